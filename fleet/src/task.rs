use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::language::Language;

/// User-submitted program text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceCode {
    pub content: String,
    #[serde(default)]
    pub function_name: Option<String>,
}

impl SourceCode {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            function_name: None,
        }
    }
}

/// One unit of work handed to the fleet.
#[derive(Debug, Clone)]
pub struct CompileTask {
    pub code: SourceCode,
    pub language: Arc<Language>,
    /// Opaque tag carried through to logs.
    pub problem_kind: String,
}

impl CompileTask {
    pub fn new(code: SourceCode, language: Arc<Language>, problem_kind: impl Into<String>) -> Self {
        Self {
            code,
            language,
            problem_kind: problem_kind.into(),
        }
    }
}

/// Outcome and measurements of a successful run.
///
/// `total_time_ms` is the sum of `spin_up_time_ms` (claim until the command
/// was issued) and `execution_time_ms` (command round trip).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionResult {
    instance_id: String,
    language: String,
    output: String,
    exit_code: i32,
    total_time_ms: u64,
    execution_time_ms: u64,
    spin_up_time_ms: u64,
    cpu_time_ms: u64,
    memory_bytes: u64,
}

pub(crate) struct Measurements {
    pub(crate) spin_up: Duration,
    pub(crate) execution: Duration,
    pub(crate) cpu_time_ms: u64,
    pub(crate) memory_bytes: u64,
}

impl ExecutionResult {
    pub(crate) fn new(
        instance_id: &str,
        language: &Language,
        output: String,
        exit_code: i32,
        m: Measurements,
    ) -> Self {
        let spin_up_time_ms = millis(m.spin_up);
        let execution_time_ms = millis(m.execution);
        Self {
            instance_id: instance_id.to_owned(),
            language: language.name.clone(),
            output,
            exit_code,
            total_time_ms: spin_up_time_ms.saturating_add(execution_time_ms),
            execution_time_ms,
            spin_up_time_ms,
            cpu_time_ms: m.cpu_time_ms,
            memory_bytes: m.memory_bytes,
        }
    }

    /// Instance that ran the task.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn output(&self) -> &str {
        &self.output
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    pub fn total_time_ms(&self) -> u64 {
        self.total_time_ms
    }

    pub fn execution_time_ms(&self) -> u64 {
        self.execution_time_ms
    }

    pub fn spin_up_time_ms(&self) -> u64 {
        self.spin_up_time_ms
    }

    pub fn cpu_time_ms(&self) -> u64 {
        self.cpu_time_ms
    }

    pub fn memory_bytes(&self) -> u64 {
        self.memory_bytes
    }
}

pub(crate) fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
