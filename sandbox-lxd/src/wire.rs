//! JSON shapes of the LXD REST API, restricted to the fields we read.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;

/// Standard response envelope wrapping every JSON reply.
#[derive(Debug, Deserialize)]
pub(crate) struct Envelope {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub operation: String,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub error_code: u16,
    #[serde(default)]
    pub metadata: Value,
}

impl Envelope {
    /// The daemon reports background work either with `type: async` or with
    /// an `Operation ...` status.
    pub fn is_async(&self) -> bool {
        self.kind == "async" || self.status.starts_with("Operation")
    }

    pub fn is_error(&self) -> bool {
        self.kind == "error"
    }

    pub fn operation(&self) -> Option<&str> {
        if self.operation.is_empty() {
            None
        } else {
            Some(&self.operation)
        }
    }
}

/// Background operation, as returned by `GET /1.0/operations/{id}/wait`.
#[derive(Debug, Deserialize)]
pub(crate) struct Operation {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub status_code: u16,
    #[serde(default)]
    pub err: String,
    #[serde(default)]
    pub metadata: Value,
}

impl Operation {
    pub fn is_running(&self) -> bool {
        matches!(self.status.as_str(), "Running" | "Pending")
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status.as_str(), "Failure" | "Cancelled")
    }
}

/// Metadata of a finished exec operation with `record-output` enabled.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct ExecMetadata {
    #[serde(rename = "return", default)]
    pub return_code: i32,
    /// File descriptor number ("1", "2") to log path.
    #[serde(default)]
    pub output: HashMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct InstanceState {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub cpu: CpuState,
    #[serde(default)]
    pub memory: MemoryState,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct CpuState {
    /// Cumulative CPU time in nanoseconds; negative when unsupported.
    #[serde(default)]
    pub usage: i64,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct MemoryState {
    #[serde(default)]
    pub usage: i64,
    #[serde(default)]
    pub usage_peak: i64,
}

impl InstanceState {
    pub fn cpu_ns(&self) -> u64 {
        u64::try_from(self.cpu.usage).unwrap_or(0)
    }

    /// Peak usage when the kernel reports it, current usage otherwise.
    pub fn memory_bytes(&self) -> u64 {
        let peak = u64::try_from(self.memory.usage_peak).unwrap_or(0);
        if peak > 0 {
            peak
        } else {
            u64::try_from(self.memory.usage).unwrap_or(0)
        }
    }
}
