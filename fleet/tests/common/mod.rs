#![allow(dead_code, clippy::expect_used)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fleet::{CompileTask, FleetConfig, Language, SourceCode};
use sandbox::{
    ControlPlane, ExecRequest, ExecResult, InstanceHandle, InstanceStatus, Result, SandboxError,
};

/// Knobs for how the fake daemon answers.
#[derive(Debug, Clone)]
pub struct Behaviour {
    pub async_create: bool,
    /// Instances accept start requests but never report running.
    pub never_running: bool,
    /// The first N creates fail with a protocol error.
    pub fail_creates: usize,
    /// How long a start request takes before the instance reports running.
    pub start_delay: Duration,
    pub exec_delay: Duration,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub fail_delete: HashSet<String>,
}

impl Default for Behaviour {
    fn default() -> Self {
        Self {
            async_create: true,
            never_running: false,
            fail_creates: 0,
            start_delay: Duration::ZERO,
            exec_delay: Duration::ZERO,
            exit_code: 0,
            stdout: "ok\n".into(),
            stderr: String::new(),
            fail_delete: HashSet::new(),
        }
    }
}

#[derive(Debug, Default)]
pub struct Record {
    pub created: Vec<String>,
    pub deleted: Vec<String>,
    pub stopped: Vec<String>,
    pub started: Vec<String>,
    pub pushed: Vec<(String, String, String)>,
    pub removed: Vec<(String, String)>,
    pub commands: Vec<(String, String, u32)>,
    pub state_queries: usize,
    pub exec_active: HashMap<String, usize>,
    /// Set if two execs ever ran on one instance at the same time.
    pub overlap: bool,
    pub closed: bool,
}

/// In-memory control plane. Creation is instant; instances start stopped
/// and become running on the first start request.
#[derive(Default)]
pub struct FakeControlPlane {
    pub behaviour: Mutex<Behaviour>,
    pub record: Mutex<Record>,
    statuses: Mutex<HashMap<String, InstanceStatus>>,
}

impl FakeControlPlane {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with(behaviour: Behaviour) -> Arc<Self> {
        Arc::new(Self {
            behaviour: Mutex::new(behaviour),
            ..Self::default()
        })
    }

    pub fn behaviour(&self) -> Behaviour {
        self.behaviour.lock().expect("behaviour lock").clone()
    }

    pub fn update(&self, f: impl FnOnce(&mut Behaviour)) {
        f(&mut self.behaviour.lock().expect("behaviour lock"));
    }

    pub fn record<T>(&self, f: impl FnOnce(&Record) -> T) -> T {
        f(&self.record.lock().expect("record lock"))
    }

    pub fn status(&self, id: &str) -> InstanceStatus {
        self.statuses
            .lock()
            .expect("status lock")
            .get(id)
            .cloned()
            .unwrap_or(InstanceStatus::NotFound)
    }

    pub fn live_instances(&self) -> usize {
        self.statuses.lock().expect("status lock").len()
    }

    fn set_status(&self, id: &str, status: InstanceStatus) {
        self.statuses
            .lock()
            .expect("status lock")
            .insert(id.to_owned(), status);
    }

    fn check_open(&self) -> Result<()> {
        if self.record.lock().expect("record lock").closed {
            return Err(SandboxError::DaemonUnavailable("client closed".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ControlPlane for FakeControlPlane {
    fn name(&self) -> &str {
        "fake"
    }

    async fn create_instance(&self, id: &str, _image: &str) -> Result<InstanceHandle> {
        self.check_open()?;
        let async_create = {
            let mut behaviour = self.behaviour.lock().expect("behaviour lock");
            if behaviour.fail_creates > 0 {
                behaviour.fail_creates -= 1;
                return Err(SandboxError::protocol(404, "image not found"));
            }
            behaviour.async_create
        };
        self.set_status(id, InstanceStatus::Stopped);
        self.record.lock().expect("record lock").created.push(id.to_owned());
        Ok(InstanceHandle {
            id: id.to_owned(),
            operation: async_create.then(|| format!("/1.0/operations/{id}")),
        })
    }

    async fn get_state(&self, id: &str) -> Result<InstanceStatus> {
        self.check_open()?;
        self.record.lock().expect("record lock").state_queries += 1;
        Ok(self.status(id))
    }

    async fn list_instances(&self) -> Result<Vec<String>> {
        self.check_open()?;
        let mut names: Vec<String> = self
            .statuses
            .lock()
            .expect("status lock")
            .keys()
            .cloned()
            .collect();
        names.sort();
        Ok(names)
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.check_open()?;
        match self.status(id) {
            InstanceStatus::Running => Err(SandboxError::InvalidStateTransition {
                id: id.to_owned(),
                action: "start",
                state: "running".into(),
            }),
            InstanceStatus::NotFound => Err(SandboxError::protocol(404, "not found")),
            _ => {
                self.record.lock().expect("record lock").started.push(id.to_owned());
                let behaviour = self.behaviour();
                tokio::time::sleep(behaviour.start_delay).await;
                if !behaviour.never_running {
                    self.set_status(id, InstanceStatus::Running);
                }
                Ok(())
            }
        }
    }

    async fn stop(&self, id: &str) -> Result<()> {
        self.check_open()?;
        if self.status(id) != InstanceStatus::Running {
            return Err(SandboxError::InvalidStateTransition {
                id: id.to_owned(),
                action: "stop",
                state: self.status(id).to_string(),
            });
        }
        self.set_status(id, InstanceStatus::Stopped);
        self.record.lock().expect("record lock").stopped.push(id.to_owned());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.check_open()?;
        if self.behaviour().fail_delete.contains(id) {
            return Err(SandboxError::protocol(500, "delete rejected"));
        }
        match self.status(id) {
            InstanceStatus::Running => Err(SandboxError::protocol(400, "Instance is running")),
            InstanceStatus::NotFound => Err(SandboxError::protocol(404, "not found")),
            _ => {
                self.statuses.lock().expect("status lock").remove(id);
                self.record.lock().expect("record lock").deleted.push(id.to_owned());
                Ok(())
            }
        }
    }

    async fn push_file(&self, id: &str, path: &str, content: &[u8]) -> Result<()> {
        self.check_open()?;
        self.record.lock().expect("record lock").pushed.push((
            id.to_owned(),
            path.to_owned(),
            String::from_utf8_lossy(content).into_owned(),
        ));
        Ok(())
    }

    async fn remove_file(&self, id: &str, path: &str) -> Result<()> {
        self.check_open()?;
        self.record
            .lock()
            .expect("record lock")
            .removed
            .push((id.to_owned(), path.to_owned()));
        Ok(())
    }

    async fn exec(&self, id: &str, request: &ExecRequest<'_>) -> Result<ExecResult> {
        self.check_open()?;
        let behaviour = self.behaviour();
        {
            let mut record = self.record.lock().expect("record lock");
            record
                .commands
                .push((id.to_owned(), request.cmd.to_owned(), request.timeout_ms));
            let active = {
                let count = record.exec_active.entry(id.to_owned()).or_default();
                *count += 1;
                *count
            };
            if active > 1 {
                record.overlap = true;
            }
        }

        tokio::time::sleep(behaviour.exec_delay).await;

        if let Some(active) = self
            .record
            .lock()
            .expect("record lock")
            .exec_active
            .get_mut(id)
        {
            *active -= 1;
        }
        Ok(ExecResult {
            exit_code: behaviour.exit_code,
            stdout: behaviour.stdout,
            stderr: behaviour.stderr,
            cpu_time_ms: 3,
            memory_bytes: 2048,
        })
    }

    async fn close(&self) {
        self.record.lock().expect("record lock").closed = true;
    }
}

pub fn python() -> Arc<Language> {
    Arc::new(Language::new("Python", "py", "python3 {file}"))
}

pub fn task(content: &str) -> CompileTask {
    CompileTask::new(SourceCode::new(content), python(), "sum")
}

/// Fast timings for tests that do not pause the clock.
pub fn config(standby_target: usize) -> FleetConfig {
    FleetConfig {
        standby_target,
        poll_interval_ms: 5,
        provision_timeout_ms: 2_000,
        exec_timeout_ms: 2_000,
        ..FleetConfig::default()
    }
}
