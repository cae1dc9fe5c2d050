use std::fmt;

/// Returned by [`ControlPlane::create_instance`](crate::ControlPlane::create_instance).
///
/// `operation` is set when the daemon accepted the request but is still
/// creating the instance in the background. Polling that operation to
/// completion is the caller's concern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceHandle {
    pub id: String,
    pub operation: Option<String>,
}

impl InstanceHandle {
    pub fn is_pending(&self) -> bool {
        self.operation.is_some()
    }
}

/// Status of an instance as reported by the control plane.
///
/// `NotFound` is a normal answer meaning "not currently running".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceStatus {
    Running,
    Stopped,
    Frozen,
    Error,
    NotFound,
    Other(String),
}

impl InstanceStatus {
    pub fn parse(status: &str) -> Self {
        match status {
            "Running" => Self::Running,
            "Stopped" => Self::Stopped,
            "Frozen" => Self::Frozen,
            "Error" => Self::Error,
            other => Self::Other(other.to_owned()),
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => f.write_str("running"),
            Self::Stopped => f.write_str("stopped"),
            Self::Frozen => f.write_str("frozen"),
            Self::Error => f.write_str("error"),
            Self::NotFound => f.write_str("not found"),
            Self::Other(s) => write!(f, "{}", s.to_lowercase()),
        }
    }
}

pub struct ExecRequest<'a> {
    pub cmd: &'a str,
    pub timeout_ms: u32,
}

/// Captured output and resource accounting of one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub cpu_time_ms: u64,
    pub memory_bytes: u64,
}
