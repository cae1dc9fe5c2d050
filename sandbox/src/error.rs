#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("control plane unavailable: {0}")]
    DaemonUnavailable(String),

    #[error("control plane returned {status}: {body}")]
    Protocol { status: u16, body: String },

    #[error("cannot {action} instance {id} while {state}")]
    InvalidStateTransition {
        id: String,
        action: &'static str,
        state: String,
    },

    #[error("execution in {id} exceeded {timeout_ms}ms")]
    ExecutionTimeout { id: String, timeout_ms: u32 },

    #[error("execution failed: {0}")]
    ExecutionFailed(String),
}

impl SandboxError {
    /// Shorthand for a protocol error whose body is produced locally
    /// (e.g. a response that could not be decoded).
    pub fn protocol(status: u16, body: impl Into<String>) -> Self {
        Self::Protocol {
            status,
            body: body.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SandboxError>;
