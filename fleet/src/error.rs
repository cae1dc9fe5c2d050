use sandbox::SandboxError;

use crate::instance::LifecycleState;

#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    #[error("sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("instance {id} did not reach running within {waited_ms}ms")]
    ProvisioningTimeout { id: String, waited_ms: u64 },

    #[error("instance {id} cannot be claimed while {state}")]
    AlreadyBusy { id: String, state: LifecycleState },

    #[error("execution in instance {id} exited with code {exit_code}")]
    ExecutionFailed {
        id: String,
        exit_code: i32,
        output: String,
    },

    #[error("teardown of instance {id} failed: {message}")]
    TeardownError { id: String, message: String },

    #[error("no instance became idle out of {requested} requested: {reason}")]
    FleetInitializationFailed { requested: usize, reason: String },

    #[error("failed to tear down {} instance(s): {}", .failed.len(), .failed.join(", "))]
    PartialTeardownFailure { failed: Vec<String> },

    #[error("fleet is shutting down")]
    ShuttingDown,

    #[error("config error: {0}")]
    Config(String),
}

impl FleetError {
    /// Provisioning or execution ran past its time budget.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::ProvisioningTimeout { .. } | Self::Sandbox(SandboxError::ExecutionTimeout { .. })
        )
    }

    pub fn is_daemon_unavailable(&self) -> bool {
        matches!(self, Self::Sandbox(SandboxError::DaemonUnavailable(_)))
    }
}

pub type FleetResult<T> = Result<T, FleetError>;
