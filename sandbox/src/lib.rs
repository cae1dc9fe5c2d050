mod control_plane;
mod error;
mod types;

pub use control_plane::ControlPlane;
pub use error::{Result, SandboxError};
pub use types::{ExecRequest, ExecResult, InstanceHandle, InstanceStatus};
