use async_trait::async_trait;

use crate::error::Result;
use crate::types::{ExecRequest, ExecResult, InstanceHandle, InstanceStatus};

/// Operations a container daemon must offer to host sandbox instances.
///
/// Implementations hold no per-instance state: every call names the instance
/// by id. They are shared behind `Arc` and called concurrently.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Human-readable name for this backend (e.g. "lxd").
    fn name(&self) -> &str;

    // -- lifecycle --
    /// Ask the daemon to create `id` from `image`. Does not wait for an
    /// asynchronous creation to finish.
    async fn create_instance(&self, id: &str, image: &str) -> Result<InstanceHandle>;
    async fn get_state(&self, id: &str) -> Result<InstanceStatus>;
    /// Names of every instance the daemon knows, including ones this
    /// process did not create.
    async fn list_instances(&self) -> Result<Vec<String>>;
    /// Fails with `InvalidStateTransition` if the instance is already running.
    async fn start(&self, id: &str) -> Result<()>;
    /// Fails with `InvalidStateTransition` if the instance is not running.
    async fn stop(&self, id: &str) -> Result<()>;
    /// The instance must be stopped first.
    async fn delete(&self, id: &str) -> Result<()>;

    // -- operations --
    async fn push_file(&self, id: &str, path: &str, content: &[u8]) -> Result<()>;
    async fn remove_file(&self, id: &str, path: &str) -> Result<()>;
    /// Run a command, bounded by `request.timeout_ms` of wall-clock time.
    async fn exec(&self, id: &str, request: &ExecRequest<'_>) -> Result<ExecResult>;

    /// Release the transport. Calls made afterwards fail with
    /// `DaemonUnavailable`.
    async fn close(&self);
}
