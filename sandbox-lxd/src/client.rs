use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use hyper::Method;
use sandbox::{
    ControlPlane, ExecRequest, ExecResult, InstanceHandle, InstanceStatus, SandboxError,
};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::config::LxdConfig;
use crate::transport::{RawResponse, Transport};
use crate::wire::{Envelope, ExecMetadata, InstanceState, Operation};

/// Extra seconds granted to the daemon on top of a stop timeout before we
/// stop waiting on the operation.
const STOP_WAIT_SLACK_SECS: u64 = 5;

/// Upper bound when waiting for a delete operation.
const DELETE_WAIT_SECS: u64 = 30;

/// Slack between the daemon-side exec wait and our own wall-clock bound.
const EXEC_WAIT_GRACE: Duration = Duration::from_secs(2);

/// Client for the LXD REST API on a local unix socket.
pub struct LxdClient {
    config: LxdConfig,
    transport: Transport,
}

impl LxdClient {
    /// Build a client. No connection is made until the first request.
    pub fn new(config: LxdConfig) -> Self {
        let transport = Transport::new(config.socket_path.clone());
        info!(socket = %transport.socket_path().display(), "lxd client initialized");
        Self { config, transport }
    }

    /// Send a request and decode the standard envelope, turning non-success
    /// responses into `Protocol` errors.
    async fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> sandbox::Result<Envelope> {
        let (headers, bytes): (&[(&str, &str)], Bytes) = match body {
            Some(value) => (
                &[("content-type", "application/json")],
                Bytes::from(value.to_string()),
            ),
            None => (&[], Bytes::new()),
        };
        let response = self.transport.send(method, path, headers, bytes).await?;
        decode_envelope(response)
    }

    /// Fetch a non-JSON resource (recorded exec output).
    async fn get_raw(&self, path: &str) -> sandbox::Result<String> {
        let response = self.transport.send(Method::GET, path, &[], Bytes::new()).await?;
        if !response.status.is_success() {
            return Err(error_from_response(&response));
        }
        Ok(String::from_utf8_lossy(&response.body).into_owned())
    }

    /// Block on a background operation for at most `timeout_secs`.
    ///
    /// A still-running operation is returned as-is; a failed or cancelled one
    /// becomes a `Protocol` error carrying the daemon's message.
    async fn wait_operation(
        &self,
        operation: &str,
        timeout_secs: u64,
    ) -> sandbox::Result<Operation> {
        let path = format!("{operation}/wait?timeout={timeout_secs}");
        let envelope = self.call(Method::GET, &path, None).await?;
        let op: Operation = decode_metadata(envelope.metadata)?;
        if op.is_failed() {
            return Err(SandboxError::protocol(op.status_code, op.err));
        }
        Ok(op)
    }

    /// Best-effort cancellation of a background operation.
    async fn cancel_operation(&self, operation: &str) {
        if let Err(e) = self.call(Method::DELETE, operation, None).await {
            warn!(operation, error = %e, "failed to cancel operation");
        }
    }

    /// Full state document; `None` when the instance does not exist.
    async fn instance_state(&self, id: &str) -> sandbox::Result<Option<InstanceState>> {
        let path = format!("/1.0/instances/{id}/state");
        match self.call(Method::GET, &path, None).await {
            Ok(envelope) => decode_metadata(envelope.metadata).map(Some),
            Err(SandboxError::Protocol { status: 404, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn status_of(&self, id: &str) -> sandbox::Result<InstanceStatus> {
        Ok(match self.instance_state(id).await? {
            Some(state) => InstanceStatus::parse(&state.status),
            None => InstanceStatus::NotFound,
        })
    }

    /// Current usage counters, for accounting around an exec.
    async fn usage(&self, id: &str) -> sandbox::Result<InstanceState> {
        self.instance_state(id)
            .await?
            .ok_or_else(|| SandboxError::protocol(404, format!("instance {id} not found")))
    }

    async fn fetch_output(&self, meta: &ExecMetadata, fd: &str) -> sandbox::Result<String> {
        let Some(path) = meta.output.get(fd) else {
            return Ok(String::new());
        };
        let text = self
            .get_raw(path)
            .await
            .map_err(|e| SandboxError::ExecutionFailed(format!("read output {fd}: {e}")))?;
        if let Err(e) = self.call(Method::DELETE, path, None).await {
            debug!(path = %path, error = %e, "failed to delete exec log");
        }
        Ok(text)
    }

    fn file_path(id: &str, path: &str) -> String {
        let encoded: String = url::form_urlencoded::byte_serialize(path.as_bytes()).collect();
        format!("/1.0/instances/{id}/files?path={encoded}")
    }
}

fn error_from_response(response: &RawResponse) -> SandboxError {
    let status = response.status.as_u16();
    match serde_json::from_slice::<Envelope>(&response.body) {
        Ok(envelope) if !envelope.error.is_empty() => SandboxError::Protocol {
            status,
            body: envelope.error,
        },
        _ => SandboxError::Protocol {
            status,
            body: String::from_utf8_lossy(&response.body).into_owned(),
        },
    }
}

fn decode_envelope(response: RawResponse) -> sandbox::Result<Envelope> {
    if !response.status.is_success() {
        return Err(error_from_response(&response));
    }
    let envelope: Envelope = serde_json::from_slice(&response.body).map_err(|e| {
        SandboxError::protocol(response.status.as_u16(), format!("decode response: {e}"))
    })?;
    if envelope.is_error() {
        return Err(SandboxError::Protocol {
            status: envelope.error_code,
            body: envelope.error,
        });
    }
    Ok(envelope)
}

fn decode_metadata<T: DeserializeOwned>(metadata: Value) -> sandbox::Result<T> {
    serde_json::from_value(metadata)
        .map_err(|e| SandboxError::protocol(200, format!("decode metadata: {e}")))
}

fn require_operation(envelope: &Envelope, what: &str) -> sandbox::Result<String> {
    envelope
        .operation()
        .map(str::to_owned)
        .ok_or_else(|| SandboxError::protocol(200, format!("{what}: response has no operation")))
}

#[async_trait]
impl ControlPlane for LxdClient {
    fn name(&self) -> &str {
        "lxd"
    }

    async fn create_instance(&self, id: &str, image: &str) -> sandbox::Result<InstanceHandle> {
        let body = json!({
            "name": id,
            "source": { "type": "image", "alias": image },
        });
        let envelope = self.call(Method::POST, "/1.0/instances", Some(body)).await?;

        let operation = if envelope.is_async() {
            envelope.operation().map(str::to_owned)
        } else {
            None
        };
        debug!(id, image, pending = operation.is_some(), "instance create accepted");

        Ok(InstanceHandle {
            id: id.to_owned(),
            operation,
        })
    }

    async fn get_state(&self, id: &str) -> sandbox::Result<InstanceStatus> {
        self.status_of(id).await
    }

    async fn list_instances(&self) -> sandbox::Result<Vec<String>> {
        let envelope = self.call(Method::GET, "/1.0/instances", None).await?;
        let urls: Option<Vec<String>> = decode_metadata(envelope.metadata)?;
        let names = urls
            .unwrap_or_default()
            .iter()
            .filter_map(|url| url.rsplit('/').next())
            .filter(|name| !name.is_empty())
            .map(str::to_owned)
            .collect();
        Ok(names)
    }

    async fn start(&self, id: &str) -> sandbox::Result<()> {
        let status = self.status_of(id).await?;
        if status == InstanceStatus::Running {
            return Err(SandboxError::InvalidStateTransition {
                id: id.to_owned(),
                action: "start",
                state: status.to_string(),
            });
        }

        let body = json!({ "action": "start" });
        let path = format!("/1.0/instances/{id}/state");
        self.call(Method::PUT, &path, Some(body)).await?;
        debug!(id, "start requested");
        Ok(())
    }

    async fn stop(&self, id: &str) -> sandbox::Result<()> {
        let status = self.status_of(id).await?;
        if status != InstanceStatus::Running {
            return Err(SandboxError::InvalidStateTransition {
                id: id.to_owned(),
                action: "stop",
                state: status.to_string(),
            });
        }

        let body = json!({
            "action": "stop",
            "timeout": self.config.stop_timeout_secs,
            "force": false,
        });
        let path = format!("/1.0/instances/{id}/state");
        let envelope = self.call(Method::PUT, &path, Some(body)).await?;
        if let Some(operation) = envelope.operation() {
            let wait = u64::from(self.config.stop_timeout_secs) + STOP_WAIT_SLACK_SECS;
            self.wait_operation(operation, wait).await?;
        }
        debug!(id, "instance stopped");
        Ok(())
    }

    async fn delete(&self, id: &str) -> sandbox::Result<()> {
        let path = format!("/1.0/instances/{id}");
        let envelope = self.call(Method::DELETE, &path, None).await?;
        if let Some(operation) = envelope.operation() {
            self.wait_operation(operation, DELETE_WAIT_SECS).await?;
        }
        debug!(id, "instance deleted");
        Ok(())
    }

    async fn push_file(&self, id: &str, path: &str, content: &[u8]) -> sandbox::Result<()> {
        let headers = [
            ("content-type", "application/octet-stream"),
            ("X-LXD-type", "file"),
            ("X-LXD-mode", "0644"),
            ("X-LXD-write", "overwrite"),
        ];
        let response = self
            .transport
            .send(
                Method::POST,
                &Self::file_path(id, path),
                &headers,
                Bytes::copy_from_slice(content),
            )
            .await?;
        decode_envelope(response)?;
        debug!(id, path, bytes = content.len(), "file pushed");
        Ok(())
    }

    async fn remove_file(&self, id: &str, path: &str) -> sandbox::Result<()> {
        self.call(Method::DELETE, &Self::file_path(id, path), None)
            .await?;
        Ok(())
    }

    async fn exec(&self, id: &str, request: &ExecRequest<'_>) -> sandbox::Result<ExecResult> {
        let before = self.usage(id).await?;

        let body = json!({
            "command": ["sh", "-c", request.cmd],
            "environment": {},
            "wait-for-websocket": false,
            "interactive": false,
            "record-output": true,
        });
        let path = format!("/1.0/instances/{id}/exec");
        let envelope = self.call(Method::POST, &path, Some(body)).await?;
        let operation = require_operation(&envelope, "exec")?;

        let timeout = Duration::from_millis(u64::from(request.timeout_ms));
        let wait_secs = u64::from(request.timeout_ms).div_ceil(1000).max(1);
        let timed_out = SandboxError::ExecutionTimeout {
            id: id.to_owned(),
            timeout_ms: request.timeout_ms,
        };

        let waited = tokio::time::timeout(
            timeout + EXEC_WAIT_GRACE,
            self.wait_operation(&operation, wait_secs),
        )
        .await;
        let op = match waited {
            Ok(Ok(op)) => op,
            Ok(Err(SandboxError::Protocol { status, body })) => {
                return Err(SandboxError::ExecutionFailed(format!(
                    "exec operation failed ({status}): {body}"
                )));
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                self.cancel_operation(&operation).await;
                return Err(timed_out);
            }
        };
        if op.is_running() {
            self.cancel_operation(&operation).await;
            return Err(timed_out);
        }

        let meta: ExecMetadata = serde_json::from_value(op.metadata)
            .map_err(|e| SandboxError::ExecutionFailed(format!("decode exec result: {e}")))?;
        let stdout = self.fetch_output(&meta, "1").await?;
        let stderr = self.fetch_output(&meta, "2").await?;

        let after = self.usage(id).await?;
        let cpu_ns = after.cpu_ns().saturating_sub(before.cpu_ns());

        debug!(id, exit_code = meta.return_code, "exec finished");

        Ok(ExecResult {
            exit_code: meta.return_code,
            stdout,
            stderr,
            cpu_time_ms: cpu_ns / 1_000_000,
            memory_bytes: after.memory_bytes(),
        })
    }

    async fn close(&self) {
        self.transport.close();
        info!(socket = %self.transport.socket_path().display(), "lxd client closed");
    }
}
