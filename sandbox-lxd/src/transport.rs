use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::Client;
use hyperlocal::{UnixClientExt, UnixConnector, Uri as UnixUri};
use sandbox::SandboxError;
use tracing::trace;

/// Raw HTTP response from the daemon.
pub(crate) struct RawResponse {
    pub status: StatusCode,
    pub body: Bytes,
}

/// HTTP/1.1 over the daemon's unix socket.
///
/// The underlying client pools connections and is safe to use from many
/// tasks at once.
pub(crate) struct Transport {
    socket_path: PathBuf,
    client: Client<UnixConnector, Full<Bytes>>,
    closed: AtomicBool,
}

impl Transport {
    pub fn new(socket_path: PathBuf) -> Self {
        Self {
            socket_path,
            client: Client::unix(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Send one request. `path` includes any query string.
    pub async fn send(
        &self,
        method: Method,
        path: &str,
        headers: &[(&str, &str)],
        body: Bytes,
    ) -> Result<RawResponse, SandboxError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SandboxError::DaemonUnavailable("client closed".into()));
        }

        trace!(method = %method, path, "lxd request");

        let uri: hyper::Uri = UnixUri::new(&self.socket_path, path).into();
        let mut builder = Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let request = builder
            .body(Full::new(body))
            .map_err(|e| SandboxError::protocol(0, format!("build request {path}: {e}")))?;

        let response = self.client.request(request).await.map_err(|e| {
            SandboxError::DaemonUnavailable(format!("{}: {e}", self.socket_path.display()))
        })?;

        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| {
                SandboxError::DaemonUnavailable(format!(
                    "{}: read body: {e}",
                    self.socket_path.display()
                ))
            })?
            .to_bytes();

        trace!(path, status = status.as_u16(), bytes = body.len(), "lxd response");

        Ok(RawResponse { status, body })
    }
}
