use std::path::PathBuf;

/// Default location of the LXD daemon socket on a packaged install.
pub const DEFAULT_SOCKET_PATH: &str = "/var/lib/lxd/unix.socket";

const DEFAULT_STOP_TIMEOUT_SECS: u32 = 30;

#[derive(Debug, Clone)]
pub struct LxdConfig {
    pub socket_path: PathBuf,
    /// Seconds the daemon may spend on a graceful stop before giving up.
    pub stop_timeout_secs: u32,
}

impl LxdConfig {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            stop_timeout_secs: DEFAULT_STOP_TIMEOUT_SECS,
        }
    }
}

impl Default for LxdConfig {
    fn default() -> Self {
        Self::new(DEFAULT_SOCKET_PATH)
    }
}
