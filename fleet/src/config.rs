use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FleetError, FleetResult};

pub const DEFAULT_SOCKET_PATH: &str = "/var/lib/lxd/unix.socket";
pub const DEFAULT_IMAGE: &str = "fvirt-1.0.0";
pub(crate) const DEFAULT_STANDBY_TARGET: usize = 3;
pub(crate) const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;
pub(crate) const DEFAULT_PROVISION_TIMEOUT_MS: u64 = 60_000;
pub(crate) const DEFAULT_EXEC_TIMEOUT_MS: u32 = 10_000;
pub(crate) const DEFAULT_SOURCE_DIR: &str = "/tmp";

/// Settings for a [`crate::FleetPool`] and the instances it manages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    /// Daemon socket; consumed by whoever builds the control-plane client.
    pub socket_path: PathBuf,
    pub image: String,
    /// Instances brought to idle by `initialize`. Zero means fully on demand.
    pub standby_target: usize,
    pub poll_interval_ms: u64,
    pub provision_timeout_ms: u64,
    pub exec_timeout_ms: u32,
    /// Directory inside the container where source files are written.
    pub source_dir: String,
    pub remove_source_after_run: bool,
    /// Destroy an instance after this many successful runs.
    pub max_uses: Option<u32>,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            image: DEFAULT_IMAGE.to_owned(),
            standby_target: DEFAULT_STANDBY_TARGET,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            provision_timeout_ms: DEFAULT_PROVISION_TIMEOUT_MS,
            exec_timeout_ms: DEFAULT_EXEC_TIMEOUT_MS,
            source_dir: DEFAULT_SOURCE_DIR.to_owned(),
            remove_source_after_run: true,
            max_uses: None,
        }
    }
}

impl FleetConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn provision_timeout(&self) -> Duration {
        Duration::from_millis(self.provision_timeout_ms)
    }

    pub fn exec_timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.exec_timeout_ms))
    }

    pub fn validate(&self) -> FleetResult<()> {
        if self.image.trim().is_empty() {
            return Err(FleetError::Config("image must not be empty".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(FleetError::Config("poll_interval_ms must be positive".into()));
        }
        if self.provision_timeout_ms < self.poll_interval_ms {
            return Err(FleetError::Config(format!(
                "provision_timeout_ms ({}) is shorter than poll_interval_ms ({})",
                self.provision_timeout_ms, self.poll_interval_ms
            )));
        }
        if self.exec_timeout_ms == 0 {
            return Err(FleetError::Config("exec_timeout_ms must be positive".into()));
        }
        if !self.source_dir.starts_with('/') {
            return Err(FleetError::Config(format!(
                "source_dir must be absolute: {}",
                self.source_dir
            )));
        }
        if self.max_uses == Some(0) {
            return Err(FleetError::Config("max_uses must be at least 1".into()));
        }
        Ok(())
    }
}

/// Load and validate a fleet config from a YAML file. Missing keys take their defaults.
pub async fn load(path: &Path) -> FleetResult<FleetConfig> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| FleetError::Config(format!("read {}: {e}", path.display())))?;
    let config: FleetConfig = serde_yaml_ng::from_str(&content)
        .map_err(|e| FleetError::Config(format!("parse {}: {e}", path.display())))?;
    config.validate()?;
    Ok(config)
}
