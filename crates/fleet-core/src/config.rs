//! fleet.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Where the daemon looks for its configuration when `--config` is omitted.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/fleet/fleet.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("missing credentials: {0}")]
    MissingCredentials(&'static str),

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    pub store: Option<StoreConfig>,
    pub bus: Option<BusConfig>,
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
}

/// Document store location plus the credentials handed to workload agents.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreConfig {
    pub path: PathBuf,
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub database: String,
}

impl StoreConfig {
    /// Hosts joined the way agents expect them (`a;b;c`).
    pub fn formatted_hosts(&self) -> String {
        self.hosts.join(";")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BusConfig {
    pub host: String,
    #[serde(default)]
    pub password: String,
}

/// How the autoscaler hands deploy decisions to a deployment queue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// Enqueue directly into the in-process deployment queue.
    Local,
    /// Publish a create command on the message bus.
    #[default]
    Bus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ControllerConfig {
    pub tick_interval_secs: u64,
    pub dispatch_delay_ms: u64,
    pub dispatch: DispatchMode,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 10,
            dispatch_delay_ms: 200,
            dispatch: DispatchMode::Bus,
        }
    }
}

impl ControllerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn dispatch_delay(&self) -> Duration {
        Duration::from_millis(self.dispatch_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Name of the node this daemon runs on.
    pub node: Option<String>,
    pub base_port: u16,
    pub pacing_ms: u64,
    pub idle_poll_ms: u64,
    pub run_root: PathBuf,
    pub script_root: PathBuf,
    pub reap_interval_secs: u64,
    pub reap_grace_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            node: None,
            base_port: 32812,
            pacing_ms: 7500,
            idle_poll_ms: 500,
            run_root: PathBuf::from("/var/fleet"),
            script_root: PathBuf::from("/mnt/fleet"),
            reap_interval_secs: 30,
            reap_grace_secs: 60,
        }
    }
}

impl DaemonConfig {
    pub fn pacing(&self) -> Duration {
        Duration::from_millis(self.pacing_ms)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }

    pub fn reap_grace(&self) -> Duration {
        Duration::from_secs(self.reap_grace_secs)
    }
}

impl FleetConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Reject configurations the daemon cannot start with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let store = self.store()?;
        if store.path.as_os_str().is_empty() {
            return Err(ConfigError::MissingCredentials("store.path"));
        }
        if store.hosts.is_empty() || store.hosts.iter().any(|h| h.trim().is_empty()) {
            return Err(ConfigError::MissingCredentials("store.hosts"));
        }
        if store.database.trim().is_empty() {
            return Err(ConfigError::MissingCredentials("store.database"));
        }

        let bus = self.bus()?;
        if bus.host.trim().is_empty() {
            return Err(ConfigError::MissingCredentials("bus.host"));
        }

        if self.controller.tick_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "controller.tick_interval_secs",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.daemon.base_port == 0 {
            return Err(ConfigError::Invalid {
                field: "daemon.base_port",
                reason: "must be greater than zero".to_string(),
            });
        }
        if let Some(node) = &self.daemon.node
            && node.trim().is_empty()
        {
            return Err(ConfigError::Invalid {
                field: "daemon.node",
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }

    pub fn store(&self) -> Result<&StoreConfig, ConfigError> {
        self.store
            .as_ref()
            .ok_or(ConfigError::MissingCredentials("[store]"))
    }

    pub fn bus(&self) -> Result<&BusConfig, ConfigError> {
        self.bus.as_ref().ok_or(ConfigError::MissingCredentials("[bus]"))
    }

    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}
