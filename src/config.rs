//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `KFWD_ADDRESS`, `KFWD_NAMESPACE`
//! 2. **Config file**: path via `--config <path>`, or `kfwd.toml` in CWD
//! 3. **Compiled defaults**: see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [forward]
//! address = "localhost"      # bind address when the dialog field is empty
//! max_forwarders = 0         # 0 = unlimited
//! stop_timeout_ms = 3000     # wait for tunnels to acknowledge a stop
//! probe_interval_secs = 5    # how often live targets are re-checked
//!
//! [cluster]
//! namespace = "default"
//!
//! [logging]
//! level = "info"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ForwardError;

const DEFAULT_CONFIG_FILE: &str = "kfwd.toml";

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub forward: ForwardConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Port-forward defaults and limits.
#[derive(Debug, Clone, Deserialize)]
pub struct ForwardConfig {
    /// Bind address used when the operator leaves the field empty
    /// (default `localhost`). Override with `KFWD_ADDRESS`.
    #[serde(default = "default_address")]
    pub address: String,
    /// Maximum concurrent forwarders (default 0 = unlimited).
    #[serde(default)]
    pub max_forwarders: usize,
    /// Milliseconds to wait for tunnel tasks to acknowledge a stop before
    /// they are aborted (default 3000).
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
    /// Seconds between liveness probes of forwarded pods (default 5).
    #[serde(default = "default_probe_interval")]
    pub probe_interval_secs: u64,
}

/// Cluster access settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    /// Namespace used for bare pod names. Override with `KFWD_NAMESPACE`.
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_address() -> String {
    "localhost".to_string()
}
fn default_stop_timeout_ms() -> u64 {
    3000
}
fn default_probe_interval() -> u64 {
    5
}
fn default_namespace() -> String {
    "default".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            max_forwarders: 0,
            stop_timeout_ms: default_stop_timeout_ms(),
            probe_interval_secs: default_probe_interval(),
        }
    }
}

impl ForwardConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs.max(1))
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist. Otherwise `kfwd.toml` in the
    /// current directory is used when present, falling back to compiled
    /// defaults.
    pub fn load(path: Option<&str>) -> Result<Self, ForwardError> {
        let mut config = match path {
            Some(p) => Self::from_file(Path::new(p))?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };

        // Env var overrides
        if let Ok(address) = std::env::var("KFWD_ADDRESS") {
            config.forward.address = address;
        }
        if let Ok(ns) = std::env::var("KFWD_NAMESPACE") {
            config.cluster.namespace = ns;
        }

        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self, ForwardError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ForwardError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        toml::from_str(&content).map_err(|e| {
            ForwardError::Config(format!("failed to parse {}: {e}", path.display()))
        })
    }
}
