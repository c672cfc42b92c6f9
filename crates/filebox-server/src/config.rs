//! Server configuration, loaded from an optional TOML file.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default port shared by the server and the mount.
pub const DEFAULT_PORT: u16 = 8763;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Settings of the disk reconciler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    pub enabled: bool,
    /// Quiet period before a burst of disk events is reconciled.
    pub debounce_ms: u64,
    /// Full rescan period; 0 disables it.
    pub rescan_interval_ms: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            debounce_ms: 100,
            rescan_interval_ms: 30_000,
        }
    }
}

impl ReconcilerConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn rescan_interval(&self) -> Option<Duration> {
        (self.rescan_interval_ms > 0).then(|| Duration::from_millis(self.rescan_interval_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the TCP listener binds to.
    pub listen: SocketAddr,
    /// Storage root shared by every mount.
    pub root: PathBuf,
    pub ping_interval_ms: u64,
    /// Also deliver an event to the session that caused it.
    pub push_to_originator: bool,
    /// Number of events kept for replay to reconnecting sessions.
    pub history_limit: usize,
    /// Capacity of the live event broadcast per session.
    pub event_buffer: usize,
    /// Capacity of the sequencer intent queue.
    pub queue_depth: usize,
    pub reconciler: ReconcilerConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            root: PathBuf::from("."),
            ping_interval_ms: 5_000,
            push_to_originator: true,
            history_limit: 4096,
            event_buffer: 1024,
            queue_depth: 256,
            reconciler: ReconcilerConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load a config file; every missing field takes its default.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text).map_err(|err| match err {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: PathBuf::new(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.history_limit == 0 {
            return Err(ConfigError::Invalid("history_limit must be positive".into()));
        }
        if self.event_buffer == 0 || self.queue_depth == 0 {
            return Err(ConfigError::Invalid(
                "event_buffer and queue_depth must be positive".into(),
            ));
        }
        if self.ping_interval_ms == 0 {
            return Err(ConfigError::Invalid("ping_interval_ms must be positive".into()));
        }
        Ok(())
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }
}
