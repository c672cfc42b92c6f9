//! Mount configuration, loaded from an optional TOML file.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Server address used when none is configured.
pub const DEFAULT_SERVER: &str = "127.0.0.1:8763";

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

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// `host:port` of the filebox server.
    pub server: String,
    /// Budget for one request, from send to response.
    pub timeout_ms: u64,
    /// Backstop expiry of cached attributes and listings.
    pub attr_ttl_ms: u64,
    /// Reconnect on the next call after the connection drops.
    pub reconnect: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: DEFAULT_SERVER.to_string(),
            timeout_ms: 10_000,
            attr_ttl_ms: 1_000,
            reconnect: true,
        }
    }
}

impl ClientConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.is_empty() {
            return Err(ConfigError::Invalid("server must not be empty".into()));
        }
        if self.timeout_ms == 0 {
            return Err(ConfigError::Invalid("timeout_ms must be positive".into()));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn attr_ttl(&self) -> Duration {
        Duration::from_millis(self.attr_ttl_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_point_at_local_server() {
        let config = ClientConfig::default();
        assert_eq!(config.server, "127.0.0.1:8763");
        assert_eq!(config.timeout(), Duration::from_secs(10));
        assert_eq!(config.attr_ttl(), Duration::from_secs(1));
        assert!(config.reconnect);
    }

    #[test]
    fn load_merges_with_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "server = \"files.local:9000\"\nreconnect = false").unwrap();
        let config = ClientConfig::load(file.path()).unwrap();
        assert_eq!(config.server, "files.local:9000");
        assert!(!config.reconnect);
        assert_eq!(config.timeout_ms, 10_000);
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let config = ClientConfig {
            timeout_ms: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
