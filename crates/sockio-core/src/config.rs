//! Client configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (`SOCKIO_URL`)
//! - TOML configuration file
//! - The [`ClientBuilder`](crate::ClientBuilder) API

use serde::{Deserialize, Serialize};
use sockio_protocol::Revision;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::endpoint::DEFAULT_PATH;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The file is not valid TOML for this schema.
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    /// A value is out of range.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server URL.
    #[serde(default = "default_url")]
    pub url: String,

    /// Reconnection policy.
    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// Engine protocol settings.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Query parameters sent with every connection attempt.
    #[serde(default)]
    pub query: BTreeMap<String, String>,

    /// Headers sent with every connection attempt.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

/// Reconnection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Maximum consecutive attempts. Unbounded when absent.
    #[serde(default)]
    pub attempts: Option<u32>,

    /// Base delay in milliseconds.
    #[serde(default = "default_delay")]
    pub delay_ms: u64,

    /// Delay cap in milliseconds.
    #[serde(default = "default_delay_max")]
    pub delay_max_ms: u64,
}

/// Engine protocol configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Protocol revision (3 or 4).
    #[serde(default)]
    pub revision: Revision,

    /// Resource path used when the URL has none.
    #[serde(default = "default_path")]
    pub path: String,
}

// Default value functions
fn default_url() -> String {
    std::env::var("SOCKIO_URL").unwrap_or_else(|_| "http://127.0.0.1:3000".to_string())
}

fn default_delay() -> u64 {
    5_000
}

fn default_delay_max() -> u64 {
    25_000
}

fn default_path() -> String {
    DEFAULT_PATH.to_string()
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            reconnect: ReconnectConfig::default(),
            engine: EngineConfig::default(),
            query: BTreeMap::new(),
            headers: BTreeMap::new(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            attempts: None,
            delay_ms: default_delay(),
            delay_max_ms: default_delay_max(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            revision: Revision::default(),
            path: default_path(),
        }
    }
}

impl ReconnectConfig {
    #[must_use]
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    #[must_use]
    pub fn delay_max(&self) -> Duration {
        Duration::from_millis(self.delay_max_ms)
    }
}

impl ClientConfig {
    /// Configuration for `url` with every other setting at its default.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Load configuration from file or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed.
    pub fn load() -> Result<Self, ConfigError> {
        let config_paths = [
            "sockio.toml",
            "/etc/sockio/sockio.toml",
            "~/.config/sockio/sockio.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let config: ClientConfig =
            toml::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Check value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when the delay bounds are inverted.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.reconnect.delay_ms > self.reconnect.delay_max_ms {
            return Err(ConfigError::Invalid(format!(
                "reconnect.delay_ms ({}) exceeds reconnect.delay_max_ms ({})",
                self.reconnect.delay_ms, self.reconnect.delay_max_ms
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::new("http://localhost:3000");
        assert_eq!(config.reconnect.attempts, None);
        assert_eq!(config.reconnect.delay(), Duration::from_millis(5000));
        assert_eq!(config.reconnect.delay_max(), Duration::from_millis(25000));
        assert_eq!(config.engine.revision, Revision::V4);
        assert_eq!(config.engine.path, "/socket.io/");
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            url = "https://rt.example.com"

            [reconnect]
            attempts = 3
            delay_ms = 1000

            [engine]
            revision = 3

            [query]
            token = "abc"
        "#;

        let config: ClientConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.url, "https://rt.example.com");
        assert_eq!(config.reconnect.attempts, Some(3));
        assert_eq!(config.reconnect.delay_ms, 1000);
        assert_eq!(config.reconnect.delay_max_ms, 25000);
        assert_eq!(config.engine.revision, Revision::V3);
        assert_eq!(config.query["token"], "abc");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_unknown_revision() {
        let toml_str = r#"
            [engine]
            revision = 7
        "#;
        assert!(toml::from_str::<ClientConfig>(toml_str).is_err());
    }

    #[test]
    fn test_validate_delay_bounds() {
        let mut config = ClientConfig::new("http://localhost");
        config.reconnect.delay_ms = 30_000;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_from_file_missing() {
        let err = ClientConfig::from_file("/nonexistent/sockio.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
