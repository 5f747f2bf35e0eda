//! CLI configuration.
//!
//! The client settings sit at the top level of the file, next to the
//! `[subscribe]` and `[metrics]` tables:
//!
//! ```toml
//! url = "http://localhost:3000"
//!
//! [reconnect]
//! attempts = 10
//!
//! [subscribe]
//! "/" = ["welcome"]
//! "/chat" = ["message", "typing"]
//!
//! [metrics]
//! enabled = true
//! port = 9091
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sockio_core::ClientConfig;
use std::collections::BTreeMap;
use std::path::Path;

/// CLI configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Connection settings.
    #[serde(flatten)]
    pub client: ClientConfig,

    /// Events to print, keyed by namespace.
    #[serde(default)]
    pub subscribe: BTreeMap<String, Vec<String>>,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Serve a Prometheus endpoint.
    #[serde(default)]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_metrics_port() -> u16 {
    9091
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from file or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
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
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config
            .client
            .validate()
            .with_context(|| format!("Invalid config file: {}", path.display()))?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sockio_protocol::Revision;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.subscribe.is_empty());
        assert!(!config.metrics.enabled);
        assert_eq!(config.metrics.port, 9091);
        assert_eq!(config.client.reconnect.delay_ms, 5000);
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            url = "https://rt.example.com"

            [engine]
            revision = 3

            [reconnect]
            attempts = 4

            [subscribe]
            "/chat" = ["message", "typing"]

            [metrics]
            enabled = true
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.client.url, "https://rt.example.com");
        assert_eq!(config.client.engine.revision, Revision::V3);
        assert_eq!(config.client.reconnect.attempts, Some(4));
        assert_eq!(config.subscribe["/chat"], vec!["message", "typing"]);
        assert!(config.metrics.enabled);
        assert_eq!(config.metrics.port, 9091);
    }

    #[test]
    fn test_from_file_rejects_inverted_delays() {
        let path = std::env::temp_dir().join(format!("sockio-cli-{}.toml", std::process::id()));
        std::fs::write(
            &path,
            "[reconnect]\ndelay_ms = 9000\ndelay_max_ms = 1000\n",
        )
        .unwrap();

        let result = Config::from_file(&path);
        std::fs::remove_file(&path).unwrap();
        assert!(result.is_err());
    }

    #[test]
    fn test_from_file_missing() {
        let err = Config::from_file("/nonexistent/sockio.toml").unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
