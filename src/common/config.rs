//! Configuration file handling

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::endpoint::ClientConfig;

use super::paths::config_path;
use super::Result;

/// Main configuration structure
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    /// Session endpoint settings
    #[serde(default)]
    pub client: ClientSettings,

    /// Controller settings
    #[serde(default)]
    pub controller: ControllerSettings,
}

/// Session endpoint settings
#[derive(Debug, Deserialize, Clone)]
pub struct ClientSettings {
    /// Controller URL to connect to
    #[serde(default = "default_url")]
    pub url: String,

    /// Session identity, sent as the WebSocket sub-protocol
    #[serde(default = "default_id")]
    pub id: String,

    /// Connect immediately when the endpoint is constructed
    #[serde(default = "default_true")]
    pub auto_connect: bool,

    /// Reconnect after an abnormal close
    #[serde(default = "default_true")]
    pub auto_retry: bool,

    /// Delay before a reconnect attempt
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            url: default_url(),
            id: default_id(),
            auto_connect: true,
            auto_retry: true,
            retry_delay_ms: default_retry_delay(),
        }
    }
}

fn default_url() -> String {
    "ws://localhost:8090".to_string()
}

fn default_id() -> String {
    "default".to_string()
}

fn default_true() -> bool {
    true
}

fn default_retry_delay() -> u64 {
    500
}

/// Controller settings
#[derive(Debug, Deserialize, Clone)]
pub struct ControllerSettings {
    /// Address the controller listens on
    #[serde(default = "default_listen")]
    pub listen: String,

    /// How long `serve` waits for an endpoint to connect
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// How long `serve` waits for a requested run to finish
    #[serde(default = "default_run_timeout")]
    pub run_timeout_secs: u64,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            connect_timeout_secs: default_connect_timeout(),
            run_timeout_secs: default_run_timeout(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:8090".to_string()
}

fn default_connect_timeout() -> u64 {
    60
}

fn default_run_timeout() -> u64 {
    300
}

impl Config {
    /// Load configuration from the default config file
    ///
    /// Returns default configuration if file doesn't exist
    pub fn load() -> Result<Self> {
        match config_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Load configuration from an explicit path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| super::Error::FileRead {
            path: path.display().to_string(),
            error: e.to_string(),
        })?;
        toml::from_str(&content).map_err(|e| super::Error::ConfigParse(e.to_string()))
    }

    /// Compose an endpoint configuration from the `[client]` section
    pub fn client_config(&self) -> ClientConfig {
        let settings = &self.client;
        ClientConfig {
            url: settings.url.clone(),
            id: settings.id.clone(),
            auto_connect: settings.auto_connect,
            auto_retry: settings.auto_retry,
            retry_delay: Duration::from_millis(settings.retry_delay_ms),
            ..ClientConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.client.id, "default");
        assert!(config.client.auto_connect);
        assert!(config.client.auto_retry);
        assert_eq!(config.client.retry_delay_ms, 500);
        assert_eq!(config.controller.listen, "127.0.0.1:8090");
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[client]\nid = \"browser\"\nretry_delay_ms = 50").unwrap();

        let config = Config::load_from(file.path()).unwrap();
        assert_eq!(config.client.id, "browser");
        assert_eq!(config.client.retry_delay_ms, 50);
        assert_eq!(config.client.url, "ws://localhost:8090");
        assert_eq!(config.controller.run_timeout_secs, 300);

        let client = config.client_config();
        assert_eq!(client.id, "browser");
        assert_eq!(client.retry_delay, Duration::from_millis(50));
    }

    #[test]
    fn test_invalid_file_is_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[client]\nauto_retry = \"sometimes\"").unwrap();

        let err = Config::load_from(file.path()).unwrap_err();
        assert!(matches!(err, super::super::Error::ConfigParse(_)));
    }
}
