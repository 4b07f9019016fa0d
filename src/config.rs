//! Configuration for the waspconnd daemon.

use crate::error::AppError;
use crate::utxodb::confirm::ConfirmConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub waspconn: WaspConnConfig,
    #[serde(default)]
    pub webapi: WebApiConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default = "default_node_name")]
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaspConnConfig {
    /// Port for wasp client connections.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Mock the value tangle with the in-memory UTXO emulator.
    #[serde(default = "default_true")]
    pub utxodb_enabled: bool,
    /// Emulated confirmation delay in seconds; 0 confirms instantly.
    #[serde(default)]
    pub confirm_delay_seconds: u64,
    /// Randomize each confirmation delay around the configured value.
    #[serde(default)]
    pub randomize_confirm: bool,
    /// Confirm the first transaction of a conflict set instead of dropping
    /// the whole set.
    #[serde(default)]
    pub confirm_first_in_conflict: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebApiConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_webapi_bind_address")]
    pub bind_address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (trace/debug/info/warn/error).
    #[serde(default = "default_log_level")]
    pub level: String,
    /// "text" or "json".
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_node_name() -> String {
    "waspconnd".to_string()
}

fn default_port() -> u16 {
    5000
}

fn default_true() -> bool {
    true
}

fn default_webapi_bind_address() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            name: default_node_name(),
        }
    }
}

impl Default for WaspConnConfig {
    fn default() -> Self {
        WaspConnConfig {
            port: default_port(),
            utxodb_enabled: true,
            confirm_delay_seconds: 0,
            randomize_confirm: false,
            confirm_first_in_conflict: false,
        }
    }
}

impl Default for WebApiConfig {
    fn default() -> Self {
        WebApiConfig {
            enabled: true,
            bind_address: default_webapi_bind_address(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl WaspConnConfig {
    pub fn confirm_config(&self) -> ConfirmConfig {
        ConfirmConfig {
            confirm_time: Duration::from_secs(self.confirm_delay_seconds),
            randomize: self.randomize_confirm,
            confirm_first_in_conflict: self.confirm_first_in_conflict,
        }
    }
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Config, AppError> {
        let content = fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| AppError::Config(e.to_string()))
    }

    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), AppError> {
        let content = toml::to_string_pretty(self).map_err(|e| AppError::Config(e.to_string()))?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Load the config file, falling back to defaults when it is missing.
    pub fn load_or_default(path: impl AsRef<Path>) -> Config {
        match Config::load_from_file(path.as_ref()) {
            Ok(config) => config,
            Err(e) => {
                tracing::debug!(
                    "could not load config from {}: {}; using defaults",
                    path.as_ref().display(),
                    e
                );
                Config::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.waspconn.port, 5000);
        assert!(config.waspconn.utxodb_enabled);
        assert_eq!(config.waspconn.confirm_delay_seconds, 0);
        assert!(!config.waspconn.randomize_confirm);
        assert!(!config.waspconn.confirm_first_in_conflict);
        assert!(config.webapi.enabled);
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("waspconn.toml");

        let mut config = Config::default();
        config.waspconn.port = 5550;
        config.waspconn.confirm_delay_seconds = 3;
        config.waspconn.confirm_first_in_conflict = true;
        config.save_to_file(&path).unwrap();

        let loaded = Config::load_from_file(&path).unwrap();
        assert_eq!(loaded.waspconn.port, 5550);
        assert_eq!(loaded.waspconn.confirm_delay_seconds, 3);
        assert!(loaded.waspconn.confirm_first_in_conflict);
    }

    #[test]
    fn test_partial_file_gets_defaults() {
        let config: Config = toml::from_str("[waspconn]\nport = 6000\n").unwrap();
        assert_eq!(config.waspconn.port, 6000);
        assert!(config.waspconn.utxodb_enabled);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_confirm_config_mapping() {
        let mut config = Config::default();
        config.waspconn.confirm_delay_seconds = 2;
        config.waspconn.randomize_confirm = true;
        let confirm = config.waspconn.confirm_config();
        assert_eq!(confirm.confirm_time, Duration::from_secs(2));
        assert!(confirm.randomize);
        assert!(!confirm.confirm_first_in_conflict);
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = Config::load_or_default("/nonexistent/waspconn.toml");
        assert_eq!(config.waspconn.port, 5000);
    }
}
