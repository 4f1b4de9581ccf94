//! Configuration for a syncing node
//!
//! Loaded from a TOML file, overridable through `PEERSYNC_*` environment
//! variables, and validated before use.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// File name of the redb database inside `data_dir`
pub const DATABASE_FILE: &str = "peersync.redb";

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    FileReadError(String),

    #[error("Failed to write configuration file: {0}")]
    FileWriteError(String),

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Failed to serialize configuration: {0}")]
    SerializeError(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Settings for the store, the heartbeat and the connection manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Directory holding the database
    pub data_dir: PathBuf,

    /// Name announced to peers; the store's default is used when unset
    pub device_name: Option<String>,

    /// Delay between the end of one heartbeat round and the start of the next
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,

    /// Deadline for a channel to report itself open
    #[serde(with = "humantime_serde")]
    pub handshake_timeout: Duration,

    /// After this long without a response a peer falls back to Idle
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Bound on queueing one frame to a peer's channel
    #[serde(with = "humantime_serde")]
    pub send_timeout: Duration,

    /// Largest frame accepted from the wire
    pub max_frame_bytes: usize,

    /// Default tracing filter (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            device_name: None,
            heartbeat_interval: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            send_timeout: Duration::from_secs(10),
            max_frame_bytes: 16 * 1024 * 1024,
            log_level: "info".to_string(),
        }
    }
}

impl SyncConfig {
    /// Load configuration from a TOML file. Missing fields take defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::FileReadError(e.to_string()))?;

        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Apply `PEERSYNC_*` environment overrides on top of this configuration
    pub fn apply_env(self) -> Result<Self, ConfigError> {
        self.apply_overrides(|key| env::var(key).ok())
    }

    /// Apply `PEERSYNC_*` overrides read through `lookup`, then validate
    pub fn apply_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(dir) = lookup("PEERSYNC_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(name) = lookup("PEERSYNC_DEVICE_NAME") {
            self.device_name = Some(name);
        }
        if let Some(interval) = lookup("PEERSYNC_HEARTBEAT_INTERVAL") {
            self.heartbeat_interval = parse_duration("PEERSYNC_HEARTBEAT_INTERVAL", &interval)?;
        }
        if let Some(timeout) = lookup("PEERSYNC_HANDSHAKE_TIMEOUT") {
            self.handshake_timeout = parse_duration("PEERSYNC_HANDSHAKE_TIMEOUT", &timeout)?;
        }
        if let Some(level) = lookup("PEERSYNC_LOG_LEVEL") {
            self.log_level = level;
        }

        self.validate()?;
        Ok(self)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let durations = [
            ("heartbeat_interval", self.heartbeat_interval),
            ("handshake_timeout", self.handshake_timeout),
            ("request_timeout", self.request_timeout),
            ("send_timeout", self.send_timeout),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(ConfigError::ValidationFailed(format!(
                    "{} must be greater than 0",
                    name
                )));
            }
        }

        if self.max_frame_bytes == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_frame_bytes must be greater than 0".to_string(),
            ));
        }

        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(ConfigError::ValidationFailed(format!(
                "Invalid log level: {}",
                self.log_level
            )));
        }

        Ok(())
    }

    /// Save configuration to file
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let contents =
            toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, contents).map_err(|e| ConfigError::FileWriteError(e.to_string()))?;

        Ok(())
    }

    /// Path of the database file
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(DATABASE_FILE)
    }
}

fn parse_duration(var: &str, value: &str) -> Result<Duration, ConfigError> {
    humantime_serde::re::humantime::parse_duration(value)
        .map_err(|e| ConfigError::InvalidValue(format!("{}: {}", var, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = SyncConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.handshake_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_config_validation() {
        let mut config = SyncConfig::default();
        config.heartbeat_interval = Duration::ZERO;
        assert!(config.validate().is_err());

        config = SyncConfig::default();
        config.max_frame_bytes = 0;
        assert!(config.validate().is_err());

        config = SyncConfig::default();
        config.log_level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_file_takes_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("peersync.toml");
        std::fs::write(
            &path,
            "device_name = \"garage laptop\"\nheartbeat_interval = \"5s\"\n",
        )
        .unwrap();

        let config = SyncConfig::from_file(&path).unwrap();
        assert_eq!(config.device_name.as_deref(), Some("garage laptop"));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(config.handshake_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_save_and_reload() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("peersync.toml");

        let mut config = SyncConfig::default();
        config.data_dir = temp.path().to_path_buf();
        config.request_timeout = Duration::from_secs(45);
        config.save_to_file(&path).unwrap();

        let loaded = SyncConfig::from_file(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.database_path(), temp.path().join(DATABASE_FILE));
    }

    #[test]
    fn test_unparseable_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("broken.toml");
        std::fs::write(&path, "heartbeat_interval = [").unwrap();
        assert!(matches!(
            SyncConfig::from_file(&path),
            Err(ConfigError::ParseError(_))
        ));
    }

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: std::collections::HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_overrides_replace_file_values() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("peersync.toml");
        std::fs::write(
            &path,
            "device_name = \"from-file\"\nheartbeat_interval = \"20s\"\n",
        )
        .unwrap();

        let config = SyncConfig::from_file(&path)
            .unwrap()
            .apply_overrides(vars(&[
                ("PEERSYNC_HEARTBEAT_INTERVAL", "5s"),
                ("PEERSYNC_LOG_LEVEL", "debug"),
            ]))
            .unwrap();

        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(config.log_level, "debug");
        // Untouched fields keep the file's values
        assert_eq!(config.device_name.as_deref(), Some("from-file"));
    }

    #[test]
    fn test_invalid_overrides_are_rejected() {
        let unparseable =
            SyncConfig::default().apply_overrides(vars(&[("PEERSYNC_HEARTBEAT_INTERVAL", "soon")]));
        assert!(matches!(unparseable, Err(ConfigError::InvalidValue(_))));

        let zero =
            SyncConfig::default().apply_overrides(vars(&[("PEERSYNC_HANDSHAKE_TIMEOUT", "0s")]));
        assert!(matches!(zero, Err(ConfigError::ValidationFailed(_))));

        let level = SyncConfig::default().apply_overrides(vars(&[("PEERSYNC_LOG_LEVEL", "loud")]));
        assert!(matches!(level, Err(ConfigError::ValidationFailed(_))));
    }

    #[test]
    fn test_apply_env_reads_process_environment() {
        // The only test in this crate that touches PEERSYNC_* variables
        env::set_var("PEERSYNC_HEARTBEAT_INTERVAL", "5s");
        let config = SyncConfig::default().apply_env();
        env::set_var("PEERSYNC_HEARTBEAT_INTERVAL", "0s");
        let rejected = SyncConfig::default().apply_env();
        env::remove_var("PEERSYNC_HEARTBEAT_INTERVAL");

        assert_eq!(config.unwrap().heartbeat_interval, Duration::from_secs(5));
        assert!(matches!(rejected, Err(ConfigError::ValidationFailed(_))));
    }
}
