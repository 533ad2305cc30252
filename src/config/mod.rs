// ABOUTME: Configuration for the ingest server and the packet client
//
// Defines the explicit, validated configuration structures:
// - ServerConfig: listener address, worker pool size, admission bound, timeouts
// - ClientConfig: target rate, packet size, session duration, retry budget
// Both are loaded from an optional TOML file with `[server]` and `[client]` tables.

pub mod client;
pub mod server;

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

pub use client::ClientConfig;
pub use server::{BalancePolicy, ServerConfig};

/// Largest packet size accepted by either end
pub const MAX_PACKET_SIZE: usize = 64 * 1024;

/// Errors raised while loading or validating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("Failed to read config from {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid TOML for this schema
    #[error("Failed to parse config from {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// A field holds a value outside its allowed range
    #[error("Invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Top-level configuration file layout
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub client: ClientConfig,
}

impl Config {
    /// Load and validate configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let config: Self = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        config.validate()?;
        debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Load from the first config file found in the default locations,
    /// falling back to defaults when none exists
    pub fn discover() -> Result<Self, ConfigError> {
        for path in Self::config_paths() {
            if path.exists() {
                return Self::load(&path);
            }
        }
        Ok(Self::default())
    }

    /// Config file paths in order of precedence
    fn config_paths() -> Vec<PathBuf> {
        let mut paths = vec![];

        // 1. Working directory
        if let Ok(cwd) = std::env::current_dir() {
            paths.push(cwd.join("hfingest.toml"));
        }

        // 2. User config (~/.config/hfingest/config.toml)
        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("hfingest").join("config.toml"));
        }

        paths
    }

    /// Validate both sections
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.validate()?;
        self.client.validate()
    }
}

pub(crate) fn validate_packet_size(packet_size: usize) -> Result<(), ConfigError> {
    if packet_size == 0 || packet_size > MAX_PACKET_SIZE {
        return Err(ConfigError::invalid(
            "packet_size",
            format!("must be between 1 and {MAX_PACKET_SIZE} bytes, got {packet_size}"),
        ));
    }
    Ok(())
}

/// Serde helper for Duration as fractional seconds (f64)
pub(crate) mod duration_secs {
    use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    fn write_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.worker_count, 4);
        assert_eq!(config.server.max_clients, 10);
    }

    #[test]
    fn test_load_partial_file_keeps_defaults() {
        let file = write_config(
            r#"
            [server]
            port = 9999
            worker_count = 8
            policy = "round_robin"

            [client]
            target_rate = 500.0
            duration = 2.5
            "#,
        );

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.server.port, 9999);
        assert_eq!(config.server.worker_count, 8);
        assert_eq!(config.server.policy, BalancePolicy::RoundRobin);
        assert_eq!(config.server.max_clients, 10);
        assert_eq!(config.client.duration, Duration::from_millis(2500));
        assert_eq!(config.client.packet_size, 16);
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        let file = write_config("[server]\nworker_count = 0\n");
        let err = Config::load(file.path()).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "worker_count",
                ..
            }
        ));
    }

    #[test]
    fn test_load_rejects_negative_duration() {
        let file = write_config("[client]\nduration = -1.0\n");
        let err = Config::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load(Path::new("/nonexistent/hfingest.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
        assert!(err.to_string().contains("/nonexistent/hfingest.toml"));
    }

    #[test]
    fn test_toml_roundtrip_preserves_durations() {
        let mut config = Config::default();
        config.server.drain_timeout = Duration::from_millis(1500);
        config.client.backoff_initial = Duration::from_millis(250);

        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();

        assert_eq!(parsed.server.drain_timeout, Duration::from_millis(1500));
        assert_eq!(parsed.client.backoff_initial, Duration::from_millis(250));
    }

    #[test]
    fn test_packet_size_bounds() {
        assert!(validate_packet_size(16).is_ok());
        assert!(validate_packet_size(32).is_ok());
        assert!(validate_packet_size(0).is_err());
        assert!(validate_packet_size(MAX_PACKET_SIZE + 1).is_err());
    }
}
