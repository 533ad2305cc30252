// ABOUTME: Client-side configuration: target rate, packet size, duration, retry budget

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{duration_secs, validate_packet_size, ConfigError};
use crate::client::RateConfig;

/// Configuration for the packet client and simulator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server host name or address
    pub host: String,

    /// Server port
    pub port: u16,

    /// Target packets per second for each client
    pub target_rate: f64,

    /// Packet size in bytes (must match the server)
    pub packet_size: usize,

    /// Transmission duration
    #[serde(with = "duration_secs")]
    pub duration: Duration,

    /// Number of concurrent clients the simulator starts
    pub clients: usize,

    // === Connection retry ===
    /// Connect attempts before giving up
    pub connect_attempts: u32,

    /// Delay after the first failed attempt
    #[serde(with = "duration_secs")]
    pub backoff_initial: Duration,

    /// Growth factor applied to the delay after each failure
    pub backoff_multiplier: f64,

    /// Upper bound on the retry delay
    #[serde(with = "duration_secs")]
    pub backoff_max: Duration,

    /// Bound on a single connect attempt
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    // === Pacing ===
    /// Relative deviation from the target rate tolerated before warning
    pub rate_tolerance: f64,

    /// SO_RCVBUF / SO_SNDBUF for the client socket
    pub socket_buffer_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8888,
            target_rate: 10_000.0,
            packet_size: 16,
            duration: Duration::from_secs(60),
            clients: 1,

            connect_attempts: 10,
            backoff_initial: Duration::from_millis(500),
            backoff_multiplier: 1.5,
            backoff_max: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(2),

            rate_tolerance: 0.05,
            socket_buffer_size: 128 * 1024,
        }
    }
}

impl ClientConfig {
    /// Check every field is within its allowed range
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::invalid("host", "must not be empty"));
        }
        if !self.target_rate.is_finite() || self.target_rate <= 0.0 {
            return Err(ConfigError::invalid(
                "target_rate",
                format!("must be a positive number, got {}", self.target_rate),
            ));
        }
        validate_packet_size(self.packet_size)?;
        RateConfig::from_config(self)?;
        if self.clients == 0 {
            return Err(ConfigError::invalid("clients", "must be at least 1"));
        }
        if self.connect_attempts == 0 {
            return Err(ConfigError::invalid("connect_attempts", "must be at least 1"));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(ConfigError::invalid(
                "backoff_multiplier",
                format!("must be at least 1.0, got {}", self.backoff_multiplier),
            ));
        }
        if self.backoff_max < self.backoff_initial {
            return Err(ConfigError::invalid(
                "backoff_max",
                "must not be smaller than backoff_initial",
            ));
        }
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::invalid("connect_timeout", "must be greater than zero"));
        }
        if !(0.0..1.0).contains(&self.rate_tolerance) {
            return Err(ConfigError::invalid(
                "rate_tolerance",
                format!("must be in [0, 1), got {}", self.rate_tolerance),
            ));
        }
        if self.socket_buffer_size == 0 {
            return Err(ConfigError::invalid(
                "socket_buffer_size",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}
