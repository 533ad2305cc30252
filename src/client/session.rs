// ABOUTME: Client transmission session: rate configuration, connection state and counters

use std::time::Duration;

use serde::Serialize;

use crate::config::{validate_packet_size, ClientConfig, ConfigError};

/// Target rate divided by this gives the packets per batch
const BATCHES_PER_SECOND: f64 = 200.0;

/// Upper bound on the bytes written by a single batch
pub const MAX_BATCH_BYTES: usize = 16 * 1024 * 1024;

/// Pacing parameters for one transmission session
///
/// Immutable once built; the derived batch size and intervals are fixed for
/// the session.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RateConfig {
    target_rate: f64,
    packet_size: usize,
    batch_size: usize,
    #[serde(with = "crate::config::duration_secs")]
    duration: Duration,
    #[serde(skip)]
    packet_interval: Duration,
    #[serde(skip)]
    batch_interval: Duration,
}

impl RateConfig {
    pub fn new(target_rate: f64, packet_size: usize, duration: Duration) -> Result<Self, ConfigError> {
        if !target_rate.is_finite() || target_rate <= 0.0 {
            return Err(ConfigError::invalid(
                "target_rate",
                format!("must be a positive number, got {target_rate}"),
            ));
        }
        validate_packet_size(packet_size)?;

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let batch_size = ((target_rate / BATCHES_PER_SECOND).floor() as usize).max(1);
        if batch_size.saturating_mul(packet_size) > MAX_BATCH_BYTES {
            return Err(ConfigError::invalid(
                "target_rate",
                format!("{target_rate} packets/s needs batches over {MAX_BATCH_BYTES} bytes"),
            ));
        }

        let interval = |secs: f64| {
            Duration::try_from_secs_f64(secs).map_err(|_| {
                ConfigError::invalid(
                    "target_rate",
                    format!("{target_rate} packets/s gives an unrepresentable send interval"),
                )
            })
        };
        let packet_interval = interval(1.0 / target_rate)?;
        let batch_interval = interval(batch_size as f64 / target_rate)?;

        Ok(Self {
            target_rate,
            packet_size,
            batch_size,
            duration,
            packet_interval,
            batch_interval,
        })
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self, ConfigError> {
        Self::new(config.target_rate, config.packet_size, config.duration)
    }

    /// Packets per second
    pub const fn target_rate(&self) -> f64 {
        self.target_rate
    }

    pub const fn packet_size(&self) -> usize {
        self.packet_size
    }

    /// Packets written per batch
    pub const fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub const fn duration(&self) -> Duration {
        self.duration
    }

    /// Bytes written per batch
    pub const fn batch_bytes(&self) -> usize {
        self.batch_size * self.packet_size
    }

    /// Nominal spacing between packets
    pub const fn packet_interval(&self) -> Duration {
        self.packet_interval
    }

    /// Deadline increment per batch
    pub const fn batch_interval(&self) -> Duration {
        self.batch_interval
    }
}

/// Connection state of a client session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Transmitting,
    Closed,
}

/// Cumulative send counters for a session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionCounters {
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub send_errors: u64,
    pub reconnects: u64,
}

/// One client's transmission session
#[derive(Debug, Clone)]
pub struct ClientSession {
    id: String,
    rate: RateConfig,
    state: SessionState,
    counters: SessionCounters,
}

impl ClientSession {
    pub fn new(id: impl Into<String>, rate: RateConfig) -> Self {
        Self {
            id: id.into(),
            rate,
            state: SessionState::Disconnected,
            counters: SessionCounters::default(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub const fn rate(&self) -> &RateConfig {
        &self.rate
    }

    pub const fn state(&self) -> SessionState {
        self.state
    }

    pub const fn counters(&self) -> SessionCounters {
        self.counters
    }

    pub(crate) fn set_state(&mut self, state: SessionState) {
        self.state = state;
    }

    pub(crate) fn record_batch(&mut self, packets: u64, bytes: u64) {
        self.counters.packets_sent += packets;
        self.counters.bytes_sent += bytes;
    }

    pub(crate) fn record_send_error(&mut self) {
        self.counters.send_errors += 1;
    }

    pub(crate) fn record_reconnect(&mut self) {
        self.counters.reconnects += 1;
    }
}

/// Outcome of one `transmit` call
#[derive(Debug, Clone, Serialize)]
pub struct SessionResult {
    pub id: String,
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub send_errors: u64,
    pub reconnects: u64,
    pub batches: u64,
    #[serde(with = "crate::config::duration_secs")]
    pub elapsed: Duration,
    pub target_rate: f64,
    pub achieved_rate: f64,
    #[serde(with = "crate::config::duration_secs")]
    pub max_batch_gap: Duration,
    pub within_tolerance: bool,
}
