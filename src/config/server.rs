// ABOUTME: Server-side configuration: listener, worker pool, dispatch policy and timeouts

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{duration_secs, validate_packet_size, ConfigError};

/// Load-balancing policy used by the connection dispatcher
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalancePolicy {
    /// Rotate through workers regardless of load
    RoundRobin,
    /// Pick the worker with the fewest active plus queued connections
    #[default]
    LeastConnections,
    /// Weigh each worker's error rate against its load factor
    Scored,
}

/// Configuration for the ingest server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Interface to bind
    pub host: String,

    /// TCP port to bind (0 picks an ephemeral port)
    pub port: u16,

    /// Number of workers in the pool
    pub worker_count: usize,

    /// Upper bound on queued plus active connections
    pub max_clients: usize,

    /// Fixed packet size used to infer packet counts from byte counts
    pub packet_size: usize,

    /// Dispatch policy
    pub policy: BalancePolicy,

    // === Supervision ===
    /// Interval between worker liveness polls
    #[serde(with = "duration_secs")]
    pub liveness_interval: Duration,

    /// How long an idle worker waits on its queue before re-checking shutdown
    #[serde(with = "duration_secs")]
    pub queue_wait: Duration,

    /// Bound on a single socket read
    #[serde(with = "duration_secs")]
    pub read_timeout: Duration,

    /// Accept poll interval for the listener loop
    #[serde(with = "duration_secs")]
    pub accept_poll_interval: Duration,

    /// Default drain timeout for graceful shutdown
    #[serde(with = "duration_secs")]
    pub drain_timeout: Duration,

    // === Stats ===
    /// Interval between periodic stats log lines (0 disables)
    #[serde(with = "duration_secs")]
    pub stats_interval: Duration,

    /// Capacity of the stats event channel
    pub event_capacity: usize,

    // === Sockets ===
    /// SO_RCVBUF / SO_SNDBUF for listener and accepted sockets
    pub socket_buffer_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8888,
            worker_count: 4,
            max_clients: 10,
            packet_size: 16,
            policy: BalancePolicy::default(),

            liveness_interval: Duration::from_secs(1),
            queue_wait: Duration::from_secs(1),
            read_timeout: Duration::from_secs(1),
            accept_poll_interval: Duration::from_millis(100),
            drain_timeout: Duration::from_secs(5),

            stats_interval: Duration::from_secs(5),
            event_capacity: 65_536,

            socket_buffer_size: 128 * 1024,
        }
    }
}

impl ServerConfig {
    /// Check every field is within its allowed range
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::invalid("host", "must not be empty"));
        }
        if self.worker_count == 0 {
            return Err(ConfigError::invalid("worker_count", "must be at least 1"));
        }
        if self.max_clients == 0 {
            return Err(ConfigError::invalid("max_clients", "must be at least 1"));
        }
        validate_packet_size(self.packet_size)?;

        for (field, value) in [
            ("liveness_interval", self.liveness_interval),
            ("queue_wait", self.queue_wait),
            ("read_timeout", self.read_timeout),
            ("accept_poll_interval", self.accept_poll_interval),
        ] {
            if value.is_zero() {
                return Err(ConfigError::invalid(field, "must be greater than zero"));
            }
        }

        if self.event_capacity == 0 {
            return Err(ConfigError::invalid("event_capacity", "must be at least 1"));
        }
        if self.socket_buffer_size == 0 {
            return Err(ConfigError::invalid(
                "socket_buffer_size",
                "must be greater than zero",
            ));
        }
        Ok(())
    }

    /// Per-worker handoff queue capacity derived from `max_clients`
    pub fn queue_capacity(&self) -> usize {
        self.max_clients.div_ceil(self.worker_count).max(1)
    }

    /// Socket address string for binding
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
