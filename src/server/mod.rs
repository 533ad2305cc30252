// ABOUTME: Multi-worker TCP ingest server
//
// Accepts packet streams, hands each connection to one worker from a
// supervised pool and folds per-worker events into aggregate statistics.
//
// Key components:
// - listener: bind, accept loop and the `Server` lifecycle
// - dispatcher: per-connection worker selection and bounded handoff
// - worker: the per-connection receive loop and worker records
// - supervisor: liveness polling, restart and graceful drain
// - stats: event aggregation and published snapshots

pub mod dispatcher;
pub mod listener;
pub mod stats;
pub mod supervisor;
pub mod worker;

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::config::ConfigError;

pub use dispatcher::{DispatchError, DispatchQueue, Dispatcher};
pub use listener::Server;
pub use stats::{StatEvent, StatsAggregator, StatsRecorder, StatsSnapshot, WorkerStats};
pub use supervisor::{DrainOutcome, Supervisor};
pub use worker::{Connection, ConnectionState, WorkerRecord, WorkerState};

/// Stable worker identifier, an index in `[0, worker_count)`
pub type WorkerId = usize;

/// Errors raised while starting the server
#[derive(Debug, Error)]
pub enum ServerError {
    /// Configuration failed validation
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Host name did not resolve
    #[error("Failed to resolve {host}:{port}: {source}")]
    Resolve {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    /// Listener could not be bound
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Bound listener reported no local address
    #[error("Failed to read listener address: {0}")]
    LocalAddr(#[source] std::io::Error),
}

/// Outcome of a graceful stop
#[derive(Debug, Clone, Serialize)]
pub struct ShutdownReport {
    /// Every active connection finished within the drain timeout
    pub drained: bool,

    /// Workers terminated while still serving
    pub forced_workers: Vec<WorkerId>,

    /// Queued connections closed without service
    pub discarded: usize,

    /// Total stop duration
    #[serde(with = "crate::config::duration_secs")]
    pub elapsed: Duration,

    /// Final statistics after every event was folded
    pub stats: StatsSnapshot,
}
