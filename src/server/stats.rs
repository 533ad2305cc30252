// ABOUTME: Stats aggregation for the ingest server
// ABOUTME: Folds discrete stat events from all workers into immutable published snapshots

//! Stats aggregation.
//!
//! Workers, the dispatcher and the supervisor never touch aggregate counters.
//! They hold a [`StatsRecorder`] and submit immutable [`StatEvent`]s over a
//! bounded channel. A single fold task owns the counters, applies events in
//! arrival order and publishes a fresh `Arc<StatsSnapshot>` after each batch.
//!
//! ```text
//! worker 0 ──┐
//! worker 1 ──┼─ try_send ─▶ [ bounded mpsc ] ─▶ fold task ─▶ watch<Arc<StatsSnapshot>>
//! dispatcher ┘                  │ full                         ▲
//!                               ▼                              │ snapshot()
//!                        dropped_events += 1              callers
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::WorkerId;

/// Maximum number of queued messages folded before a snapshot is published
const FOLD_BATCH: usize = 1024;

/// A discrete statistics event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatEvent {
    /// A worker started serving a connection
    ConnectionEstablished { worker_id: WorkerId },

    /// Bytes received on a connection
    PacketProcessed {
        worker_id: WorkerId,
        packets: u64,
        bytes: u64,
    },

    /// A connection closed (cleanly or after an I/O error)
    ConnectionClosed { worker_id: WorkerId },

    /// A connection was torn down by worker death or forced termination
    ConnectionAborted { worker_id: WorkerId },

    /// The dispatcher refused a connection
    ConnectionRejected,

    /// A worker hit an error on its connection
    Error { worker_id: WorkerId },

    /// The supervisor replaced a dead worker
    WorkerRestarted { worker_id: WorkerId },
}

enum Message {
    Event(StatEvent),
    Flush(oneshot::Sender<()>),
}

/// Per-worker breakdown entry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub worker_id: WorkerId,
    pub packets: u64,
    pub bytes: u64,
    pub connections_served: u64,
    pub errors: u64,
    pub restarts: u64,
    pub active: u64,
}

/// Immutable aggregate view produced by one fold cycle
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub total_packets: u64,
    pub total_bytes: u64,
    pub active_connections: u64,
    pub connections_served: u64,
    pub errors: u64,
    pub rejected: u64,
    pub restarts: u64,
    pub dropped_events: u64,
    #[serde(with = "crate::config::duration_secs")]
    pub uptime: Duration,
    pub workers: Vec<WorkerStats>,
}

impl StatsSnapshot {
    /// Average packets per second since the aggregator started
    pub fn packet_rate(&self) -> f64 {
        let secs = self.uptime.as_secs_f64();
        if secs > 0.0 {
            self.total_packets as f64 / secs
        } else {
            0.0
        }
    }

    /// Breakdown entry for one worker
    pub fn worker(&self, worker_id: WorkerId) -> Option<&WorkerStats> {
        self.workers.get(worker_id)
    }
}

/// Mutable fold state, owned exclusively by the fold task
#[derive(Debug)]
struct FoldState {
    started: Instant,
    total_packets: u64,
    total_bytes: u64,
    active_connections: u64,
    connections_served: u64,
    errors: u64,
    rejected: u64,
    restarts: u64,
    workers: Vec<WorkerStats>,
}

impl FoldState {
    fn new(worker_count: usize) -> Self {
        Self {
            started: Instant::now(),
            total_packets: 0,
            total_bytes: 0,
            active_connections: 0,
            connections_served: 0,
            errors: 0,
            rejected: 0,
            restarts: 0,
            workers: (0..worker_count)
                .map(|worker_id| WorkerStats {
                    worker_id,
                    ..WorkerStats::default()
                })
                .collect(),
        }
    }

    fn worker_mut(&mut self, worker_id: WorkerId) -> &mut WorkerStats {
        if worker_id >= self.workers.len() {
            let start = self.workers.len();
            self.workers.extend((start..=worker_id).map(|worker_id| WorkerStats {
                worker_id,
                ..WorkerStats::default()
            }));
        }
        &mut self.workers[worker_id]
    }

    fn release_active(&mut self, worker_id: WorkerId) {
        if self.active_connections == 0 {
            warn!(worker_id = worker_id, "Connection close without matching open, clamping at zero");
        } else {
            self.active_connections -= 1;
        }

        let worker = self.worker_mut(worker_id);
        worker.active = worker.active.saturating_sub(1);
    }

    fn apply(&mut self, event: StatEvent) {
        match event {
            StatEvent::ConnectionEstablished { worker_id } => {
                self.active_connections += 1;
                self.connections_served += 1;
                let worker = self.worker_mut(worker_id);
                worker.active += 1;
                worker.connections_served += 1;
            }
            StatEvent::PacketProcessed {
                worker_id,
                packets,
                bytes,
            } => {
                self.total_packets += packets;
                self.total_bytes += bytes;
                let worker = self.worker_mut(worker_id);
                worker.packets += packets;
                worker.bytes += bytes;
            }
            StatEvent::ConnectionClosed { worker_id } => {
                self.release_active(worker_id);
            }
            StatEvent::ConnectionAborted { worker_id } => {
                self.release_active(worker_id);
                self.errors += 1;
                self.worker_mut(worker_id).errors += 1;
            }
            StatEvent::ConnectionRejected => {
                self.errors += 1;
                self.rejected += 1;
            }
            StatEvent::Error { worker_id } => {
                self.errors += 1;
                self.worker_mut(worker_id).errors += 1;
            }
            StatEvent::WorkerRestarted { worker_id } => {
                self.restarts += 1;
                self.worker_mut(worker_id).restarts += 1;
            }
        }
    }

    fn snapshot(&self, dropped_events: u64) -> StatsSnapshot {
        StatsSnapshot {
            total_packets: self.total_packets,
            total_bytes: self.total_bytes,
            active_connections: self.active_connections,
            connections_served: self.connections_served,
            errors: self.errors,
            rejected: self.rejected,
            restarts: self.restarts,
            dropped_events,
            uptime: self.started.elapsed(),
            workers: self.workers.clone(),
        }
    }
}

/// Cheap, cloneable handle for submitting stat events
#[derive(Debug, Clone)]
pub struct StatsRecorder {
    tx: mpsc::Sender<Message>,
    dropped: Arc<AtomicU64>,
}

impl StatsRecorder {
    /// Submit an event without blocking
    ///
    /// When the channel is full the event is dropped and counted in
    /// `dropped_events` rather than stalling the caller's hot path.
    pub fn record(&self, event: StatEvent) {
        match self.tx.try_send(Message::Event(event)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                trace!(event = ?event, "Stats aggregator closed, event dropped");
            }
        }
    }
}

/// Owner of the fold task and the published snapshot
pub struct StatsAggregator {
    recorder: StatsRecorder,
    snapshot_rx: watch::Receiver<Arc<StatsSnapshot>>,
    handle: JoinHandle<()>,
}

impl std::fmt::Debug for StatsAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatsAggregator")
            .field("dropped", &self.recorder.dropped.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl StatsAggregator {
    /// Start the fold task
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(worker_count: usize, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let dropped = Arc::new(AtomicU64::new(0));

        let state = FoldState::new(worker_count);
        let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(state.snapshot(0)));

        let handle = tokio::spawn(Self::fold_loop(rx, state, snapshot_tx, Arc::clone(&dropped)));

        Self {
            recorder: StatsRecorder { tx, dropped },
            snapshot_rx,
            handle,
        }
    }

    /// Handle for event producers
    pub fn recorder(&self) -> StatsRecorder {
        self.recorder.clone()
    }

    /// Submit an event without blocking
    pub fn record(&self, event: StatEvent) {
        self.recorder.record(event);
    }

    /// Latest published snapshot
    pub fn snapshot(&self) -> Arc<StatsSnapshot> {
        Arc::clone(&self.snapshot_rx.borrow())
    }

    /// Receiver that observes every published snapshot
    pub fn subscribe(&self) -> watch::Receiver<Arc<StatsSnapshot>> {
        self.snapshot_rx.clone()
    }

    /// Wait until every event recorded before this call is folded and published
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.recorder.tx.send(Message::Flush(done_tx)).await.is_err() {
            return;
        }
        let _ = done_rx.await;
    }

    async fn fold_loop(
        mut rx: mpsc::Receiver<Message>,
        mut state: FoldState,
        snapshot_tx: watch::Sender<Arc<StatsSnapshot>>,
        dropped: Arc<AtomicU64>,
    ) {
        debug!("Stats fold loop started");
        let mut waiters = Vec::new();

        while let Some(first) = rx.recv().await {
            let mut next = Some(first);
            let mut folded = 0;

            while let Some(message) = next.take() {
                match message {
                    Message::Event(event) => state.apply(event),
                    Message::Flush(done) => waiters.push(done),
                }
                folded += 1;
                if folded < FOLD_BATCH {
                    next = rx.try_recv().ok();
                }
            }

            snapshot_tx.send_replace(Arc::new(state.snapshot(dropped.load(Ordering::Relaxed))));

            for done in waiters.drain(..) {
                let _ = done.send(());
            }
        }

        debug!("Stats fold loop ended");
    }
}

impl Drop for StatsAggregator {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Periodic stats log line, the server's "monitor" output
#[derive(Debug)]
pub struct StatsReporter {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl StatsReporter {
    /// Start logging totals every `interval`
    pub fn start(snapshots: watch::Receiver<Arc<StatsSnapshot>>, interval: Duration) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);

        let handle = tokio::spawn(async move {
            let mut last_packets = 0u64;
            loop {
                tokio::time::sleep(interval).await;
                if flag.load(Ordering::SeqCst) {
                    break;
                }

                let snapshot = Arc::clone(&snapshots.borrow());
                let window_rate =
                    snapshot.total_packets.saturating_sub(last_packets) as f64 / interval.as_secs_f64();
                last_packets = snapshot.total_packets;

                info!(
                    total_packets = snapshot.total_packets,
                    total_bytes = snapshot.total_bytes,
                    active = snapshot.active_connections,
                    errors = snapshot.errors,
                    rate = snapshot.packet_rate(),
                    window_rate = window_rate,
                    "Throughput"
                );
            }
        });

        Self {
            shutdown,
            handle: Some(handle),
        }
    }

    /// Stop the reporter task
    pub async fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            handle.abort();
            let _ = handle.await;
        }
    }
}

impl Drop for StatsReporter {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
