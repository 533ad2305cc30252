// ABOUTME: Worker supervision: spawn the pool, replace dead workers, drain on shutdown
//
// The supervisor is the only writer of worker lifecycle state. A liveness
// loop polls every worker task; a finished task is marked dead and replaced
// under the same id, fed from the same handoff queue, with its restart
// counter bumped. Shutdown waits for active connections to drain and then
// forcibly terminates whatever is still serving.

// Allow if-let/else patterns instead of map_or_else for readability
#![allow(clippy::option_if_let_else)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::dispatcher::{DispatchQueue, Dispatcher};
use super::stats::{StatEvent, StatsRecorder};
use super::worker::{Worker, WorkerRecord, WorkerSettings, WorkerState};
use super::WorkerId;
use crate::config::ServerConfig;

/// Poll interval while waiting for active connections to drain
const DRAIN_POLL: Duration = Duration::from_millis(50);

/// Extra time granted to idle workers beyond one queue wait
const JOIN_MARGIN: Duration = Duration::from_millis(500);

/// Result of draining the worker pool
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainOutcome {
    /// Every active connection finished before the drain timeout
    pub drained: bool,

    /// Workers terminated while still serving a connection
    pub forced_workers: Vec<WorkerId>,

    /// Queued connections closed without being served
    pub discarded: usize,
}

/// State shared between the supervisor and its liveness loop
struct Pool {
    records: Vec<Arc<WorkerRecord>>,
    queues: Vec<DispatchQueue>,
    handles: Mutex<Vec<Option<JoinHandle<()>>>>,
    dispatcher: Arc<Dispatcher>,
    stats: StatsRecorder,
    shutdown: Arc<AtomicBool>,
    settings: WorkerSettings,
}

impl Pool {
    /// Spawn a worker incarnation for `worker_id` and register its queue
    fn spawn(&self, worker_id: WorkerId) -> JoinHandle<()> {
        let record = &self.records[worker_id];
        record.set_state(WorkerState::Starting);

        let worker = Worker::new(
            Arc::clone(record),
            self.queues[worker_id].receiver(),
            self.stats.clone(),
            Arc::clone(&self.shutdown),
            self.settings,
        );
        let handle = tokio::spawn(worker.run());

        record.set_state(WorkerState::Running);
        self.dispatcher
            .register(worker_id, self.queues[worker_id].sender());
        handle
    }

    /// Replace every worker whose task has finished
    async fn check_liveness(&self) -> Vec<WorkerId> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Vec::new();
        }

        let mut restarted = Vec::new();
        let mut handles = self.handles.lock().await;

        for worker_id in 0..self.records.len() {
            let dead = handles[worker_id]
                .as_ref()
                .map_or(true, JoinHandle::is_finished);
            if !dead {
                continue;
            }

            let record = &self.records[worker_id];
            record.set_state(WorkerState::Dead);

            if let Some(handle) = handles[worker_id].take() {
                match handle.await {
                    Ok(()) => warn!(worker_id = worker_id, "Worker exited unexpectedly"),
                    Err(e) if e.is_panic() => error!(worker_id = worker_id, "Worker panicked"),
                    Err(_) => warn!(worker_id = worker_id, "Worker was cancelled"),
                }
            }

            handles[worker_id] = Some(self.spawn(worker_id));
            let restarts = record.increment_restarts();
            self.stats.record(StatEvent::WorkerRestarted { worker_id });
            warn!(worker_id = worker_id, restarts = restarts, "Worker restarted");

            restarted.push(worker_id);
        }

        restarted
    }

    fn active_workers(&self) -> Vec<WorkerId> {
        self.records
            .iter()
            .filter(|record| record.is_active())
            .map(|record| record.id())
            .collect()
    }
}

/// Owns the worker pool and its liveness loop
pub struct Supervisor {
    pool: Arc<Pool>,
    liveness_interval: Duration,
    monitor_shutdown: Arc<AtomicBool>,
    monitor: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("workers", &self.pool.records.len())
            .field("liveness_interval", &self.liveness_interval)
            .field("monitoring", &self.monitor.is_some())
            .finish_non_exhaustive()
    }
}

impl Supervisor {
    /// Create the worker records, handoff queues and dispatcher for a pool
    ///
    /// No worker runs until [`start`](Self::start).
    pub fn new(config: &ServerConfig, stats: StatsRecorder, shutdown: Arc<AtomicBool>) -> Self {
        let records: Vec<_> = (0..config.worker_count)
            .map(|id| Arc::new(WorkerRecord::new(id)))
            .collect();
        let queues = (0..config.worker_count)
            .map(|_| DispatchQueue::new(config.queue_capacity()))
            .collect();

        let dispatcher = Arc::new(Dispatcher::new(
            config.policy,
            records.clone(),
            config.max_clients,
            config.queue_capacity(),
            stats.clone(),
        ));

        let handles = (0..config.worker_count).map(|_| None).collect();

        Self {
            pool: Arc::new(Pool {
                records,
                queues,
                handles: Mutex::new(handles),
                dispatcher,
                stats,
                shutdown,
                settings: WorkerSettings::from(config),
            }),
            liveness_interval: config.liveness_interval,
            monitor_shutdown: Arc::new(AtomicBool::new(false)),
            monitor: None,
        }
    }

    /// Spawn every worker and start the liveness loop
    pub async fn start(&mut self) {
        if self.monitor.is_some() {
            return;
        }

        {
            let mut handles = self.pool.handles.lock().await;
            for (worker_id, slot) in handles.iter_mut().enumerate() {
                *slot = Some(self.pool.spawn(worker_id));
            }
        }

        self.monitor_shutdown.store(false, Ordering::SeqCst);
        let pool = Arc::clone(&self.pool);
        let stop = Arc::clone(&self.monitor_shutdown);
        let interval = self.liveness_interval;
        self.monitor = Some(tokio::spawn(Self::liveness_loop(pool, interval, stop)));

        info!(
            workers = self.pool.records.len(),
            interval_ms = %self.liveness_interval.as_millis(),
            "Worker pool started"
        );
    }

    async fn liveness_loop(pool: Arc<Pool>, interval: Duration, stop: Arc<AtomicBool>) {
        debug!("Liveness loop started");

        loop {
            tokio::time::sleep(interval).await;

            if stop.load(Ordering::SeqCst) || pool.shutdown.load(Ordering::SeqCst) {
                break;
            }

            let restarted = pool.check_liveness().await;
            if !restarted.is_empty() {
                info!(restarted = ?restarted, "Liveness check replaced workers");
            }
        }

        debug!("Liveness loop ended");
    }

    /// Run one liveness pass immediately, returning the ids that were replaced
    pub async fn check_liveness(&self) -> Vec<WorkerId> {
        self.pool.check_liveness().await
    }

    /// Terminate a worker task without cleanup, as a crash would
    ///
    /// The liveness loop replaces it on its next pass. Returns false when the
    /// id is unknown or the worker is already dead.
    pub async fn kill_worker(&self, worker_id: WorkerId) -> bool {
        let mut handles = self.pool.handles.lock().await;
        let Some(handle) = handles.get_mut(worker_id).and_then(Option::take) else {
            return false;
        };

        handle.abort();
        let _ = handle.await;
        self.pool.records[worker_id].set_state(WorkerState::Dead);

        warn!(worker_id = worker_id, "Worker killed");
        true
    }

    /// Stop the liveness loop, drain active connections and stop every worker
    ///
    /// Connections still being served when `drain_timeout` elapses are
    /// terminated and reported as aborted.
    pub async fn shutdown(&mut self, drain_timeout: Duration) -> DrainOutcome {
        let started = Instant::now();
        self.pool.shutdown.store(true, Ordering::SeqCst);

        self.monitor_shutdown.store(true, Ordering::SeqCst);
        if let Some(monitor) = self.monitor.take() {
            monitor.abort();
            let _ = monitor.await;
        }

        let deadline = started + drain_timeout;
        let drained = loop {
            let active = self.pool.active_workers();
            if active.is_empty() {
                break true;
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(active = ?active, "Drain timeout elapsed with connections still active");
                break false;
            }
            debug!(active = active.len(), "Waiting for connections to drain");
            tokio::time::sleep(DRAIN_POLL.min(deadline - now)).await;
        };

        let mut forced_workers = Vec::new();
        {
            let mut handles = self.pool.handles.lock().await;
            for (worker_id, slot) in handles.iter_mut().enumerate() {
                let Some(mut handle) = slot.take() else {
                    continue;
                };
                let record = &self.pool.records[worker_id];

                if record.is_active() {
                    handle.abort();
                    let _ = handle.await;
                    if record.is_active() {
                        self.pool
                            .stats
                            .record(StatEvent::ConnectionAborted { worker_id });
                        warn!(worker_id = worker_id, "Forcibly terminated active connection");
                        forced_workers.push(worker_id);
                    }
                    continue;
                }

                let join_wait = self.pool.settings.queue_wait + JOIN_MARGIN;
                if tokio::time::timeout(join_wait, &mut handle).await.is_err() {
                    warn!(worker_id = worker_id, "Worker did not stop in time, aborting");
                    handle.abort();
                    let _ = handle.await;
                }
            }
        }

        let mut discarded = 0;
        for queue in &self.pool.queues {
            let mut receiver = queue.receiver().lock_owned().await;
            while let Ok(connection) = receiver.try_recv() {
                warn!(peer = %connection.peer(), "Closing queued connection at shutdown");
                self.pool.stats.record(StatEvent::ConnectionRejected);
                discarded += 1;
            }
        }

        for record in &self.pool.records {
            record.set_state(WorkerState::Dead);
        }

        info!(
            drained = drained,
            forced = forced_workers.len(),
            discarded = discarded,
            elapsed_ms = %started.elapsed().as_millis(),
            "Worker pool stopped"
        );

        DrainOutcome {
            drained,
            forced_workers,
            discarded,
        }
    }

    /// Records for every worker id, indexed by id
    pub fn records(&self) -> &[Arc<WorkerRecord>] {
        &self.pool.records
    }

    /// Dispatcher routing connections into this pool
    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        Arc::clone(&self.pool.dispatcher)
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.monitor_shutdown.store(true, Ordering::SeqCst);
        self.pool.shutdown.store(true, Ordering::SeqCst);
        if let Some(monitor) = self.monitor.take() {
            monitor.abort();
        }
        if let Ok(handles) = self.pool.handles.try_lock() {
            for handle in handles.iter().flatten() {
                handle.abort();
            }
        }
    }
}
