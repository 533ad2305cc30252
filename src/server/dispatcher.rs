// ABOUTME: Connection dispatcher: picks a worker per accepted connection and hands it off
//
// Handoff is non-blocking. A full per-worker queue, an exhausted admission
// bound or a pool with no live worker closes the connection immediately and
// counts a rejection. The accept loop never waits on a worker.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use super::stats::{StatEvent, StatsRecorder};
use super::worker::{Connection, WorkerRecord};
use super::WorkerId;
use crate::config::BalancePolicy;

/// Best scores below this mean every worker is degraded
const DEGRADED_SCORE: f64 = 0.2;

/// Reasons a connection was refused at handoff
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DispatchError {
    /// The selected worker's handoff queue is at capacity
    #[error("Queue full for worker {worker_id}: capacity {capacity}")]
    QueueFull { worker_id: WorkerId, capacity: usize },

    /// Queued plus active connections already at the admission bound
    #[error("Server at capacity: {in_flight} of {max_clients} connections in flight")]
    AtCapacity { max_clients: usize, in_flight: usize },

    /// No worker is in the `Running` state
    #[error("No live worker available")]
    NoLiveWorker,

    /// The selected worker's queue has no receiver
    #[error("Worker {worker_id} is not accepting connections")]
    WorkerUnavailable { worker_id: WorkerId },
}

/// Bounded handoff queue for one worker id
///
/// The receiver is shared so a replacement worker drains the same queue its
/// predecessor was fed from.
#[derive(Debug, Clone)]
pub struct DispatchQueue {
    sender: mpsc::Sender<Connection>,
    receiver: Arc<Mutex<mpsc::Receiver<Connection>>>,
}

impl DispatchQueue {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        Self {
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
        }
    }

    pub fn sender(&self) -> mpsc::Sender<Connection> {
        self.sender.clone()
    }

    pub fn receiver(&self) -> Arc<Mutex<mpsc::Receiver<Connection>>> {
        Arc::clone(&self.receiver)
    }

    /// Connections waiting to be dequeued
    pub fn len(&self) -> usize {
        queued(&self.sender)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn queued(sender: &mpsc::Sender<Connection>) -> usize {
    sender.max_capacity() - sender.capacity()
}

/// Routes accepted connections to worker queues
#[derive(Debug)]
pub struct Dispatcher {
    policy: BalancePolicy,
    records: Vec<Arc<WorkerRecord>>,
    queues: RwLock<Vec<Option<mpsc::Sender<Connection>>>>,
    next: AtomicUsize,
    max_clients: usize,
    max_per_worker: usize,
    stats: StatsRecorder,
}

impl Dispatcher {
    /// Create a dispatcher over the given worker records
    ///
    /// `queue_capacity` is the per-worker handoff bound; the scored policy
    /// treats one active connection plus a full queue as full load.
    pub fn new(
        policy: BalancePolicy,
        records: Vec<Arc<WorkerRecord>>,
        max_clients: usize,
        queue_capacity: usize,
        stats: StatsRecorder,
    ) -> Self {
        let slots = records.len();
        Self {
            policy,
            records,
            queues: RwLock::new(vec![None; slots]),
            next: AtomicUsize::new(0),
            max_clients,
            max_per_worker: queue_capacity + 1,
            stats,
        }
    }

    /// Attach (or replace) the handoff queue for a worker id
    pub fn register(&self, worker_id: WorkerId, sender: mpsc::Sender<Connection>) {
        let mut queues = self.queues.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = queues.get_mut(worker_id) {
            *slot = Some(sender);
            debug!(worker_id = worker_id, "Worker queue registered");
        } else {
            warn!(worker_id = worker_id, "Ignoring registration for unknown worker");
        }
    }

    /// Detach a worker's queue so no further connections are routed to it
    pub fn deregister(&self, worker_id: WorkerId) {
        let mut queues = self.queues.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = queues.get_mut(worker_id) {
            *slot = None;
        }
    }

    /// Active plus queued connections for one worker
    pub fn load(&self, worker_id: WorkerId) -> usize {
        let queues = self.queues.read().unwrap_or_else(PoisonError::into_inner);
        self.load_with(&queues, worker_id)
    }

    /// Active plus queued connections across the pool
    pub fn in_flight(&self) -> usize {
        let queues = self.queues.read().unwrap_or_else(PoisonError::into_inner);
        (0..self.records.len())
            .map(|id| self.load_with(&queues, id))
            .sum()
    }

    fn load_with(&self, queues: &[Option<mpsc::Sender<Connection>>], worker_id: WorkerId) -> usize {
        let active = usize::from(self.records[worker_id].is_active());
        let waiting = queues
            .get(worker_id)
            .and_then(Option::as_ref)
            .map_or(0, queued);
        active + waiting
    }

    /// Hand a connection to a worker, or close it and report why
    pub fn dispatch(&self, connection: Connection) -> Result<WorkerId, DispatchError> {
        let peer = connection.peer();
        let queues = self.queues.read().unwrap_or_else(PoisonError::into_inner);

        let candidates: Vec<WorkerId> = self
            .records
            .iter()
            .filter(|record| record.is_running())
            .map(|record| record.id())
            .filter(|&id| queues.get(id).is_some_and(Option::is_some))
            .collect();

        if candidates.is_empty() {
            drop(queues);
            return Err(self.reject(connection, DispatchError::NoLiveWorker));
        }

        let in_flight: usize = (0..self.records.len())
            .map(|id| self.load_with(&queues, id))
            .sum();
        if in_flight >= self.max_clients {
            drop(queues);
            return Err(self.reject(
                connection,
                DispatchError::AtCapacity {
                    max_clients: self.max_clients,
                    in_flight,
                },
            ));
        }

        let worker_id = match self.policy {
            BalancePolicy::RoundRobin => self.select_round_robin(&candidates),
            BalancePolicy::LeastConnections => self.select_least_connections(&queues, &candidates),
            BalancePolicy::Scored => self.select_scored(&queues, &candidates),
        };

        let Some(sender) = queues.get(worker_id).and_then(Option::as_ref) else {
            drop(queues);
            return Err(self.reject(connection, DispatchError::WorkerUnavailable { worker_id }));
        };

        let result = sender.try_send(connection);
        let capacity = sender.max_capacity();
        drop(queues);

        match result {
            Ok(()) => {
                debug!(worker_id = worker_id, peer = %peer, "Connection dispatched");
                Ok(worker_id)
            }
            Err(mpsc::error::TrySendError::Full(connection)) => Err(self.reject(
                connection,
                DispatchError::QueueFull {
                    worker_id,
                    capacity,
                },
            )),
            Err(mpsc::error::TrySendError::Closed(connection)) => {
                Err(self.reject(connection, DispatchError::WorkerUnavailable { worker_id }))
            }
        }
    }

    fn reject(&self, connection: Connection, reason: DispatchError) -> DispatchError {
        warn!(peer = %connection.peer(), reason = %reason, "Connection rejected");
        drop(connection);
        self.stats.record(StatEvent::ConnectionRejected);
        reason
    }

    fn select_round_robin(&self, candidates: &[WorkerId]) -> WorkerId {
        let slots = self.records.len();
        let start = self.next.fetch_add(1, Ordering::Relaxed) % slots;

        (0..slots)
            .map(|offset| (start + offset) % slots)
            .find(|id| candidates.contains(id))
            .unwrap_or(candidates[0])
    }

    fn select_least_connections(
        &self,
        queues: &[Option<mpsc::Sender<Connection>>],
        candidates: &[WorkerId],
    ) -> WorkerId {
        // min_by_key keeps the first minimum, so ties go to the lowest id
        candidates
            .iter()
            .copied()
            .min_by_key(|&id| self.load_with(queues, id))
            .unwrap_or(candidates[0])
    }

    fn select_scored(
        &self,
        queues: &[Option<mpsc::Sender<Connection>>],
        candidates: &[WorkerId],
    ) -> WorkerId {
        let mut best = candidates[0];
        let mut best_score = f64::NEG_INFINITY;

        for &id in candidates {
            let score = self.score(queues, id);
            if score > best_score {
                best = id;
                best_score = score;
            }
        }

        if best_score < DEGRADED_SCORE {
            warn!(
                worker_id = best,
                score = best_score,
                "All workers degraded, dispatching to best available"
            );
        }
        best
    }

    /// `(1 - error_rate) * (1 - load_factor)`, both factors in [0, 1]
    fn score(&self, queues: &[Option<mpsc::Sender<Connection>>], worker_id: WorkerId) -> f64 {
        let error_rate = self.records[worker_id].error_rate().clamp(0.0, 1.0);
        let load_factor =
            (self.load_with(queues, worker_id) as f64 / self.max_per_worker as f64).min(1.0);
        (1.0 - error_rate) * (1.0 - load_factor)
    }
}
