// ABOUTME: Server workers: per-worker records and the connection receive loop
//
// A worker serves one connection at a time end-to-end:
//   idle ──(dequeue)──▶ serving ──(peer close / I/O error)──▶ idle
// Death (task abort or panic) is never self-reported; the supervisor observes it.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, trace, warn};

use super::stats::{StatEvent, StatsRecorder};
use super::WorkerId;
use crate::config::ServerConfig;
use crate::net;

/// Size of the per-worker receive buffer
const READ_BUFFER_SIZE: usize = 64 * 1024;

// === Connection ===

/// Assignment state of an accepted connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Waiting in a worker's handoff queue
    Queued,
    /// Dequeued by a worker, not yet serving
    Assigned,
    /// Being read by its worker
    Active,
    /// Socket closed
    Closed,
}

/// An accepted client connection
///
/// Owned by the dispatcher until handoff, then exclusively by one worker.
/// Dropping it closes the socket.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    state: ConnectionState,
    accepted_at: Instant,
    packets: u64,
    bytes: u64,
}

impl Connection {
    /// Wrap a freshly accepted stream
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            stream,
            peer,
            state: ConnectionState::Queued,
            accepted_at: Instant::now(),
            packets: 0,
            bytes: 0,
        }
    }

    /// Remote address
    pub const fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Time since accept
    pub fn age(&self) -> Duration {
        self.accepted_at.elapsed()
    }

    /// Complete packets received on this connection
    pub const fn packets(&self) -> u64 {
        self.packets
    }

    /// Bytes received on this connection
    pub const fn bytes(&self) -> u64 {
        self.bytes
    }

    fn advance(&mut self, next: ConnectionState) {
        trace!(peer = %self.peer, from = ?self.state, to = ?next, "Connection state");
        self.state = next;
    }

    fn record_read(&mut self, packets: u64, bytes: u64) {
        self.packets += packets;
        self.bytes += bytes;
    }
}

// === Worker Record ===

/// Liveness state of a worker slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum WorkerState {
    /// Task spawned, not yet registered with the dispatcher
    Starting = 0,
    /// Accepting connections from its queue
    Running = 1,
    /// Task terminated; awaiting restart or server shutdown
    Dead = 2,
}

impl WorkerState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Starting,
            1 => Self::Running,
            _ => Self::Dead,
        }
    }
}

/// Shared record for one worker id, stable across restarts
///
/// Lifecycle fields (`state`, `restarts`) are written only by the supervisor.
/// The active flag and connection counters are written only by the worker
/// currently owning this id. Everyone else reads.
#[derive(Debug)]
pub struct WorkerRecord {
    id: WorkerId,
    state: AtomicU8,
    active: AtomicBool,
    errors: AtomicU64,
    handled: AtomicU64,
    restarts: AtomicU32,
}

impl WorkerRecord {
    /// Create a record in the `Starting` state
    pub const fn new(id: WorkerId) -> Self {
        Self {
            id,
            state: AtomicU8::new(WorkerState::Starting as u8),
            active: AtomicBool::new(false),
            errors: AtomicU64::new(0),
            handled: AtomicU64::new(0),
            restarts: AtomicU32::new(0),
        }
    }

    pub const fn id(&self) -> WorkerId {
        self.id
    }

    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_running(&self) -> bool {
        self.state() == WorkerState::Running
    }

    /// Whether the worker is currently serving a connection
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Cumulative connection errors
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Connections this id has finished serving
    pub fn connections_handled(&self) -> u64 {
        self.handled.load(Ordering::Relaxed)
    }

    pub fn restarts(&self) -> u32 {
        self.restarts.load(Ordering::SeqCst)
    }

    /// Fraction of handled connections that ended in error, in [0, 1]
    pub fn error_rate(&self) -> f64 {
        let handled = self.connections_handled();
        if handled == 0 {
            return 0.0;
        }
        (self.errors() as f64 / handled as f64).min(1.0)
    }

    // --- supervisor-owned ---

    pub(crate) fn set_state(&self, state: WorkerState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub(crate) fn increment_restarts(&self) -> u32 {
        self.restarts.fetch_add(1, Ordering::SeqCst) + 1
    }

    // --- worker-owned ---

    pub(crate) fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }

    pub(crate) fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_handled(&self) {
        self.handled.fetch_add(1, Ordering::Relaxed);
    }
}

// === Worker ===

/// Tunables a worker needs, extracted from `ServerConfig`
#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    pub packet_size: usize,
    pub queue_wait: Duration,
    pub read_timeout: Duration,
    pub socket_buffer_size: usize,
}

impl From<&ServerConfig> for WorkerSettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            packet_size: config.packet_size,
            queue_wait: config.queue_wait,
            read_timeout: config.read_timeout,
            socket_buffer_size: config.socket_buffer_size,
        }
    }
}

/// How a served connection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    PeerClosed,
    Failed,
}

/// One incarnation of a worker
///
/// The receiving end of the handoff queue is shared across incarnations, so
/// connections queued for a worker that dies are served by its replacement.
pub struct Worker {
    record: Arc<WorkerRecord>,
    queue: Arc<Mutex<mpsc::Receiver<Connection>>>,
    stats: StatsRecorder,
    shutdown: Arc<AtomicBool>,
    settings: WorkerSettings,
}

impl Worker {
    pub fn new(
        record: Arc<WorkerRecord>,
        queue: Arc<Mutex<mpsc::Receiver<Connection>>>,
        stats: StatsRecorder,
        shutdown: Arc<AtomicBool>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            record,
            queue,
            stats,
            shutdown,
            settings,
        }
    }

    /// Run the idle/serve loop until shutdown is observed
    pub async fn run(self) {
        let worker_id = self.record.id();
        let mut queue = self.queue.lock().await;

        // Previous incarnation died mid-connection
        if self.record.is_active() {
            warn!(worker_id = worker_id, "Recovering connection abandoned by previous incarnation");
            self.record.record_error();
            self.record.record_handled();
            self.record.set_active(false);
            self.stats.record(StatEvent::ConnectionAborted { worker_id });
        }

        debug!(worker_id = worker_id, "Worker loop started");

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }

            match tokio::time::timeout(self.settings.queue_wait, queue.recv()).await {
                Ok(Some(connection)) => self.serve(connection).await,
                Ok(None) => {
                    debug!(worker_id = worker_id, "Handoff queue closed");
                    break;
                }
                Err(_) => {
                    // Idle timeout - loop again to check shutdown
                }
            }
        }

        debug!(worker_id = worker_id, "Worker loop ended");
    }

    async fn serve(&self, mut connection: Connection) {
        // Load seen by the dispatcher must not dip between dequeue and serve
        self.record.set_active(true);

        let worker_id = self.record.id();
        let peer = connection.peer();
        connection.advance(ConnectionState::Assigned);

        info!(
            worker_id = worker_id,
            peer = %peer,
            queued_ms = connection.age().as_millis(),
            "Serving connection"
        );

        self.stats.record(StatEvent::ConnectionEstablished { worker_id });
        connection.advance(ConnectionState::Active);

        if let Err(e) = net::tune_stream(&connection.stream, self.settings.socket_buffer_size) {
            warn!(worker_id = worker_id, peer = %peer, error = %e, "Socket tuning failed");
            self.record.record_error();
            self.stats.record(StatEvent::Error { worker_id });
        }

        let outcome = self.receive_loop(&mut connection).await;

        connection.advance(ConnectionState::Closed);
        let (packets, bytes) = (connection.packets(), connection.bytes());
        let elapsed = connection.age();
        drop(connection);

        self.record.record_handled();
        self.record.set_active(false);
        self.stats.record(StatEvent::ConnectionClosed { worker_id });

        info!(
            worker_id = worker_id,
            peer = %peer,
            outcome = ?outcome,
            packets = packets,
            bytes = bytes,
            elapsed_ms = elapsed.as_millis(),
            "Connection closed"
        );
    }

    async fn receive_loop(&self, connection: &mut Connection) -> Outcome {
        let worker_id = self.record.id();
        let mut buffer = vec![0u8; READ_BUFFER_SIZE];
        let mut carry = 0usize;

        loop {
            let read = tokio::time::timeout(
                self.settings.read_timeout,
                connection.stream.read(&mut buffer),
            )
            .await;

            match read {
                Ok(Ok(0)) => return Outcome::PeerClosed,
                Ok(Ok(bytes)) => {
                    let packets = count_packets(&mut carry, bytes, self.settings.packet_size);
                    connection.record_read(packets, bytes as u64);
                    self.stats.record(StatEvent::PacketProcessed {
                        worker_id,
                        packets,
                        bytes: bytes as u64,
                    });
                }
                Ok(Err(e)) => {
                    warn!(worker_id = worker_id, peer = %connection.peer(), error = %e, "Connection read failed");
                    self.record.record_error();
                    self.stats.record(StatEvent::Error { worker_id });
                    return Outcome::Failed;
                }
                Err(_) => {
                    trace!(worker_id = worker_id, "Read timeout, connection idle");
                }
            }
        }
    }
}

/// Translate a read of `bytes` into complete packets
///
/// Bytes that do not complete a packet stay in `carry` for the next read, so
/// a packet split across reads is counted exactly once and a trailing partial
/// packet is never counted.
pub(crate) fn count_packets(carry: &mut usize, bytes: usize, packet_size: usize) -> u64 {
    let total = *carry + bytes;
    *carry = total % packet_size;
    (total / packet_size) as u64
}
