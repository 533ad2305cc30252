// ABOUTME: Server lifecycle: bind, accept loop, and graceful stop
//
//   accept loop ──dispatch──▶ worker queues ──▶ workers ──events──▶ stats
//        ▲                                        ▲
//        └──── shutdown flag ─────── supervisor ──┘
//
// The listener socket is returned by the accept task when it exits and is
// closed only after the worker pool has drained.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::dispatcher::Dispatcher;
use super::stats::{StatsAggregator, StatsReporter, StatsSnapshot};
use super::supervisor::Supervisor;
use super::worker::{Connection, WorkerRecord};
use super::{ServerError, ShutdownReport, WorkerId};
use crate::config::ServerConfig;
use crate::net;

/// A running ingest server
pub struct Server {
    config: ServerConfig,
    local_addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    supervisor: Supervisor,
    stats: StatsAggregator,
    reporter: Option<StatsReporter>,
    accept_handle: Option<JoinHandle<TcpListener>>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.local_addr)
            .field("workers", &self.config.worker_count)
            .field("policy", &self.config.policy)
            .finish_non_exhaustive()
    }
}

impl Server {
    /// Bind the listener, start the worker pool and begin accepting
    pub async fn start(config: ServerConfig) -> Result<Self, ServerError> {
        config.validate()?;

        let addr = net::resolve(&config.host, config.port)
            .await
            .map_err(|source| ServerError::Resolve {
                host: config.host.clone(),
                port: config.port,
                source,
            })?;

        let listener = net::bind_listener(addr, config.max_clients, config.socket_buffer_size)
            .map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = listener.local_addr().map_err(ServerError::LocalAddr)?;

        let stats = StatsAggregator::new(config.worker_count, config.event_capacity);
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut supervisor = Supervisor::new(&config, stats.recorder(), Arc::clone(&shutdown));
        supervisor.start().await;

        let accept_handle = tokio::spawn(Self::accept_loop(
            listener,
            supervisor.dispatcher(),
            Arc::clone(&shutdown),
            config.accept_poll_interval,
        ));

        let reporter = (!config.stats_interval.is_zero())
            .then(|| StatsReporter::start(stats.subscribe(), config.stats_interval));

        info!(
            addr = %local_addr,
            workers = config.worker_count,
            max_clients = config.max_clients,
            queue_capacity = config.queue_capacity(),
            packet_size = config.packet_size,
            policy = ?config.policy,
            "Server started"
        );

        Ok(Self {
            config,
            local_addr,
            shutdown,
            supervisor,
            stats,
            reporter,
            accept_handle: Some(accept_handle),
        })
    }

    async fn accept_loop(
        listener: TcpListener,
        dispatcher: Arc<Dispatcher>,
        shutdown: Arc<AtomicBool>,
        poll_interval: Duration,
    ) -> TcpListener {
        debug!("Accept loop started");

        loop {
            if shutdown.load(Ordering::SeqCst) {
                debug!("Accept loop shutdown requested");
                break;
            }

            // Accept with timeout so we can check shutdown flag
            match tokio::time::timeout(poll_interval, listener.accept()).await {
                Ok(Ok((stream, peer))) => {
                    debug!(peer = %peer, "New connection");
                    if let Err(e) = dispatcher.dispatch(Connection::new(stream, peer)) {
                        debug!(peer = %peer, error = %e, "Dispatch failed");
                    }
                }
                Ok(Err(e)) => {
                    error!(error = %e, "Accept error");
                    // Back off so a persistent failure (e.g. fd exhaustion) does not spin
                    tokio::time::sleep(poll_interval).await;
                }
                Err(_) => {
                    // Timeout - loop again to check shutdown
                }
            }
        }

        debug!("Accept loop ended");
        listener
    }

    /// Address the listener is bound to
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub const fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Latest published statistics snapshot
    pub fn stats(&self) -> Arc<StatsSnapshot> {
        self.stats.snapshot()
    }

    /// Snapshot with every event recorded so far folded in
    pub async fn flushed_stats(&self) -> Arc<StatsSnapshot> {
        self.stats.flush().await;
        self.stats.snapshot()
    }

    /// Worker records indexed by id
    pub fn records(&self) -> &[Arc<WorkerRecord>] {
        self.supervisor.records()
    }

    /// Terminate a worker as a crash would; the supervisor replaces it
    pub async fn kill_worker(&self, worker_id: WorkerId) -> bool {
        self.supervisor.kill_worker(worker_id).await
    }

    /// Stop accepting, drain the pool and close the listener
    ///
    /// Connections still active after `drain_timeout` are forcibly closed.
    pub async fn stop(mut self, drain_timeout: Duration) -> ShutdownReport {
        let started = Instant::now();
        info!(drain_timeout_ms = %drain_timeout.as_millis(), "Stopping server");

        self.shutdown.store(true, Ordering::SeqCst);

        let listener = match self.accept_handle.take() {
            Some(handle) => match handle.await {
                Ok(listener) => Some(listener),
                Err(e) => {
                    warn!(error = %e, "Accept loop did not exit cleanly");
                    None
                }
            },
            None => None,
        };

        let outcome = self.supervisor.shutdown(drain_timeout).await;

        if let Some(mut reporter) = self.reporter.take() {
            reporter.stop().await;
        }

        self.stats.flush().await;
        let stats = (*self.stats.snapshot()).clone();

        drop(listener);

        let report = ShutdownReport {
            drained: outcome.drained,
            forced_workers: outcome.forced_workers,
            discarded: outcome.discarded,
            elapsed: started.elapsed(),
            stats,
        };

        info!(
            drained = report.drained,
            forced = report.forced_workers.len(),
            total_packets = report.stats.total_packets,
            total_bytes = report.stats.total_bytes,
            elapsed_ms = %report.elapsed.as_millis(),
            "Server stopped"
        );
        report
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        // Signal shutdown on drop
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.accept_handle.take() {
            handle.abort();
        }
    }
}
