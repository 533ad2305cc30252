// ABOUTME: Shared test fixtures and utilities for behavioral tests
//
// Provides:
// - server_config() / client_config(): fast-polling configurations
// - SinkServer: loopback listener that counts and discards received bytes
// - free_port(): a port with nothing listening on it
// - wait_until(): poll a condition with a deadline

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hfingest::config::{ClientConfig, ServerConfig};
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Server configuration on an ephemeral port with short poll intervals
pub fn server_config() -> ServerConfig {
    ServerConfig {
        port: 0,
        liveness_interval: Duration::from_millis(100),
        queue_wait: Duration::from_millis(50),
        read_timeout: Duration::from_millis(50),
        accept_poll_interval: Duration::from_millis(20),
        stats_interval: Duration::ZERO,
        ..ServerConfig::default()
    }
}

/// Client configuration targeting `port` with a small retry budget
pub fn client_config(port: u16) -> ClientConfig {
    ClientConfig {
        port,
        target_rate: 1000.0,
        duration: Duration::from_secs(1),
        connect_attempts: 3,
        backoff_initial: Duration::from_millis(20),
        backoff_max: Duration::from_millis(50),
        ..ClientConfig::default()
    }
}

/// A port that was free when checked
pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Poll `condition` every 10ms until it holds or `timeout` elapses
pub async fn wait_until<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Loopback server that accepts every connection and discards its bytes
pub struct SinkServer {
    pub addr: SocketAddr,
    bytes: Arc<AtomicU64>,
    connections: Arc<AtomicU64>,
    handle: JoinHandle<()>,
}

impl SinkServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let bytes = Arc::new(AtomicU64::new(0));
        let connections = Arc::new(AtomicU64::new(0));

        let handle = {
            let bytes = Arc::clone(&bytes);
            let connections = Arc::clone(&connections);
            tokio::spawn(async move {
                while let Ok((mut stream, _)) = listener.accept().await {
                    connections.fetch_add(1, Ordering::SeqCst);
                    let bytes = Arc::clone(&bytes);
                    tokio::spawn(async move {
                        let mut buf = vec![0u8; 64 * 1024];
                        while let Ok(n) = stream.read(&mut buf).await {
                            if n == 0 {
                                break;
                            }
                            bytes.fetch_add(n as u64, Ordering::SeqCst);
                        }
                    });
                }
            })
        };

        Self {
            addr,
            bytes,
            connections,
            handle,
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::SeqCst)
    }

    pub fn connections(&self) -> u64 {
        self.connections.load(Ordering::SeqCst)
    }
}

impl Drop for SinkServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
