// ABOUTME: Client connection establishment with bounded retries and geometric backoff
//
// Every failure class is retryable; the class only changes how the attempt
// is logged. The session fails only once the attempt budget is spent.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

use super::ClientError;
use crate::backoff::Backoff;
use crate::config::ClientConfig;
use crate::net;

/// Retry budget for establishing a connection
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial: Duration,
    pub multiplier: f64,
    pub max: Duration,
    pub connect_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&ClientConfig::default())
    }
}

impl From<&ClientConfig> for RetryPolicy {
    fn from(config: &ClientConfig) -> Self {
        Self {
            attempts: config.connect_attempts,
            initial: config.backoff_initial,
            multiplier: config.backoff_multiplier,
            max: config.backoff_max,
            connect_timeout: config.connect_timeout,
        }
    }
}

impl RetryPolicy {
    pub const fn backoff(&self) -> Backoff {
        Backoff::new(self.initial, self.multiplier, self.max)
    }
}

/// Failure class of a single connect attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Nothing listening on the target
    Refused,
    /// Reset, unreachable, aborted and other short-lived OS conditions
    Transient,
    /// Socket not ready yet
    WouldBlock,
    /// Attempt exceeded the connect timeout
    TimedOut,
    /// Anything else
    Other,
}

impl FailureClass {
    pub fn classify(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => Self::Refused,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::AddrNotAvailable
            | io::ErrorKind::Interrupted => Self::Transient,
            io::ErrorKind::WouldBlock => Self::WouldBlock,
            io::ErrorKind::TimedOut => Self::TimedOut,
            _ => Self::Other,
        }
    }
}

/// A connected, tuned stream and how long it took to get
#[derive(Debug)]
pub struct Established {
    pub stream: TcpStream,
    pub peer: SocketAddr,
    pub attempts: u32,
    pub delays: Vec<Duration>,
}

/// Connects to a target and reconnects to the same target on demand
#[derive(Debug, Clone)]
pub struct ConnectionManager {
    policy: RetryPolicy,
    buffer_size: usize,
    target: Option<(String, u16)>,
}

impl ConnectionManager {
    pub const fn new(policy: RetryPolicy, buffer_size: usize) -> Self {
        Self {
            policy,
            buffer_size,
            target: None,
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(RetryPolicy::from(config), config.socket_buffer_size)
    }

    /// Target of the last `connect` call
    pub fn target(&self) -> Option<(&str, u16)> {
        self.target.as_ref().map(|(host, port)| (host.as_str(), *port))
    }

    /// Connect to `host:port`, retrying with backoff until the budget is spent
    pub async fn connect(&mut self, host: &str, port: u16) -> Result<Established, ClientError> {
        self.target = Some((host.to_string(), port));

        let mut backoff = self.policy.backoff();
        let mut delays = Vec::new();
        let attempts = self.policy.attempts.max(1);

        for attempt in 1..=attempts {
            match self.attempt(host, port).await {
                Ok((stream, peer)) => {
                    info!(peer = %peer, attempt = attempt, "Connected");
                    return Ok(Established {
                        stream,
                        peer,
                        attempts: attempt,
                        delays,
                    });
                }
                Err(e) if attempt == attempts => {
                    error!(
                        host = %host,
                        port = port,
                        attempts = attempts,
                        error = %e,
                        "All connection attempts failed"
                    );
                    return Err(ClientError::ConnectExhausted {
                        target: format!("{host}:{port}"),
                        attempts,
                        source: e,
                    });
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(
                        attempt = attempt,
                        class = ?FailureClass::classify(&e),
                        error = %e,
                        retry_in_ms = %delay.as_millis(),
                        "Connection attempt failed, retrying"
                    );
                    delays.push(delay);
                    tokio::time::sleep(delay).await;
                }
            }
        }

        // attempts >= 1 so the loop always returns
        Err(ClientError::NotConnected)
    }

    /// Reconnect to the target of the last `connect` call with a fresh budget
    pub async fn reconnect(&mut self) -> Result<Established, ClientError> {
        let Some((host, port)) = self.target.clone() else {
            return Err(ClientError::NotConnected);
        };
        debug!(host = %host, port = port, "Reconnecting");
        self.connect(&host, port).await
    }

    async fn attempt(&self, host: &str, port: u16) -> io::Result<(TcpStream, SocketAddr)> {
        let addr = net::resolve(host, port).await?;

        let stream = tokio::time::timeout(self.policy.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect to {addr} timed out after {:?}", self.policy.connect_timeout),
                )
            })??;

        if let Err(e) = net::tune_stream(&stream, self.buffer_size) {
            warn!(peer = %addr, error = %e, "Socket tuning failed");
        }
        Ok((stream, addr))
    }
}
