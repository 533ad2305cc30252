// ABOUTME: Rate-controlled packet client and multi-client simulator
//
// A `Client` owns one session: connect (with retries), transmit at a paced
// rate for a duration, disconnect. The simulator runs many clients at once.

pub mod connection;
pub mod rate;
pub mod session;
pub mod simulator;

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::config::{ClientConfig, ConfigError};

pub use connection::{ConnectionManager, Established, FailureClass, RetryPolicy};
pub use rate::{CancelHandle, RateController, RateDeviation};
pub use session::{ClientSession, RateConfig, SessionCounters, SessionResult, SessionState};
pub use simulator::{SimulationSummary, Simulator};

/// Errors surfaced by a client session
#[derive(Debug, Error)]
pub enum ClientError {
    /// Configuration failed validation
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Every connect attempt failed
    #[error("Failed to connect to {target} after {attempts} attempts: {source}")]
    ConnectExhausted {
        target: String,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    /// Operation requires a connected session
    #[error("Client is not connected")]
    NotConnected,

    /// Transmission ended early because reconnection failed
    #[error(
        "Session {id} aborted after {packets} packets: {source}",
        id = .result.id,
        packets = .result.packets_sent
    )]
    SessionAborted {
        /// Counters accumulated before the abort
        result: Box<SessionResult>,
        #[source]
        source: Box<ClientError>,
    },
}

/// One packet-sending client
#[derive(Debug)]
pub struct Client {
    session: ClientSession,
    manager: ConnectionManager,
    controller: RateController,
    stream: Option<TcpStream>,
    peer: Option<SocketAddr>,
    cancel: CancelHandle,
}

impl Client {
    /// Build a client from validated configuration
    pub fn new(id: impl Into<String>, config: &ClientConfig) -> Result<Self, ClientError> {
        Self::with_cancel(id, config, CancelHandle::new())
    }

    /// Build a client whose transmission stops when `cancel` fires
    pub fn with_cancel(
        id: impl Into<String>,
        config: &ClientConfig,
        cancel: CancelHandle,
    ) -> Result<Self, ClientError> {
        config.validate()?;
        let rate = RateConfig::from_config(config)?;

        Ok(Self {
            session: ClientSession::new(id, rate),
            manager: ConnectionManager::from_config(config),
            controller: RateController::new(rate, config.rate_tolerance, cancel.clone()),
            stream: None,
            peer: None,
            cancel,
        })
    }

    pub const fn session(&self) -> &ClientSession {
        &self.session
    }

    pub fn id(&self) -> &str {
        self.session.id()
    }

    pub const fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub const fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Connect to the server, retrying with backoff
    pub async fn connect(&mut self, host: &str, port: u16) -> Result<(), ClientError> {
        self.session.set_state(SessionState::Connecting);

        match self.manager.connect(host, port).await {
            Ok(established) => {
                debug!(
                    session = %self.session.id(),
                    attempts = established.attempts,
                    "Session connected"
                );
                self.peer = Some(established.peer);
                self.stream = Some(established.stream);
                self.session.set_state(SessionState::Connected);
                Ok(())
            }
            Err(e) => {
                self.session.set_state(SessionState::Disconnected);
                Err(e)
            }
        }
    }

    /// Transmit paced batches for `duration`
    pub async fn transmit(&mut self, duration: Duration) -> Result<SessionResult, ClientError> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(ClientError::NotConnected);
        };

        let result = self
            .controller
            .transmit(stream, &mut self.session, &mut self.manager, duration)
            .await;

        if result.is_err() {
            self.stream = None;
            self.peer = None;
        }
        result
    }

    /// Close the connection
    pub async fn disconnect(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                debug!(session = %self.session.id(), error = %e, "Shutdown on disconnect failed");
            }
            info!(session = %self.session.id(), "Disconnected");
        }
        self.peer = None;
        self.session.set_state(SessionState::Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn test_config(port: u16) -> ClientConfig {
        ClientConfig {
            port,
            target_rate: 2000.0,
            duration: Duration::from_millis(300),
            connect_attempts: 2,
            backoff_initial: Duration::from_millis(10),
            backoff_max: Duration::from_millis(20),
            ..ClientConfig::default()
        }
    }

    /// Accept one connection and count the bytes it delivers
    async fn sink(listener: TcpListener) -> u64 {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 64 * 1024];
        let mut total = 0u64;
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => return total,
                Ok(n) => total += n as u64,
            }
        }
    }

    #[tokio::test]
    async fn test_transmit_requires_connection() {
        let mut client = Client::new("client_000", &test_config(1)).unwrap();
        assert!(matches!(
            client.transmit(Duration::from_millis(10)).await,
            Err(ClientError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let config = ClientConfig {
            target_rate: -1.0,
            ..ClientConfig::default()
        };
        assert!(matches!(
            Client::new("client_000", &config),
            Err(ClientError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_transmit_disconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let receiver = tokio::spawn(sink(listener));

        let mut client = Client::new("client_000", &test_config(port)).unwrap();
        client.connect("127.0.0.1", port).await.unwrap();
        assert_eq!(client.session().state(), SessionState::Connected);

        let result = client.transmit(Duration::from_millis(300)).await.unwrap();
        client.disconnect().await;
        assert_eq!(client.session().state(), SessionState::Closed);

        let received = receiver.await.unwrap();
        assert_eq!(received, result.bytes_sent);
        assert_eq!(result.bytes_sent, result.packets_sent * 16);
        assert_eq!(result.packets_sent, result.batches * 10);
        assert_eq!(result.send_errors, 0);
        assert!(result.batches > 0);
    }

    #[tokio::test]
    async fn test_cancel_stops_transmission_early() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _receiver = tokio::spawn(sink(listener));

        let mut client = Client::new("client_000", &test_config(port)).unwrap();
        client.connect("127.0.0.1", port).await.unwrap();

        let cancel = client.cancel_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });

        let result = client.transmit(Duration::from_secs(10)).await.unwrap();
        assert!(result.elapsed < Duration::from_secs(2));
        client.disconnect().await;
    }
}
