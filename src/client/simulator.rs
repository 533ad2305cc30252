// ABOUTME: Runs many paced clients against one server and summarizes their throughput

use std::time::Duration;

use futures_util::future::join_all;
use serde::Serialize;
use tracing::{error, info, warn};

use super::rate::CancelHandle;
use super::session::SessionResult;
use super::{Client, ClientError};
use crate::config::ClientConfig;

/// Aggregate outcome of a simulation run
#[derive(Debug, Clone, Default, Serialize)]
pub struct SimulationSummary {
    /// Clients that connected and transmitted, including aborted ones
    pub total_clients: usize,
    pub total_packets: u64,
    pub total_bytes: u64,
    pub total_errors: u64,
    pub avg_rate_per_client: f64,
    pub total_rate: f64,
    /// Clients that never connected
    pub failed_clients: Vec<String>,
    /// Clients whose session ended early on an exhausted reconnect budget
    pub aborted_clients: Vec<String>,
    pub sessions: Vec<SessionResult>,
}

impl SimulationSummary {
    fn from_sessions(sessions: Vec<SessionResult>, failed: Vec<String>, aborted: Vec<String>) -> Self {
        let total_clients = sessions.len();
        let total_packets = sessions.iter().map(|s| s.packets_sent).sum();
        let total_bytes = sessions.iter().map(|s| s.bytes_sent).sum();
        let total_errors = sessions.iter().map(|s| s.send_errors).sum();

        let avg_rate_per_client = if total_clients == 0 {
            0.0
        } else {
            sessions.iter().map(|s| s.achieved_rate).sum::<f64>() / total_clients as f64
        };

        Self {
            total_clients,
            total_packets,
            total_bytes,
            total_errors,
            avg_rate_per_client,
            total_rate: avg_rate_per_client * total_clients as f64,
            failed_clients: failed,
            aborted_clients: aborted,
            sessions,
        }
    }
}

/// Simulates `config.clients` concurrent senders
#[derive(Debug, Clone)]
pub struct Simulator {
    config: ClientConfig,
    cancel: CancelHandle,
}

impl Simulator {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        config.validate()?;
        Ok(Self {
            config,
            cancel: CancelHandle::new(),
        })
    }

    /// Handle that stops every client's transmission
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Client id for index `i`
    pub fn client_id(i: usize) -> String {
        format!("client_{i:03}")
    }

    /// Connect every client, transmit for `duration`, then disconnect
    pub async fn run(&self, duration: Duration) -> Result<SimulationSummary, ClientError> {
        info!(
            clients = self.config.clients,
            target_rate = self.config.target_rate,
            total_target_rate = self.config.target_rate * self.config.clients as f64,
            "Starting simulation"
        );

        let mut clients = Vec::with_capacity(self.config.clients);
        for i in 0..self.config.clients {
            clients.push(Client::with_cancel(
                Self::client_id(i),
                &self.config,
                self.cancel.clone(),
            )?);
        }

        let host = self.config.host.as_str();
        let port = self.config.port;
        let connects = join_all(clients.iter_mut().map(|client| client.connect(host, port))).await;

        let mut failed = Vec::new();
        let mut connected = Vec::new();
        for (client, outcome) in clients.into_iter().zip(connects) {
            match outcome {
                Ok(()) => connected.push(client),
                Err(e) => {
                    error!(client = %client.id(), error = %e, "Client connection failed");
                    failed.push(client.id().to_string());
                }
            }
        }

        if connected.is_empty() {
            warn!("No clients connected");
            return Ok(SimulationSummary::from_sessions(Vec::new(), failed, Vec::new()));
        }
        info!(connected = connected.len(), "All clients started");

        let runs = join_all(connected.iter_mut().map(|client| async move {
            let outcome = client.transmit(duration).await;
            client.disconnect().await;
            outcome
        }))
        .await;

        let mut sessions = Vec::new();
        let mut aborted = Vec::new();
        for (client, outcome) in connected.iter().zip(runs) {
            match outcome {
                Ok(result) => sessions.push(result),
                Err(ClientError::SessionAborted { result, source }) => {
                    error!(client = %client.id(), error = %source, "Client session aborted");
                    aborted.push(client.id().to_string());
                    sessions.push(*result);
                }
                Err(e) => {
                    error!(client = %client.id(), error = %e, "Client session aborted");
                    aborted.push(client.id().to_string());
                }
            }
        }

        let summary = SimulationSummary::from_sessions(sessions, failed, aborted);
        info!(
            clients = summary.total_clients,
            packets = summary.total_packets,
            bytes = summary.total_bytes,
            errors = summary.total_errors,
            avg_rate = summary.avg_rate_per_client,
            total_rate = summary.total_rate,
            "Simulation completed"
        );
        Ok(summary)
    }
}
