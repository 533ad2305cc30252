// ABOUTME: CLI send and simulate commands: paced client sessions against a server
//
// send: one client session, final session statistics
// simulate: N concurrent clients, aggregate summary

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::info;

use super::{load_config, seconds, OutputFormat, SendArgs, SimulateArgs, TransmitArgs};
use hfingest::client::{
    CancelHandle, Client, ClientError, SessionResult, SimulationSummary, Simulator,
};
use hfingest::config::ClientConfig;

/// JSON output structure for the send command
#[derive(Debug, Serialize)]
pub struct SendOutput {
    pub finished_at: String,
    /// Reconnection failed before the duration elapsed
    pub aborted: bool,
    pub session: SessionResult,
}

/// JSON output structure for the simulate command
#[derive(Debug, Serialize)]
pub struct SimulateOutput {
    pub finished_at: String,
    pub summary: SimulationSummary,
}

fn apply_overrides(mut config: ClientConfig, args: &TransmitArgs) -> Result<ClientConfig> {
    if let Some(host) = &args.host {
        config.host.clone_from(host);
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(rate) = args.rate {
        config.target_rate = rate;
    }
    if let Some(packet_size) = args.packet_size {
        config.packet_size = packet_size;
    }
    if let Some(secs) = args.duration {
        config.duration = seconds("duration", secs)?;
    }
    config.validate().context("Invalid client configuration")?;
    Ok(config)
}

/// Cancel `handle` when Ctrl-C arrives
fn cancel_on_ctrl_c(handle: CancelHandle) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, stopping transmission");
            handle.cancel();
        }
    });
}

/// Execute the send command
pub async fn execute(
    args: SendArgs,
    config_path: Option<&std::path::Path>,
    format: OutputFormat,
) -> Result<()> {
    let config = apply_overrides(load_config(config_path)?.client, &args.transmit)?;

    let mut client = Client::new(args.id, &config).context("Failed to create client")?;
    cancel_on_ctrl_c(client.cancel_handle());

    client
        .connect(&config.host, config.port)
        .await
        .context("Failed to connect")?;
    let result = client.transmit(config.duration).await;
    client.disconnect().await;

    // An aborted session still reports what it sent before failing
    let (session, abort_cause) = match result {
        Ok(session) => (session, None),
        Err(ClientError::SessionAborted { result, source }) => (*result, Some(*source)),
        Err(e) => return Err(e).context("Transmission failed"),
    };

    match format {
        OutputFormat::Json => {
            let output = SendOutput {
                finished_at: chrono::Utc::now().to_rfc3339(),
                aborted: abort_cause.is_some(),
                session,
            };
            println!(
                "{}",
                serde_json::to_string_pretty(&output).context("Failed to serialize session")?
            );
        }
        OutputFormat::Text => {
            println!("=== CLIENT FINAL STATISTICS ===");
            println!("Client:         {}", session.id);
            println!("Packets sent:   {}", session.packets_sent);
            println!("Bytes sent:     {}", session.bytes_sent);
            println!("Duration:       {:.2}s", session.elapsed.as_secs_f64());
            println!(
                "Average rate:   {:.1} Hz (target {:.1})",
                session.achieved_rate, session.target_rate
            );
            println!("Max batch gap:  {:.2}ms", session.max_batch_gap.as_secs_f64() * 1000.0);
            println!("Errors:         {}", session.send_errors);
            println!("Reconnects:     {}", session.reconnects);
            if !session.within_tolerance {
                println!("Warning: achieved rate outside tolerance");
            }
            if abort_cause.is_some() {
                println!("Session aborted: reconnect budget exhausted");
            }
        }
    }

    match abort_cause {
        Some(cause) => Err(anyhow::Error::new(cause).context("Transmission aborted")),
        None => Ok(()),
    }
}

/// Execute the simulate command
pub async fn simulate(
    args: SimulateArgs,
    config_path: Option<&std::path::Path>,
    format: OutputFormat,
) -> Result<()> {
    let mut config = apply_overrides(load_config(config_path)?.client, &args.transmit)?;
    if let Some(clients) = args.clients {
        config.clients = clients;
        config.validate().context("Invalid client configuration")?;
    }
    let duration = config.duration;

    let simulator = Simulator::new(config).context("Failed to create simulator")?;
    cancel_on_ctrl_c(simulator.cancel_handle());

    let summary = simulator.run(duration).await.context("Simulation failed")?;

    match format {
        OutputFormat::Json => {
            let output = SimulateOutput {
                finished_at: chrono::Utc::now().to_rfc3339(),
                summary,
            };
            println!(
                "{}",
                serde_json::to_string_pretty(&output).context("Failed to serialize summary")?
            );
        }
        OutputFormat::Text => {
            println!("=== SIMULATION SUMMARY ===");
            println!("Clients:             {}", summary.total_clients);
            println!("Total packets:       {}", summary.total_packets);
            println!("Total bytes:         {}", summary.total_bytes);
            println!("Total errors:        {}", summary.total_errors);
            println!("Avg rate per client: {:.1} Hz", summary.avg_rate_per_client);
            println!("Total rate:          {:.1} Hz", summary.total_rate);
            if !summary.failed_clients.is_empty() {
                println!("Failed to connect:   {}", summary.failed_clients.join(", "));
            }
            if !summary.aborted_clients.is_empty() {
                println!("Aborted:             {}", summary.aborted_clients.join(", "));
            }
        }
    }

    Ok(())
}
