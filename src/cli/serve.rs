// ABOUTME: CLI serve command: run the ingest server until interrupted, then drain

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::info;

use super::{load_config, seconds, OutputFormat, ServeArgs};
use hfingest::config::ServerConfig;
use hfingest::server::{Server, ShutdownReport};

/// JSON output structure for the serve command
#[derive(Debug, Serialize)]
pub struct ServeOutput {
    pub addr: String,
    pub stopped_at: String,
    pub report: ShutdownReport,
}

/// Apply command-line overrides on top of file configuration
fn apply_overrides(mut config: ServerConfig, args: &ServeArgs) -> Result<ServerConfig> {
    if let Some(host) = &args.host {
        config.host.clone_from(host);
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(workers) = args.workers {
        config.worker_count = workers;
    }
    if let Some(max_clients) = args.max_clients {
        config.max_clients = max_clients;
    }
    if let Some(packet_size) = args.packet_size {
        config.packet_size = packet_size;
    }
    if let Some(policy) = args.policy {
        config.policy = policy.into();
    }
    if let Some(secs) = args.drain_timeout {
        config.drain_timeout = seconds("drain-timeout", secs)?;
    }
    if let Some(secs) = args.stats_interval {
        config.stats_interval = seconds("stats-interval", secs)?;
    }
    config.validate().context("Invalid server configuration")?;
    Ok(config)
}

/// Execute the serve command
pub async fn execute(
    args: ServeArgs,
    config_path: Option<&std::path::Path>,
    format: OutputFormat,
) -> Result<()> {
    let config = apply_overrides(load_config(config_path)?.server, &args)?;
    let drain_timeout = config.drain_timeout;

    let server = Server::start(config).await.context("Failed to start server")?;
    let addr = server.local_addr();
    eprintln!("Listening on {addr} (Ctrl-C to stop)");

    shutdown_signal().await;
    info!("Shutdown signal received");

    let report = server.stop(drain_timeout).await;

    match format {
        OutputFormat::Json => {
            let output = ServeOutput {
                addr: addr.to_string(),
                stopped_at: chrono::Utc::now().to_rfc3339(),
                report,
            };
            println!(
                "{}",
                serde_json::to_string_pretty(&output).context("Failed to serialize report")?
            );
        }
        OutputFormat::Text => print_report(&report),
    }

    Ok(())
}

fn print_report(report: &ShutdownReport) {
    let stats = &report.stats;
    println!("=== SERVER FINAL STATISTICS ===");
    println!("Total packets:      {}", stats.total_packets);
    println!("Total bytes:        {}", stats.total_bytes);
    println!("Connections served: {}", stats.connections_served);
    println!("Errors:             {} ({} rejected)", stats.errors, stats.rejected);
    println!("Worker restarts:    {}", stats.restarts);
    println!("Uptime:             {:.2}s", stats.uptime.as_secs_f64());
    println!("Average rate:       {:.1} pkt/s", stats.packet_rate());
    if stats.dropped_events > 0 {
        println!("Dropped events:     {}", stats.dropped_events);
    }
    for worker in &stats.workers {
        println!(
            "  worker {:>2}: {} packets, {} connections, {} errors, {} restarts",
            worker.worker_id, worker.packets, worker.connections_served, worker.errors, worker.restarts
        );
    }
    if report.drained {
        println!("Shutdown: drained in {:.2}s", report.elapsed.as_secs_f64());
    } else {
        println!(
            "Shutdown: drain timed out, forced workers {:?}",
            report.forced_workers
        );
    }
}

/// Resolve on Ctrl-C, or SIGTERM on unix
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
