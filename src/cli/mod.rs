// ABOUTME: CLI argument parsing and command routing for hfingest
//
// Provides command-line interface for:
// - Running the ingest server (serve)
// - Sending one paced packet stream (send)
// - Simulating many concurrent clients (simulate)

pub mod send;
pub mod serve;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::time::Duration;

use hfingest::config::{BalancePolicy, Config};

/// High-frequency TCP packet ingest server and rate-controlled client
#[derive(Parser)]
#[command(name = "hfingest")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (defaults to ./hfingest.toml, then ~/.config/hfingest/config.toml)
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    /// Output format for final statistics
    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,

    /// Log line format
    #[arg(long, global = true, default_value = "text")]
    pub log_format: LogFormat,
}

/// Output format for commands
#[derive(Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Log line format written to stderr
#[derive(Clone, Copy, Default, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Run the ingest server until Ctrl-C
    Serve(ServeArgs),

    /// Send one rate-controlled packet stream
    Send(SendArgs),

    /// Run several concurrent clients
    Simulate(SimulateArgs),
}

/// Load-balancing policy flag values
#[derive(Clone, Copy, ValueEnum)]
pub enum PolicyArg {
    RoundRobin,
    LeastConnections,
    Scored,
}

impl From<PolicyArg> for BalancePolicy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::RoundRobin => Self::RoundRobin,
            PolicyArg::LeastConnections => Self::LeastConnections,
            PolicyArg::Scored => Self::Scored,
        }
    }
}

/// Arguments for the serve command
#[derive(clap::Args)]
pub struct ServeArgs {
    /// Interface to bind
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind
    #[arg(long, short)]
    pub port: Option<u16>,

    /// Number of workers
    #[arg(long, short)]
    pub workers: Option<usize>,

    /// Maximum queued plus active connections
    #[arg(long)]
    pub max_clients: Option<usize>,

    /// Packet size in bytes
    #[arg(long)]
    pub packet_size: Option<usize>,

    /// Dispatch policy
    #[arg(long)]
    pub policy: Option<PolicyArg>,

    /// Seconds to wait for connections to drain on shutdown
    #[arg(long)]
    pub drain_timeout: Option<f64>,

    /// Seconds between throughput log lines (0 disables)
    #[arg(long)]
    pub stats_interval: Option<f64>,
}

/// Connection and pacing flags shared by send and simulate
#[derive(clap::Args)]
pub struct TransmitArgs {
    /// Server host
    #[arg(long)]
    pub host: Option<String>,

    /// Server port
    #[arg(long, short)]
    pub port: Option<u16>,

    /// Target packets per second per client
    #[arg(long, short)]
    pub rate: Option<f64>,

    /// Packet size in bytes
    #[arg(long)]
    pub packet_size: Option<usize>,

    /// Transmission duration in seconds
    #[arg(long, short)]
    pub duration: Option<f64>,
}

/// Arguments for the send command
#[derive(clap::Args)]
pub struct SendArgs {
    #[command(flatten)]
    pub transmit: TransmitArgs,

    /// Session id used in logs and output
    #[arg(long, default_value = "client_000")]
    pub id: String,
}

/// Arguments for the simulate command
#[derive(clap::Args)]
pub struct SimulateArgs {
    #[command(flatten)]
    pub transmit: TransmitArgs,

    /// Number of concurrent clients
    #[arg(long, short = 'n')]
    pub clients: Option<usize>,
}

/// Load the explicit config file, or discover one, or fall back to defaults
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load(path).context("Failed to load configuration"),
        None => Config::discover().context("Failed to load configuration"),
    }
}

/// Convert a seconds flag to a Duration
pub fn seconds(flag: &str, secs: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(secs).with_context(|| format!("Invalid value for --{flag}: {secs}"))
}
