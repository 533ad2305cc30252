// ABOUTME: Main entry point for hfingest
//
// Binary: hfingest
// Usage: hfingest <COMMAND>
// - serve: run the ingest server until Ctrl-C
// - send: one rate-controlled client session
// - simulate: many concurrent client sessions

use anyhow::Result;
use clap::Parser;

mod cli;

use cli::{Cli, Commands, LogFormat};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    setup_logging(args.log_format);
    setup_panic_handler();

    let config_path = args.config.as_deref();
    match args.command {
        Commands::Serve(serve_args) => cli::serve::execute(serve_args, config_path, args.format).await,
        Commands::Send(send_args) => cli::send::execute(send_args, config_path, args.format).await,
        Commands::Simulate(simulate_args) => {
            cli::send::simulate(simulate_args, config_path, args.format).await
        }
    }
}

fn setup_logging(format: LogFormat) {
    use tracing_subscriber::prelude::*;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "hfingest=info".into());

    match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .json() // Output in JSON Lines format
                    .with_target(true)
                    .with_writer(std::io::stderr)
                    .with_ansi(false),
            )
            .with(filter)
            .init(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_writer(std::io::stderr),
            )
            .with(filter)
            .init(),
    }
}

fn setup_panic_handler() {
    use tracing::error;

    std::panic::set_hook(Box::new(|panic_info| {
        error!("Application panicked: {}", panic_info);
        eprintln!("Application panicked: {}", panic_info);
    }));
}
