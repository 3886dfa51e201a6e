//! CLI entry point: parses arguments, initializes logging, and routes to
//! the command implementations.

use clap::Parser;

use nexus_core::cli::{execute_command, Cli};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();

    if let Err(e) = execute_command(cli.command, cli.config).await {
        tracing::error!("{e:#}");
        std::process::exit(1);
    }
}
