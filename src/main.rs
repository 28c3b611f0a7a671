//! Main entry point for the bulk-runner CLI

use bulk_runner::cli::{Cli, Commands};
use bulk_runner::metrics;
use bulk_runner::shutdown::ShutdownCoordinator;
use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber with optional JSON formatting
fn init_tracing() {
    let json_format = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("bulk_runner=info"));

    if json_format {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();

    if let Some(addr) = cli.metrics_addr {
        if let Err(e) = metrics::init_metrics(addr).await {
            error!("Command failed: {}", e);
            std::process::exit(1);
        }
    }

    // Ctrl+C stops intake; in-flight attempts finish and are recorded
    let shutdown = ShutdownCoordinator::shared();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Ctrl+C received - finishing in-flight requests...");
                shutdown.request_shutdown();
            }
        }
    });

    let result = match &cli.command {
        Commands::Run(args) => args
            .execute(&cli, shutdown.clone())
            .await
            .map_err(|e| anyhow::anyhow!(e)),
        Commands::Export(args) => args
            .execute(&cli, shutdown.clone())
            .await
            .map_err(|e| anyhow::anyhow!(e)),
        Commands::Verify(args) => args.execute(&cli).await.map_err(|e| anyhow::anyhow!(e)),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        std::process::exit(1);
    }
}
