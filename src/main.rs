//! MemRag - Tiered memory and retrieval-augmented record store
//!
//! Serves one memory partition over HTTP, with a hot in-memory tier and a
//! cold object-storage mirror.

use anyhow::Result;
use clap::{Parser, Subcommand};
use memrag::{api, MemRagConfig, MemorySystem};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "memrag")]
#[command(author = "A3S Lab Team")]
#[command(version)]
#[command(about = "Tiered memory and retrieval-augmented record store")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "MEMRAG_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Host to bind to (overrides the config file)
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on (overrides the config file)
        #[arg(long)]
        port: Option<u16>,

        /// Restore the partition from cold storage before serving
        #[arg(long)]
        hydrate: bool,
    },

    /// Restore a partition from cold storage and print the report
    Restore {
        /// Partition to restore (defaults to the configured one)
        #[arg(short, long)]
        partition: Option<String>,

        /// Restore a snapshot instead of the per-object mirror
        #[arg(short, long)]
        snapshot: Option<String>,
    },

    /// Show configuration
    Config {
        /// Show default configuration
        #[arg(long)]
        default: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("memrag={},tower_http={}", log_level, log_level).into());
    let registry = tracing_subscriber::registry().with(filter);
    if cli.json_logs {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    // Load configuration
    let config = match &cli.config {
        Some(path) => MemRagConfig::load(path)?,
        None => MemRagConfig::default(),
    };

    match cli.command {
        Commands::Serve { host, port, hydrate } => {
            run_server(config, host, port, hydrate).await?;
        }
        Commands::Restore { partition, snapshot } => {
            run_restore(config, partition, snapshot).await?;
        }
        Commands::Config { default } => {
            let shown = if default { MemRagConfig::default() } else { config };
            println!("{}", shown.to_toml()?);
        }
    }

    Ok(())
}

async fn run_server(
    mut config: MemRagConfig,
    host: Option<String>,
    port: Option<u16>,
    hydrate: bool,
) -> Result<()> {
    if let Some(host) = host {
        config.api.host = host;
    }
    if let Some(port) = port {
        config.api.port = port;
    }
    let addr = format!("{}:{}", config.api.host, config.api.port);

    let system = Arc::new(MemorySystem::new(config)?);
    if hydrate {
        let partition = system.partition().to_string();
        let report = system.restore(&partition).await?;
        tracing::info!(
            restored = report.restored_count,
            skipped = report.skipped_count,
            "Hot tier hydrated from cold storage"
        );
    }

    let cancel = CancellationToken::new();
    let background = system.spawn_background(cancel.clone());

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("MemRag listening on {}. Press Ctrl+C to stop.", addr);
    axum::serve(listener, api::build_app(system.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutting down...");
    cancel.cancel();
    for handle in background {
        let _ = handle.await;
    }

    let report = system.sync().await;
    if report.degraded {
        tracing::warn!(
            failed = report.failed_count,
            "Final sync incomplete, unsynced changes are lost"
        );
    } else {
        tracing::info!(synced = report.synced_count, "Final sync complete");
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
}

async fn run_restore(
    config: MemRagConfig,
    partition: Option<String>,
    snapshot: Option<String>,
) -> Result<()> {
    let partition = partition.unwrap_or_else(|| config.memory.partition.clone());
    let system = MemorySystem::new(config)?;
    let report = match snapshot {
        Some(id) => system.restore_snapshot(&partition, &id).await?,
        None => system.restore(&partition).await?,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
