//! Shipyard server.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use shipyard_api::server;
use shipyard_config::ShipyardConfig;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "shipyard-server")]
#[command(about = "Shipyard build pipeline services", long_about = None)]
struct Cli {
    /// Path to a KDL configuration file
    #[arg(long, short, env = "SHIPYARD_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, env = "SHIPYARD_LOG_FORMAT", default_value = "pretty", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Own build state: ingest requests, dispatch jobs, fold in progress
    Orchestrator,
    /// Execute build jobs
    Builder,
    /// Push live build notifications to WebSocket clients
    Notifier,
    /// Run every component in one process with in-memory backends
    Standalone,
    /// Apply database migrations and exit
    Migrate,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Pretty => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// `PORT` overrides the port of the active role's listen address.
fn listen_addr(configured: SocketAddr) -> anyhow::Result<SocketAddr> {
    match std::env::var("PORT") {
        Ok(port) => {
            let port: u16 = port
                .trim()
                .parse()
                .with_context(|| format!("invalid PORT: {}", port))?;
            Ok(SocketAddr::new(configured.ip(), port))
        }
        Err(_) => Ok(configured),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = ShipyardConfig::load(cli.config.as_deref()).context("loading configuration")?;

    let shutdown = CancellationToken::new();
    tokio::spawn(server::shutdown_on_signal(shutdown.clone()));

    match cli.command {
        Commands::Orchestrator => {
            let listen = listen_addr(config.orchestrator.listen)?;
            info!(%listen, "Starting orchestrator");
            server::run_orchestrator(config, listen, shutdown).await?;
        }
        Commands::Builder => {
            let listen = listen_addr(config.builder.listen)?;
            info!(%listen, worker_id = %config.builder.worker_id, "Starting builder");
            server::run_builder(config, listen, shutdown).await?;
        }
        Commands::Notifier => {
            let listen = listen_addr(config.notifier.listen)?;
            info!(%listen, "Starting notifier");
            server::run_notifier(config, listen, shutdown).await?;
        }
        Commands::Standalone => {
            let listen = listen_addr(config.orchestrator.listen)?;
            info!(%listen, "Starting standalone pipeline");
            server::run_standalone(config, listen, shutdown).await?;
        }
        Commands::Migrate => {
            server::migrate(&config).await?;
        }
    }

    info!("Shutdown complete");
    Ok(())
}
