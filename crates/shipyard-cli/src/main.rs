//! Shipyard CLI tool.

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "shipyard")]
#[command(about = "Shipyard build pipeline CLI", long_about = None)]
struct Cli {
    /// Orchestrator API URL
    #[arg(long, env = "SHIPYARD_API_URL", default_value = "http://localhost:8082")]
    api_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a build
    Submit {
        /// Repository to clone
        repository: String,
        /// Branch to build
        #[arg(long)]
        branch: Option<String>,
        /// Commit to check out after the branch
        #[arg(long)]
        commit: Option<String>,
        /// Submitter recorded on the build
        #[arg(long, env = "USER")]
        submitter: Option<String>,
    },
    /// Show a build
    Status {
        /// Build ID
        id: String,
    },
    /// Print the log of a build
    Logs {
        /// Build ID
        id: String,
    },
    /// List recent builds
    List {
        /// Maximum number of builds to show
        #[arg(long, default_value = "20")]
        limit: u32,
    },
    /// Validate a server configuration file
    ValidateConfig {
        /// Path to the configuration file
        #[arg(default_value = "shipyard.kdl")]
        path: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let client = commands::ApiClient::new(&cli.api_url)?;

    match cli.command {
        Commands::Submit {
            repository,
            branch,
            commit,
            submitter,
        } => {
            commands::builds::submit(&client, &repository, branch, commit, submitter).await?;
        }
        Commands::Status { id } => {
            commands::builds::status(&client, &id).await?;
        }
        Commands::Logs { id } => {
            commands::builds::logs(&client, &id).await?;
        }
        Commands::List { limit } => {
            commands::builds::list(&client, limit).await?;
        }
        Commands::ValidateConfig { path } => {
            commands::validate_config(&path)?;
        }
    }

    Ok(())
}
