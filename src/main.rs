use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use mnema::{cli, config, server};

#[derive(Parser)]
#[command(name = "mnema", version, about = "Ambient memory for engineering teams")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the HTTP API server
    Serve,
    /// Capture events from a JSON file (or stdin) into a workspace
    Capture {
        /// Workspace slug
        workspace: String,
        /// Path to a JSON event or array of events; stdin when omitted
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
    /// Search a workspace from the terminal
    Search {
        /// Workspace slug
        workspace: String,
        /// Query text
        query: String,
        /// Rerank mode: fast, balanced, or thorough
        #[arg(short, long, default_value = "balanced")]
        mode: String,
        /// Maximum results
        #[arg(short, long)]
        limit: Option<usize>,
    },
    /// Show workspace statistics
    Stats {
        /// Workspace slug
        workspace: String,
    },
    /// Manage the embedding model
    Model {
        #[command(subcommand)]
        action: ModelAction,
    },
}

#[derive(Subcommand)]
enum ModelAction {
    /// Download the embedding model to ~/.mnema/models/
    Download,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load config (for log level)
    let config = config::MnemaConfig::load()?;

    let filter =
        EnvFilter::try_new(&config.server.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Serve => {
            server::serve(config).await?;
        }
        Command::Capture { workspace, file } => {
            cli::capture::capture(config, &workspace, file.as_deref()).await?;
        }
        Command::Search {
            workspace,
            query,
            mode,
            limit,
        } => {
            let mode = cli::search::parse_mode(&mode)?;
            cli::search::search(config, &workspace, &query, mode, limit).await?;
        }
        Command::Stats { workspace } => {
            cli::stats::stats(&config, &workspace)?;
        }
        Command::Model { action } => match action {
            ModelAction::Download => {
                cli::model_download(&config).await?;
            }
        },
    }

    Ok(())
}
