//! cfbot Control - update operator CLI.
//!
//! Drives the self-update subsystem from the terminal: check for
//! releases, install them, restore the last backup snapshot, and manage
//! snapshot retention. The desktop GUI drives the same orchestrator
//! through the library API.

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "cfbotctl")]
#[command(about = "cfbot - trading bot update manager", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to update.toml (default: XDG config dir, then ./update.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check the release server for a newer version
    Check,

    /// Download and install the latest release
    Upgrade {
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },

    /// Restore the most recent backup snapshot
    Rollback {
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },

    /// List backup snapshots, optionally pruning old ones
    Snapshots {
        /// Keep only the newest N snapshots
        #[arg(long)]
        prune: Option<usize>,
    },

    /// Show the installed version and the last update outcome
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Check => commands::check(cli.config.as_deref()).await,
        Commands::Upgrade { yes } => commands::upgrade(cli.config.as_deref(), yes).await,
        Commands::Rollback { yes } => commands::rollback(cli.config.as_deref(), yes),
        Commands::Snapshots { prune } => commands::snapshots(cli.config.as_deref(), prune),
        Commands::Status => commands::status(cli.config.as_deref()),
    }
}
