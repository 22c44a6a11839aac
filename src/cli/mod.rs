pub mod collect;
pub mod info;
pub mod replay;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::config::Config;

pub use collect::{cmd_collect, CollectArgs};
pub use info::cmd_info;
pub use replay::{cmd_replay, ReplayArgs};

/// PagePulse - page analytics collection and reporting
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Log level
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Enable debug mode
    #[arg(short, long)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Pull Search Console rows and replay them as analytics events
    Collect(CollectArgs),

    /// Feed a JSON event log through the tracker runtime
    Replay(ReplayArgs),

    /// Show configuration and stored visitor state
    Info,
}

pub fn init_logging(level: &str, debug: bool) {
    let directive = if debug { "debug" } else { level };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(directive));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(debug)
        .init();
}

pub async fn run(cli: Cli) -> Result<()> {
    let mut config = Config::load(cli.config.as_deref())?;
    if cli.debug {
        config.debug = true;
    }
    match cli.command {
        Commands::Collect(args) => cmd_collect(args, &config).await,
        Commands::Replay(args) => cmd_replay(args, &config).await,
        Commands::Info => cmd_info(&config).await,
    }
}
