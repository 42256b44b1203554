//! memkeep daemon - persistent memory engine for AI assistants

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use memkeep::api;
use memkeep::config::Config;
use memkeep::engine::MemoryEngine;
use memkeep::error::Result;

/// memkeep - long-term memory for AI assistants
#[derive(Parser)]
#[command(name = "memkeep")]
#[command(about = "Gated, decaying, searchable long-term memory for AI assistants")]
#[command(version)]
pub struct Cli {
    /// Path to config file
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the HTTP server (default command)
    #[command(name = "serve")]
    Serve,

    /// Run one reflection cycle and print its report
    #[command(name = "reflect")]
    Reflect,

    /// Retry lagging index writes and removals
    #[command(name = "reconcile")]
    Reconcile,

    /// Classify the sensitivity of stored memories
    #[command(name = "classify")]
    Classify {
        /// Reclassify memories that already have a level
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    init_logging();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    tracing::debug!("Config loaded: {:?}", config);

    match cli.command {
        None | Some(Command::Serve) => serve(config).await,
        Some(Command::Reflect) => {
            let engine = MemoryEngine::open(config).await?;
            print_json(&engine.reflect().await?)
        }
        Some(Command::Reconcile) => {
            let engine = MemoryEngine::open(config).await?;
            print_json(&engine.reconcile().await?)
        }
        Some(Command::Classify { force }) => {
            let engine = MemoryEngine::open(config).await?;
            print_json(&engine.classify_sensitivity(force).await?)
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,memkeep=debug"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn serve(config: Config) -> Result<()> {
    tracing::info!("Starting memkeep daemon");
    tracing::info!(
        "Storage root: {} ({} mode)",
        config.storage.root.display(),
        config.storage.mode.as_str()
    );

    let server_config = config.server.clone();
    let engine = Arc::new(MemoryEngine::open(config).await?);
    api::serve(engine, &server_config).await
}
