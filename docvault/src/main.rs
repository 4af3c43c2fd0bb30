//! docvault server
//!
//! Opens a repository over the reference engine and keeps it alive, evicting
//! idle sessions, until interrupted.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use docvault_core::{ContentEngine, MemoryEngine, Repository, VaultConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "docvault")]
#[command(about = "Hierarchical document repository")]
struct Cli {
    /// TOML configuration file; DOCVAULT_* variables override it
    #[arg(short, long, default_value = "docvault.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Open the repository and serve until Ctrl-C (default)
    Serve,

    /// Print the effective configuration and exit
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = VaultConfig::load(Some(cli.config.as_path()))
        .with_context(|| format!("loading {}", cli.config.display()))?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await,
        Commands::Check => {
            println!("repository:    {}", config.repository_name);
            println!("delete policy: {:?}", config.delete_policy);
            println!("idle timeout:  {}s", config.session_idle_timeout_secs);
            println!("eviction:      every {}s", config.eviction_period_secs);
            match &config.data_file {
                Some(path) => println!("data file:     {}", path.display()),
                None => println!("data file:     (memory only)"),
            }
            Ok(())
        }
    }
}

async fn serve(config: VaultConfig) -> Result<()> {
    let engine: Arc<dyn ContentEngine> = match &config.data_file {
        Some(path) => Arc::new(
            MemoryEngine::open(path).with_context(|| format!("opening {}", path.display()))?,
        ),
        None => {
            warn!("no data_file configured, content will not survive a restart");
            Arc::new(MemoryEngine::new())
        }
    };

    let repository = Repository::open(config, engine)?;
    let mut events = repository.events().subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => tracing::debug!(?event, "repository event"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event log lagging"),
                Err(RecvError::Closed) => break,
            }
        }
    });
    repository.start_eviction();
    info!(
        repository = %repository.config().repository_name,
        "docvault ready, press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    repository.shutdown()?;
    Ok(())
}
