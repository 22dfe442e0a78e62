//! Snapshot Agent - Main entry point
//!
//! Runs one engine operation and prints its outcome as JSON on stdout.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use snapshot_agent::config::{Config, SyncMode, SyncPolicy};
use snapshot_agent::crypto::EncryptionKey;
use snapshot_agent::{utils, Engine, RunOutcome};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print a fresh base64 encryption key
    Keygen,
    #[command(flatten)]
    Run(RunCommand),
}

/// Commands that drive the engine
#[derive(Subcommand, Debug)]
enum RunCommand {
    /// Create a backup and send it to the configured destination
    Create,
    /// List local backups, newest first
    List,
    /// Delete local backups beyond the retention limit
    Prune,
    /// Create a backup and sync it to the remote
    Sync {
        #[arg(long, value_enum, default_value_t = Mode::Git)]
        mode: Mode,
        #[arg(long, value_enum, default_value_t = Policy::Override)]
        policy: Policy,
    },
    /// Restore a local backup into a directory
    Restore { id: String, target: PathBuf },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Mode {
    Git,
    Api,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Policy {
    Override,
    Merge,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let command = match args.command {
        Command::Keygen => {
            println!("{}", EncryptionKey::generate().to_base64());
            return Ok(());
        }
        Command::Run(command) => command,
    };

    // Load configuration
    let config = if let Some(config_path) = &args.config {
        Config::from_file(config_path)
            .with_context(|| format!("Failed to load {}", config_path.display()))?
    } else {
        Config::default()
    };

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    tracing::info!(
        "Starting snapshot-agent v{} (project: {})",
        env!("CARGO_PKG_VERSION"),
        config.project.name
    );

    let engine = Engine::from_env(config)?;

    let run = async {
        match command {
            RunCommand::Create => engine.create_backup().await,
            RunCommand::List => engine.list_backups().await,
            RunCommand::Prune => engine.prune_backups().await,
            RunCommand::Sync { mode, policy } => {
                let mode = match mode {
                    Mode::Git => SyncMode::Git,
                    Mode::Api => SyncMode::Api,
                };
                let policy = match policy {
                    Policy::Override => SyncPolicy::Override,
                    Policy::Merge => SyncPolicy::Merge,
                };
                engine.sync_to_remote(mode, policy).await
            }
            RunCommand::Restore { id, target } => engine.restore_backup(&id, &target).await,
        }
    };

    // The run future is dropped on Ctrl-C, which removes its staging directories
    let outcome: Option<RunOutcome> = tokio::select! {
        outcome = run => Some(outcome),
        _ = tokio::signal::ctrl_c() => None,
    };
    let Some(outcome) = outcome else {
        tracing::warn!("Interrupted, run abandoned");
        std::process::exit(130);
    };

    println!("{}", serde_json::to_string_pretty(&outcome)?);

    if !outcome.success {
        std::process::exit(1);
    }
    Ok(())
}
