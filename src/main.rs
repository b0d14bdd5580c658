//! PostgreSQL dump shipper
//!
//! Captures a logical dump and uploads it to a GitHub repository or an S3-compatible bucket

// dumpship/src/main.rs
mod backup;
mod cli;
mod config;
mod errors;
mod utils;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cli::Cli;
use config::RawConfig;
use errors::{PipelineError, Stage};

/// Exit status for a run stopped by Ctrl-C.
const EXIT_CANCELLED: u8 = 130;

/// Main entry point for the backup tool
#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling backup");
            on_signal.cancel();
        }
    });

    match run_app(cli, &cancel).await {
        Ok(()) => {
            println!("✅ Operation completed successfully.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("❌ Error: {:#}", e);
            let cancelled = e
                .downcast_ref::<PipelineError>()
                .is_some_and(|e| e.source.is_cancelled());
            if cancelled {
                ExitCode::from(EXIT_CANCELLED)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run_app(cli: Cli, cancel: &CancellationToken) -> Result<()> {
    let started_at = Utc::now();

    let raw = match &cli.config {
        Some(path) => config::load_document(path)
            .map_err(PipelineError::at(Stage::ResolveConfig))
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => RawConfig::default(),
    };
    let raw = raw.apply_overrides(cli.overrides());
    let plan = config::resolve(&raw, started_at).map_err(PipelineError::at(Stage::ResolveConfig))?;

    info!(dry_run = cli.dry_run, "Starting backup process");
    if let Some(location) = backup::run_backup_flow(plan, cli.dry_run, cancel).await? {
        println!("📦 Backup uploaded to {}", location);
    }
    Ok(())
}
