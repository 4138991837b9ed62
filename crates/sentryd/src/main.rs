//! DiskSentry Daemon - storage device health monitoring.
//!
//! Polls SMART telemetry, scores device health, and drives automated
//! backup decisions when a device starts failing.

use anyhow::{Context, Result};
use clap::Parser;
use sentryd::backup::CommandBackupExecutor;
use sentryd::collectors::SmartctlSource;
use sentryd::config::{Config, CONFIG_PATH};
use sentryd::monitor::Monitor;
use sentryd::sink::{EventSink, FanoutSink, JsonlSink, LogSink};
use sentryd::store::SqliteStore;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "sentryd")]
#[command(about = "DiskSentry - storage health monitoring and backup automation", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file
    #[arg(long, default_value = CONFIG_PATH)]
    config: PathBuf,

    /// Run one evaluation cycle and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    info!("DiskSentry v{} starting", env!("CARGO_PKG_VERSION"));

    // Invalid configuration is fatal here, before the loop exists.
    let config = Config::load(&cli.config)?;

    let store = Arc::new(
        SqliteStore::open_at(&config.store.database_path, config.store.retention_samples)
            .with_context(|| format!("opening history database {}", config.store.database_path))?,
    );
    let telemetry = Arc::new(SmartctlSource::new());

    let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
    let backup = Arc::new(CommandBackupExecutor::new(
        config.backup.command.clone(),
        outcome_tx,
    ));

    let mut sinks: Vec<Box<dyn EventSink>> = vec![Box::new(LogSink)];
    if let Some(path) = &config.store.audit_log_path {
        sinks.push(Box::new(JsonlSink::new(path)));
    }
    let sink = Arc::new(FanoutSink::new(sinks));

    let mut monitor = Monitor::new(&config, store, telemetry, backup, sink)?;

    if cli.once {
        monitor.run_cycle().await;
        info!("single evaluation cycle complete");
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                let _ = shutdown_tx.send(true);
            }
            Err(e) => error!("failed to listen for shutdown signal: {}", e),
        }
    });

    monitor.run(outcome_rx, shutdown_rx).await;
    info!("DiskSentry shut down cleanly");
    Ok(())
}
