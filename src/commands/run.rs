//! Supervisor command
//!
//! Recovers saved state, then reconciles every managed position against the
//! broker on a fixed cadence until interrupted. Ctrl-C lets the current
//! pass finish; no new pass starts afterwards.

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{error, info};

use trade_sentinel::Config;

pub fn run(config_path: String, interval_secs: Option<u64>, state_db: Option<String>) -> Result<()> {
    dotenv::dotenv().ok();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    runtime.block_on(run_async(config_path, interval_secs, state_db))
}

async fn run_async(
    config_path: String,
    interval_secs: Option<u64>,
    state_db: Option<String>,
) -> Result<()> {
    let mut config = Config::from_file(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;
    if let Some(secs) = interval_secs {
        config.engine.poll_interval_secs = secs;
    }
    if let Some(db) = state_db {
        config.store.db_path = db;
    }

    info!("╔════════════════════════════════════════════╗");
    info!("║        TRADE SENTINEL - SUPERVISOR         ║");
    info!("╠════════════════════════════════════════════╣");
    info!("║ Broker: {:<34} ║", config.broker.trading_url);
    info!("║ State db: {:<32} ║", config.store.db_path);
    info!("║ Pass interval: {} seconds{:<18} ║", config.engine.poll_interval_secs, "");
    info!("╚════════════════════════════════════════════╝");

    let engine = super::build_engine(&config)?;
    let fingerprint = config.fingerprint();
    engine
        .recover(Some(&fingerprint))
        .context("State recovery failed")?;

    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let shutdown_flag_clone = shutdown_flag.clone();

    let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, initiating shutdown...");
                shutdown_flag_clone.store(true, Ordering::SeqCst);
                let _ = shutdown_tx.send(()).await;
            }
            Err(e) => {
                error!("Error setting up signal handler: {}", e);
            }
        }
    });

    let mut pass_interval = interval(Duration::from_secs(config.engine.poll_interval_secs.max(1)));

    info!("Starting supervision loop...");

    loop {
        tokio::select! {
            _ = pass_interval.tick() => {
                if shutdown_flag.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(e) = engine.run_pass().await {
                    error!("Reconciliation pass error: {}", e);
                }
            }
            _ = shutdown_rx.recv() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    info!(
        "Supervisor stopped; {} positions remain under management",
        engine.managed_count()
    );
    Ok(())
}
