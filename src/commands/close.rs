//! Manual close command

use anyhow::{Context, Result};
use tracing::info;

use trade_sentinel::Config;

pub fn run(config_path: String, id: i64) -> Result<()> {
    dotenv::dotenv().ok();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    runtime.block_on(run_async(config_path, id))
}

async fn run_async(config_path: String, id: i64) -> Result<()> {
    let config = Config::from_file(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;
    let engine = super::build_engine(&config)?;

    engine
        .close_position(id)
        .await
        .with_context(|| format!("Failed to close position {}", id))?;

    let record = engine.get_position(id)?;
    info!(
        "Position #{} closed ({} {}, remaining {:.0})",
        id, record.side, record.symbol, record.remaining_quantity
    );
    Ok(())
}
