//! CLI subcommands

pub mod close;
pub mod open;
pub mod positions;
pub mod run;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::warn;

use trade_sentinel::broker::ClientConfig;
use trade_sentinel::{AlpacaClient, Config, Engine, PositionStore};

/// Wire the engine up from a loaded config: store, broker client, engine.
pub(crate) fn build_engine(config: &Config) -> Result<Engine> {
    let store = PositionStore::open(&config.store.db_path, config.store.json_backup)
        .context("Failed to open position store")?;

    if config.broker.api_key.is_none() || config.broker.api_secret.is_none() {
        warn!("broker credentials not configured; broker calls will be rejected");
    }
    let api_key = config.broker.api_key.clone().unwrap_or_default();
    let api_secret = config.broker.api_secret.clone().unwrap_or_default();

    let client_config = ClientConfig::default()
        .with_trading_url(config.broker.trading_url.clone())
        .with_data_url(config.broker.data_url.clone())
        .with_max_retries(config.broker.max_retries)
        .with_rate_limit(config.broker.rate_limit as usize)
        .with_timeout(Duration::from_secs(config.broker.timeout_secs));
    let broker = AlpacaClient::with_config(api_key, api_secret, client_config);

    Ok(Engine::new(
        config.engine.clone(),
        Arc::new(broker),
        Arc::new(store),
    ))
}
