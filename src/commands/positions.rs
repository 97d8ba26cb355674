//! Position listing command

use anyhow::{Context, Result};
use tracing::info;

use trade_sentinel::{Config, StatusFilter};

pub fn run(config_path: String, status: String) -> Result<()> {
    dotenv::dotenv().ok();

    let config = Config::from_file(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;
    let engine = super::build_engine(&config)?;

    let filter: StatusFilter = status.parse().map_err(anyhow::Error::msg)?;
    let positions = engine.list_positions(filter)?;

    if positions.is_empty() {
        info!("No positions match");
        return Ok(());
    }

    info!(
        "{:>5}  {:<8} {:<6} {:<11} {:>8} {:>10} {:>10} {:>10} {:>9}",
        "id", "symbol", "side", "status", "qty", "entry", "stop", "take", "P&L"
    );
    for p in &positions {
        info!(
            "{:>5}  {:<8} {:<6} {:<11} {:>8.0} {:>10.2} {:>10.2} {:>10.2} {:>+9.2}",
            p.id,
            p.symbol,
            p.side.as_str(),
            p.status.as_str(),
            p.remaining_quantity,
            p.entry_price,
            p.stop_price,
            p.take_profit_price,
            p.unrealized_pl,
        );
    }
    info!("{} positions", positions.len());

    Ok(())
}
