//! Open-position command

use anyhow::{Context, Result};
use tracing::info;

use trade_sentinel::{Config, OpenPositionRequest, PartialExitRequest};

pub struct OpenArgs {
    pub config: String,
    pub symbol: String,
    pub side: String,
    pub allocation: f64,
    pub entry: String,
    pub limit_price: Option<f64>,
    pub stop_percent: Option<f64>,
    pub stop_price: Option<f64>,
    pub take_percent: Option<f64>,
    pub take_price: Option<f64>,
    pub trailing_percent: Option<f64>,
    pub partial_fraction: Option<f64>,
    pub partial_trigger_percent: Option<f64>,
    pub strategy: String,
    pub notes: String,
    pub tags: Vec<String>,
}

pub fn run(args: OpenArgs) -> Result<()> {
    dotenv::dotenv().ok();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    runtime.block_on(run_async(args))
}

async fn run_async(args: OpenArgs) -> Result<()> {
    let config = Config::from_file(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config))?;
    let engine = super::build_engine(&config)?;

    let partial_exit = match (args.partial_fraction, args.partial_trigger_percent) {
        (Some(fraction), Some(trigger_percent)) => Some(PartialExitRequest {
            fraction,
            trigger_percent,
        }),
        (None, None) => None,
        _ => anyhow::bail!("--partial-fraction and --partial-trigger-percent go together"),
    };

    let request = OpenPositionRequest {
        symbol: args.symbol,
        side: args.side.parse().map_err(anyhow::Error::msg)?,
        strategy_tag: args.strategy,
        allocation: args.allocation,
        entry_strategy: args.entry.parse().map_err(anyhow::Error::msg)?,
        entry_price: args.limit_price,
        stop_price: args.stop_price,
        stop_percent: args.stop_percent,
        take_profit_price: args.take_price,
        take_profit_percent: args.take_percent,
        trailing_enabled: args.trailing_percent.is_some(),
        trailing_percent: args.trailing_percent,
        partial_exit,
        notes: args.notes,
        tags: args.tags,
    };

    let record = engine
        .open_position(request)
        .await
        .context("Open request failed")?;

    info!("Position #{} created:", record.id);
    info!("  {} {} x{:.0} (allocation {:.2})", record.side, record.symbol, record.quantity, record.allocation);
    info!("  entry: {} @ ~{:.2} (order {})", record.entry_order_type.as_str(), record.entry_price, record.entry_order_id.as_deref().unwrap_or("-"));
    info!("  stop: {:.2} | take-profit: {:.2}", record.stop_price, record.take_profit_price);
    if let Some(pe) = &record.partial_exit {
        info!("  partial exit: {:.0}% @ {:.2}", pe.fraction * 100.0, pe.trigger_price);
    }
    if record.trailing_enabled {
        info!("  trailing: {:.1}%", record.trailing_percent.unwrap_or_default());
    }
    info!("The supervisor (`run`) manages it from here");

    Ok(())
}
