//! Trade sentinel - main entry point
//!
//! This binary provides four subcommands:
//! - run: recover saved state and supervise positions until interrupted
//! - open: plan and submit a new protected position
//! - positions: list managed positions
//! - close: cancel a position's orders and exit any remaining exposure

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;

#[derive(Parser, Debug)]
#[command(name = "trade-sentinel")]
#[command(about = "Automated managed-position engine with bracketed entries and broker reconciliation", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Recover saved positions and run the supervisor loop
    Run {
        /// Path to configuration file
        #[arg(short, long, default_value = "configs/sentinel.json")]
        config: String,

        /// Reconciliation interval in seconds (overrides config)
        #[arg(long)]
        interval: Option<u64>,

        /// State database path (overrides config)
        #[arg(long)]
        state_db: Option<String>,
    },

    /// Open a new protected position
    Open {
        /// Path to configuration file
        #[arg(short, long, default_value = "configs/sentinel.json")]
        config: String,

        /// Ticker symbol, e.g. SPY
        #[arg(long)]
        symbol: String,

        /// Position side: long or short
        #[arg(long, default_value = "long")]
        side: String,

        /// Currency amount to allocate
        #[arg(long)]
        allocation: f64,

        /// Entry strategy: market or limit
        #[arg(long, default_value = "market")]
        entry: String,

        /// Limit price (required for limit entries)
        #[arg(long)]
        limit_price: Option<f64>,

        /// Stop-loss as percent below/above entry
        #[arg(long)]
        stop_percent: Option<f64>,

        /// Absolute stop-loss price
        #[arg(long)]
        stop_price: Option<f64>,

        /// Take-profit as percent above/below entry
        #[arg(long)]
        take_percent: Option<f64>,

        /// Absolute take-profit price
        #[arg(long)]
        take_price: Option<f64>,

        /// Trail the stop by this percent once the position moves favorably
        #[arg(long)]
        trailing_percent: Option<f64>,

        /// Exit this fraction of the position at the partial trigger
        #[arg(long)]
        partial_fraction: Option<f64>,

        /// Favorable move (percent) that triggers the partial exit
        #[arg(long)]
        partial_trigger_percent: Option<f64>,

        /// Strategy tag recorded on the position
        #[arg(long, default_value = "")]
        strategy: String,

        /// Free-form note
        #[arg(long, default_value = "")]
        notes: String,

        /// Tags (repeatable)
        #[arg(long = "tag")]
        tags: Vec<String>,
    },

    /// List managed positions
    Positions {
        /// Path to configuration file
        #[arg(short, long, default_value = "configs/sentinel.json")]
        config: String,

        /// Status filter: all, pending, active, partial, closed,
        /// stopped_out, failed. Default hides stale pending records.
        #[arg(long, default_value = "")]
        status: String,
    },

    /// Close a position: cancel its orders and exit remaining exposure
    Close {
        /// Path to configuration file
        #[arg(short, long, default_value = "configs/sentinel.json")]
        config: String,

        /// Position id
        id: i64,
    },
}

fn setup_logging(verbose: bool, command_name: &str) -> Result<()> {
    std::fs::create_dir_all("logs")?;

    let log_filename = format!(
        "{}_{}.log",
        command_name,
        chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
    );
    let log_path = PathBuf::from("logs").join(&log_filename);

    // Filter out noisy external crates
    let level = if verbose { "debug" } else { "info" };
    let filter_str = format!(
        "{},hyper=warn,hyper_util=warn,reqwest=warn,rustls=warn,h2=warn",
        level
    );
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));

    let file_appender = tracing_appender::rolling::never("logs", &log_filename);

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(true);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_appender)
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    info!("Logging initialized");
    info!("Log file: {}", log_path.display());

    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let command_name = match &cli.command {
        Commands::Run { .. } => "run",
        Commands::Open { .. } => "open",
        Commands::Positions { .. } => "positions",
        Commands::Close { .. } => "close",
    };

    setup_logging(cli.verbose, command_name)?;

    match cli.command {
        Commands::Run {
            config,
            interval,
            state_db,
        } => commands::run::run(config, interval, state_db),
        Commands::Open {
            config,
            symbol,
            side,
            allocation,
            entry,
            limit_price,
            stop_percent,
            stop_price,
            take_percent,
            take_price,
            trailing_percent,
            partial_fraction,
            partial_trigger_percent,
            strategy,
            notes,
            tags,
        } => commands::open::run(commands::open::OpenArgs {
            config,
            symbol,
            side,
            allocation,
            entry,
            limit_price,
            stop_percent,
            stop_price,
            take_percent,
            take_price,
            trailing_percent,
            partial_fraction,
            partial_trigger_percent,
            strategy,
            notes,
            tags,
        }),
        Commands::Positions { config, status } => commands::positions::run(config, status),
        Commands::Close { config, id } => commands::close::run(config, id),
    }
}
