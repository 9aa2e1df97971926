// =============================================================================
// Aurora Grid Engine — Main Entry Point
// =============================================================================
//
// One process per symbol (spec §5, §6 "Process control"). Wires C1–C7 and
// runs the event loop to completion, mapping fatal startup/runtime failures
// onto the exit codes spec §6 specifies.
// =============================================================================

mod config;
mod event_loop;
mod grid;
mod journal;
mod reconcile;
mod state;
mod types;
mod venue;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use rust_decimal::Decimal;
use tracing::{error, info};
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::ConfigWatcher;
use crate::journal::TradeJournal;
use crate::reconcile::Reconciler;
use crate::state::StateStore;
use crate::types::PerpetualSymbol;
use crate::venue::binance::BinanceFuturesClient;
use crate::venue::VenueClient;

/// Exit code for a fatal config error (spec §6).
const EXIT_CONFIG_ERROR: u8 = 1;
/// Exit code for a fatal venue error (spec §6).
const EXIT_VENUE_ERROR: u8 = 2;
/// Exit code for state-file corruption on boot (spec §6).
const EXIT_STATE_CORRUPTION: u8 = 3;

/// Runs one grid-martingale strategy process against a single perpetual
/// futures symbol.
#[derive(Debug, Parser)]
#[command(name = "aurora-grid-engine", version)]
struct Cli {
    /// Venue symbol, e.g. BTCUSDT.
    #[arg(long, env = "GRID_SYMBOL")]
    symbol: String,

    /// Venue price tick size for `symbol`.
    #[arg(long, env = "GRID_TICK_SIZE")]
    tick_size: Decimal,

    /// Venue quantity step size for `symbol`.
    #[arg(long, env = "GRID_QTY_STEP")]
    qty_step: Decimal,

    /// Path to the KEY=VALUE strategy config file (spec §6).
    #[arg(long, env = "GRID_CONFIG_PATH", default_value = "strategy.conf")]
    config_path: PathBuf,

    /// Path to the persisted StrategyState JSON snapshot (spec §4.2, §6).
    #[arg(long, env = "GRID_STATE_PATH", default_value = "state.json")]
    state_path: PathBuf,

    /// Path to the per-symbol CSV trade journal (spec §4.4, §6).
    #[arg(long, env = "GRID_JOURNAL_PATH", default_value = "trades.csv")]
    journal_path: PathBuf,

    /// Directory for the day-rolling log file (spec §7).
    #[arg(long, env = "GRID_LOG_DIR", default_value = "logs")]
    log_dir: PathBuf,
}

fn init_tracing(log_dir: &std::path::Path, symbol: &str) -> tracing_appender::non_blocking::WorkerGuard {
    let file_appender = tracing_appender::rolling::daily(log_dir, format!("{symbol}.log"));
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let stdout_layer = tracing_subscriber::fmt::layer().with_filter(env_filter());
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_filter(env_filter());

    tracing_subscriber::registry().with(stdout_layer).with(file_layer).init();

    guard
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenv::dotenv();
    let cli = Cli::parse();

    let _log_guard = init_tracing(&cli.log_dir, &cli.symbol);

    info!(symbol = %cli.symbol, "aurora grid engine starting");

    let config_watcher = match ConfigWatcher::load(&cli.config_path) {
        Ok(w) => w,
        Err(e) => {
            error!(error = %e, path = %cli.config_path.display(), "fatal: failed to load strategy config");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    let symbol = PerpetualSymbol::new(cli.symbol.clone(), cli.tick_size, cli.qty_step);
    let state_store = StateStore::new(&cli.state_path);
    let initial_capital = config_watcher.current().initial_capital;
    let initial_state = match state_store.load(initial_capital) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, path = %cli.state_path.display(), "fatal: state file corrupt, refusing to silently reset");
            return ExitCode::from(EXIT_STATE_CORRUPTION);
        }
    };

    let api_key = std::env::var("BINANCE_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("BINANCE_API_SECRET").unwrap_or_default();
    let binance_client = Arc::new(BinanceFuturesClient::new(api_key, api_secret));

    if let Err(e) = binance_client.set_margin_mode_isolated(&symbol.name).await {
        error!(error = %e, "fatal: failed to set isolated margin mode");
        return ExitCode::from(EXIT_VENUE_ERROR);
    }
    let cfg = config_watcher.current();
    if let Err(e) = binance_client.set_leverage(&symbol.name, cfg.leverage_long.max(cfg.leverage_short)).await {
        error!(error = %e, "fatal: failed to set leverage");
        return ExitCode::from(EXIT_VENUE_ERROR);
    }
    drop(cfg);

    let journal = match TradeJournal::open(&cli.journal_path, &cli.symbol) {
        Ok(j) => j,
        Err(e) => {
            error!(error = %e, path = %cli.journal_path.display(), "fatal: failed to open trade journal");
            return ExitCode::from(EXIT_VENUE_ERROR);
        }
    };

    let venue: Arc<dyn VenueClient> = binance_client.clone();
    let reconciler = Reconciler::new(venue, symbol.clone(), state_store, journal);

    let (bar_tx, bar_rx) = tokio::sync::mpsc::unbounded_channel();
    let stream_client = binance_client.clone();
    let stream_symbol = cli.symbol.clone();
    tokio::spawn(async move {
        loop {
            let tx = bar_tx.clone();
            let result = stream_client
                .run_kline_stream(&stream_symbol, move |bar| {
                    let _ = tx.send(bar.close);
                })
                .await;
            if let Err(e) = result {
                error!(symbol = %stream_symbol, error = %e, "kline stream task exited, restarting in 3s");
            }
            tokio::time::sleep(std::time::Duration::from_secs(3)).await;
        }
    });

    info!("all subsystems wired, entering event loop");
    match event_loop::run(reconciler, config_watcher, initial_state, bar_rx).await {
        Ok(_) => {
            info!("aurora grid engine shut down cleanly");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "fatal: event loop terminated with error");
            ExitCode::from(EXIT_VENUE_ERROR)
        }
    }
}
