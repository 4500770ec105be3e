//! Paper and live trading command
//!
//! Shared runner for the two trading modes: paper uses real market
//! data with dry-run placements, live places real orders and requires
//! API credentials from the environment.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

use gridai::config::ConfigLoader;
use gridai::monitor::Monitor;
use gridai::store::StateStore;
use gridai::trader::{GridTrader, TraderOutcome};
use gridai::venue::RestVenue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Paper,
    Live,
}

impl Mode {
    fn as_str(&self) -> &'static str {
        match self {
            Mode::Paper => "PAPER",
            Mode::Live => "LIVE",
        }
    }
}

pub fn run(mode: Mode, profile: &str, config_dir: &str) -> Result<i32> {
    dotenv::dotenv().ok();

    let loader = ConfigLoader::new(config_dir, profile);
    let mut config = loader.load().context("failed to load configuration")?;

    if mode == Mode::Live {
        let api_key = std::env::var("GRIDAI_API_KEY")
            .context("GRIDAI_API_KEY is required for live trading")?;
        let api_secret = std::env::var("GRIDAI_API_SECRET")
            .context("GRIDAI_API_SECRET is required for live trading")?;
        config.exchange.api_key = Some(api_key);
        config.exchange.api_secret = Some(api_secret);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    runtime.block_on(run_async(mode, loader, config))
}

async fn run_async(
    mode: Mode,
    loader: ConfigLoader,
    config: gridai::Config,
) -> Result<i32> {
    info!(
        mode = mode.as_str(),
        exchange = %config.exchange.name,
        pair = %config.exchange.trading_pair,
        num_grids = config.grid.num_grids,
        order_size_usdt = config.grid.order_size_usdt,
        poll_interval = config.live.poll_interval_seconds,
        "starting gridai trader"
    );

    if mode == Mode::Live {
        warn!("LIVE TRADING MODE - REAL MONEY AT RISK");
        warn!("press Ctrl+C within 10 seconds to abort");
        for i in (1..=10).rev() {
            info!("starting in {i} seconds...");
            sleep(Duration::from_secs(1)).await;
        }
    }

    let config = Arc::new(config);
    let monitor = Arc::new(Monitor::new());
    let venue = Arc::new(RestVenue::new(&config.exchange).with_monitor(Arc::clone(&monitor)));
    let store =
        StateStore::open(&config.database.path).context("failed to open state store")?;

    let cfg_rx = loader.watch(Arc::clone(&config), Duration::from_secs(5));
    let mut trader = GridTrader::new(
        Arc::clone(&config),
        venue,
        store,
        monitor,
        mode == Mode::Paper,
    )
    .with_config_watcher(cfg_rx);

    trader.init();
    let outcome = trader.run().await?;

    info!(outcome = ?outcome, "trading session ended");
    Ok(match outcome {
        TraderOutcome::Finished => 0,
        TraderOutcome::EmergencyStop => 2,
        TraderOutcome::Interrupted => 130,
    })
}
