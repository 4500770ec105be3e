//! Trading control loop
//!
//! One logical task ties everything together: fetch tick, refresh
//! signals on a sub-cadence, evaluate risk, recalibrate the grid on
//! drift, place orders, reconcile, record fills, snapshot equity.
//! Within a tick, risk strictly precedes placement, placement precedes
//! reconciliation, reconciliation precedes persistence.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::grid::GridEngine;
use crate::monitor::Monitor;
use crate::orders::{OrderManager, OrderManagerConfig};
use crate::position::PositionTracker;
use crate::risk::{RiskAction, RiskInputs, RiskManager};
use crate::store::StateStore;
use crate::trend::TrendDetector;
use crate::types::{OrderStatus, Side};
use crate::venue::Venue;
use crate::volatility::VolatilityClassifier;

/// Signals and reconciliation run every Nth tick to amortize venue
/// queries; the grid recalibrates on drift, not wall clock.
const SIGNAL_CADENCE: u64 = 6;
const CANDLE_TIMEFRAME: &str = "5m";
const CANDLE_LIMIT: usize = 200;
const MIN_SIGNAL_BARS: usize = 50;

/// Default taker fee assumed when the venue did not report one.
const DEFAULT_FEE_RATE: f64 = 0.001;

/// How the trading session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraderOutcome {
    Finished,
    EmergencyStop,
    Interrupted,
}

/// Result of a single tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Continue,
    /// Risk supervisor requested a pause for this tick.
    Paused,
    /// Ticker fetch failed; nothing was mutated.
    Skipped,
    EmergencyStop,
}

pub struct GridTrader {
    cfg: Arc<Config>,
    cfg_rx: Option<watch::Receiver<Arc<Config>>>,
    venue: Arc<dyn Venue>,
    grid: GridEngine,
    orders: OrderManager,
    risk: RiskManager,
    position: PositionTracker,
    trend: TrendDetector,
    volatility: VolatilityClassifier,
    monitor: Arc<Monitor>,
    dry_run: bool,
    tick_count: u64,
    /// Whether the current grid pause was imposed by the trend signal,
    /// so only the trend signal may lift it.
    trend_paused: bool,
    /// Counter-sell order id -> (origin buy order id, buy fill price).
    pairings: HashMap<String, (String, f64)>,
}

impl GridTrader {
    pub fn new(
        cfg: Arc<Config>,
        venue: Arc<dyn Venue>,
        store: StateStore,
        monitor: Arc<Monitor>,
        dry_run: bool,
    ) -> Self {
        let orders = OrderManager::new(
            Some(Arc::clone(&venue)),
            OrderManagerConfig {
                dry_run,
                max_retries: cfg.live.retry_max_attempts,
                retry_backoff: Duration::from_secs_f64(cfg.live.retry_backoff_seconds),
                rate_limit_per_second: cfg.live.rate_limit_calls_per_second,
            },
            Arc::clone(&monitor),
        );

        GridTrader {
            grid: GridEngine::new(&cfg.grid),
            orders,
            risk: RiskManager::new(cfg.risk.clone()),
            position: PositionTracker::new(store, Arc::clone(&monitor)),
            trend: TrendDetector::new(cfg.trend.clone()),
            volatility: VolatilityClassifier::new(cfg.regime.clone()),
            monitor,
            venue,
            cfg,
            cfg_rx: None,
            dry_run,
            tick_count: 0,
            trend_paused: false,
            pairings: HashMap::new(),
        }
    }

    /// Attach a config hot-reload channel.
    pub fn with_config_watcher(mut self, rx: watch::Receiver<Arc<Config>>) -> Self {
        self.cfg_rx = Some(rx);
        self
    }

    /// Seed or restore the ledger. Durable state from a previous
    /// session wins over the configured starting capital.
    pub fn init(&mut self) {
        self.position.initialize(self.cfg.paper.initial_capital_usdt);
        if self.position.load_state() {
            info!("restored previous session state");
        }
    }

    pub fn position(&mut self) -> &mut PositionTracker {
        &mut self.position
    }

    pub fn risk(&mut self) -> &mut RiskManager {
        &mut self.risk
    }

    pub fn grid(&self) -> &GridEngine {
        &self.grid
    }

    pub fn orders(&self) -> &OrderManager {
        &self.orders
    }

    /// Main loop. Runs until EMERGENCY_STOP or a shutdown signal; the
    /// current tick always completes before the shutdown procedure.
    pub async fn run(&mut self) -> Result<TraderOutcome> {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.cfg.live.poll_interval_seconds));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

        info!("trading loop started");
        let outcome = loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.maybe_reload_config();
                    match self.tick().await {
                        Ok(TickOutcome::EmergencyStop) => break TraderOutcome::EmergencyStop,
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "tick failed"),
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("SIGINT received, shutting down");
                    break TraderOutcome::Interrupted;
                }
                _ = sigterm.recv() => {
                    info!("SIGTERM received, shutting down");
                    break TraderOutcome::Interrupted;
                }
            }
        };

        self.shutdown().await;
        Ok(outcome)
    }

    /// One pass of the per-tick sequence. Public so tests can drive the
    /// loop deterministically.
    pub async fn tick(&mut self) -> Result<TickOutcome> {
        let tick = self.tick_count;
        self.tick_count += 1;

        let price = match self.venue.fetch_ticker().await {
            Ok(ticker) => ticker.last,
            Err(e) => {
                warn!(error = %e, "failed to fetch ticker");
                return Ok(TickOutcome::Skipped);
            }
        };

        if tick % SIGNAL_CADENCE == 0 {
            self.refresh_signals().await;
        }

        let daily_order_count = self.orders.daily_order_count();
        let status = self.risk.evaluate(RiskInputs {
            drawdown_pct: self.position.drawdown_pct(),
            capital_deployed_pct: self.position.capital_deployed_pct(),
            daily_pnl: self.position.daily_pnl(),
            daily_order_count,
            total_fees: self.position.total_fees(),
            initial_capital: self.position.initial_capital(),
        });

        match status.overall_action {
            RiskAction::EmergencyStop => {
                error!(reason = %status.pause_reason, "EMERGENCY STOP triggered");
                self.orders.cancel_all_open().await;
                self.position.save_state(true);
                return Ok(TickOutcome::EmergencyStop);
            }
            RiskAction::Pause => {
                self.position.snapshot_equity(price);
                self.position.save_state(false);
                return Ok(TickOutcome::Paused);
            }
            _ => {}
        }

        let threshold = self.cfg.live.recalibration_threshold_pct;
        if self.grid.state().is_none() || self.grid.should_recalibrate(price, threshold) {
            info!(price, "recalibrating grid");
            self.orders.cancel_all_open().await;
            self.pairings.clear();
            self.grid.calculate_grid(price);
            self.place_grid_orders().await;
        }

        if tick % SIGNAL_CADENCE == 0 {
            let closed = self.orders.reconcile_orders().await;
            for order_id in closed {
                self.handle_fill(&order_id).await;
            }
        }

        for record in self.orders.open_orders() {
            if self.orders.check_order_status(&record.order_id).await == Some(OrderStatus::Closed)
            {
                self.handle_fill(&record.order_id).await;
            }
        }

        self.position.snapshot_equity(price);
        self.position.save_state(false);

        if tick % 60 == 0 {
            let summary = self.position.summary();
            info!(
                tick,
                cash = summary.current_cash,
                inventory = summary.inventory,
                daily_pnl = summary.daily_pnl,
                drawdown_pct = summary.drawdown_pct,
                active_orders = self.grid.active_order_count(),
                "tick summary"
            );
        }

        Ok(TickOutcome::Continue)
    }

    /// Trend and regime refresh at 1/6 of the tick rate. Data gaps skip
    /// the step; the next cadence tick retries.
    async fn refresh_signals(&mut self) {
        let candles = match self
            .venue
            .fetch_recent_ohlcv(CANDLE_TIMEFRAME, CANDLE_LIMIT)
            .await
        {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "failed to fetch candles");
                return;
            }
        };
        if candles.len() < MIN_SIGNAL_BARS {
            return;
        }

        if let Some(signal) = self.trend.analyze(&candles) {
            if signal.should_pause {
                if !self.grid.is_paused() {
                    info!(reason = %signal.reason, "grid paused by trend");
                }
                self.grid.pause();
                self.trend_paused = true;
            } else if self.trend_paused && self.grid.is_paused() {
                self.grid.resume();
                self.trend_paused = false;
            }
        }

        let prediction = self.volatility.classify(&candles);
        if prediction.confidence >= self.volatility.confidence_threshold() {
            let mult = self.volatility.multiplier_for(prediction.regime);
            self.grid.set_regime_multiplier(mult);
        }
    }

    /// Place whatever the grid hands out, gated by the risk latch and
    /// the ledger pre-checks (cash for buys, inventory for sells).
    async fn place_grid_orders(&mut self) {
        let mut available_inventory = {
            let reserved: f64 = self
                .orders
                .open_orders()
                .iter()
                .filter(|r| r.side == Side::Sell)
                .map(|r| r.amount)
                .sum();
            self.position.inventory() - reserved
        };

        for level in self.grid.orders_to_place() {
            if !self.risk.can_place_order() {
                break;
            }
            let amount = self.grid.order_amount(level.price);
            match level.side {
                Side::Buy => {
                    let cost = level.price * amount * (1.0 + DEFAULT_FEE_RATE);
                    if !self.position.can_afford(cost) {
                        continue;
                    }
                }
                Side::Sell => {
                    if amount > available_inventory {
                        continue;
                    }
                    available_inventory -= amount;
                }
            }
            match self
                .orders
                .place_order(level.side, level.price, amount, level.index)
                .await
            {
                Ok(record) => self.grid.mark_order_placed(level.index, &record.order_id),
                Err(e) => warn!(index = level.index, error = %e, "failed to place grid order"),
            }
        }
    }

    /// Settle a confirmed fill: update the ledger, and for a buy derive
    /// and place the counter-sell one spacing up.
    async fn handle_fill(&mut self, order_id: &str) {
        let Some(record) = self.orders.get(order_id).cloned() else {
            return;
        };

        let level = self.grid.mark_order_filled(order_id);
        let fee = if record.fee > 0.0 {
            record.fee
        } else {
            record.price * record.amount * DEFAULT_FEE_RATE
        };

        match record.side {
            Side::Buy => {
                self.position.record_buy(record.price, record.amount, fee);

                let counter = level.as_ref().and_then(|l| self.grid.counter_order(l));
                if let Some(counter) = counter {
                    if self.risk.can_place_order()
                        && self.position.inventory() >= counter.amount
                    {
                        match self
                            .orders
                            .place_order(
                                counter.side,
                                counter.price,
                                counter.amount,
                                counter.source_index,
                            )
                            .await
                        {
                            Ok(placed) => {
                                info!(
                                    order_id = %placed.order_id,
                                    price = counter.price,
                                    "counter order placed"
                                );
                                self.pairings.insert(
                                    placed.order_id.clone(),
                                    (order_id.to_string(), record.price),
                                );
                            }
                            Err(e) => warn!(error = %e, "failed to place counter order"),
                        }
                    }
                }
            }
            Side::Sell => {
                self.position.record_sell(record.price, record.amount, fee);

                // Exact pairing via the counter-order origin; fall back
                // to one spacing below when the pairing was lost to a
                // recalibration.
                let (buy_id, buy_price) = self.pairings.remove(order_id).unwrap_or_else(|| {
                    let spacing = self.grid.state().map(|s| s.spacing).unwrap_or(0.0);
                    (String::new(), record.price - spacing)
                });
                self.position.record_completed_trade(
                    &buy_id,
                    order_id,
                    buy_price,
                    record.price,
                    record.amount,
                    fee,
                );
            }
        }

        self.position.save_state(false);
    }

    /// Dry-run orders are swept on the way out; live orders are
    /// deliberately left resting unless this is an emergency stop.
    pub async fn shutdown(&mut self) {
        info!("shutting down trader");
        if self.dry_run {
            let cancelled = self.orders.cancel_all_open().await;
            info!(cancelled, "dry-run orders cancelled");
        }
        self.position.save_state(false);
        info!("shutdown complete");
    }

    /// Full state dump: ledger, grid, risk, signals, gauges, history.
    pub fn state_snapshot(&mut self) -> serde_json::Value {
        serde_json::json!({
            "dry_run": self.dry_run,
            "position": self.position.summary(),
            "grid": self.grid.state(),
            "grid_paused": self.grid.is_paused(),
            "risk": self.risk.last_status(),
            "trend": self.trend.last_signal(),
            "volatility": self.volatility.last_prediction(),
            "monitor": self.monitor.snapshot(),
            "equity_history": self.position.equity_history(200),
            "trades": self.position.recent_trades(50),
        })
    }

    fn maybe_reload_config(&mut self) {
        let Some(rx) = &mut self.cfg_rx else {
            return;
        };
        if rx.has_changed().unwrap_or(false) {
            let cfg = rx.borrow_and_update().clone();
            info!("applying reloaded config snapshot");
            self.grid.update_params(&cfg.grid);
            self.risk.update_thresholds(cfg.risk.clone());
            self.trend = TrendDetector::new(cfg.trend.clone());
            self.volatility = VolatilityClassifier::new(cfg.regime.clone());
            self.cfg = cfg;
        }
    }
}
