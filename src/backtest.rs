//! Backtesting engine
//!
//! Walks historical candles through the same grid, risk, trend, and
//! volatility components the live loop uses, with intra-candle fill
//! simulation: a resting buy fills when the bar's low touches its
//! price, a resting sell when the high does. Slippage and fees are
//! applied per fill. No venue calls are made.

use chrono::NaiveDate;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use crate::config::Config;
use crate::grid::GridEngine;
use crate::metrics::{compute_all, BacktestMetrics};
use crate::risk::{RiskAction, RiskInputs, RiskManager};
use crate::store::TradeRecord;
use crate::trend::TrendDetector;
use crate::types::Side;
use crate::volatility::VolatilityClassifier;
use crate::Candle;

/// Bars between signal refreshes; mirrors the live loop's 1/6 cadence
/// on a 5m timeframe.
const SIGNAL_CADENCE: usize = 12;
const LOOKBACK: usize = 100;

#[derive(Debug, Clone)]
struct SimOrder {
    id: String,
    side: Side,
    price: f64,
    amount: f64,
    /// Buy fill this sell was spawned from, for exact round-trip pairing.
    origin_buy_id: Option<String>,
    origin_buy_price: Option<f64>,
}

pub struct BacktestEngine {
    grid: GridEngine,
    risk: RiskManager,
    trend: TrendDetector,
    volatility: VolatilityClassifier,
    fee_pct: f64,
    slippage_pct: f64,
    recalib_every: usize,

    initial_capital: f64,
    capital: f64,
    inventory: f64,
    peak_equity: f64,
    total_fees: f64,
    daily_pnl: f64,
    daily_order_count: u32,
    last_day: Option<NaiveDate>,

    open_orders: Vec<SimOrder>,
    sim_counter: u64,
    equity_curve: Vec<f64>,
    trades: Vec<TradeRecord>,
}

pub struct BacktestReport {
    pub metrics: BacktestMetrics,
    pub emergency_stopped: bool,
}

impl BacktestEngine {
    pub fn new(cfg: &Config, initial_capital: f64) -> Self {
        // One recalibration interval expressed in 5m bars
        let recalib_every = (cfg.grid.recalibration_interval_minutes as usize / 5).max(1);
        BacktestEngine {
            grid: GridEngine::new(&cfg.grid),
            risk: RiskManager::new(cfg.risk.clone()),
            trend: TrendDetector::new(cfg.trend.clone()),
            volatility: VolatilityClassifier::new(cfg.regime.clone()),
            fee_pct: 0.1,
            slippage_pct: cfg.risk.slippage_tolerance_pct,
            recalib_every,
            initial_capital,
            capital: initial_capital,
            inventory: 0.0,
            peak_equity: initial_capital,
            total_fees: 0.0,
            daily_pnl: 0.0,
            daily_order_count: 0,
            last_day: None,
            open_orders: Vec::new(),
            sim_counter: 0,
            equity_curve: Vec::new(),
            trades: Vec::new(),
        }
    }

    pub fn trades(&self) -> &[TradeRecord] {
        &self.trades
    }

    pub fn equity_curve(&self) -> &[f64] {
        &self.equity_curve
    }

    pub fn run(&mut self, candles: &[Candle]) -> BacktestReport {
        let started = std::time::Instant::now();
        info!(
            candles = candles.len(),
            capital = self.initial_capital,
            "backtest starting"
        );

        if candles.len() <= LOOKBACK {
            warn!("not enough candles for the indicator lookback");
            return BacktestReport {
                metrics: compute_all(&self.equity_curve, &self.trades, self.initial_capital, 0, 0.0),
                emergency_stopped: false,
            };
        }

        let bar = ProgressBar::new((candles.len() - LOOKBACK) as u64);
        bar.set_style(
            ProgressStyle::with_template("{bar:40} {pos}/{len} {msg}")
                .expect("valid progress template"),
        );

        let mut trend_paused = false;
        let mut emergency_stopped = false;
        let mut last_signal_check = 0usize;

        for i in LOOKBACK..candles.len() {
            bar.inc(1);
            let candle = &candles[i];
            let price = candle.close;

            self.roll_day(candle.timestamp.date_naive());

            if i - last_signal_check >= SIGNAL_CADENCE || last_signal_check == 0 {
                let window = &candles[i.saturating_sub(LOOKBACK * 2)..=i];
                if window.len() >= 50 {
                    if let Some(signal) = self.trend.analyze(window) {
                        trend_paused = signal.should_pause;
                    }
                    let prediction = self.volatility.classify(window);
                    if prediction.confidence >= self.volatility.confidence_threshold() {
                        let mult = self.volatility.multiplier_for(prediction.regime);
                        self.grid.set_regime_multiplier(mult);
                    }
                }
                last_signal_check = i;
            }

            let status = self.risk.evaluate(RiskInputs {
                drawdown_pct: self.drawdown_pct(),
                capital_deployed_pct: self.capital_deployed_pct(),
                daily_pnl: self.daily_pnl,
                daily_order_count: self.daily_order_count,
                total_fees: self.total_fees,
                initial_capital: self.initial_capital,
            });
            if status.overall_action == RiskAction::EmergencyStop {
                warn!(bar = i, "emergency stop during backtest");
                self.record_equity(price);
                emergency_stopped = true;
                break;
            }
            if status.overall_action == RiskAction::Pause || trend_paused {
                self.record_equity(price);
                continue;
            }

            let recalib_due = self.grid.state().is_none()
                || i % self.recalib_every == 0
                || self.grid.should_recalibrate(price, 2.0);
            if recalib_due {
                self.open_orders.clear();
                self.grid.calculate_grid(price);
                self.place_grid_orders();
            }

            self.check_fills(candle);
            self.record_equity(price);
        }
        bar.finish_and_clear();

        let elapsed = started.elapsed().as_secs_f64();
        info!(
            trades = self.trades.len(),
            elapsed_seconds = elapsed,
            "backtest complete"
        );

        BacktestReport {
            metrics: compute_all(
                &self.equity_curve,
                &self.trades,
                self.initial_capital,
                candles.len() - LOOKBACK,
                elapsed,
            ),
            emergency_stopped,
        }
    }

    fn place_grid_orders(&mut self) {
        let reserved: f64 = self
            .open_orders
            .iter()
            .filter(|o| o.side == Side::Sell)
            .map(|o| o.amount)
            .sum();
        let mut available_inventory = self.inventory - reserved;

        for level in self.grid.orders_to_place() {
            let amount = self.grid.order_amount(level.price);
            if level.side == Side::Buy && level.price * amount > self.capital {
                continue;
            }
            // a spot sell must be covered by inventory
            if level.side == Side::Sell {
                if amount > available_inventory {
                    continue;
                }
                available_inventory -= amount;
            }
            self.sim_counter += 1;
            let id = format!("sim-{}", self.sim_counter);
            self.open_orders.push(SimOrder {
                id: id.clone(),
                side: level.side,
                price: level.price,
                amount,
                origin_buy_id: None,
                origin_buy_price: None,
            });
            self.grid.mark_order_placed(level.index, &id);
            self.daily_order_count += 1;
        }
    }

    fn check_fills(&mut self, candle: &Candle) {
        let orders = std::mem::take(&mut self.open_orders);
        let mut remaining = Vec::with_capacity(orders.len());

        for order in orders {
            match order.side {
                Side::Buy if candle.low <= order.price => self.fill_buy(&order),
                Side::Sell if candle.high >= order.price => self.fill_sell(&order),
                _ => remaining.push(order),
            }
        }
        // fills may have queued counter-orders
        remaining.append(&mut self.open_orders);
        self.open_orders = remaining;
    }

    fn fill_buy(&mut self, order: &SimOrder) {
        let fill_price = order.price * (1.0 + self.slippage_pct / 100.0);
        let fee = fill_price * order.amount * self.fee_pct / 100.0;
        self.capital -= fill_price * order.amount + fee;
        self.inventory += order.amount;
        self.total_fees += fee;

        if let Some(level) = self.grid.mark_order_filled(&order.id) {
            if let Some(counter) = self.grid.counter_order(&level) {
                self.sim_counter += 1;
                self.open_orders.push(SimOrder {
                    id: format!("sim-{}", self.sim_counter),
                    side: counter.side,
                    price: counter.price,
                    amount: counter.amount,
                    origin_buy_id: Some(order.id.clone()),
                    origin_buy_price: Some(fill_price),
                });
            }
        }
    }

    fn fill_sell(&mut self, order: &SimOrder) {
        let fill_price = order.price * (1.0 - self.slippage_pct / 100.0);
        let fee = fill_price * order.amount * self.fee_pct / 100.0;
        self.capital += fill_price * order.amount - fee;
        self.inventory -= order.amount;
        self.total_fees += fee;
        self.grid.mark_order_filled(&order.id);

        let spacing = self.grid.state().map(|s| s.spacing).unwrap_or(0.0);
        let buy_price = order.origin_buy_price.unwrap_or(order.price - spacing);
        let gross = (fill_price - buy_price) * order.amount;
        let net = gross - fee;
        self.daily_pnl += net;

        self.trades.push(TradeRecord {
            trade_id: format!("T-{}", self.trades.len() + 1),
            buy_order_id: order.origin_buy_id.clone().unwrap_or_default(),
            sell_order_id: order.id.clone(),
            buy_price,
            sell_price: fill_price,
            amount: order.amount,
            profit_usdt: gross,
            fee_usdt: fee,
            net_profit_usdt: net,
            timestamp: chrono::Utc::now(),
        });
    }

    fn record_equity(&mut self, price: f64) {
        let equity = self.capital + self.inventory * price;
        self.equity_curve.push(equity);
        if equity > self.peak_equity {
            self.peak_equity = equity;
        }
    }

    fn roll_day(&mut self, day: NaiveDate) {
        if self.last_day != Some(day) {
            self.daily_pnl = 0.0;
            self.daily_order_count = 0;
            self.last_day = Some(day);
        }
    }

    fn drawdown_pct(&self) -> f64 {
        if self.peak_equity <= 0.0 {
            return 0.0;
        }
        let equity = self.equity_curve.last().copied().unwrap_or(self.capital);
        ((self.peak_equity - equity) / self.peak_equity * 100.0).max(0.0)
    }

    fn capital_deployed_pct(&self) -> f64 {
        if self.initial_capital <= 0.0 {
            return 0.0;
        }
        ((self.initial_capital - self.capital) / self.initial_capital * 100.0).max(0.0)
    }
}
