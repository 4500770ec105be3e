//! Integration tests for the gridai engine
//!
//! Cross-component scenarios: grid geometry, counter-order flow, drift
//! recalibration, risk escalation, a full dry-run round trip through
//! the trader's fill handler, and reconciliation against a scripted
//! venue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use gridai::config::{
    Config, DatabaseConfig, ExchangeConfig, GridConfig, LiveConfig, LoggingConfig, PaperConfig,
    RegimeConfig, RiskConfig, TrendConfig,
};
use gridai::grid::GridEngine;
use gridai::monitor::Monitor;
use gridai::orders::{OrderManager, OrderManagerConfig};
use gridai::risk::{RiskAction, RiskInputs, RiskManager};
use gridai::store::StateStore;
use gridai::trader::{GridTrader, TickOutcome};
use gridai::types::{Candle, OrderStatus, Side, Ticker};
use gridai::venue::{OrderAck, Venue, VenueError, VenueOrder};

// =============================================================================
// Test Utilities
// =============================================================================

fn test_config() -> Config {
    Config {
        exchange: ExchangeConfig {
            name: "scripted".into(),
            trading_pair: "BTC/USDT".into(),
            sandbox: true,
            api_key: None,
            api_secret: None,
        },
        grid: GridConfig {
            num_grids: 10,
            upper_bound_pct: 2.0,
            lower_bound_pct: 2.0,
            order_size_usdt: 50.0,
            recalibration_interval_minutes: 60,
            max_open_orders: 30,
        },
        risk: RiskConfig {
            max_drawdown_pct: 15.0,
            max_capital_deployed_pct: 50.0,
            daily_loss_cap_usdt: 500.0,
            emergency_stop_loss_pct: 20.0,
            max_orders_per_day: 200,
            max_fee_pct: 0.5,
            slippage_tolerance_pct: 0.1,
        },
        trend: TrendConfig::default(),
        regime: RegimeConfig::default(),
        live: LiveConfig {
            poll_interval_seconds: 1,
            retry_max_attempts: 3,
            retry_backoff_seconds: 0.001,
            rate_limit_calls_per_second: 10_000.0,
            recalibration_threshold_pct: 2.0,
        },
        paper: PaperConfig {
            initial_capital_usdt: 10_000.0,
        },
        database: DatabaseConfig::default(),
        logging: LoggingConfig::default(),
    }
}

#[derive(Debug, Clone)]
struct ScriptedOrder {
    side: Side,
    price: f64,
    status: String,
    fee: Option<f64>,
}

/// A venue whose responses the test scripts directly.
#[derive(Default)]
struct ScriptedVenue {
    price: Mutex<f64>,
    candles: Mutex<Vec<Candle>>,
    next_id: AtomicU64,
    orders: Mutex<HashMap<String, ScriptedOrder>>,
}

impl ScriptedVenue {
    fn new(price: f64) -> Self {
        ScriptedVenue {
            price: Mutex::new(price),
            ..Default::default()
        }
    }

    fn set_price(&self, price: f64) {
        *self.price.lock().unwrap() = price;
    }

    fn mint(&self, side: Side, price: f64) -> OrderAck {
        let id = format!("V-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.orders.lock().unwrap().insert(
            id.clone(),
            ScriptedOrder {
                side,
                price,
                status: "open".into(),
                fee: None,
            },
        );
        OrderAck {
            id,
            status: "open".into(),
        }
    }

    /// Script a fill: the order leaves the open set and reports closed.
    fn close_order(&self, order_id: &str, fee: f64) {
        let mut orders = self.orders.lock().unwrap();
        let order = orders.get_mut(order_id).expect("unknown scripted order");
        order.status = "filled".into();
        order.fee = Some(fee);
    }

    /// Find the open order resting at a price (within a cent).
    fn open_order_at(&self, price: f64) -> Option<String> {
        self.orders
            .lock()
            .unwrap()
            .iter()
            .find(|(_, o)| o.status == "open" && (o.price - price).abs() < 0.01)
            .map(|(id, _)| id.clone())
    }

    fn open_count(&self) -> usize {
        self.orders
            .lock()
            .unwrap()
            .values()
            .filter(|o| o.status == "open")
            .count()
    }
}

#[async_trait]
impl Venue for ScriptedVenue {
    async fn fetch_ticker(&self) -> Result<Ticker, VenueError> {
        let last = *self.price.lock().unwrap();
        Ok(Ticker {
            last,
            bid: last,
            ask: last,
            timestamp: Utc::now(),
        })
    }

    async fn fetch_recent_ohlcv(
        &self,
        _timeframe: &str,
        _limit: usize,
    ) -> Result<Vec<Candle>, VenueError> {
        Ok(self.candles.lock().unwrap().clone())
    }

    async fn place_limit_buy(&self, _amount: f64, price: f64) -> Result<OrderAck, VenueError> {
        Ok(self.mint(Side::Buy, price))
    }

    async fn place_limit_sell(&self, _amount: f64, price: f64) -> Result<OrderAck, VenueError> {
        Ok(self.mint(Side::Sell, price))
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), VenueError> {
        let mut orders = self.orders.lock().unwrap();
        if let Some(order) = orders.get_mut(order_id) {
            order.status = "cancelled".into();
        }
        Ok(())
    }

    async fn fetch_order(&self, order_id: &str) -> Result<VenueOrder, VenueError> {
        let orders = self.orders.lock().unwrap();
        let order = orders
            .get(order_id)
            .ok_or_else(|| VenueError::Permanent(format!("unknown order {order_id}")))?;
        Ok(VenueOrder {
            id: order_id.to_string(),
            status: order.status.clone(),
            fee: order.fee,
        })
    }

    async fn fetch_open_orders(&self) -> Result<Vec<VenueOrder>, VenueError> {
        let orders = self.orders.lock().unwrap();
        Ok(orders
            .iter()
            .filter(|(_, o)| o.status == "open")
            .map(|(id, o)| VenueOrder {
                id: id.clone(),
                status: o.status.clone(),
                fee: o.fee,
            })
            .collect())
    }
}

/// Venue that fails a scripted number of times before succeeding.
struct FlakyVenue {
    inner: ScriptedVenue,
    failures_left: Mutex<u32>,
    permanent: bool,
}

impl FlakyVenue {
    fn transient(failures: u32) -> Self {
        FlakyVenue {
            inner: ScriptedVenue::new(50_000.0),
            failures_left: Mutex::new(failures),
            permanent: false,
        }
    }

    fn permanent() -> Self {
        FlakyVenue {
            inner: ScriptedVenue::new(50_000.0),
            failures_left: Mutex::new(u32::MAX),
            permanent: true,
        }
    }

    fn maybe_fail(&self) -> Result<(), VenueError> {
        let mut left = self.failures_left.lock().unwrap();
        if *left > 0 {
            if !self.permanent {
                *left -= 1;
            }
            return Err(if self.permanent {
                VenueError::Permanent("invalid API key".into())
            } else {
                VenueError::Transient("connection timed out".into())
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Venue for FlakyVenue {
    async fn fetch_ticker(&self) -> Result<Ticker, VenueError> {
        self.inner.fetch_ticker().await
    }

    async fn fetch_recent_ohlcv(
        &self,
        timeframe: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, VenueError> {
        self.inner.fetch_recent_ohlcv(timeframe, limit).await
    }

    async fn place_limit_buy(&self, amount: f64, price: f64) -> Result<OrderAck, VenueError> {
        self.maybe_fail()?;
        self.inner.place_limit_buy(amount, price).await
    }

    async fn place_limit_sell(&self, amount: f64, price: f64) -> Result<OrderAck, VenueError> {
        self.maybe_fail()?;
        self.inner.place_limit_sell(amount, price).await
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), VenueError> {
        self.inner.cancel_order(order_id).await
    }

    async fn fetch_order(&self, order_id: &str) -> Result<VenueOrder, VenueError> {
        self.inner.fetch_order(order_id).await
    }

    async fn fetch_open_orders(&self) -> Result<Vec<VenueOrder>, VenueError> {
        self.inner.fetch_open_orders().await
    }
}

fn live_manager(venue: Arc<dyn Venue>) -> OrderManager {
    OrderManager::new(
        Some(venue),
        OrderManagerConfig {
            dry_run: false,
            max_retries: 3,
            retry_backoff: Duration::from_millis(1),
            rate_limit_per_second: 10_000.0,
        },
        Arc::new(Monitor::new()),
    )
}

fn trader_with(venue: Arc<dyn Venue>, dry_run: bool) -> GridTrader {
    let cfg = Arc::new(test_config());
    let mut trader = GridTrader::new(
        cfg,
        venue,
        StateStore::in_memory().unwrap(),
        Arc::new(Monitor::new()),
        dry_run,
    );
    trader.init();
    trader
}

// =============================================================================
// Scenario 1 + 3: geometry and drift recalibration
// =============================================================================

#[test]
fn grid_geometry_around_50k() {
    let cfg = test_config();
    let mut grid = GridEngine::new(&cfg.grid);
    let state = grid.calculate_grid(50_000.0).clone();

    assert_eq!(state.upper_bound, 51_000.0);
    assert_eq!(state.lower_bound, 49_000.0);
    assert_eq!(state.spacing, 200.0);
    assert_eq!(state.levels.len(), 10);
    assert_eq!(state.levels.iter().filter(|l| l.side == Side::Buy).count(), 5);
    assert_eq!(state.levels.iter().filter(|l| l.side == Side::Sell).count(), 5);
}

#[test]
fn drift_recalibration_boundary() {
    let cfg = test_config();
    let mut grid = GridEngine::new(&cfg.grid);
    grid.calculate_grid(50_000.0);

    // 51000 is exactly 2.000% drift: stay put
    assert!(!grid.should_recalibrate(51_000.0, 2.0));
    // 51001 is 2.002%: recalibrate
    assert!(grid.should_recalibrate(51_001.0, 2.0));
}

// =============================================================================
// Scenario 2: counter-order derivation
// =============================================================================

#[test]
fn counter_order_amounts_and_boundaries() {
    let cfg = test_config();
    let mut grid = GridEngine::new(&cfg.grid);
    grid.calculate_grid(50_000.0);

    let buy_level = grid
        .state()
        .unwrap()
        .levels
        .iter()
        .find(|l| l.price == 49_600.0)
        .unwrap()
        .clone();
    let counter = grid.counter_order(&buy_level).unwrap();
    assert_eq!(counter.side, Side::Sell);
    assert_eq!(counter.price, 49_800.0);
    assert!((counter.amount - 50.0 / 49_800.0).abs() < 1e-6);

    // A sell at the lower bound would counter outside the grid
    let boundary_sell = gridai::grid::GridLevel {
        index: 0,
        price: 49_000.0,
        side: Side::Sell,
        order_id: None,
        is_active: false,
        filled: true,
    };
    assert!(grid.counter_order(&boundary_sell).is_none());
}

// =============================================================================
// Scenario 4: risk escalation and latch
// =============================================================================

#[test]
fn risk_escalation_ladder() {
    let cfg = test_config();
    let mut risk = RiskManager::new(cfg.risk);
    let base = RiskInputs {
        drawdown_pct: 0.0,
        capital_deployed_pct: 0.0,
        daily_pnl: 0.0,
        daily_order_count: 0,
        total_fees: 0.0,
        initial_capital: 10_000.0,
    };

    let status = risk.evaluate(RiskInputs {
        drawdown_pct: 12.0,
        ..base
    });
    assert_eq!(status.overall_action, RiskAction::Warn);
    assert!(risk.can_place_order());

    let status = risk.evaluate(RiskInputs {
        drawdown_pct: 16.0,
        ..base
    });
    assert_eq!(status.overall_action, RiskAction::Pause);
    assert!(!risk.can_place_order());

    // Recovery does not clear the latch
    let status = risk.evaluate(base);
    assert_eq!(status.overall_action, RiskAction::Ok);
    assert!(status.paused);

    let status = risk.evaluate(RiskInputs {
        drawdown_pct: 25.0,
        ..base
    });
    assert_eq!(status.overall_action, RiskAction::EmergencyStop);
}

// =============================================================================
// Scenario 5: round trip through the trader's fill handler
// =============================================================================

#[tokio::test]
async fn round_trip_through_fill_handler() {
    let venue = Arc::new(ScriptedVenue::new(50_000.0));
    let mut trader = trader_with(Arc::clone(&venue) as Arc<dyn Venue>, false);

    // First tick builds the grid and places the buy ladder (sells are
    // skipped: no inventory yet)
    assert_eq!(trader.tick().await.unwrap(), TickOutcome::Continue);
    assert_eq!(venue.open_count(), 5);

    // Script a fill on the nearest buy (49800)
    let buy_id = venue.open_order_at(49_800.0).expect("buy resting at 49800");
    venue.close_order(&buy_id, 0.05);

    assert_eq!(trader.tick().await.unwrap(), TickOutcome::Continue);

    let ledger = trader.position().summary();
    assert!(ledger.inventory > 0.0, "buy fill added inventory");
    assert!(ledger.current_cash < 10_000.0 - 49.0, "cash paid for the buy");

    // The counter sell rests one spacing up at 50000
    let counter_id = venue
        .open_order_at(50_000.0)
        .expect("counter sell resting at 50000");
    venue.close_order(&counter_id, 0.05);

    assert_eq!(trader.tick().await.unwrap(), TickOutcome::Continue);

    let ledger = trader.position().summary();
    assert_eq!(ledger.trade_count, 1);
    // gross = (50000 - 49800) * (50/50000) = 0.2, net = 0.2 - fee
    assert!((ledger.daily_pnl - 0.15).abs() < 0.01);

    let trades = trader.position().recent_trades(10);
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].buy_order_id, buy_id, "exact buy-side pairing");
    assert_eq!(trades[0].buy_price, 49_800.0);
}

#[tokio::test]
async fn dry_run_orders_are_swept_on_shutdown() {
    let venue = Arc::new(ScriptedVenue::new(50_000.0));
    let mut trader = trader_with(venue as Arc<dyn Venue>, true);

    trader.tick().await.unwrap();
    assert!(!trader.orders().open_orders().is_empty());

    trader.shutdown().await;
    assert!(trader.orders().open_orders().is_empty());
}

#[tokio::test]
async fn emergency_stop_cancels_everything() {
    let venue = Arc::new(ScriptedVenue::new(50_000.0));
    let mut trader = trader_with(Arc::clone(&venue) as Arc<dyn Venue>, false);

    trader.tick().await.unwrap();
    assert_eq!(venue.open_count(), 5);

    // Force a drawdown past the emergency threshold
    trader.position().record_buy(50_000.0, 0.05, 0.0); // cash 7500, dd 25%

    assert_eq!(trader.tick().await.unwrap(), TickOutcome::EmergencyStop);
    assert_eq!(venue.open_count(), 0, "all resting orders cancelled");
}

#[tokio::test]
async fn risk_pause_skips_the_tick() {
    let venue = Arc::new(ScriptedVenue::new(50_000.0));
    let mut trader = trader_with(Arc::clone(&venue) as Arc<dyn Venue>, false);

    trader.tick().await.unwrap();

    // 16% drawdown: PAUSE band
    trader.position().record_buy(50_000.0, 0.032, 0.0);
    assert_eq!(trader.tick().await.unwrap(), TickOutcome::Paused);

    // Orders were left alone (pause is not an emergency)
    assert_eq!(venue.open_count(), 5);
}

// =============================================================================
// Scenario 6: reconciliation
// =============================================================================

#[tokio::test]
async fn reconciliation_reports_each_external_close_once() {
    let venue = Arc::new(ScriptedVenue::new(50_000.0));
    let mut manager = live_manager(Arc::clone(&venue) as Arc<dyn Venue>);

    let o1 = manager
        .place_order(Side::Buy, 49_800.0, 0.001, 1)
        .await
        .unwrap();
    let o2 = manager
        .place_order(Side::Buy, 49_600.0, 0.001, 2)
        .await
        .unwrap();

    // O1 closes behind our back
    venue.close_order(&o1.order_id, 0.05);

    let closed = manager.reconcile_orders().await;
    assert_eq!(closed, vec![o1.order_id.clone()]);
    assert_eq!(
        manager.get(&o1.order_id).unwrap().status,
        OrderStatus::Closed
    );
    assert_eq!(manager.get(&o1.order_id).unwrap().fee, 0.05);
    assert_eq!(manager.get(&o2.order_id).unwrap().status, OrderStatus::Open);

    // A second pass reports nothing new
    assert!(manager.reconcile_orders().await.is_empty());
}

#[tokio::test]
async fn externally_cancelled_orders_are_not_fills() {
    let venue = Arc::new(ScriptedVenue::new(50_000.0));
    let mut manager = live_manager(Arc::clone(&venue) as Arc<dyn Venue>);

    let o1 = manager
        .place_order(Side::Buy, 49_800.0, 0.001, 1)
        .await
        .unwrap();
    venue.cancel_order(&o1.order_id).await.unwrap();

    let closed = manager.reconcile_orders().await;
    assert!(closed.is_empty());
    assert_eq!(
        manager.get(&o1.order_id).unwrap().status,
        OrderStatus::Cancelled
    );
}

// =============================================================================
// Retry discipline
// =============================================================================

#[tokio::test]
async fn transient_errors_are_retried_to_success() {
    let venue = Arc::new(FlakyVenue::transient(2));
    let mut manager = live_manager(venue as Arc<dyn Venue>);

    let record = manager
        .place_order(Side::Buy, 49_800.0, 0.001, 1)
        .await
        .expect("placement should survive two transient failures");
    assert_eq!(record.status, OrderStatus::Open);
}

#[tokio::test]
async fn transient_errors_exhaust_into_placement_failed() {
    let venue = Arc::new(FlakyVenue::transient(10));
    let mut manager = live_manager(venue as Arc<dyn Venue>);

    let err = manager
        .place_order(Side::Buy, 49_800.0, 0.001, 1)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("placement failed after 3 attempts"));
}

#[tokio::test]
async fn permanent_errors_are_not_retried() {
    let venue = Arc::new(FlakyVenue::permanent());
    let mut manager = live_manager(venue as Arc<dyn Venue>);

    let err = manager
        .place_order(Side::Buy, 49_800.0, 0.001, 1)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("after 1 attempts"));
}
