//! Grid engine
//!
//! Derives a static ladder of buy/sell levels around a reference price,
//! tracks per-level order lifecycle, and produces counter-orders after
//! fills. Geometry is replaced atomically on recalibration; the regime
//! multiplier persists across recalibrations until changed.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::GridConfig;
use crate::types::{round_amount, round_price, Side};

/// A single price rung of the grid.
///
/// `index` / `price` / `side` are fixed at recalibration; `order_id`,
/// `is_active` and `filled` track the order lifecycle. `is_active` and
/// `filled` are never both true, and `filled` is terminal within one
/// grid generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridLevel {
    pub index: u32,
    pub price: f64,
    pub side: Side,
    pub order_id: Option<String>,
    pub is_active: bool,
    pub filled: bool,
}

/// The full grid geometry for the current generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridState {
    pub levels: Vec<GridLevel>,
    pub center_price: f64,
    pub upper_bound: f64,
    pub lower_bound: f64,
    pub num_grids: u32,
    pub spacing: f64,
    pub regime_multiplier: f64,
}

/// Opposite-side order derived from a fill, one spacing away.
///
/// Carries the origin order id and price so round-trip settlement can
/// pair the sell with its buy exactly instead of reconstructing
/// `sell_price - spacing`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CounterOrder {
    pub side: Side,
    pub price: f64,
    pub amount: f64,
    pub source_index: u32,
    pub origin_order_id: Option<String>,
    pub origin_price: f64,
}

pub struct GridEngine {
    num_grids: u32,
    upper_bound_pct: f64,
    lower_bound_pct: f64,
    order_size_usdt: f64,
    max_open_orders: usize,
    state: Option<GridState>,
    regime_multiplier: f64,
    paused: bool,
}

impl GridEngine {
    pub fn new(cfg: &GridConfig) -> Self {
        GridEngine {
            num_grids: cfg.num_grids,
            upper_bound_pct: cfg.upper_bound_pct,
            lower_bound_pct: cfg.lower_bound_pct,
            order_size_usdt: cfg.order_size_usdt,
            max_open_orders: cfg.max_open_orders,
            state: None,
            regime_multiplier: 1.0,
            paused: false,
        }
    }

    pub fn state(&self) -> Option<&GridState> {
        self.state.as_ref()
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn regime_multiplier(&self) -> f64 {
        self.regime_multiplier
    }

    /// Soft-gate: a paused grid stops handing out orders to place but
    /// leaves resting orders alone. Cancelling is the caller's call.
    pub fn pause(&mut self) {
        self.paused = true;
        info!("grid engine paused");
    }

    pub fn resume(&mut self) {
        self.paused = false;
        info!("grid engine resumed");
    }

    /// Update geometry parameters from a reloaded config snapshot.
    /// Takes effect on the next `calculate_grid`.
    pub fn update_params(&mut self, cfg: &GridConfig) {
        self.num_grids = cfg.num_grids;
        self.upper_bound_pct = cfg.upper_bound_pct;
        self.lower_bound_pct = cfg.lower_bound_pct;
        self.order_size_usdt = cfg.order_size_usdt;
        self.max_open_orders = cfg.max_open_orders;
    }

    /// Clamped to [0.1, 5.0]; applies on the next `calculate_grid`,
    /// never resizes an existing grid retroactively.
    pub fn set_regime_multiplier(&mut self, multiplier: f64) {
        self.regime_multiplier = multiplier.clamp(0.1, 5.0);
        info!(multiplier = self.regime_multiplier, "regime multiplier set");
    }

    /// Build a fresh grid around `current_price`, replacing any prior
    /// state atomically. A candidate level equal to the center price is
    /// omitted so every level sits strictly above or below center.
    pub fn calculate_grid(&mut self, current_price: f64) -> &GridState {
        let effective_upper_pct = self.upper_bound_pct * self.regime_multiplier;
        let effective_lower_pct = self.lower_bound_pct * self.regime_multiplier;

        let upper_bound = current_price * (1.0 + effective_upper_pct / 100.0);
        let lower_bound = current_price * (1.0 - effective_lower_pct / 100.0);
        let spacing = (upper_bound - lower_bound) / self.num_grids as f64;

        let mut levels = Vec::with_capacity(self.num_grids as usize + 1);
        for i in 0..=self.num_grids {
            let price = round_price(lower_bound + i as f64 * spacing);
            let side = if price < current_price {
                Side::Buy
            } else if price > current_price {
                Side::Sell
            } else {
                continue;
            };
            levels.push(GridLevel {
                index: i,
                price,
                side,
                order_id: None,
                is_active: false,
                filled: false,
            });
        }

        self.state = Some(GridState {
            levels,
            center_price: current_price,
            upper_bound: round_price(upper_bound),
            lower_bound: round_price(lower_bound),
            num_grids: self.num_grids,
            spacing: round_price(spacing),
            regime_multiplier: self.regime_multiplier,
        });

        let state = self.state.as_ref().unwrap();
        info!(
            center = current_price,
            lower = state.lower_bound,
            upper = state.upper_bound,
            spacing = state.spacing,
            levels = state.levels.len(),
            "grid calculated"
        );
        state
    }

    /// Levels that need an order, nearest to center first so the fills
    /// likeliest to execute get the available slots. Truncated so
    /// active + to-be-placed never exceeds `max_open_orders`.
    pub fn orders_to_place(&self) -> Vec<GridLevel> {
        let state = match &self.state {
            Some(s) if !self.paused => s,
            _ => return Vec::new(),
        };

        let active_count = state.levels.iter().filter(|l| l.is_active).count();
        let available = self.max_open_orders.saturating_sub(active_count);

        let mut pending: Vec<GridLevel> = state
            .levels
            .iter()
            .filter(|l| !l.is_active && !l.filled)
            .cloned()
            .collect();
        pending.sort_by(|a, b| {
            let da = (a.price - state.center_price).abs();
            let db = (b.price - state.center_price).abs();
            da.total_cmp(&db)
        });
        pending.truncate(available);
        pending
    }

    /// Idempotent for the same `(index, order_id)` pair; callers must
    /// not re-place a different order on an already-active level.
    pub fn mark_order_placed(&mut self, index: u32, order_id: &str) {
        if let Some(state) = &mut self.state {
            if let Some(level) = state.levels.iter_mut().find(|l| l.index == index) {
                level.order_id = Some(order_id.to_string());
                level.is_active = true;
                debug!(index, order_id, "order placed on grid level");
            }
        }
    }

    /// Marks the owning level filled and returns it, or `None` when no
    /// level holds this order id (e.g. after a recalibration).
    pub fn mark_order_filled(&mut self, order_id: &str) -> Option<GridLevel> {
        let state = self.state.as_mut()?;
        let level = state
            .levels
            .iter_mut()
            .find(|l| l.order_id.as_deref() == Some(order_id))?;
        level.filled = true;
        level.is_active = false;
        info!(
            index = level.index,
            price = level.price,
            side = %level.side,
            "grid level filled"
        );
        Some(level.clone())
    }

    /// Returns the level to pending; `filled` is left untouched.
    pub fn mark_order_cancelled(&mut self, order_id: &str) {
        if let Some(state) = &mut self.state {
            if let Some(level) = state
                .levels
                .iter_mut()
                .find(|l| l.order_id.as_deref() == Some(order_id))
            {
                level.is_active = false;
                level.order_id = None;
            }
        }
    }

    /// Derive the opposite-side order one spacing away from a fill.
    /// Rejected when the counter price would leave the grid bounds.
    pub fn counter_order(&self, filled_level: &GridLevel) -> Option<CounterOrder> {
        let state = self.state.as_ref()?;

        let (counter_price, counter_side) = match filled_level.side {
            Side::Buy => (filled_level.price + state.spacing, Side::Sell),
            Side::Sell => (filled_level.price - state.spacing, Side::Buy),
        };

        if counter_price < state.lower_bound || counter_price > state.upper_bound {
            return None;
        }

        Some(CounterOrder {
            side: counter_side,
            price: round_price(counter_price),
            amount: round_amount(self.order_size_usdt / counter_price),
            source_index: filled_level.index,
            origin_order_id: filled_level.order_id.clone(),
            origin_price: filled_level.price,
        })
    }

    /// True when no grid exists yet or price has drifted strictly more
    /// than `threshold_pct` from the center.
    pub fn should_recalibrate(&self, current_price: f64, threshold_pct: f64) -> bool {
        match &self.state {
            None => true,
            Some(state) => {
                let drift =
                    (current_price - state.center_price).abs() / state.center_price * 100.0;
                drift > threshold_pct
            }
        }
    }

    /// Base-asset amount for a level, sized so every order commits
    /// `order_size_usdt` of quote currency.
    pub fn order_amount(&self, price: f64) -> f64 {
        round_amount(self.order_size_usdt / price)
    }

    pub fn active_order_count(&self) -> usize {
        self.state
            .as_ref()
            .map(|s| s.levels.iter().filter(|l| l.is_active).count())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(num_grids: u32, bound_pct: f64) -> GridEngine {
        GridEngine::new(&GridConfig {
            num_grids,
            upper_bound_pct: bound_pct,
            lower_bound_pct: bound_pct,
            order_size_usdt: 50.0,
            recalibration_interval_minutes: 60,
            max_open_orders: 30,
        })
    }

    #[test]
    fn geometry_matches_bounds_and_spacing() {
        let mut grid = engine(10, 2.0);
        let state = grid.calculate_grid(50000.0).clone();

        assert_eq!(state.upper_bound, 51000.0);
        assert_eq!(state.lower_bound, 49000.0);
        assert_eq!(state.spacing, 200.0);
        // index 5 would land exactly on the center and is omitted
        assert_eq!(state.levels.len(), 10);
        assert_eq!(
            state.levels.iter().filter(|l| l.side == Side::Buy).count(),
            5
        );
        assert_eq!(
            state.levels.iter().filter(|l| l.side == Side::Sell).count(),
            5
        );
        for level in &state.levels {
            assert!(level.price >= state.lower_bound && level.price <= state.upper_bound);
            if level.side == Side::Buy {
                assert!(level.price < state.center_price);
            } else {
                assert!(level.price > state.center_price);
            }
        }
    }

    #[test]
    fn recalculation_at_same_price_reproduces_geometry() {
        let mut grid = engine(10, 2.0);
        let first = grid.calculate_grid(50000.0).clone();
        let second = grid.calculate_grid(50000.0).clone();
        assert_eq!(first.spacing, second.spacing);
        assert_eq!(first.levels.len(), second.levels.len());
        for (a, b) in first.levels.iter().zip(second.levels.iter()) {
            assert_eq!(a.price, b.price);
            assert_eq!(a.side, b.side);
        }
    }

    #[test]
    fn regime_multiplier_widens_next_grid_only() {
        let mut grid = engine(10, 3.0);
        grid.calculate_grid(50000.0);
        grid.set_regime_multiplier(2.0);
        assert_eq!(grid.state().unwrap().regime_multiplier, 1.0);

        let state = grid.calculate_grid(50000.0).clone();
        assert_eq!(state.regime_multiplier, 2.0);
        assert_eq!(state.upper_bound, 53000.0);
    }

    #[test]
    fn regime_multiplier_is_clamped() {
        let mut grid = engine(10, 2.0);
        grid.set_regime_multiplier(12.0);
        assert_eq!(grid.regime_multiplier(), 5.0);
        grid.set_regime_multiplier(0.0);
        assert_eq!(grid.regime_multiplier(), 0.1);
    }

    #[test]
    fn orders_to_place_prefers_levels_near_center() {
        let mut grid = engine(10, 2.0);
        grid.calculate_grid(50000.0);
        let orders = grid.orders_to_place();
        let center = 50000.0;
        for w in orders.windows(2) {
            assert!((w[0].price - center).abs() <= (w[1].price - center).abs());
        }
    }

    #[test]
    fn orders_to_place_respects_max_open_orders() {
        let mut grid = GridEngine::new(&GridConfig {
            num_grids: 20,
            upper_bound_pct: 2.0,
            lower_bound_pct: 2.0,
            order_size_usdt: 50.0,
            recalibration_interval_minutes: 60,
            max_open_orders: 5,
        });
        grid.calculate_grid(50000.0);
        assert_eq!(grid.orders_to_place().len(), 5);

        for level in grid.orders_to_place() {
            grid.mark_order_placed(level.index, &format!("o-{}", level.index));
        }
        assert!(grid.orders_to_place().is_empty());
    }

    #[test]
    fn fill_lifecycle_is_terminal() {
        let mut grid = engine(10, 2.0);
        grid.calculate_grid(50000.0);
        let level = grid.orders_to_place()[0].clone();
        grid.mark_order_placed(level.index, "o-1");

        let filled = grid.mark_order_filled("o-1").unwrap();
        assert!(filled.filled);
        assert!(!filled.is_active);

        // A filled level never re-pends within the same generation
        assert!(grid
            .orders_to_place()
            .iter()
            .all(|l| l.index != level.index));
    }

    #[test]
    fn cancel_returns_level_to_pending() {
        let mut grid = engine(10, 2.0);
        grid.calculate_grid(50000.0);
        let level = grid.orders_to_place()[0].clone();
        grid.mark_order_placed(level.index, "o-1");
        grid.mark_order_cancelled("o-1");

        let state = grid.state().unwrap();
        let l = state.levels.iter().find(|l| l.index == level.index).unwrap();
        assert!(!l.is_active);
        assert!(l.order_id.is_none());
        assert!(!l.filled);
    }

    #[test]
    fn counter_order_one_spacing_away() {
        let mut grid = engine(10, 2.0);
        grid.calculate_grid(50000.0);

        let buy_level = GridLevel {
            index: 3,
            price: 49600.0,
            side: Side::Buy,
            order_id: Some("o-3".into()),
            is_active: false,
            filled: true,
        };
        let counter = grid.counter_order(&buy_level).unwrap();
        assert_eq!(counter.side, Side::Sell);
        assert_eq!(counter.price, 49800.0);
        assert_eq!(counter.amount, round_amount(50.0 / 49800.0));
        assert_eq!(counter.origin_order_id.as_deref(), Some("o-3"));
        assert_eq!(counter.origin_price, 49600.0);
    }

    #[test]
    fn counter_order_rejected_at_boundary() {
        let mut grid = engine(10, 2.0);
        grid.calculate_grid(50000.0);

        // A sell fill at the lower bound would counter below the grid
        let level = GridLevel {
            index: 0,
            price: 49000.0,
            side: Side::Sell,
            order_id: None,
            is_active: false,
            filled: true,
        };
        assert!(grid.counter_order(&level).is_none());
    }

    #[test]
    fn recalibration_threshold_is_strict() {
        let mut grid = engine(10, 3.0);
        assert!(grid.should_recalibrate(50000.0, 2.0));

        grid.calculate_grid(50000.0);
        // exactly 2.000% drift: no recalibration
        assert!(!grid.should_recalibrate(51000.0, 2.0));
        // 2.002% drift: recalibrate
        assert!(grid.should_recalibrate(51001.0, 2.0));
    }

    #[test]
    fn paused_grid_hands_out_nothing() {
        let mut grid = engine(10, 2.0);
        grid.calculate_grid(50000.0);
        grid.pause();
        assert!(grid.orders_to_place().is_empty());
        grid.resume();
        assert!(!grid.orders_to_place().is_empty());
    }
}
