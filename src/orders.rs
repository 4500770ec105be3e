//! Order lifecycle management
//!
//! Bridges grid intent ("place a BUY of X at P") to venue reality:
//! retries with exponential backoff on transient errors, a minimum
//! interval between venue calls, and reconciliation against the venue's
//! open-order set as the authoritative correction for missed fills.

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};

use crate::monitor::Monitor;
use crate::types::{utc_today, OrderStatus, Side};
use crate::venue::{OrderAck, Venue, VenueError};

#[derive(Debug, Error)]
pub enum OrderError {
    #[error("placement failed after {attempts} attempts: {last_error}")]
    PlacementFailed {
        attempts: u32,
        #[source]
        last_error: VenueError,
    },

    #[error("cancel failed after {attempts} attempts: {last_error}")]
    CancelFailed {
        attempts: u32,
        #[source]
        last_error: VenueError,
    },

    #[error("no venue configured for live order flow")]
    NoVenue,
}

/// Local record of an order we asked the venue to rest.
#[derive(Debug, Clone, Serialize)]
pub struct OrderRecord {
    pub order_id: String,
    pub side: Side,
    pub price: f64,
    pub amount: f64,
    pub status: OrderStatus,
    pub grid_index: u32,
    pub created_at: DateTime<Utc>,
    pub filled_at: Option<DateTime<Utc>>,
    pub fee: f64,
}

#[derive(Debug, Clone)]
pub struct OrderManagerConfig {
    pub dry_run: bool,
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub rate_limit_per_second: f64,
}

pub struct OrderManager {
    venue: Option<Arc<dyn Venue>>,
    cfg: OrderManagerConfig,
    min_interval: Duration,
    last_call: Option<Instant>,
    orders: HashMap<String, OrderRecord>,
    dry_run_counter: u64,
    daily_order_count: u32,
    daily_anchor: NaiveDate,
    monitor: Arc<Monitor>,
}

impl OrderManager {
    pub fn new(
        venue: Option<Arc<dyn Venue>>,
        cfg: OrderManagerConfig,
        monitor: Arc<Monitor>,
    ) -> Self {
        let min_interval = if cfg.rate_limit_per_second > 0.0 {
            Duration::from_secs_f64(1.0 / cfg.rate_limit_per_second)
        } else {
            Duration::ZERO
        };
        OrderManager {
            venue,
            cfg,
            min_interval,
            last_call: None,
            orders: HashMap::new(),
            dry_run_counter: 0,
            daily_order_count: 0,
            daily_anchor: utc_today(),
            monitor,
        }
    }

    pub fn orders(&self) -> &HashMap<String, OrderRecord> {
        &self.orders
    }

    pub fn get(&self, order_id: &str) -> Option<&OrderRecord> {
        self.orders.get(order_id)
    }

    /// Orders placed today (UTC); resets at the day boundary.
    pub fn daily_order_count(&mut self) -> u32 {
        let today = utc_today();
        if self.daily_anchor != today {
            self.daily_order_count = 0;
            self.daily_anchor = today;
        }
        self.daily_order_count
    }

    /// Minimum-interval gate shared by every venue call, so no rolling
    /// one-second window sees more calls than configured.
    async fn pace(&mut self) {
        if let Some(last) = self.last_call {
            let elapsed = last.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        self.last_call = Some(Instant::now());
    }

    /// Retry a venue call on transient errors with exponential backoff
    /// `retry_backoff * 2^attempt`. Permanent errors surface at once.
    async fn retry_call<T, F, Fut>(&mut self, mut call: F) -> Result<T, (u32, VenueError)>
    where
        F: FnMut(Arc<dyn Venue>) -> Fut,
        Fut: std::future::Future<Output = Result<T, VenueError>>,
    {
        let venue = match &self.venue {
            Some(v) => Arc::clone(v),
            None => return Err((0, VenueError::Permanent("no venue configured".into()))),
        };

        let mut last_error = None;
        for attempt in 0..self.cfg.max_retries {
            self.pace().await;
            match call(Arc::clone(&venue)).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() => {
                    let wait = self.cfg.retry_backoff * 2u32.pow(attempt);
                    warn!(
                        attempt = attempt + 1,
                        max = self.cfg.max_retries,
                        error = %e,
                        wait_secs = wait.as_secs_f64(),
                        "venue call failed, retrying"
                    );
                    last_error = Some(e);
                    tokio::time::sleep(wait).await;
                }
                Err(e) => return Err((attempt + 1, e)),
            }
        }
        Err((
            self.cfg.max_retries,
            last_error.unwrap_or_else(|| VenueError::Transient("retries exhausted".into())),
        ))
    }

    /// Place a limit order; dry-run mints a synthetic `dry-<n>` id.
    pub async fn place_order(
        &mut self,
        side: Side,
        price: f64,
        amount: f64,
        grid_index: u32,
    ) -> Result<OrderRecord, OrderError> {
        if self.cfg.dry_run {
            self.dry_run_counter += 1;
            let order_id = format!("dry-{}", self.dry_run_counter);
            let record = OrderRecord {
                order_id: order_id.clone(),
                side,
                price,
                amount,
                status: OrderStatus::Open,
                grid_index,
                created_at: Utc::now(),
                filled_at: None,
                fee: 0.0,
            };
            self.orders.insert(order_id.clone(), record.clone());
            self.bump_daily_count();
            info!(
                %order_id,
                %side,
                amount,
                price,
                grid_index,
                "[dry-run] order placed"
            );
            return Ok(record);
        }

        if self.venue.is_none() {
            return Err(OrderError::NoVenue);
        }

        let ack: OrderAck = self
            .retry_call(|venue| async move {
                match side {
                    Side::Buy => venue.place_limit_buy(amount, price).await,
                    Side::Sell => venue.place_limit_sell(amount, price).await,
                }
            })
            .await
            .map_err(|(attempts, last_error)| {
                self.monitor.record_failed_order();
                OrderError::PlacementFailed {
                    attempts,
                    last_error,
                }
            })?;

        let record = OrderRecord {
            order_id: ack.id.clone(),
            side,
            price,
            amount,
            status: OrderStatus::from_venue(&ack.status),
            grid_index,
            created_at: Utc::now(),
            filled_at: None,
            fee: 0.0,
        };
        self.orders.insert(ack.id.clone(), record.clone());
        self.bump_daily_count();
        info!(
            order_id = %ack.id,
            %side,
            amount,
            price,
            grid_index,
            "order placed"
        );
        Ok(record)
    }

    /// Cancel an order. Idempotent: cancelling an already-cancelled or
    /// already-filled order counts as success.
    pub async fn cancel_order(&mut self, order_id: &str) -> Result<bool, OrderError> {
        if self.cfg.dry_run {
            if let Some(record) = self.orders.get_mut(order_id) {
                record.status = OrderStatus::Cancelled;
            }
            info!(order_id, "[dry-run] order cancelled");
            return Ok(true);
        }

        if self.venue.is_none() {
            return Err(OrderError::NoVenue);
        }

        let id = order_id.to_string();
        match self
            .retry_call(|venue| {
                let id = id.clone();
                async move { venue.cancel_order(&id).await }
            })
            .await
        {
            Ok(()) => {
                if let Some(record) = self.orders.get_mut(order_id) {
                    record.status = OrderStatus::Cancelled;
                }
                info!(order_id, "order cancelled");
                Ok(true)
            }
            Err((attempts, last_error)) => {
                warn!(order_id, error = %last_error, "cancel failed");
                Err(OrderError::CancelFailed {
                    attempts,
                    last_error,
                })
            }
        }
    }

    /// Poll the venue for an order's status; `None` when the query
    /// itself failed (not fatal, the next cycle retries). On CLOSED the
    /// fill time is stamped and the venue-reported fee captured.
    pub async fn check_order_status(&mut self, order_id: &str) -> Option<OrderStatus> {
        if self.cfg.dry_run {
            return self.orders.get(order_id).map(|r| r.status);
        }

        self.venue.as_ref()?;

        let id = order_id.to_string();
        match self
            .retry_call(|venue| {
                let id = id.clone();
                async move { venue.fetch_order(&id).await }
            })
            .await
        {
            Ok(venue_order) => {
                let status = OrderStatus::from_venue(&venue_order.status);
                if let Some(record) = self.orders.get_mut(order_id) {
                    record.status = status;
                    if status == OrderStatus::Closed {
                        record.filled_at = Some(Utc::now());
                        if let Some(fee) = venue_order.fee {
                            record.fee = fee;
                        }
                    }
                }
                Some(status)
            }
            Err((_, e)) => {
                warn!(order_id, error = %e, "order status check failed");
                None
            }
        }
    }

    /// Discrepancy detector: any locally-OPEN order absent from the
    /// venue's open set gets polled individually and classified.
    /// Returns ids confirmed CLOSED, exactly once each.
    pub async fn reconcile_orders(&mut self) -> Vec<String> {
        if self.cfg.dry_run || self.venue.is_none() {
            return Vec::new();
        }

        let venue_open = match self
            .retry_call(|venue| async move { venue.fetch_open_orders().await })
            .await
        {
            Ok(orders) => orders,
            Err((_, e)) => {
                warn!(error = %e, "reconciliation failed");
                self.monitor.set_reconciliation_ok(false);
                return Vec::new();
            }
        };
        let venue_ids: std::collections::HashSet<String> =
            venue_open.into_iter().map(|o| o.id).collect();

        let missing: Vec<String> = self
            .orders
            .iter()
            .filter(|(id, record)| {
                record.status == OrderStatus::Open && !venue_ids.contains(*id)
            })
            .map(|(id, _)| id.clone())
            .collect();

        let mut closed = Vec::new();
        for order_id in missing {
            match self.check_order_status(&order_id).await {
                Some(OrderStatus::Closed) => closed.push(order_id),
                Some(OrderStatus::Cancelled) => {
                    info!(%order_id, "order was externally cancelled");
                }
                _ => {
                    // unknown: leave OPEN locally, retry next cycle
                }
            }
        }

        self.monitor.set_reconciliation_ok(true);
        closed
    }

    /// Cancel every locally-open order; returns how many succeeded.
    pub async fn cancel_all_open(&mut self) -> usize {
        let open_ids: Vec<String> = self
            .orders
            .values()
            .filter(|r| r.status == OrderStatus::Open)
            .map(|r| r.order_id.clone())
            .collect();

        let mut count = 0;
        for order_id in open_ids {
            match self.cancel_order(&order_id).await {
                Ok(true) => count += 1,
                Ok(false) => {}
                Err(e) => warn!(%order_id, error = %e, "failed to cancel during sweep"),
            }
        }
        count
    }

    pub fn open_orders(&self) -> Vec<OrderRecord> {
        self.orders
            .values()
            .filter(|r| r.status == OrderStatus::Open)
            .cloned()
            .collect()
    }

    pub fn filled_orders(&self) -> Vec<OrderRecord> {
        self.orders
            .values()
            .filter(|r| r.status == OrderStatus::Closed)
            .cloned()
            .collect()
    }

    pub fn total_fees(&self) -> f64 {
        self.orders.values().map(|r| r.fee).sum()
    }

    /// Apply a fill observed by the caller (reconciliation or direct
    /// poll) to the local record.
    pub fn mark_filled(&mut self, order_id: &str, fee: Option<f64>) {
        if let Some(record) = self.orders.get_mut(order_id) {
            record.status = OrderStatus::Closed;
            if record.filled_at.is_none() {
                record.filled_at = Some(Utc::now());
            }
            if let Some(fee) = fee {
                record.fee = fee;
            }
        }
    }

    fn bump_daily_count(&mut self) {
        let today = utc_today();
        if self.daily_anchor != today {
            self.daily_order_count = 0;
            self.daily_anchor = today;
        }
        self.daily_order_count += 1;
    }
}
