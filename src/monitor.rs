//! Observability gauges
//!
//! Process-wide counters the loop and the order manager keep current.
//! An exporter can scrape these; the engine itself only folds them into
//! the state snapshot.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

const FAILED_ORDER_WINDOW: Duration = Duration::from_secs(3600);

#[derive(Debug, Default)]
pub struct Monitor {
    exchange_connected: AtomicBool,
    api_latency_ms: AtomicU64,
    reconciliation_ok: AtomicBool,
    persist_failures: AtomicU64,
    failed_orders: Mutex<VecDeque<Instant>>,
}

/// Point-in-time snapshot of all gauges.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorSnapshot {
    pub exchange_connected: bool,
    pub api_latency_ms: u64,
    pub failed_orders_count_1h: usize,
    pub reconciliation_ok: bool,
    pub persist_failures: u64,
}

impl Monitor {
    pub fn new() -> Self {
        let monitor = Monitor::default();
        monitor.reconciliation_ok.store(true, Ordering::Relaxed);
        monitor
    }

    pub fn set_exchange_connected(&self, connected: bool) {
        self.exchange_connected.store(connected, Ordering::Relaxed);
    }

    pub fn set_api_latency_ms(&self, latency: u64) {
        self.api_latency_ms.store(latency, Ordering::Relaxed);
    }

    pub fn set_reconciliation_ok(&self, ok: bool) {
        self.reconciliation_ok.store(ok, Ordering::Relaxed);
    }

    pub fn record_persist_failure(&self) {
        self.persist_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed_order(&self) {
        let mut failures = self.failed_orders.lock().unwrap();
        failures.push_back(Instant::now());
        Self::prune(&mut failures);
    }

    pub fn failed_orders_count_1h(&self) -> usize {
        let mut failures = self.failed_orders.lock().unwrap();
        Self::prune(&mut failures);
        failures.len()
    }

    fn prune(failures: &mut VecDeque<Instant>) {
        let Some(cutoff) = Instant::now().checked_sub(FAILED_ORDER_WINDOW) else {
            return;
        };
        while failures.front().is_some_and(|t| *t < cutoff) {
            failures.pop_front();
        }
    }

    pub fn snapshot(&self) -> MonitorSnapshot {
        MonitorSnapshot {
            exchange_connected: self.exchange_connected.load(Ordering::Relaxed),
            api_latency_ms: self.api_latency_ms.load(Ordering::Relaxed),
            failed_orders_count_1h: self.failed_orders_count_1h(),
            reconciliation_ok: self.reconciliation_ok.load(Ordering::Relaxed),
            persist_failures: self.persist_failures.load(Ordering::Relaxed),
        }
    }
}
