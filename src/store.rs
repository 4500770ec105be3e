//! SQLite state store
//!
//! Durable backing for the position ledger: an append-only trade log,
//! an append-only equity snapshot table, and a key-value table for the
//! ledger scalars. WAL mode, one connection behind a mutex, so every
//! update is a single-writer transaction.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("failed to create state directory: {0}")]
    Io(#[from] std::io::Error),
}

/// A completed buy/sell round trip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub trade_id: String,
    pub buy_order_id: String,
    pub sell_order_id: String,
    pub buy_price: f64,
    pub sell_price: f64,
    pub amount: f64,
    pub profit_usdt: f64,
    pub fee_usdt: f64,
    pub net_profit_usdt: f64,
    pub timestamp: DateTime<Utc>,
}

/// One row of the equity history.
#[derive(Debug, Clone, Serialize)]
pub struct EquitySnapshot {
    pub timestamp: String,
    pub equity_usdt: f64,
    pub inventory: f64,
    pub mark_price: f64,
}

/// Ledger scalars as persisted in the `state` table.
#[derive(Debug, Clone, Default)]
pub struct LedgerState {
    pub initial_capital: f64,
    pub current_cash: f64,
    pub peak_capital: f64,
    pub inventory: f64,
    pub total_fees: f64,
    pub trade_count: u64,
    pub emergency_stop: bool,
}

pub struct StateStore {
    conn: Mutex<Connection>,
}

impl StateStore {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;

        let store = StateStore {
            conn: Mutex::new(conn),
        };
        store.create_tables()?;
        info!(path = %db_path.display(), "state store opened");
        Ok(store)
    }

    /// In-memory store for tests and throwaway backtest runs.
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = StateStore {
            conn: Mutex::new(conn),
        };
        store.create_tables()?;
        Ok(store)
    }

    fn create_tables(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS trades (
                trade_id TEXT PRIMARY KEY,
                buy_order_id TEXT,
                sell_order_id TEXT,
                buy_price REAL,
                sell_price REAL,
                amount REAL,
                profit_usdt REAL,
                fee_usdt REAL,
                net_profit_usdt REAL,
                timestamp TEXT
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS equity_snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT,
                equity_usdt REAL,
                inventory REAL,
                mark_price REAL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS state (
                key TEXT PRIMARY KEY,
                value TEXT
            )",
            [],
        )?;

        debug!("state store schema verified");
        Ok(())
    }

    pub fn insert_trade(&self, trade: &TradeRecord) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO trades
             (trade_id, buy_order_id, sell_order_id, buy_price, sell_price,
              amount, profit_usdt, fee_usdt, net_profit_usdt, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                trade.trade_id,
                trade.buy_order_id,
                trade.sell_order_id,
                trade.buy_price,
                trade.sell_price,
                trade.amount,
                trade.profit_usdt,
                trade.fee_usdt,
                trade.net_profit_usdt,
                trade.timestamp.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn insert_equity_snapshot(
        &self,
        equity: f64,
        inventory: f64,
        mark_price: f64,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO equity_snapshots (timestamp, equity_usdt, inventory, mark_price)
             VALUES (?1, ?2, ?3, ?4)",
            params![Utc::now().to_rfc3339(), equity, inventory, mark_price],
        )?;
        Ok(())
    }

    pub fn save_state(&self, state: &LedgerState) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let pairs: [(&str, String); 7] = [
            ("initial_capital", state.initial_capital.to_string()),
            ("current_cash", state.current_cash.to_string()),
            ("peak_capital", state.peak_capital.to_string()),
            ("inventory", state.inventory.to_string()),
            ("total_fees", state.total_fees.to_string()),
            ("trade_count", state.trade_count.to_string()),
            ("emergency_stop", state.emergency_stop.to_string()),
        ];
        for (key, value) in pairs {
            tx.execute(
                "INSERT OR REPLACE INTO state (key, value) VALUES (?1, ?2)",
                params![key, value],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn load_state(&self) -> Result<Option<LedgerState>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT key, value FROM state")?;
        let rows: Vec<(String, String)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<_, _>>()?;
        if rows.is_empty() {
            return Ok(None);
        }

        let mut state = LedgerState::default();
        for (key, value) in rows {
            match key.as_str() {
                "initial_capital" => state.initial_capital = value.parse().unwrap_or(0.0),
                "current_cash" => state.current_cash = value.parse().unwrap_or(0.0),
                "peak_capital" => state.peak_capital = value.parse().unwrap_or(0.0),
                "inventory" => state.inventory = value.parse().unwrap_or(0.0),
                "total_fees" => state.total_fees = value.parse().unwrap_or(0.0),
                "trade_count" => state.trade_count = value.parse().unwrap_or(0),
                "emergency_stop" => state.emergency_stop = value == "true",
                _ => {}
            }
        }
        Ok(Some(state))
    }

    pub fn equity_history(&self, limit: usize) -> Result<Vec<EquitySnapshot>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT timestamp, equity_usdt, inventory, mark_price
             FROM equity_snapshots ORDER BY id DESC LIMIT ?1",
        )?;
        let mut rows: Vec<EquitySnapshot> = stmt
            .query_map(params![limit as i64], |row| {
                Ok(EquitySnapshot {
                    timestamp: row.get(0)?,
                    equity_usdt: row.get(1)?,
                    inventory: row.get(2)?,
                    mark_price: row.get(3)?,
                })
            })?
            .collect::<Result<_, _>>()?;
        rows.reverse();
        Ok(rows)
    }

    pub fn recent_trades(&self, limit: usize) -> Result<Vec<TradeRecord>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT trade_id, buy_order_id, sell_order_id, buy_price, sell_price,
                    amount, profit_usdt, fee_usdt, net_profit_usdt, timestamp
             FROM trades ORDER BY rowid DESC LIMIT ?1",
        )?;
        let mut rows: Vec<TradeRecord> = stmt
            .query_map(params![limit as i64], |row| {
                let ts: String = row.get(9)?;
                Ok(TradeRecord {
                    trade_id: row.get(0)?,
                    buy_order_id: row.get(1)?,
                    sell_order_id: row.get(2)?,
                    buy_price: row.get(3)?,
                    sell_price: row.get(4)?,
                    amount: row.get(5)?,
                    profit_usdt: row.get(6)?,
                    fee_usdt: row.get(7)?,
                    net_profit_usdt: row.get(8)?,
                    timestamp: ts
                        .parse::<DateTime<Utc>>()
                        .unwrap_or_else(|_| Utc::now()),
                })
            })?
            .collect::<Result<_, _>>()?;
        rows.reverse();
        Ok(rows)
    }
}
