//! Core data types shared across the trading engine

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Quote-currency price precision (USD/USDT quotes)
pub const PRICE_DECIMALS: u32 = 2;

/// Base-asset amount precision
pub const AMOUNT_DECIMALS: u32 = 8;

/// Order direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Local view of a venue order's lifecycle.
///
/// Transitions are one-way except that `Unknown` may refine to any
/// other status once the venue answers a poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Open,
    Closed,
    Cancelled,
    Unknown,
}

impl OrderStatus {
    /// Map a venue-reported status string onto the local lifecycle.
    pub fn from_venue(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "open" | "new" | "partially_filled" => OrderStatus::Open,
            "closed" | "filled" => OrderStatus::Closed,
            "cancelled" | "canceled" | "expired" | "rejected" => OrderStatus::Cancelled,
            _ => OrderStatus::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Open => "open",
            OrderStatus::Closed => "closed",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Latest venue quote
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticker {
    pub last: f64,
    pub bid: f64,
    pub ask: f64,
    pub timestamp: DateTime<Utc>,
}

/// Validation errors for candle data
#[derive(Debug, Error)]
pub enum CandleValidationError {
    #[error("high ({high}) must be >= low ({low})")]
    HighLessThanLow { high: f64, low: f64 },

    #[error("volume ({0}) must be >= 0")]
    NegativeVolume(f64),

    #[error("prices must be positive: open={open}, high={high}, low={low}, close={close}")]
    NonPositivePrice {
        open: f64,
        high: f64,
        low: f64,
        close: f64,
    },
}

/// OHLCV candlestick data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn new(
        timestamp: DateTime<Utc>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Result<Self, CandleValidationError> {
        let candle = Self {
            timestamp,
            open,
            high,
            low,
            close,
            volume,
        };
        candle.validate()?;
        Ok(candle)
    }

    pub fn validate(&self) -> Result<(), CandleValidationError> {
        if self.open <= 0.0 || self.high <= 0.0 || self.low <= 0.0 || self.close <= 0.0 {
            return Err(CandleValidationError::NonPositivePrice {
                open: self.open,
                high: self.high,
                low: self.low,
                close: self.close,
            });
        }
        if self.high < self.low {
            return Err(CandleValidationError::HighLessThanLow {
                high: self.high,
                low: self.low,
            });
        }
        if self.volume < 0.0 {
            return Err(CandleValidationError::NegativeVolume(self.volume));
        }
        Ok(())
    }
}

/// Round a quote-currency price to venue precision.
///
/// Goes through `Decimal` so a grid level computed as
/// `49799.999999999996` serializes and compares as `49800.00`.
pub fn round_price(price: f64) -> f64 {
    round_dp(price, PRICE_DECIMALS)
}

/// Round a base-asset amount to venue precision.
pub fn round_amount(amount: f64) -> f64 {
    round_dp(amount, AMOUNT_DECIMALS)
}

fn round_dp(value: f64, dp: u32) -> f64 {
    Decimal::from_f64_retain(value)
        .map(|d| d.round_dp(dp))
        .and_then(|d| d.to_f64())
        .unwrap_or(value)
}

/// Single clock for UTC day boundaries.
///
/// Both the position ledger and the order manager anchor their daily
/// counters on this so resets happen in lockstep.
pub fn utc_today() -> NaiveDate {
    Utc::now().date_naive()
}
