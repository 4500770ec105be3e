//! Historical data loading
//!
//! OHLCV candles from CSV files for backtests, with a venue-fetch
//! fallback when no data file is supplied. CSV rows are
//! `timestamp,open,high,low,close,volume`; the timestamp column accepts
//! epoch milliseconds or an RFC 3339 / `YYYY-MM-DD HH:MM:SS` string.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use std::path::Path;
use tracing::{info, warn};

use crate::venue::Venue;
use crate::Candle;

pub fn load_csv(path: impl AsRef<Path>) -> Result<Vec<Candle>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path.as_ref())
        .context("failed to open CSV file")?;

    let mut candles = Vec::new();
    for (row_idx, result) in reader.records().enumerate() {
        let record = result.with_context(|| format!("failed to read row {}", row_idx + 1))?;

        let ts_str = record.get(0).context("missing timestamp column")?;
        let timestamp = parse_timestamp(ts_str)
            .with_context(|| format!("failed to parse timestamp: {ts_str}"))?;

        let field = |idx: usize, name: &str| -> Result<f64> {
            record
                .get(idx)
                .with_context(|| format!("missing {name} column"))?
                .parse::<f64>()
                .with_context(|| format!("failed to parse {name}"))
        };

        let candle = Candle {
            timestamp,
            open: field(1, "open")?,
            high: field(2, "high")?,
            low: field(3, "low")?,
            close: field(4, "close")?,
            volume: field(5, "volume")?,
        };
        if let Err(e) = candle.validate() {
            warn!(row = row_idx + 1, error = %e, "skipping invalid candle");
            continue;
        }
        candles.push(candle);
    }

    info!(count = candles.len(), "candles loaded from CSV");
    Ok(candles)
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    if let Ok(ms) = s.parse::<i64>() {
        return Utc
            .timestamp_millis_opt(ms)
            .single()
            .context("epoch millis out of range");
    }
    if let Ok(dt) = s.parse::<DateTime<Utc>>() {
        return Ok(dt);
    }
    let naive = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .context("unrecognized timestamp format")?;
    Ok(DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc))
}

/// Keep candles inside `[start, end]` (whole UTC days, inclusive).
pub fn filter_date_range(
    candles: Vec<Candle>,
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
) -> Vec<Candle> {
    candles
        .into_iter()
        .filter(|c| {
            let day = c.timestamp.date_naive();
            start.is_none_or(|s| day >= s) && end.is_none_or(|e| day <= e)
        })
        .collect()
}

/// Fetch recent history from the venue when no data file is given.
pub async fn fetch_from_venue(
    venue: &dyn Venue,
    timeframe: &str,
    limit: usize,
) -> Result<Vec<Candle>> {
    let candles = venue
        .fetch_recent_ohlcv(timeframe, limit)
        .await
        .context("failed to fetch candles from venue")?;
    if candles.is_empty() {
        anyhow::bail!("venue returned no candles");
    }
    info!(count = candles.len(), timeframe, "candles fetched from venue");
    Ok(candles)
}
