//! Technical indicators over candle windows
//!
//! The trend detector and volatility classifier only ever look at the most
//! recent value of an indicator, so everything here is window-oriented:
//! series helpers return full vectors, `last_*` helpers return the newest
//! reading or `None` during warmup.

use crate::Candle;

/// Simple moving average of the last `period` values, if enough data.
pub fn last_sma(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }
    let sum: f64 = values[values.len() - period..].iter().sum();
    Some(sum / period as f64)
}

/// RSI over the full window using rolling-mean gains/losses.
pub fn last_rsi(values: &[f64], period: usize) -> Option<f64> {
    if values.len() < period + 1 {
        return None;
    }
    let mut gains = Vec::with_capacity(values.len() - 1);
    let mut losses = Vec::with_capacity(values.len() - 1);
    for w in values.windows(2) {
        let change = w[1] - w[0];
        gains.push(change.max(0.0));
        losses.push((-change).max(0.0));
    }
    let avg_gain = last_sma(&gains, period)?;
    let avg_loss = last_sma(&losses, period)?;
    if avg_loss == 0.0 {
        return Some(100.0);
    }
    let rs = avg_gain / avg_loss;
    Some(100.0 - 100.0 / (1.0 + rs))
}

/// True range series for a candle window.
pub fn true_range(candles: &[Candle]) -> Vec<f64> {
    let mut tr = Vec::with_capacity(candles.len());
    for (i, c) in candles.iter().enumerate() {
        let value = if i == 0 {
            c.high - c.low
        } else {
            let prev_close = candles[i - 1].close;
            (c.high - c.low)
                .max((c.high - prev_close).abs())
                .max((c.low - prev_close).abs())
        };
        tr.push(value);
    }
    tr
}

/// Average true range series (rolling mean of true range).
///
/// Entries before the warmup index are `None`.
pub fn atr_series(candles: &[Candle], period: usize) -> Vec<Option<f64>> {
    let tr = true_range(candles);
    rolling_mean(&tr, period)
}

/// Latest ATR reading.
pub fn last_atr(candles: &[Candle], period: usize) -> Option<f64> {
    atr_series(candles, period).last().copied().flatten()
}

/// Latest ADX reading, Wilder-style with rolling means.
pub fn last_adx(candles: &[Candle], period: usize) -> Option<f64> {
    if candles.len() < 2 * period + 1 {
        return None;
    }

    let mut plus_dm = vec![0.0; candles.len()];
    let mut minus_dm = vec![0.0; candles.len()];
    for i in 1..candles.len() {
        let up = candles[i].high - candles[i - 1].high;
        let down = candles[i - 1].low - candles[i].low;
        if up > down && up > 0.0 {
            plus_dm[i] = up;
        }
        if down > up && down > 0.0 {
            minus_dm[i] = down;
        }
    }

    let atr = atr_series(candles, period);
    let plus_avg = rolling_mean(&plus_dm, period);
    let minus_avg = rolling_mean(&minus_dm, period);

    let mut dx = Vec::with_capacity(candles.len());
    for i in 0..candles.len() {
        let value = match (plus_avg[i], minus_avg[i], atr[i]) {
            (Some(p), Some(m), Some(a)) if a > 0.0 => {
                let plus_di = 100.0 * p / a;
                let minus_di = 100.0 * m / a;
                let sum = plus_di + minus_di;
                if sum > 0.0 {
                    (plus_di - minus_di).abs() / sum * 100.0
                } else {
                    0.0
                }
            }
            _ => 0.0,
        };
        dx.push(value);
    }

    rolling_mean(&dx, period).last().copied().flatten()
}

/// Rolling standard deviation of simple returns over the last `period` bars.
pub fn last_returns_std(values: &[f64], period: usize) -> Option<f64> {
    if values.len() < period + 1 {
        return None;
    }
    let returns: Vec<f64> = values[values.len() - period - 1..]
        .windows(2)
        .filter(|w| w[0] != 0.0)
        .map(|w| (w[1] - w[0]) / w[0])
        .collect();
    if returns.len() < 2 {
        return None;
    }
    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let var = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (returns.len() - 1) as f64;
    Some(var.sqrt())
}

fn rolling_mean(values: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut result = Vec::with_capacity(values.len());
    let mut sum = 0.0;
    for (i, &v) in values.iter().enumerate() {
        sum += v;
        if i + 1 > period {
            sum -= values[i - period];
        }
        if i + 1 >= period && period > 0 {
            result.push(Some(sum / period as f64));
        } else {
            result.push(None);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn candles_from_closes(closes: &[f64]) -> Vec<Candle> {
        let start = Utc::now();
        closes
            .iter()
            .enumerate()
            .map(|(i, &close)| Candle {
                timestamp: start + Duration::minutes(5 * i as i64),
                open: close,
                high: close * 1.01,
                low: close * 0.99,
                close,
                volume: 100.0,
            })
            .collect()
    }

    #[test]
    fn sma_needs_full_window() {
        assert_eq!(last_sma(&[1.0, 2.0], 3), None);
        assert_eq!(last_sma(&[1.0, 2.0, 3.0, 4.0], 3), Some(3.0));
    }

    #[test]
    fn rsi_is_100_when_only_gains() {
        let values: Vec<f64> = (1..=20).map(|i| i as f64).collect();
        assert_eq!(last_rsi(&values, 14), Some(100.0));
    }

    #[test]
    fn rsi_is_bounded() {
        let values: Vec<f64> = (0..40)
            .map(|i| 100.0 + if i % 2 == 0 { 1.5 } else { -1.0 })
            .collect();
        let rsi = last_rsi(&values, 14).unwrap();
        assert!((0.0..=100.0).contains(&rsi));
    }

    #[test]
    fn atr_reflects_range() {
        let candles = candles_from_closes(&[100.0; 30]);
        let atr = last_atr(&candles, 14).unwrap();
        // Each bar's range is high - low = 2% of 100
        assert!((atr - 2.0).abs() < 1e-9);
    }

    #[test]
    fn adx_warmup_returns_none() {
        let candles = candles_from_closes(&[100.0; 10]);
        assert_eq!(last_adx(&candles, 14), None);
    }

    #[test]
    fn rolling_mean_window_slides() {
        let result = rolling_mean(&[1.0, 2.0, 3.0, 4.0, 5.0], 3);
        assert_eq!(result[1], None);
        assert_eq!(result[2], Some(2.0));
        assert_eq!(result[4], Some(4.0));
    }
}
