//! Trend detection
//!
//! Grid market-making earns the spacing in ranging markets and bleeds
//! in strong trends, so the detector's job is to flag conditions under
//! which the grid should stand down. MA cross gives direction, ADX
//! gives strength, RSI flags exhaustion extremes.

use serde::Serialize;
use tracing::info;

use crate::config::TrendConfig;
use crate::indicators::{last_adx, last_rsi, last_sma};
use crate::Candle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TrendState {
    Ranging,
    Bullish,
    Bearish,
    StrongBullish,
    StrongBearish,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrendSignal {
    pub state: TrendState,
    pub ma_fast: f64,
    pub ma_slow: f64,
    pub rsi: f64,
    pub adx: f64,
    pub should_pause: bool,
    pub reason: String,
}

pub struct TrendDetector {
    cfg: TrendConfig,
    last_signal: Option<TrendSignal>,
}

impl TrendDetector {
    pub fn new(cfg: TrendConfig) -> Self {
        TrendDetector {
            cfg,
            last_signal: None,
        }
    }

    pub fn last_signal(&self) -> Option<&TrendSignal> {
        self.last_signal.as_ref()
    }

    /// Analyze a candle window. `None` during indicator warmup.
    pub fn analyze(&mut self, candles: &[Candle]) -> Option<TrendSignal> {
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();

        let ma_fast = last_sma(&closes, self.cfg.ma_fast)?;
        let ma_slow = last_sma(&closes, self.cfg.ma_slow)?;
        let rsi = last_rsi(&closes, self.cfg.rsi_period)?;
        let adx = last_adx(candles, self.cfg.adx_period).unwrap_or(0.0);

        let strong = adx >= self.cfg.adx_strong_trend;
        let mut should_pause = false;
        let mut reason = String::new();

        let state = if ma_fast > ma_slow && strong {
            if self.cfg.pause_on_strong_trend {
                should_pause = true;
                reason = format!("strong bullish trend (ADX={adx:.1})");
            }
            TrendState::StrongBullish
        } else if ma_fast < ma_slow && strong {
            if self.cfg.pause_on_strong_trend {
                should_pause = true;
                reason = format!("strong bearish trend (ADX={adx:.1})");
            }
            TrendState::StrongBearish
        } else if ma_fast > ma_slow {
            TrendState::Bullish
        } else if ma_fast < ma_slow {
            TrendState::Bearish
        } else {
            TrendState::Ranging
        };

        if self.cfg.pause_on_strong_trend && strong && rsi >= self.cfg.rsi_overbought {
            should_pause = true;
            reason = format!("overbought + strong trend (RSI={rsi:.1}, ADX={adx:.1})");
        } else if self.cfg.pause_on_strong_trend && strong && rsi <= self.cfg.rsi_oversold {
            should_pause = true;
            reason = format!("oversold + strong trend (RSI={rsi:.1}, ADX={adx:.1})");
        }

        let signal = TrendSignal {
            state,
            ma_fast,
            ma_slow,
            rsi,
            adx,
            should_pause,
            reason,
        };

        info!(
            state = ?signal.state,
            ma_fast,
            ma_slow,
            rsi,
            adx,
            pause = should_pause,
            "trend analyzed"
        );

        self.last_signal = Some(signal.clone());
        Some(signal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn candle(i: usize, close: f64, range: f64) -> Candle {
        Candle {
            timestamp: Utc::now() + Duration::minutes(5 * i as i64),
            open: close,
            high: close + range,
            low: close - range,
            close,
            volume: 100.0,
        }
    }

    fn ranging_candles(n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let close = 50_000.0 + if i % 2 == 0 { 20.0 } else { -20.0 };
                candle(i, close, 30.0)
            })
            .collect()
    }

    fn trending_candles(n: usize, step: f64) -> Vec<Candle> {
        (0..n)
            .map(|i| candle(i, 50_000.0 + i as f64 * step, 40.0))
            .collect()
    }

    #[test]
    fn warmup_returns_none() {
        let mut detector = TrendDetector::new(TrendConfig::default());
        assert!(detector.analyze(&ranging_candles(10)).is_none());
    }

    #[test]
    fn ranging_market_does_not_pause() {
        let mut detector = TrendDetector::new(TrendConfig::default());
        let signal = detector.analyze(&ranging_candles(120)).unwrap();
        assert!(!signal.should_pause);
    }

    #[test]
    fn persistent_rally_flags_strong_trend() {
        let mut detector = TrendDetector::new(TrendConfig::default());
        let signal = detector.analyze(&trending_candles(120, 80.0)).unwrap();
        assert!(matches!(
            signal.state,
            TrendState::StrongBullish | TrendState::Bullish
        ));
        if signal.state == TrendState::StrongBullish {
            assert!(signal.should_pause);
            assert!(!signal.reason.is_empty());
        }
    }

    #[test]
    fn pause_disabled_by_config() {
        let cfg = TrendConfig {
            pause_on_strong_trend: false,
            ..TrendConfig::default()
        };
        let mut detector = TrendDetector::new(cfg);
        let signal = detector.analyze(&trending_candles(120, 80.0)).unwrap();
        assert!(!signal.should_pause);
    }

    #[test]
    fn last_signal_is_cached() {
        let mut detector = TrendDetector::new(TrendConfig::default());
        assert!(detector.last_signal().is_none());
        detector.analyze(&ranging_candles(120));
        assert!(detector.last_signal().is_some());
    }
}
