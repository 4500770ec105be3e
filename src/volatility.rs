//! Volatility regime classification
//!
//! Classifies the market into LOW / MEDIUM / HIGH volatility by
//! comparing the current ATR against its rolling mean over a lookback
//! window. The grid widens in HIGH regimes and tightens in LOW ones via
//! the regime multiplier. Confidence reflects how far the ATR ratio
//! sits from the nearest band edge, scaled into [0, 1].

use serde::Serialize;
use tracing::info;

use crate::config::RegimeConfig;
use crate::indicators::atr_series;
use crate::Candle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum VolatilityRegime {
    Low,
    Medium,
    High,
}

impl VolatilityRegime {
    pub fn as_str(&self) -> &'static str {
        match self {
            VolatilityRegime::Low => "LOW",
            VolatilityRegime::Medium => "MEDIUM",
            VolatilityRegime::High => "HIGH",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct RegimePrediction {
    pub regime: VolatilityRegime,
    pub confidence: f64,
    pub atr_ratio: f64,
}

pub struct VolatilityClassifier {
    cfg: RegimeConfig,
    last_prediction: Option<RegimePrediction>,
}

impl VolatilityClassifier {
    pub fn new(cfg: RegimeConfig) -> Self {
        VolatilityClassifier {
            cfg,
            last_prediction: None,
        }
    }

    pub fn last_prediction(&self) -> Option<&RegimePrediction> {
        self.last_prediction.as_ref()
    }

    /// The grid-width multiplier configured for a regime.
    pub fn multiplier_for(&self, regime: VolatilityRegime) -> f64 {
        match regime {
            VolatilityRegime::Low => self.cfg.multipliers.low,
            VolatilityRegime::Medium => self.cfg.multipliers.medium,
            VolatilityRegime::High => self.cfg.multipliers.high,
        }
    }

    pub fn confidence_threshold(&self) -> f64 {
        self.cfg.confidence_threshold
    }

    /// Classify the window; defaults to MEDIUM at zero confidence when
    /// there is not enough data for the ATR baseline.
    pub fn classify(&mut self, candles: &[Candle]) -> RegimePrediction {
        let fallback = RegimePrediction {
            regime: VolatilityRegime::Medium,
            confidence: 0.0,
            atr_ratio: 1.0,
        };

        let atr = atr_series(candles, self.cfg.atr_period);
        let current = match atr.last().copied().flatten() {
            Some(v) if v > 0.0 => v,
            _ => {
                self.last_prediction = Some(fallback);
                return fallback;
            }
        };

        let start = atr.len().saturating_sub(self.cfg.lookback);
        let baseline: Vec<f64> = atr[start..].iter().filter_map(|&v| v).collect();
        if baseline.len() < self.cfg.atr_period {
            self.last_prediction = Some(fallback);
            return fallback;
        }
        let mean = baseline.iter().sum::<f64>() / baseline.len() as f64;
        if mean <= 0.0 {
            self.last_prediction = Some(fallback);
            return fallback;
        }

        let ratio = current / mean;
        let low = self.cfg.compression_threshold;
        let high = self.cfg.expansion_threshold;
        let band_width = (high - low).max(f64::EPSILON);

        let (regime, distance) = if ratio <= low {
            (VolatilityRegime::Low, low - ratio)
        } else if ratio >= high {
            (VolatilityRegime::High, ratio - high)
        } else {
            // distance to the nearest band edge
            (VolatilityRegime::Medium, (ratio - low).min(high - ratio))
        };
        let confidence = (distance / (band_width / 2.0)).clamp(0.0, 1.0);

        let prediction = RegimePrediction {
            regime,
            confidence,
            atr_ratio: ratio,
        };
        self.last_prediction = Some(prediction);

        info!(
            regime = regime.as_str(),
            confidence,
            atr_ratio = ratio,
            "volatility classified"
        );
        prediction
    }
}
