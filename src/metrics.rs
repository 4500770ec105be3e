//! Backtest performance metrics

use serde::Serialize;
use statrs::statistics::Statistics;

use crate::store::TradeRecord;

/// Annualization factor for 5-minute bars (288 per day, 252 sessions).
const PERIODS_PER_YEAR: f64 = 252.0 * 288.0;

#[derive(Debug, Clone, Serialize)]
pub struct BacktestMetrics {
    pub initial_capital: f64,
    pub final_equity: f64,
    pub total_return_usdt: f64,
    pub total_return_pct: f64,
    pub max_drawdown_pct: f64,
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,
    pub calmar_ratio: f64,
    pub win_rate_pct: f64,
    pub profit_factor: f64,
    pub total_trades: usize,
    pub total_fees_usdt: f64,
    pub avg_trade_profit: f64,
    pub candles_processed: usize,
    pub elapsed_seconds: f64,
}

pub fn sharpe_ratio(returns: &[f64]) -> f64 {
    if returns.len() < 2 {
        return 0.0;
    }
    let mean = returns.iter().mean();
    let std_dev = returns.iter().std_dev();
    if std_dev == 0.0 || std_dev.is_nan() {
        return 0.0;
    }
    mean / std_dev * PERIODS_PER_YEAR.sqrt()
}

pub fn sortino_ratio(returns: &[f64]) -> f64 {
    if returns.len() < 2 {
        return 0.0;
    }
    let mean = returns.iter().mean();
    let downside: Vec<f64> = returns.iter().copied().filter(|r| *r < 0.0).collect();
    if downside.is_empty() {
        return if mean > 0.0 { f64::INFINITY } else { 0.0 };
    }
    if downside.len() < 2 {
        return 0.0;
    }
    let downside_std = downside.iter().std_dev();
    if downside_std == 0.0 || downside_std.is_nan() {
        return 0.0;
    }
    mean / downside_std * PERIODS_PER_YEAR.sqrt()
}

pub fn max_drawdown_pct(equity_curve: &[f64]) -> f64 {
    let mut peak = f64::MIN;
    let mut max_dd = 0.0_f64;
    for &equity in equity_curve {
        peak = peak.max(equity);
        if peak > 0.0 {
            max_dd = max_dd.max((peak - equity) / peak * 100.0);
        }
    }
    max_dd
}

pub fn calmar_ratio(total_return_pct: f64, max_drawdown_pct: f64) -> f64 {
    if max_drawdown_pct == 0.0 {
        return 0.0;
    }
    total_return_pct / max_drawdown_pct
}

pub fn win_rate_pct(trades: &[TradeRecord]) -> f64 {
    if trades.is_empty() {
        return 0.0;
    }
    let wins = trades.iter().filter(|t| t.net_profit_usdt > 0.0).count();
    wins as f64 / trades.len() as f64 * 100.0
}

pub fn profit_factor(trades: &[TradeRecord]) -> f64 {
    let gross_profit: f64 = trades
        .iter()
        .filter(|t| t.net_profit_usdt > 0.0)
        .map(|t| t.net_profit_usdt)
        .sum();
    let gross_loss: f64 = trades
        .iter()
        .filter(|t| t.net_profit_usdt < 0.0)
        .map(|t| t.net_profit_usdt.abs())
        .sum();
    if gross_loss == 0.0 {
        return if gross_profit > 0.0 { f64::INFINITY } else { 0.0 };
    }
    gross_profit / gross_loss
}

pub fn compute_all(
    equity_curve: &[f64],
    trades: &[TradeRecord],
    initial_capital: f64,
    candles_processed: usize,
    elapsed_seconds: f64,
) -> BacktestMetrics {
    let returns: Vec<f64> = equity_curve
        .windows(2)
        .filter(|w| w[0] > 0.0)
        .map(|w| (w[1] - w[0]) / w[0])
        .collect();

    let final_equity = equity_curve.last().copied().unwrap_or(initial_capital);
    let total_return = final_equity - initial_capital;
    let total_return_pct = if initial_capital > 0.0 {
        total_return / initial_capital * 100.0
    } else {
        0.0
    };
    let max_dd = max_drawdown_pct(equity_curve);
    let total_fees: f64 = trades.iter().map(|t| t.fee_usdt).sum();

    BacktestMetrics {
        initial_capital,
        final_equity,
        total_return_usdt: total_return,
        total_return_pct,
        max_drawdown_pct: max_dd,
        sharpe_ratio: sharpe_ratio(&returns),
        sortino_ratio: sortino_ratio(&returns),
        calmar_ratio: calmar_ratio(total_return_pct, max_dd),
        win_rate_pct: win_rate_pct(trades),
        profit_factor: profit_factor(trades),
        total_trades: trades.len(),
        total_fees_usdt: total_fees,
        avg_trade_profit: if trades.is_empty() {
            0.0
        } else {
            total_return / trades.len() as f64
        },
        candles_processed,
        elapsed_seconds,
    }
}
