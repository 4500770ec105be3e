//! Risk supervision
//!
//! A battery of quantitative checks evaluated every tick, producing a
//! monotonic action escalation. PAUSE and EMERGENCY_STOP latch: once
//! tripped, placements stay suppressed until an operator calls
//! `reset_pause`, so the engine cannot flap at a threshold boundary.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::RiskConfig;

/// Escalation ladder; `overall_action` is the max over all checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum RiskAction {
    Ok,
    Warn,
    Pause,
    EmergencyStop,
}

#[derive(Debug, Clone, Serialize)]
pub struct RiskCheck {
    pub name: &'static str,
    pub action: RiskAction,
    pub value: f64,
    pub threshold: f64,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RiskStatus {
    pub overall_action: RiskAction,
    pub checks: Vec<RiskCheck>,
    pub paused: bool,
    pub pause_reason: String,
    pub timestamp: DateTime<Utc>,
}

/// Ledger readings the supervisor evaluates each tick.
#[derive(Debug, Clone, Copy)]
pub struct RiskInputs {
    pub drawdown_pct: f64,
    pub capital_deployed_pct: f64,
    pub daily_pnl: f64,
    pub daily_order_count: u32,
    pub total_fees: f64,
    pub initial_capital: f64,
}

pub struct RiskManager {
    cfg: RiskConfig,
    paused: bool,
    pause_reason: String,
    last_status: Option<RiskStatus>,
}

impl RiskManager {
    pub fn new(cfg: RiskConfig) -> Self {
        RiskManager {
            cfg,
            paused: false,
            pause_reason: String::new(),
            last_status: None,
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn pause_reason(&self) -> &str {
        &self.pause_reason
    }

    pub fn last_status(&self) -> Option<&RiskStatus> {
        self.last_status.as_ref()
    }

    /// Swap thresholds from a reloaded config snapshot. The latch is
    /// untouched.
    pub fn update_thresholds(&mut self, cfg: RiskConfig) {
        self.cfg = cfg;
    }

    pub fn evaluate(&mut self, inputs: RiskInputs) -> RiskStatus {
        let checks = vec![
            self.check_drawdown(inputs.drawdown_pct),
            self.check_capital_deployed(inputs.capital_deployed_pct),
            self.check_daily_loss(inputs.daily_pnl),
            self.check_order_count(inputs.daily_order_count),
            self.check_fees(inputs.total_fees, inputs.initial_capital),
        ];

        let overall_action = checks
            .iter()
            .map(|c| c.action)
            .max()
            .unwrap_or(RiskAction::Ok);

        if overall_action >= RiskAction::Pause {
            let breached: Vec<&str> = checks
                .iter()
                .filter(|c| c.action >= RiskAction::Pause)
                .map(|c| c.message.as_str())
                .collect();
            self.paused = true;
            self.pause_reason = breached.join("; ");
            warn!(reason = %self.pause_reason, "risk breach");
        }
        // An OK evaluation never clears the latch; that takes reset_pause().

        let status = RiskStatus {
            overall_action,
            checks,
            paused: self.paused,
            pause_reason: self.pause_reason.clone(),
            timestamp: Utc::now(),
        };
        self.last_status = Some(status.clone());
        status
    }

    pub fn reset_pause(&mut self) {
        self.paused = false;
        self.pause_reason.clear();
        info!("risk pause reset manually");
    }

    pub fn can_place_order(&self) -> bool {
        !self.paused
    }

    fn check_drawdown(&self, drawdown_pct: f64) -> RiskCheck {
        let max_dd = self.cfg.max_drawdown_pct;
        if drawdown_pct >= self.cfg.emergency_stop_loss_pct {
            return RiskCheck {
                name: "drawdown",
                action: RiskAction::EmergencyStop,
                value: drawdown_pct,
                threshold: self.cfg.emergency_stop_loss_pct,
                message: format!(
                    "EMERGENCY: drawdown {drawdown_pct:.1}% >= {:.1}%",
                    self.cfg.emergency_stop_loss_pct
                ),
            };
        }
        if drawdown_pct >= max_dd {
            return RiskCheck {
                name: "drawdown",
                action: RiskAction::Pause,
                value: drawdown_pct,
                threshold: max_dd,
                message: format!("drawdown {drawdown_pct:.1}% >= {max_dd:.1}%"),
            };
        }
        if drawdown_pct >= max_dd * 0.8 {
            return RiskCheck {
                name: "drawdown",
                action: RiskAction::Warn,
                value: drawdown_pct,
                threshold: max_dd,
                message: format!("drawdown approaching limit: {drawdown_pct:.1}%"),
            };
        }
        RiskCheck {
            name: "drawdown",
            action: RiskAction::Ok,
            value: drawdown_pct,
            threshold: max_dd,
            message: "OK".into(),
        }
    }

    fn check_capital_deployed(&self, deployed_pct: f64) -> RiskCheck {
        let max_deployed = self.cfg.max_capital_deployed_pct;
        if deployed_pct >= max_deployed {
            return RiskCheck {
                name: "capital_deployed",
                action: RiskAction::Pause,
                value: deployed_pct,
                threshold: max_deployed,
                message: format!("capital deployed {deployed_pct:.1}% >= {max_deployed:.1}%"),
            };
        }
        if deployed_pct >= max_deployed * 0.8 {
            return RiskCheck {
                name: "capital_deployed",
                action: RiskAction::Warn,
                value: deployed_pct,
                threshold: max_deployed,
                message: format!("capital deployed approaching limit: {deployed_pct:.1}%"),
            };
        }
        RiskCheck {
            name: "capital_deployed",
            action: RiskAction::Ok,
            value: deployed_pct,
            threshold: max_deployed,
            message: "OK".into(),
        }
    }

    fn check_daily_loss(&self, daily_pnl: f64) -> RiskCheck {
        let cap = self.cfg.daily_loss_cap_usdt;
        if daily_pnl <= -cap {
            return RiskCheck {
                name: "daily_loss",
                action: RiskAction::Pause,
                value: daily_pnl.abs(),
                threshold: cap,
                message: format!("daily loss {:.2} >= cap {cap:.2}", daily_pnl.abs()),
            };
        }
        RiskCheck {
            name: "daily_loss",
            action: RiskAction::Ok,
            value: daily_pnl.abs(),
            threshold: cap,
            message: "OK".into(),
        }
    }

    fn check_order_count(&self, count: u32) -> RiskCheck {
        let max = self.cfg.max_orders_per_day;
        if count >= max {
            return RiskCheck {
                name: "order_count",
                action: RiskAction::Pause,
                value: count as f64,
                threshold: max as f64,
                message: format!("daily orders {count} >= {max}"),
            };
        }
        RiskCheck {
            name: "order_count",
            action: RiskAction::Ok,
            value: count as f64,
            threshold: max as f64,
            message: "OK".into(),
        }
    }

    fn check_fees(&self, total_fees: f64, initial_capital: f64) -> RiskCheck {
        if initial_capital <= 0.0 {
            return RiskCheck {
                name: "fees",
                action: RiskAction::Ok,
                value: 0.0,
                threshold: 0.0,
                message: "OK".into(),
            };
        }
        let fee_pct = total_fees / initial_capital * 100.0;
        if fee_pct >= self.cfg.max_fee_pct {
            return RiskCheck {
                name: "fees",
                action: RiskAction::Warn,
                value: fee_pct,
                threshold: self.cfg.max_fee_pct,
                message: format!("total fees {fee_pct:.2}% of capital"),
            };
        }
        RiskCheck {
            name: "fees",
            action: RiskAction::Ok,
            value: fee_pct,
            threshold: self.cfg.max_fee_pct,
            message: "OK".into(),
        }
    }
}
