//! Configuration management
//!
//! Layered JSON profiles: `default.json`, overridden by a named profile,
//! overridden by an optional `override.json`, overridden by `GRIDAI_*`
//! environment variables. Reloads produce a new immutable snapshot that is
//! published over a watch channel; an invalid reload keeps the prior one.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("default config not found: {0}")]
    MissingDefault(PathBuf),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid config: {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Main configuration snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub exchange: ExchangeConfig,
    pub grid: GridConfig,
    pub risk: RiskConfig,
    #[serde(default)]
    pub trend: TrendConfig,
    #[serde(default)]
    pub regime: RegimeConfig,
    #[serde(default)]
    pub live: LiveConfig,
    #[serde(default)]
    pub paper: PaperConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    pub name: String,
    pub trading_pair: String,
    #[serde(default)]
    pub sandbox: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_secret: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridConfig {
    pub num_grids: u32,
    pub upper_bound_pct: f64,
    pub lower_bound_pct: f64,
    pub order_size_usdt: f64,
    #[serde(default = "default_recalibration_minutes")]
    pub recalibration_interval_minutes: u64,
    #[serde(default = "default_max_open_orders")]
    pub max_open_orders: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    pub max_drawdown_pct: f64,
    pub max_capital_deployed_pct: f64,
    #[serde(default = "default_daily_loss_cap")]
    pub daily_loss_cap_usdt: f64,
    #[serde(default = "default_emergency_stop_pct")]
    pub emergency_stop_loss_pct: f64,
    #[serde(default = "default_max_orders_per_day")]
    pub max_orders_per_day: u32,
    #[serde(default = "default_max_fee_pct")]
    pub max_fee_pct: f64,
    #[serde(default = "default_slippage_tolerance")]
    pub slippage_tolerance_pct: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrendConfig {
    pub ma_fast: usize,
    pub ma_slow: usize,
    pub rsi_period: usize,
    pub rsi_overbought: f64,
    pub rsi_oversold: f64,
    pub adx_period: usize,
    pub adx_strong_trend: f64,
    pub pause_on_strong_trend: bool,
}

impl Default for TrendConfig {
    fn default() -> Self {
        TrendConfig {
            ma_fast: 20,
            ma_slow: 50,
            rsi_period: 14,
            rsi_overbought: 70.0,
            rsi_oversold: 30.0,
            adx_period: 14,
            adx_strong_trend: 25.0,
            pause_on_strong_trend: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegimeConfig {
    pub atr_period: usize,
    pub lookback: usize,
    /// ATR ratio at or below which volatility is LOW
    pub compression_threshold: f64,
    /// ATR ratio at or above which volatility is HIGH
    pub expansion_threshold: f64,
    pub confidence_threshold: f64,
    pub multipliers: RegimeMultipliers,
}

impl Default for RegimeConfig {
    fn default() -> Self {
        RegimeConfig {
            atr_period: 14,
            lookback: 96,
            compression_threshold: 0.75,
            expansion_threshold: 1.25,
            confidence_threshold: 0.6,
            multipliers: RegimeMultipliers::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegimeMultipliers {
    pub low: f64,
    pub medium: f64,
    pub high: f64,
}

impl Default for RegimeMultipliers {
    fn default() -> Self {
        RegimeMultipliers {
            low: 0.7,
            medium: 1.0,
            high: 1.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveConfig {
    pub poll_interval_seconds: u64,
    pub retry_max_attempts: u32,
    pub retry_backoff_seconds: f64,
    pub rate_limit_calls_per_second: f64,
    pub recalibration_threshold_pct: f64,
}

impl Default for LiveConfig {
    fn default() -> Self {
        LiveConfig {
            poll_interval_seconds: 10,
            retry_max_attempts: 5,
            retry_backoff_seconds: 2.0,
            rate_limit_calls_per_second: 5.0,
            recalibration_threshold_pct: 2.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PaperConfig {
    pub initial_capital_usdt: f64,
}

impl Default for PaperConfig {
    fn default() -> Self {
        PaperConfig {
            initial_capital_usdt: 10_000.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            path: "state/gridai.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default log level; `GRIDAI_LOG_LEVEL` overrides it at startup.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Enforce the documented parameter ranges. Called on every load,
    /// including hot reloads.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &'static str, reason: String) -> ConfigError {
            ConfigError::Invalid { field, reason }
        }

        if self.exchange.name.is_empty() {
            return Err(invalid("exchange.name", "must not be empty".into()));
        }
        if self.exchange.trading_pair.is_empty() {
            return Err(invalid("exchange.trading_pair", "must not be empty".into()));
        }
        if !(2..=100).contains(&self.grid.num_grids) {
            return Err(invalid(
                "grid.num_grids",
                format!("{} outside [2, 100]", self.grid.num_grids),
            ));
        }
        if self.grid.upper_bound_pct <= 0.1 {
            return Err(invalid(
                "grid.upper_bound_pct",
                format!("{} must be > 0.1", self.grid.upper_bound_pct),
            ));
        }
        if self.grid.lower_bound_pct <= 0.1 {
            return Err(invalid(
                "grid.lower_bound_pct",
                format!("{} must be > 0.1", self.grid.lower_bound_pct),
            ));
        }
        if self.grid.order_size_usdt <= 1.0 {
            return Err(invalid(
                "grid.order_size_usdt",
                format!("{} must be > 1", self.grid.order_size_usdt),
            ));
        }
        if self.grid.max_open_orders == 0 {
            return Err(invalid("grid.max_open_orders", "must be >= 1".into()));
        }
        if !(0.1..=100.0).contains(&self.risk.max_drawdown_pct) {
            return Err(invalid(
                "risk.max_drawdown_pct",
                format!("{} outside [0.1, 100]", self.risk.max_drawdown_pct),
            ));
        }
        if !(0.1..=100.0).contains(&self.risk.max_capital_deployed_pct) {
            return Err(invalid(
                "risk.max_capital_deployed_pct",
                format!("{} outside [0.1, 100]", self.risk.max_capital_deployed_pct),
            ));
        }
        if self.risk.daily_loss_cap_usdt < 0.0 {
            return Err(invalid("risk.daily_loss_cap_usdt", "must be >= 0".into()));
        }
        if self.risk.emergency_stop_loss_pct <= 0.1 {
            return Err(invalid(
                "risk.emergency_stop_loss_pct",
                "must be > 0.1".into(),
            ));
        }
        if self.risk.max_orders_per_day == 0 {
            return Err(invalid("risk.max_orders_per_day", "must be >= 1".into()));
        }
        if self.risk.max_fee_pct < 0.0 {
            return Err(invalid("risk.max_fee_pct", "must be >= 0".into()));
        }
        if self.risk.slippage_tolerance_pct < 0.0 {
            return Err(invalid(
                "risk.slippage_tolerance_pct",
                "must be >= 0".into(),
            ));
        }
        Ok(())
    }
}

/// Loads and re-loads layered profile files from a config directory.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    config_dir: PathBuf,
    profile: String,
    override_file: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new(config_dir: impl AsRef<Path>, profile: &str) -> Self {
        ConfigLoader {
            config_dir: config_dir.as_ref().to_path_buf(),
            profile: profile.to_string(),
            override_file: None,
        }
    }

    pub fn with_override_file(mut self, path: impl AsRef<Path>) -> Self {
        self.override_file = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn load(&self) -> Result<Config, ConfigError> {
        let default_path = self.config_dir.join("default.json");
        if !default_path.exists() {
            return Err(ConfigError::MissingDefault(default_path));
        }
        let mut merged = read_json(&default_path)?;

        if self.profile != "default" {
            let profile_path = self.config_dir.join(format!("{}.json", self.profile));
            if profile_path.exists() {
                deep_merge(&mut merged, read_json(&profile_path)?);
            } else {
                warn!(path = %profile_path.display(), "profile config not found");
            }
        }

        if let Some(override_path) = &self.override_file {
            if override_path.exists() {
                deep_merge(&mut merged, read_json(override_path)?);
            }
        }

        apply_env_overrides(&mut merged);

        let config: Config = serde_json::from_value(merged).map_err(|source| {
            ConfigError::Parse {
                path: default_path.clone(),
                source,
            }
        })?;
        config.validate()?;

        info!(profile = %self.profile, "config loaded");
        Ok(config)
    }

    /// Spawn a background watcher that polls profile file mtimes and
    /// publishes new snapshots. A reload that fails validation keeps
    /// the prior snapshot in place.
    pub fn watch(
        self,
        initial: Arc<Config>,
        poll: std::time::Duration,
    ) -> watch::Receiver<Arc<Config>> {
        let (tx, rx) = watch::channel(initial);
        tokio::spawn(async move {
            let mut last_seen = self.latest_mtime();
            let mut ticker = tokio::time::interval(poll);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if tx.is_closed() {
                    break;
                }
                let current = self.latest_mtime();
                if current != last_seen {
                    last_seen = current;
                    match self.load() {
                        Ok(cfg) => {
                            info!("config file changed, new snapshot published");
                            let _ = tx.send(Arc::new(cfg));
                        }
                        Err(e) => warn!(error = %e, "config reload failed, keeping prior snapshot"),
                    }
                }
            }
        });
        rx
    }

    fn latest_mtime(&self) -> Option<SystemTime> {
        let mut paths = vec![self.config_dir.join("default.json")];
        if self.profile != "default" {
            paths.push(self.config_dir.join(format!("{}.json", self.profile)));
        }
        if let Some(p) = &self.override_file {
            paths.push(p.clone());
        }
        paths
            .iter()
            .filter_map(|p| std::fs::metadata(p).and_then(|m| m.modified()).ok())
            .max()
    }
}

fn read_json(path: &Path) -> Result<serde_json::Value, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Recursively merge `override_value` into `base`; objects merge key
/// by key, everything else replaces.
fn deep_merge(base: &mut serde_json::Value, override_value: serde_json::Value) {
    match (base, override_value) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(override_map)) => {
            for (key, value) in override_map {
                match base_map.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base_slot, value) => *base_slot = value,
    }
}

fn apply_env_overrides(cfg: &mut serde_json::Value) {
    let overrides: [(&str, &str, &str, bool); 6] = [
        ("GRIDAI_NUM_GRIDS", "grid", "num_grids", true),
        ("GRIDAI_ORDER_SIZE", "grid", "order_size_usdt", false),
        ("GRIDAI_MAX_DRAWDOWN", "risk", "max_drawdown_pct", false),
        ("GRIDAI_MAX_CAPITAL", "risk", "max_capital_deployed_pct", false),
        ("GRIDAI_DAILY_LOSS_CAP", "risk", "daily_loss_cap_usdt", false),
        ("GRIDAI_LOG_LEVEL", "logging", "level", false),
    ];

    for (env_key, section, key, is_integer) in overrides {
        let Ok(raw) = std::env::var(env_key) else {
            continue;
        };
        let value = if env_key == "GRIDAI_LOG_LEVEL" {
            serde_json::Value::String(raw)
        } else if is_integer {
            match raw.parse::<u64>() {
                Ok(n) => serde_json::Value::from(n),
                Err(_) => {
                    warn!(env = env_key, value = %raw, "ignoring unparsable env override");
                    continue;
                }
            }
        } else {
            match raw.parse::<f64>() {
                Ok(n) => serde_json::Value::from(n),
                Err(_) => {
                    warn!(env = env_key, value = %raw, "ignoring unparsable env override");
                    continue;
                }
            }
        };

        let Some(root) = cfg.as_object_mut() else {
            return;
        };
        let section_value = root
            .entry(section)
            .or_insert_with(|| serde_json::Value::Object(Default::default()));
        if let Some(obj) = section_value.as_object_mut() {
            obj.insert(key.to_string(), value);
        }
    }
}

fn default_recalibration_minutes() -> u64 {
    60
}

fn default_max_open_orders() -> usize {
    30
}

fn default_daily_loss_cap() -> f64 {
    500.0
}

fn default_emergency_stop_pct() -> f64 {
    20.0
}

fn default_max_orders_per_day() -> u32 {
    200
}

fn default_max_fee_pct() -> f64 {
    0.5
}

fn default_slippage_tolerance() -> f64 {
    0.1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            exchange: ExchangeConfig {
                name: "coinbase".into(),
                trading_pair: "BTC/USDT".into(),
                sandbox: false,
                api_key: None,
                api_secret: None,
            },
            grid: GridConfig {
                num_grids: 15,
                upper_bound_pct: 3.0,
                lower_bound_pct: 3.0,
                order_size_usdt: 50.0,
                recalibration_interval_minutes: 60,
                max_open_orders: 30,
            },
            risk: RiskConfig {
                max_drawdown_pct: 15.0,
                max_capital_deployed_pct: 50.0,
                daily_loss_cap_usdt: 500.0,
                emergency_stop_loss_pct: 20.0,
                max_orders_per_day: 200,
                max_fee_pct: 0.5,
                slippage_tolerance_pct: 0.1,
            },
            trend: TrendConfig::default(),
            regime: RegimeConfig::default(),
            live: LiveConfig::default(),
            paper: PaperConfig::default(),
            database: DatabaseConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn num_grids_range_enforced() {
        let mut cfg = base_config();
        cfg.grid.num_grids = 1;
        assert!(cfg.validate().is_err());
        cfg.grid.num_grids = 101;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn order_size_minimum_enforced() {
        let mut cfg = base_config();
        cfg.grid.order_size_usdt = 0.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn drawdown_range_enforced() {
        let mut cfg = base_config();
        cfg.risk.max_drawdown_pct = 150.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn deep_merge_overrides_nested_keys() {
        let mut base = serde_json::json!({
            "grid": {"num_grids": 15, "order_size_usdt": 50.0},
            "risk": {"max_drawdown_pct": 15.0}
        });
        deep_merge(
            &mut base,
            serde_json::json!({"grid": {"num_grids": 20}}),
        );
        assert_eq!(base["grid"]["num_grids"], 20);
        assert_eq!(base["grid"]["order_size_usdt"], 50.0);
        assert_eq!(base["risk"]["max_drawdown_pct"], 15.0);
    }

    #[test]
    fn env_overrides_apply() {
        std::env::set_var("GRIDAI_NUM_GRIDS", "25");
        let mut cfg = serde_json::json!({"grid": {"num_grids": 15}});
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg["grid"]["num_grids"], 25);
        std::env::remove_var("GRIDAI_NUM_GRIDS");
    }
}
