//! Venue adapter
//!
//! The single seam between the engine and the outside world. The
//! [`Venue`] trait covers market data and order endpoints; `RestVenue`
//! implements it over the exchange's REST API with HMAC-SHA256 request
//! signing. Tests and the backtester provide their own implementations.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::warn;

use crate::config::ExchangeConfig;
use crate::monitor::Monitor;
use crate::types::{Candle, Ticker};

type HmacSha256 = Hmac<Sha256>;

const API_BASE_URL: &str = "https://api.exchange.gridai.dev";
const SANDBOX_BASE_URL: &str = "https://api-sandbox.exchange.gridai.dev";

/// Venue failures, split by whether a retry can help.
///
/// Transient errors (timeouts, rate limiting, 5xx) are retried by the
/// order manager; permanent errors (auth, malformed request,
/// insufficient funds) surface immediately.
#[derive(Debug, Error)]
pub enum VenueError {
    #[error("transient venue error: {0}")]
    Transient(String),

    #[error("permanent venue error: {0}")]
    Permanent(String),
}

impl VenueError {
    pub fn is_transient(&self) -> bool {
        matches!(self, VenueError::Transient(_))
    }
}

/// Acknowledgement returned by order placement.
#[derive(Debug, Clone, Deserialize)]
pub struct OrderAck {
    pub id: String,
    pub status: String,
}

/// An order as the venue reports it.
#[derive(Debug, Clone)]
pub struct VenueOrder {
    pub id: String,
    pub status: String,
    pub fee: Option<f64>,
}

/// Market-data and order endpoints of a spot trading venue.
#[async_trait]
pub trait Venue: Send + Sync {
    async fn fetch_ticker(&self) -> Result<Ticker, VenueError>;

    async fn fetch_recent_ohlcv(
        &self,
        timeframe: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, VenueError>;

    async fn place_limit_buy(&self, amount: f64, price: f64) -> Result<OrderAck, VenueError>;

    async fn place_limit_sell(&self, amount: f64, price: f64) -> Result<OrderAck, VenueError>;

    async fn cancel_order(&self, order_id: &str) -> Result<(), VenueError>;

    async fn fetch_order(&self, order_id: &str) -> Result<VenueOrder, VenueError>;

    async fn fetch_open_orders(&self) -> Result<Vec<VenueOrder>, VenueError>;
}

/// REST implementation of [`Venue`].
pub struct RestVenue {
    client: reqwest::Client,
    base_url: String,
    symbol: String,
    api_key: String,
    api_secret: String,
    monitor: Option<Arc<Monitor>>,
}

impl RestVenue {
    pub fn new(cfg: &ExchangeConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .expect("failed to build HTTP client");

        let base_url = if cfg.sandbox {
            SANDBOX_BASE_URL
        } else {
            API_BASE_URL
        };

        RestVenue {
            client,
            base_url: base_url.to_string(),
            symbol: cfg.trading_pair.replace('/', ""),
            api_key: cfg.api_key.clone().unwrap_or_default(),
            api_secret: cfg.api_secret.clone().unwrap_or_default(),
            monitor: None,
        }
    }

    pub fn with_monitor(mut self, monitor: Arc<Monitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    fn sign(&self, payload: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .expect("HMAC accepts keys of any size");
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn record_call(&self, started: Instant, ok: bool) {
        if let Some(monitor) = &self.monitor {
            monitor.set_api_latency_ms(started.elapsed().as_millis() as u64);
            monitor.set_exchange_connected(ok);
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, VenueError> {
        let started = Instant::now();
        let url = format!("{}{}", self.base_url, path);
        let result = self.client.get(&url).query(query).send().await;
        let response = match result {
            Ok(r) => r,
            Err(e) => {
                self.record_call(started, false);
                return Err(map_reqwest_error(e));
            }
        };
        let response = match check_status(response) {
            Ok(r) => r,
            Err(e) => {
                self.record_call(started, false);
                return Err(e);
            }
        };
        self.record_call(started, true);
        response
            .json::<T>()
            .await
            .map_err(|e| VenueError::Permanent(format!("failed to parse response: {e}")))
    }

    async fn signed_request<T: serde::de::DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        mut query: Vec<(&'static str, String)>,
    ) -> Result<T, VenueError> {
        let started = Instant::now();
        query.push(("timestamp", Utc::now().timestamp_millis().to_string()));
        let payload = query
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        let signature = self.sign(&payload);
        query.push(("signature", signature));

        let url = format!("{}{}", self.base_url, path);
        let result = self
            .client
            .request(method, &url)
            .header("X-API-KEY", &self.api_key)
            .query(&query)
            .send()
            .await;
        let response = match result {
            Ok(r) => r,
            Err(e) => {
                self.record_call(started, false);
                return Err(map_reqwest_error(e));
            }
        };
        let response = match check_status(response) {
            Ok(r) => r,
            Err(e) => {
                self.record_call(started, false);
                return Err(e);
            }
        };
        self.record_call(started, true);
        response
            .json::<T>()
            .await
            .map_err(|e| VenueError::Permanent(format!("failed to parse response: {e}")))
    }
}

fn map_reqwest_error(e: reqwest::Error) -> VenueError {
    if e.is_timeout() || e.is_connect() || e.is_request() {
        VenueError::Transient(e.to_string())
    } else {
        VenueError::Permanent(e.to_string())
    }
}

fn check_status(response: reqwest::Response) -> Result<reqwest::Response, VenueError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else if status.as_u16() == 429 || status.is_server_error() {
        Err(VenueError::Transient(format!("HTTP {status}")))
    } else {
        Err(VenueError::Permanent(format!("HTTP {status}")))
    }
}

#[derive(Debug, Deserialize)]
struct TickerResponse {
    last_price: String,
    bid: String,
    ask: String,
}

#[derive(Debug, Deserialize)]
struct VenueOrderResponse {
    id: String,
    status: String,
    #[serde(default)]
    fee: Option<FeeInfo>,
}

#[derive(Debug, Deserialize)]
struct FeeInfo {
    cost: f64,
}

#[async_trait]
impl Venue for RestVenue {
    async fn fetch_ticker(&self) -> Result<Ticker, VenueError> {
        let response: TickerResponse = self
            .get_json("/api/v1/ticker", &[("symbol", self.symbol.clone())])
            .await?;

        let last: f64 = response
            .last_price
            .parse()
            .map_err(|_| VenueError::Permanent("unparsable last price".into()))?;
        Ok(Ticker {
            last,
            bid: response.bid.parse().unwrap_or(last),
            ask: response.ask.parse().unwrap_or(last),
            timestamp: Utc::now(),
        })
    }

    async fn fetch_recent_ohlcv(
        &self,
        timeframe: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, VenueError> {
        let rows: Vec<Vec<serde_json::Value>> = self
            .get_json(
                "/api/v1/klines",
                &[
                    ("symbol", self.symbol.clone()),
                    ("interval", timeframe.to_string()),
                    ("limit", limit.to_string()),
                ],
            )
            .await?;

        let mut candles = Vec::with_capacity(rows.len());
        for row in rows {
            let Some(candle) = parse_kline_row(&row) else {
                warn!("skipping malformed kline row");
                continue;
            };
            candles.push(candle);
        }
        Ok(candles)
    }

    async fn place_limit_buy(&self, amount: f64, price: f64) -> Result<OrderAck, VenueError> {
        self.signed_request(
            reqwest::Method::POST,
            "/api/v1/order",
            vec![
                ("symbol", self.symbol.clone()),
                ("side", "buy".to_string()),
                ("type", "limit".to_string()),
                ("quantity", format!("{amount:.8}")),
                ("price", format!("{price:.2}")),
            ],
        )
        .await
    }

    async fn place_limit_sell(&self, amount: f64, price: f64) -> Result<OrderAck, VenueError> {
        self.signed_request(
            reqwest::Method::POST,
            "/api/v1/order",
            vec![
                ("symbol", self.symbol.clone()),
                ("side", "sell".to_string()),
                ("type", "limit".to_string()),
                ("quantity", format!("{amount:.8}")),
                ("price", format!("{price:.2}")),
            ],
        )
        .await
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), VenueError> {
        let _: serde_json::Value = self
            .signed_request(
                reqwest::Method::DELETE,
                "/api/v1/order",
                vec![
                    ("symbol", self.symbol.clone()),
                    ("orderId", order_id.to_string()),
                ],
            )
            .await?;
        Ok(())
    }

    async fn fetch_order(&self, order_id: &str) -> Result<VenueOrder, VenueError> {
        let response: VenueOrderResponse = self
            .signed_request(
                reqwest::Method::GET,
                "/api/v1/order",
                vec![
                    ("symbol", self.symbol.clone()),
                    ("orderId", order_id.to_string()),
                ],
            )
            .await?;
        Ok(VenueOrder {
            id: response.id,
            status: response.status,
            fee: response.fee.map(|f| f.cost),
        })
    }

    async fn fetch_open_orders(&self) -> Result<Vec<VenueOrder>, VenueError> {
        let response: Vec<VenueOrderResponse> = self
            .signed_request(
                reqwest::Method::GET,
                "/api/v1/openOrders",
                vec![("symbol", self.symbol.clone())],
            )
            .await?;
        Ok(response
            .into_iter()
            .map(|o| VenueOrder {
                id: o.id,
                status: o.status,
                fee: o.fee.map(|f| f.cost),
            })
            .collect())
    }
}

fn parse_kline_row(row: &[serde_json::Value]) -> Option<Candle> {
    if row.len() < 6 {
        return None;
    }
    let ts_ms = row[0].as_i64()?;
    let timestamp: DateTime<Utc> = Utc.timestamp_millis_opt(ts_ms).single()?;
    let field = |v: &serde_json::Value| -> Option<f64> {
        v.as_f64().or_else(|| v.as_str()?.parse().ok())
    };
    Candle::new(
        timestamp,
        field(&row[1])?,
        field(&row[2])?,
        field(&row[3])?,
        field(&row[4])?,
        field(&row[5])?,
    )
    .ok()
}
