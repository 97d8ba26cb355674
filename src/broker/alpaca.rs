//! Alpaca REST client
//!
//! Implements [`BrokerPort`] against the Alpaca trading and market-data
//! APIs with:
//! - Automatic retry with exponential backoff for reads and cancels
//! - Rate limiting
//! - Circuit breaker pattern for fault tolerance
//!
//! Order placements are submitted exactly once: a timed-out POST may still
//! have created an order at the venue, so the caller reconciles instead of
//! the client retrying blind.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::sleep;

use super::types::*;
use super::BrokerPort;
use crate::common::{CircuitBreaker, CircuitBreakerConfig, RateLimiter, RateLimiterConfig};

/// Default base URL for the paper-trading API
pub const PAPER_TRADING_URL: &str = "https://paper-api.alpaca.markets";

/// Default base URL for market data
pub const MARKET_DATA_URL: &str = "https://data.alpaca.markets";

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Trading API base URL
    pub trading_url: String,
    /// Market-data API base URL
    pub data_url: String,
    /// Maximum retry attempts for idempotent calls
    pub max_retries: u32,
    /// Per-request timeout
    pub timeout: Duration,
    /// Rate limiter configuration
    pub rate_limiter: RateLimiterConfig,
    /// Circuit breaker configuration
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            trading_url: PAPER_TRADING_URL.to_string(),
            data_url: MARKET_DATA_URL.to_string(),
            max_retries: 3,
            timeout: Duration::from_secs(10),
            rate_limiter: RateLimiterConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn with_trading_url(mut self, url: impl Into<String>) -> Self {
        self.trading_url = url.into();
        self
    }

    pub fn with_data_url(mut self, url: impl Into<String>) -> Self {
        self.data_url = url.into();
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set rate limit in requests per second
    pub fn with_rate_limit(mut self, requests_per_second: usize) -> Self {
        self.rate_limiter = self.rate_limiter.with_rate(requests_per_second);
        self
    }
}

/// Alpaca brokerage API client
#[derive(Clone)]
pub struct AlpacaClient {
    key_id: String,
    secret_key: String,
    trading_url: String,
    data_url: String,
    http: Client,
    circuit_breaker: Arc<Mutex<CircuitBreaker>>,
    rate_limiter: RateLimiter,
    max_retries: u32,
}

impl AlpacaClient {
    /// Create a client with default configuration (paper trading)
    pub fn new(key_id: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self::with_config(key_id, secret_key, ClientConfig::default())
    }

    /// Create a client with custom configuration
    pub fn with_config(
        key_id: impl Into<String>,
        secret_key: impl Into<String>,
        config: ClientConfig,
    ) -> Self {
        let http = Client::builder()
            .timeout(config.timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .expect("Failed to build HTTP client");

        Self {
            key_id: key_id.into(),
            secret_key: secret_key.into(),
            trading_url: config.trading_url,
            data_url: config.data_url,
            http,
            circuit_breaker: Arc::new(Mutex::new(CircuitBreaker::new(config.circuit_breaker))),
            rate_limiter: RateLimiter::new(config.rate_limiter),
            max_retries: config.max_retries,
        }
    }

    /// Create a client from `APCA_API_KEY_ID` / `APCA_API_SECRET_KEY`
    pub fn from_env() -> Result<Self, std::env::VarError> {
        let key_id = std::env::var("APCA_API_KEY_ID")?;
        let secret_key = std::env::var("APCA_API_SECRET_KEY")?;
        Ok(Self::new(key_id, secret_key))
    }

    fn auth(&self, rb: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        rb.header("APCA-API-KEY-ID", &self.key_id)
            .header("APCA-API-SECRET-KEY", &self.secret_key)
    }

    /// Send one request, folding transport failures into `Transient`
    async fn send(
        &self,
        rb: reqwest::RequestBuilder,
    ) -> Result<(StatusCode, String), BrokerError> {
        let response = rb
            .send()
            .await
            .map_err(|e| BrokerError::Transient(e.to_string()))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| BrokerError::Transient(e.to_string()))?;
        Ok((status, text))
    }

    /// Run an idempotent operation under the circuit breaker and rate
    /// limiter, retrying transient failures with exponential backoff.
    async fn execute_with_retry<F, Fut, T>(&self, operation: F) -> Result<T, BrokerError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, BrokerError>>,
    {
        {
            let mut cb = self.circuit_breaker.lock().await;
            if !cb.can_attempt() {
                return Err(BrokerError::Transient(
                    "circuit breaker open, rejecting request".to_string(),
                ));
            }
        }

        self.rate_limiter.acquire().await;

        let mut last_error = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s...
                let delay = Duration::from_secs(2u64.pow(attempt - 1));
                tracing::debug!("retrying after {}ms", delay.as_millis());
                sleep(delay).await;
            }

            match operation().await {
                Ok(result) => {
                    let mut cb = self.circuit_breaker.lock().await;
                    cb.record_success();
                    return Ok(result);
                }
                Err(e) if e.is_transient() => {
                    tracing::warn!(
                        "broker call failed (attempt {}/{}): {}",
                        attempt + 1,
                        self.max_retries + 1,
                        e
                    );
                    last_error = Some(e);
                }
                Err(e) => {
                    // A definitive refusal still means the venue answered
                    let mut cb = self.circuit_breaker.lock().await;
                    cb.record_success();
                    return Err(e);
                }
            }
        }

        {
            let mut cb = self.circuit_breaker.lock().await;
            cb.record_failure();
        }

        Err(last_error
            .unwrap_or_else(|| BrokerError::Transient("retries exhausted".to_string())))
    }

    /// Current circuit breaker state
    pub async fn circuit_breaker_state(&self) -> crate::common::CircuitState {
        let cb = self.circuit_breaker.lock().await;
        cb.state()
    }
}

#[async_trait]
impl BrokerPort for AlpacaClient {
    async fn place_order(&self, req: &OrderRequest) -> Result<PlacedOrder, BrokerError> {
        {
            let mut cb = self.circuit_breaker.lock().await;
            if !cb.can_attempt() {
                return Err(BrokerError::Transient(
                    "circuit breaker open, rejecting request".to_string(),
                ));
            }
        }
        self.rate_limiter.acquire().await;

        let url = format!("{}/v2/orders", self.trading_url);
        let body = order_body(req);

        let result = async {
            let (status, text) = self.send(self.auth(self.http.post(&url)).json(&body)).await?;
            if status.is_success() {
                let order: AlpacaOrder = serde_json::from_str(&text).map_err(|e| {
                    // The order may exist even though we could not read the ack
                    BrokerError::Transient(format!("unreadable order ack: {}", e))
                })?;
                Ok(PlacedOrder {
                    id: order.id.clone(),
                    status: order.status_enum(),
                })
            } else {
                Err(map_error_status(status, &text))
            }
        }
        .await;

        let mut cb = self.circuit_breaker.lock().await;
        match &result {
            Ok(_) => cb.record_success(),
            Err(e) if e.is_transient() => cb.record_failure(),
            Err(_) => cb.record_success(),
        }
        result
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), BrokerError> {
        let url = format!("{}/v2/orders/{}", self.trading_url, order_id);
        self.execute_with_retry(|| {
            let url = url.clone();
            async move {
                let (status, text) = self.send(self.auth(self.http.delete(&url))).await?;
                match status {
                    StatusCode::OK | StatusCode::NO_CONTENT => Ok(()),
                    StatusCode::NOT_FOUND => Err(BrokerError::NotFound),
                    StatusCode::UNPROCESSABLE_ENTITY => Err(BrokerError::AlreadyTerminal),
                    _ => Err(map_error_status(status, &text)),
                }
            }
        })
        .await
    }

    async fn get_order(&self, order_id: &str) -> Result<OrderSnapshot, BrokerError> {
        let url = format!("{}/v2/orders/{}", self.trading_url, order_id);
        self.execute_with_retry(|| {
            let url = url.clone();
            async move {
                let (status, text) = self.send(self.auth(self.http.get(&url))).await?;
                if status == StatusCode::NOT_FOUND {
                    return Err(BrokerError::NotFound);
                }
                if !status.is_success() {
                    return Err(map_error_status(status, &text));
                }
                let order: AlpacaOrder = serde_json::from_str(&text)
                    .map_err(|e| BrokerError::Transient(format!("unreadable order: {}", e)))?;
                Ok(order.into_snapshot())
            }
        })
        .await
    }

    async fn latest_quote(&self, symbol: &str) -> Result<Quote, BrokerError> {
        let url = format!("{}/v2/stocks/{}/quotes/latest", self.data_url, symbol);
        self.execute_with_retry(|| {
            let url = url.clone();
            async move {
                let (status, text) = self.send(self.auth(self.http.get(&url))).await?;
                if status == StatusCode::NOT_FOUND {
                    return Err(BrokerError::NotFound);
                }
                if !status.is_success() {
                    return Err(map_error_status(status, &text));
                }
                let parsed: LatestQuoteResponse = serde_json::from_str(&text)
                    .map_err(|e| BrokerError::Transient(format!("unreadable quote: {}", e)))?;
                Ok(Quote {
                    bid: parsed.quote.bid,
                    ask: parsed.quote.ask,
                    ts: parsed.quote.ts,
                })
            }
        })
        .await
    }
}

/// Map a non-success HTTP status to the normalized error taxonomy
fn map_error_status(status: StatusCode, body: &str) -> BrokerError {
    match status {
        StatusCode::NOT_FOUND => BrokerError::NotFound,
        StatusCode::FORBIDDEN | StatusCode::UNPROCESSABLE_ENTITY | StatusCode::BAD_REQUEST => {
            BrokerError::Rejected {
                reason: extract_reason(body),
            }
        }
        _ => BrokerError::Transient(format!("HTTP {}: {}", status, extract_reason(body))),
    }
}

fn extract_reason(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(String::from))
        .unwrap_or_else(|| body.chars().take(200).collect())
}

/// Build the order JSON body (prices and quantities go over the wire as
/// strings)
fn order_body(req: &OrderRequest) -> serde_json::Value {
    let mut body = serde_json::json!({
        "symbol": req.symbol,
        "qty": format!("{}", req.qty),
        "side": req.side.to_string(),
        "type": req.kind.to_string(),
        "time_in_force": req.time_in_force.to_string(),
    });
    if let Some(p) = req.limit_price {
        body["limit_price"] = serde_json::json!(format!("{}", p));
    }
    if let Some(p) = req.stop_price {
        body["stop_price"] = serde_json::json!(format!("{}", p));
    }
    body
}

/// Wire representation of an order
#[derive(Debug, Clone, Deserialize)]
struct AlpacaOrder {
    id: String,
    status: String,
    #[serde(default)]
    filled_qty: Option<String>,
    #[serde(default)]
    filled_avg_price: Option<String>,
    #[serde(default)]
    submitted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    filled_at: Option<DateTime<Utc>>,
}

impl AlpacaOrder {
    fn status_enum(&self) -> OrderStatus {
        match self.status.as_str() {
            "new" | "accepted" | "pending_new" | "accepted_for_bidding" | "calculated"
            | "pending_cancel" | "pending_replace" => OrderStatus::Accepted,
            "partially_filled" => OrderStatus::PartiallyFilled,
            "filled" => OrderStatus::Filled,
            "canceled" | "done_for_day" | "replaced" | "stopped" | "suspended" => {
                OrderStatus::Canceled
            }
            "expired" => OrderStatus::Expired,
            "rejected" => OrderStatus::Rejected,
            _ => OrderStatus::Pending,
        }
    }

    fn into_snapshot(self) -> OrderSnapshot {
        let status = self.status_enum();
        OrderSnapshot {
            id: self.id,
            status,
            filled_qty: self
                .filled_qty
                .as_deref()
                .and_then(|q| q.parse().ok())
                .unwrap_or(0.0),
            fill_avg_price: self.filled_avg_price.as_deref().and_then(|p| p.parse().ok()),
            submitted_at: self.submitted_at,
            filled_at: self.filled_at,
        }
    }
}

#[derive(Debug, Deserialize)]
struct LatestQuoteResponse {
    quote: AlpacaQuote,
}

#[derive(Debug, Deserialize)]
struct AlpacaQuote {
    #[serde(rename = "bp")]
    bid: f64,
    #[serde(rename = "ap")]
    ask: f64,
    #[serde(rename = "t")]
    ts: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_default() {
        let config = ClientConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.timeout, Duration::from_secs(10));
        assert_eq!(config.trading_url, PAPER_TRADING_URL);
    }

    #[test]
    fn test_client_config_builder() {
        let config = ClientConfig::default()
            .with_trading_url("https://api.example.test")
            .with_max_retries(5)
            .with_timeout(Duration::from_secs(30))
            .with_rate_limit(20);

        assert_eq!(config.trading_url, "https://api.example.test");
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.rate_limiter.max_requests_per_second, 20);
    }

    #[test]
    fn test_client_creation() {
        let client = AlpacaClient::new("key", "secret");
        assert_eq!(client.max_retries, 3);
    }

    #[test]
    fn test_status_mapping() {
        let mut order = AlpacaOrder {
            id: "o-1".to_string(),
            status: "new".to_string(),
            filled_qty: None,
            filled_avg_price: None,
            submitted_at: None,
            filled_at: None,
        };
        assert_eq!(order.status_enum(), OrderStatus::Accepted);

        order.status = "partially_filled".to_string();
        assert_eq!(order.status_enum(), OrderStatus::PartiallyFilled);

        order.status = "filled".to_string();
        assert_eq!(order.status_enum(), OrderStatus::Filled);

        order.status = "rejected".to_string();
        assert_eq!(order.status_enum(), OrderStatus::Rejected);

        order.status = "something_else".to_string();
        assert_eq!(order.status_enum(), OrderStatus::Pending);
    }

    #[test]
    fn test_snapshot_parses_string_fills() {
        let order = AlpacaOrder {
            id: "o-2".to_string(),
            status: "filled".to_string(),
            filled_qty: Some("10".to_string()),
            filled_avg_price: Some("100.25".to_string()),
            submitted_at: None,
            filled_at: None,
        };
        let snap = order.into_snapshot();
        assert_eq!(snap.filled_qty, 10.0);
        assert_eq!(snap.fill_avg_price, Some(100.25));
    }

    #[test]
    fn test_order_body_shape() {
        let req = OrderRequest::stop(OrderSide::Sell, "SPY", 10.0, 95.0, TimeInForce::Gtc);
        let body = order_body(&req);
        assert_eq!(body["symbol"], "SPY");
        assert_eq!(body["qty"], "10");
        assert_eq!(body["side"], "sell");
        assert_eq!(body["type"], "stop");
        assert_eq!(body["time_in_force"], "gtc");
        assert_eq!(body["stop_price"], "95");
        assert!(body.get("limit_price").is_none());
    }

    #[test]
    fn test_error_status_mapping() {
        assert!(matches!(
            map_error_status(StatusCode::UNPROCESSABLE_ENTITY, "{\"message\":\"bad qty\"}"),
            BrokerError::Rejected { .. }
        ));
        assert!(matches!(
            map_error_status(StatusCode::NOT_FOUND, ""),
            BrokerError::NotFound
        ));
        assert!(map_error_status(StatusCode::INTERNAL_SERVER_ERROR, "oops").is_transient());
        assert!(map_error_status(StatusCode::TOO_MANY_REQUESTS, "slow down").is_transient());
    }
}
