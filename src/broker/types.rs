//! Normalized order and quote types for the brokerage boundary
//!
//! The engine speaks this vocabulary regardless of the venue behind the
//! port; venue clients translate to and from their wire formats.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::Side;

/// Order direction at the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(&self) -> OrderSide {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "buy"),
            OrderSide::Sell => write!(f, "sell"),
        }
    }
}

/// The order side that opens a position on the given side
impl From<Side> for OrderSide {
    fn from(side: Side) -> Self {
        match side {
            Side::Long => OrderSide::Buy,
            Side::Short => OrderSide::Sell,
        }
    }
}

/// Order pricing discipline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderKind {
    Market,
    Limit,
    Stop,
}

impl std::fmt::Display for OrderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderKind::Market => write!(f, "market"),
            OrderKind::Limit => write!(f, "limit"),
            OrderKind::Stop => write!(f, "stop"),
        }
    }
}

/// Order lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeInForce {
    Day,
    Gtc,
}

impl std::fmt::Display for TimeInForce {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeInForce::Day => write!(f, "day"),
            TimeInForce::Gtc => write!(f, "gtc"),
        }
    }
}

/// Broker-reported order status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Accepted,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
}

impl OrderStatus {
    /// A terminal order accepts no further fills or cancels
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Rejected | OrderStatus::Expired
        )
    }
}

/// A normalized order submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub qty: f64,
    pub side: OrderSide,
    pub kind: OrderKind,
    pub time_in_force: TimeInForce,
    pub limit_price: Option<f64>,
    pub stop_price: Option<f64>,
}

impl OrderRequest {
    pub fn market(side: OrderSide, symbol: &str, qty: f64, tif: TimeInForce) -> Self {
        Self {
            symbol: symbol.to_string(),
            qty,
            side,
            kind: OrderKind::Market,
            time_in_force: tif,
            limit_price: None,
            stop_price: None,
        }
    }

    pub fn limit(side: OrderSide, symbol: &str, qty: f64, limit_price: f64, tif: TimeInForce) -> Self {
        Self {
            symbol: symbol.to_string(),
            qty,
            side,
            kind: OrderKind::Limit,
            time_in_force: tif,
            limit_price: Some(limit_price),
            stop_price: None,
        }
    }

    pub fn stop(side: OrderSide, symbol: &str, qty: f64, stop_price: f64, tif: TimeInForce) -> Self {
        Self {
            symbol: symbol.to_string(),
            qty,
            side,
            kind: OrderKind::Stop,
            time_in_force: tif,
            limit_price: None,
            stop_price: Some(stop_price),
        }
    }
}

/// Acknowledgment returned by a successful placement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlacedOrder {
    pub id: String,
    pub status: OrderStatus,
}

/// Broker view of one order, observed via polling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSnapshot {
    pub id: String,
    pub status: OrderStatus,
    pub filled_qty: f64,
    pub fill_avg_price: Option<f64>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub filled_at: Option<DateTime<Utc>>,
}

/// Latest top-of-book quote
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub bid: f64,
    pub ask: f64,
    pub ts: DateTime<Utc>,
}

impl Quote {
    /// Price used to size an entry: the side the entry would take from the
    /// book, falling back to the other side of a one-sided quote.
    pub fn entry_price(&self, side: Side) -> Option<f64> {
        let price = match side {
            Side::Long => {
                if self.ask > 0.0 {
                    self.ask
                } else {
                    self.bid
                }
            }
            Side::Short => {
                if self.bid > 0.0 {
                    self.bid
                } else {
                    self.ask
                }
            }
        };
        (price > 0.0).then_some(price)
    }

    /// Price used to mark an open position: what the exit would realize
    pub fn mark(&self, side: Side) -> Option<f64> {
        let price = match side {
            Side::Long => {
                if self.bid > 0.0 {
                    self.bid
                } else {
                    self.ask
                }
            }
            Side::Short => {
                if self.ask > 0.0 {
                    self.ask
                } else {
                    self.bid
                }
            }
        };
        (price > 0.0).then_some(price)
    }
}

/// Failures at the brokerage boundary
#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    /// Permanent refusal; retrying the same request cannot succeed
    #[error("rejected by broker: {reason}")]
    Rejected { reason: String },

    /// The broker does not know the order (or symbol)
    #[error("not found at broker")]
    NotFound,

    /// Cancel raced a fill or an earlier cancel; the order is already done
    #[error("order already terminal")]
    AlreadyTerminal,

    /// Network trouble, timeout, or a 5xx; safe to retry later
    #[error("transient broker failure: {0}")]
    Transient(String),
}

impl BrokerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BrokerError::Transient(_))
    }
}
