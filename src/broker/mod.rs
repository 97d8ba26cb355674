//! Brokerage boundary
//!
//! [`BrokerPort`] is the only seam between the engine and the venue. The
//! broker is the authoritative source of truth for order state: whatever the
//! engine believes, an observed broker value wins. Implementations must be
//! thread-safe; every call may be slow and may fail.

use async_trait::async_trait;

pub mod alpaca;
pub mod types;

pub use alpaca::{AlpacaClient, ClientConfig};
pub use types::{
    BrokerError, OrderKind, OrderRequest, OrderSide, OrderSnapshot, OrderStatus, PlacedOrder,
    Quote, TimeInForce,
};

/// Capability set the engine requires of any venue
#[async_trait]
pub trait BrokerPort: Send + Sync {
    /// Submit a normalized order. A `Rejected` error is permanent; a
    /// `Transient` error leaves the outcome unknown (the order may exist).
    async fn place_order(&self, req: &OrderRequest) -> Result<PlacedOrder, BrokerError>;

    /// Cancel by broker order id. Callers treat `NotFound` and
    /// `AlreadyTerminal` as success.
    async fn cancel_order(&self, order_id: &str) -> Result<(), BrokerError>;

    /// Current broker view of one order
    async fn get_order(&self, order_id: &str) -> Result<OrderSnapshot, BrokerError>;

    /// Latest top-of-book quote for a symbol
    async fn latest_quote(&self, symbol: &str) -> Result<Quote, BrokerError>;
}
