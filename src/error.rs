//! Engine-surface error kinds
//!
//! Broker failures carry their own taxonomy in [`crate::broker::BrokerError`];
//! everything here is what callers of the engine see.

use thiserror::Error;

use crate::broker::BrokerError;

/// Persistence failures. A failed store write aborts the in-flight
/// transition; the record stays in its pre-transition state and the
/// supervisor retries on the next pass.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("state encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("state file error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by the engine gateway operations
#[derive(Debug, Error)]
pub enum EngineError {
    /// Request shape or value violation; no record is created
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Sizing produced zero shares; no record is created
    #[error("allocation {allocation:.2} buys zero shares at {price:.2}")]
    AllocationBelowPrice { allocation: f64, price: f64 },

    #[error("position {0} not found")]
    NotFound(i64),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
