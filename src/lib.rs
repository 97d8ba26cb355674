//! Trade Sentinel
//!
//! An automated managed-position engine for a brokerage account: plans
//! bracketed entries (entry + stop-loss + take-profit + optional partial
//! exit), submits them in order, reconciles broker state on a timer, and
//! persists every transition so a restart resumes management without
//! duplicating or orphaning broker orders.

pub mod broker;
pub mod common;
pub mod config;
pub mod engine;
pub mod error;
pub mod risk;
pub mod store;
pub mod types;

pub use broker::{AlpacaClient, BrokerPort};
pub use config::Config;
pub use engine::Engine;
pub use error::{EngineError, StoreError};
pub use store::PositionStore;
pub use types::*;
