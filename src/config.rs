//! Configuration management
//!
//! Handles loading and parsing of JSON configuration files with environment
//! variable support for broker credentials.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

impl Config {
    /// Load configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref()).context("Failed to read config file")?;
        let mut config: Config =
            serde_json::from_str(&contents).context("Failed to parse config JSON")?;

        // Load API credentials from environment if not set
        if let Ok(key_id) = std::env::var("APCA_API_KEY_ID") {
            config.broker.api_key = Some(key_id);
        }
        if let Ok(secret) = std::env::var("APCA_API_SECRET_KEY") {
            config.broker.api_secret = Some(secret);
        }

        Ok(config)
    }

    /// Stable fingerprint of the non-secret configuration, recorded in the
    /// store so recovery can warn when the config changed under saved state.
    pub fn fingerprint(&self) -> String {
        let mut scrubbed = self.clone();
        scrubbed.broker.api_key = None;
        scrubbed.broker.api_secret = None;

        let serialized = serde_json::to_string(&scrubbed).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(serialized.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Brokerage connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_secret: Option<String>,
    /// Trading API base URL
    pub trading_url: String,
    /// Market-data API base URL
    pub data_url: String,
    /// Requests per second against the broker API
    pub rate_limit: u32,
    /// Per-call timeout in seconds
    pub timeout_secs: u64,
    /// Retry attempts for idempotent calls
    pub max_retries: u32,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig {
            api_key: None,
            api_secret: None,
            trading_url: "https://paper-api.alpaca.markets".to_string(),
            data_url: "https://data.alpaca.markets".to_string(),
            rate_limit: 10,
            timeout_secs: 10,
            max_retries: 3,
        }
    }
}

/// Supervisor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Seconds between reconciliation passes
    pub poll_interval_secs: u64,
    /// Pending records older than this are hidden from default list views
    pub pending_stale_hours: i64,
    /// Upper bound of the deterministic per-position poll jitter
    pub poll_jitter_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            poll_interval_secs: 10,
            pending_stale_hours: 24,
            poll_jitter_ms: 1000,
        }
    }
}

/// Persistence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database path
    pub db_path: String,
    /// Write a JSON snapshot next to the database after each mutation
    pub json_backup: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            db_path: "state/positions.db".to_string(),
            json_backup: true,
        }
    }
}
