//! Core data types for managed positions

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Position direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Long => "long",
            Side::Short => "short",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "long" => Ok(Side::Long),
            "short" => Ok(Side::Short),
            other => Err(format!("unknown side: {}", other)),
        }
    }
}

/// How the entry order is priced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStrategy {
    Market,
    Limit,
}

impl EntryStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStrategy::Market => "market",
            EntryStrategy::Limit => "limit",
        }
    }
}

impl std::str::FromStr for EntryStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "market" => Ok(EntryStrategy::Market),
            "limit" => Ok(EntryStrategy::Limit),
            other => Err(format!("unknown entry strategy: {}", other)),
        }
    }
}

/// Managed-position state machine
///
/// Transitions move along a DAG: Pending -> {Active, Failed},
/// Active -> {Partial, Closed, StoppedOut}, Partial -> {Partial, Closed,
/// StoppedOut}. Closed, StoppedOut and Failed are sinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    /// Entry order planned or submitted, not yet filled
    Pending,
    /// Entry filled; protective orders live
    Active,
    /// A partial-exit order filled; reduced size still protected
    Partial,
    /// Exited via take-profit or manual close
    Closed,
    /// Exited via stop-loss
    StoppedOut,
    /// Entry rejected/cancelled before fill, or an internal invariant broke
    Failed,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Pending => "pending",
            PositionStatus::Active => "active",
            PositionStatus::Partial => "partial",
            PositionStatus::Closed => "closed",
            PositionStatus::StoppedOut => "stopped_out",
            PositionStatus::Failed => "failed",
        }
    }

    /// Terminal statuses never change again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PositionStatus::Closed | PositionStatus::StoppedOut | PositionStatus::Failed
        )
    }
}

impl std::fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PositionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PositionStatus::Pending),
            "active" => Ok(PositionStatus::Active),
            "partial" => Ok(PositionStatus::Partial),
            "closed" => Ok(PositionStatus::Closed),
            "stopped_out" => Ok(PositionStatus::StoppedOut),
            "failed" => Ok(PositionStatus::Failed),
            other => Err(format!("unknown position status: {}", other)),
        }
    }
}

/// Filter for listing positions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusFilter {
    /// Everything except stale pending records (the default list view)
    Default,
    /// Every record regardless of status or age
    All,
    /// Records not in a terminal status
    NonTerminal,
    /// Records with exactly this status
    Status(PositionStatus),
}

impl std::str::FromStr for StatusFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" => Ok(StatusFilter::Default),
            "all" => Ok(StatusFilter::All),
            other => other.parse().map(StatusFilter::Status),
        }
    }
}

/// Planned partial exit: sell a fraction of the position once the price
/// reaches the trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialExit {
    /// Fraction of the planned quantity to exit, in (0, 1)
    pub fraction: f64,
    /// Favorable move from entry that triggers the exit, in percent
    pub trigger_percent: f64,
    /// Absolute trigger price, resolved against the actual fill
    pub trigger_price: f64,
    /// Broker ids of partial-exit orders submitted for this position
    #[serde(default)]
    pub order_ids: Vec<String>,
}

/// The single core entity: a position under engine management together with
/// its bracket of protective orders.
///
/// The supervisor exclusively owns mutation; everything else reads snapshots.
/// Broker-observed values win over planned ones: `entry_price` is replaced by
/// the fill average once the entry completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagedPosition {
    /// Engine-assigned id, monotonic with creation time
    pub id: i64,
    pub symbol: String,
    pub side: Side,
    pub strategy_tag: String,

    /// Total size as planned at entry (whole shares)
    pub quantity: f64,
    /// Size still exposed; decreases on partial fills, zero once terminal
    pub remaining_quantity: f64,
    /// Currency amount the position was sized from
    pub allocation: f64,

    pub entry_order_id: Option<String>,
    pub entry_order_type: EntryStrategy,
    /// Planned entry price until filled, then the broker fill average
    pub entry_price: f64,

    pub stop_price: f64,
    pub stop_percent: Option<f64>,
    pub stop_order_id: Option<String>,

    pub trailing_enabled: bool,
    pub trailing_percent: Option<f64>,

    pub take_profit_price: f64,
    pub take_profit_percent: Option<f64>,
    pub take_profit_order_id: Option<String>,

    pub partial_exit: Option<PartialExit>,

    pub status: PositionStatus,

    /// Latest mark and derived P&L; advisory only
    pub current_price: f64,
    pub unrealized_pl: f64,
    pub unrealized_pl_pct: f64,

    pub notes: String,
    pub tags: Vec<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl ManagedPosition {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// A pending record older than the freshness window is hidden from the
    /// default list view but stays under management.
    pub fn is_stale_pending(&self, now: DateTime<Utc>, window_hours: i64) -> bool {
        self.status == PositionStatus::Pending
            && now - self.created_at > Duration::hours(window_hours)
    }

    /// Refresh the mark and advisory P&L fields. Returns whether anything
    /// changed, so callers can skip a store write on a flat quote.
    pub fn mark_to(&mut self, price: f64) -> bool {
        if price <= 0.0 {
            return false;
        }
        let changed = self.current_price != price;
        self.current_price = price;
        let qty = self.remaining_quantity;
        self.unrealized_pl = match self.side {
            Side::Long => (price - self.entry_price) * qty,
            Side::Short => (self.entry_price - price) * qty,
        };
        self.unrealized_pl_pct = if self.entry_price > 0.0 {
            match self.side {
                Side::Long => (price - self.entry_price) / self.entry_price * 100.0,
                Side::Short => (self.entry_price - price) / self.entry_price * 100.0,
            }
        } else {
            0.0
        };
        changed
    }

    /// Append a diagnostic note, preserving earlier ones
    pub fn push_note(&mut self, note: &str) {
        if self.notes.is_empty() {
            self.notes = note.to_string();
        } else {
            self.notes.push_str("; ");
            self.notes.push_str(note);
        }
    }
}

/// Partial-exit parameters as they appear on an open request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PartialExitRequest {
    pub fraction: f64,
    pub trigger_percent: f64,
}

/// A user request to open a protected position
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenPositionRequest {
    pub symbol: String,
    pub side: Side,
    #[serde(default)]
    pub strategy_tag: String,
    pub allocation: f64,

    #[serde(default = "default_entry_strategy")]
    pub entry_strategy: EntryStrategy,
    /// Required iff `entry_strategy` is limit
    #[serde(default)]
    pub entry_price: Option<f64>,

    #[serde(default)]
    pub stop_price: Option<f64>,
    #[serde(default)]
    pub stop_percent: Option<f64>,

    #[serde(default)]
    pub take_profit_price: Option<f64>,
    #[serde(default)]
    pub take_profit_percent: Option<f64>,

    #[serde(default)]
    pub trailing_enabled: bool,
    #[serde(default)]
    pub trailing_percent: Option<f64>,

    #[serde(default)]
    pub partial_exit: Option<PartialExitRequest>,

    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_entry_strategy() -> EntryStrategy {
    EntryStrategy::Market
}

impl OpenPositionRequest {
    /// Shape validation; price-ordering checks happen after protective
    /// prices are resolved against a real quote.
    pub fn validate(&self) -> Result<(), EngineError> {
        let invalid = |msg: &str| Err(EngineError::InvalidRequest(msg.to_string()));

        if self.symbol.trim().is_empty() {
            return invalid("symbol is required");
        }
        if self.allocation <= 0.0 {
            return invalid("allocation must be positive");
        }
        match self.entry_strategy {
            EntryStrategy::Limit => match self.entry_price {
                Some(p) if p > 0.0 => {}
                Some(_) => return invalid("entry_price must be positive"),
                None => return invalid("entry_price is required for limit entries"),
            },
            EntryStrategy::Market => {
                if self.entry_price.is_some() {
                    return invalid("entry_price is only valid for limit entries");
                }
            }
        }
        match (self.stop_price, self.stop_percent) {
            (Some(p), None) if p > 0.0 => {}
            (None, Some(pct)) if pct > 0.0 && pct < 100.0 => {}
            (Some(_), Some(_)) => return invalid("specify stop_price or stop_percent, not both"),
            (None, None) => return invalid("one of stop_price or stop_percent is required"),
            _ => return invalid("stop must be positive (percent below 100)"),
        }
        match (self.take_profit_price, self.take_profit_percent) {
            (Some(p), None) if p > 0.0 => {}
            (None, Some(pct)) if pct > 0.0 => {}
            (Some(_), Some(_)) => {
                return invalid("specify take_profit_price or take_profit_percent, not both")
            }
            (None, None) => {
                return invalid("one of take_profit_price or take_profit_percent is required")
            }
            _ => return invalid("take profit must be positive"),
        }
        match (self.trailing_enabled, self.trailing_percent) {
            (false, None) => {}
            (true, Some(pct)) if pct > 0.0 && pct < 100.0 => {}
            (true, _) => {
                return invalid("trailing_percent must be in (0, 100) when trailing is enabled")
            }
            (false, Some(_)) => return invalid("trailing_percent requires trailing_enabled"),
        }
        if let Some(pe) = &self.partial_exit {
            if !(pe.fraction > 0.0 && pe.fraction < 1.0) {
                return invalid("partial_exit.fraction must be in (0, 1)");
            }
            if pe.trigger_percent <= 0.0 {
                return invalid("partial_exit.trigger_percent must be positive");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_request() -> OpenPositionRequest {
        OpenPositionRequest {
            symbol: "SPY".to_string(),
            side: Side::Long,
            strategy_tag: String::new(),
            allocation: 1000.0,
            entry_strategy: EntryStrategy::Market,
            entry_price: None,
            stop_price: None,
            stop_percent: Some(5.0),
            take_profit_price: None,
            take_profit_percent: Some(10.0),
            trailing_enabled: false,
            trailing_percent: None,
            partial_exit: None,
            notes: String::new(),
            tags: vec![],
        }
    }

    fn sample_position() -> ManagedPosition {
        ManagedPosition {
            id: 1,
            symbol: "SPY".to_string(),
            side: Side::Long,
            strategy_tag: String::new(),
            quantity: 10.0,
            remaining_quantity: 10.0,
            allocation: 1000.0,
            entry_order_id: None,
            entry_order_type: EntryStrategy::Market,
            entry_price: 100.0,
            stop_price: 95.0,
            stop_percent: Some(5.0),
            stop_order_id: None,
            trailing_enabled: false,
            trailing_percent: None,
            take_profit_price: 110.0,
            take_profit_percent: Some(10.0),
            take_profit_order_id: None,
            partial_exit: None,
            status: PositionStatus::Pending,
            current_price: 0.0,
            unrealized_pl: 0.0,
            unrealized_pl_pct: 0.0,
            notes: String::new(),
            tags: vec![],
            created_at: Utc::now(),
            updated_at: Utc::now(),
            closed_at: None,
        }
    }

    #[test]
    fn test_valid_request_passes() {
        assert!(base_request().validate().is_ok());
    }

    #[test]
    fn test_limit_requires_entry_price() {
        let mut req = base_request();
        req.entry_strategy = EntryStrategy::Limit;
        assert!(req.validate().is_err());

        req.entry_price = Some(100.0);
        assert!(req.validate().is_ok());
    }

    #[test]
    fn test_stop_exclusivity() {
        let mut req = base_request();
        req.stop_price = Some(95.0);
        // Both set
        assert!(req.validate().is_err());

        req.stop_percent = None;
        assert!(req.validate().is_ok());

        req.stop_price = None;
        // Neither set
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_trailing_requires_percent() {
        let mut req = base_request();
        req.trailing_enabled = true;
        assert!(req.validate().is_err());

        req.trailing_percent = Some(5.0);
        assert!(req.validate().is_ok());
    }

    #[test]
    fn test_partial_fraction_bounds() {
        let mut req = base_request();
        req.partial_exit = Some(PartialExitRequest {
            fraction: 1.0,
            trigger_percent: 5.0,
        });
        assert!(req.validate().is_err());

        req.partial_exit = Some(PartialExitRequest {
            fraction: 0.5,
            trigger_percent: 5.0,
        });
        assert!(req.validate().is_ok());
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            PositionStatus::Pending,
            PositionStatus::Active,
            PositionStatus::Partial,
            PositionStatus::Closed,
            PositionStatus::StoppedOut,
            PositionStatus::Failed,
        ] {
            let parsed: PositionStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!PositionStatus::Pending.is_terminal());
        assert!(!PositionStatus::Active.is_terminal());
        assert!(!PositionStatus::Partial.is_terminal());
        assert!(PositionStatus::Closed.is_terminal());
        assert!(PositionStatus::StoppedOut.is_terminal());
        assert!(PositionStatus::Failed.is_terminal());
    }

    #[test]
    fn test_mark_to_updates_pnl() {
        let mut pos = sample_position();

        assert!(pos.mark_to(105.0));
        assert_eq!(pos.unrealized_pl, 50.0);
        assert_eq!(pos.unrealized_pl_pct, 5.0);

        // Same price again: nothing changed
        assert!(!pos.mark_to(105.0));
    }

    #[test]
    fn test_mark_to_short_side() {
        let mut pos = sample_position();
        pos.side = Side::Short;

        pos.mark_to(95.0);
        assert_eq!(pos.unrealized_pl, 50.0);
        assert_eq!(pos.unrealized_pl_pct, 5.0);
    }

    #[test]
    fn test_stale_pending_window() {
        let mut pos = sample_position();
        pos.created_at = Utc::now() - Duration::hours(30);
        assert!(pos.is_stale_pending(Utc::now(), 24));

        pos.status = PositionStatus::Active;
        assert!(!pos.is_stale_pending(Utc::now(), 24));
    }
}
