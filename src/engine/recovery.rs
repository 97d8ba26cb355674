//! Startup rehydration
//!
//! Loads every non-terminal record from the store into the working set. No
//! broker orders are resubmitted on the basis of the record alone: the first
//! reconciliation pass polls the stored order ids and converges on whatever
//! the broker actually holds.

use tracing::{info, warn};

use crate::error::EngineError;
use crate::types::{PositionStatus, StatusFilter};

use super::Engine;

const CONFIG_FINGERPRINT_KEY: &str = "config_fingerprint";

impl Engine {
    /// Seed the working set from the store. Returns the number of positions
    /// brought back under management.
    pub fn recover(&self, config_fingerprint: Option<&str>) -> Result<usize, EngineError> {
        if let Some(fingerprint) = config_fingerprint {
            match self.store.get_meta(CONFIG_FINGERPRINT_KEY)? {
                Some(stored) if stored != fingerprint => {
                    warn!("⚠️  config has changed since the saved state was written");
                }
                _ => {}
            }
            self.store.set_meta(CONFIG_FINGERPRINT_KEY, fingerprint)?;
        }

        let records = self.store.list(StatusFilter::NonTerminal)?;
        let mut count = 0;

        for record in records {
            if record.status == PositionStatus::Pending && record.entry_order_id.is_none() {
                // The planner persisted this record but never got an entry
                // order out; only an operator can decide its fate
                warn!(
                    "#{} pending with no entry order; flagged for operator attention",
                    record.id
                );
            }
            info!(
                "recovered #{}: {} {} [{}] remaining={:.0}",
                record.id, record.side, record.symbol, record.status, record.remaining_quantity
            );
            self.adopt(record);
            count += 1;
        }

        info!("recovery complete: {} positions under management", count);
        Ok(count)
    }
}
