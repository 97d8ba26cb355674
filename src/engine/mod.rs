//! Managed-position engine
//!
//! The [`Engine`] owns the working set of positions under management and
//! coordinates the three collaborators: the broker port (authoritative for
//! order state), the position store (authoritative for engine state across
//! restarts), and the supervisor pass that reconciles the two.
//!
//! Locking model: the working-set map is guarded by a plain mutex for
//! insert/remove; each record sits behind its own async mutex so all
//! mutation of one position is serialized while passes, manual closes and
//! intake run concurrently.

pub mod planner;
pub mod recovery;
pub mod supervisor;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::time::Instant;

use crate::broker::BrokerPort;
use crate::config::EngineConfig;
use crate::error::{EngineError, StoreError};
use crate::store::PositionStore;
use crate::types::{ManagedPosition, StatusFilter};

/// A working-set entry: the live record plus its transient poll bookkeeping
pub(crate) struct Slot {
    pub record: ManagedPosition,
    pub last_polled: Option<Instant>,
}

pub struct Engine {
    pub(crate) settings: EngineConfig,
    pub(crate) broker: Arc<dyn BrokerPort>,
    pub(crate) store: Arc<PositionStore>,
    working: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<Slot>>>>,
}

impl Engine {
    pub fn new(
        settings: EngineConfig,
        broker: Arc<dyn BrokerPort>,
        store: Arc<PositionStore>,
    ) -> Self {
        Self {
            settings,
            broker,
            store,
            working: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &PositionStore {
        &self.store
    }

    /// Put a record under management, returning its slot. An id already
    /// tracked keeps its existing slot; the stored record wins over the
    /// argument in that case.
    pub(crate) fn adopt(&self, record: ManagedPosition) -> Arc<tokio::sync::Mutex<Slot>> {
        let mut working = self.working.lock().unwrap();
        working
            .entry(record.id)
            .or_insert_with(|| {
                Arc::new(tokio::sync::Mutex::new(Slot {
                    record,
                    last_polled: None,
                }))
            })
            .clone()
    }

    pub(crate) fn slot(&self, id: i64) -> Option<Arc<tokio::sync::Mutex<Slot>>> {
        self.working.lock().unwrap().get(&id).cloned()
    }

    /// Ids currently under management, in creation order
    pub(crate) fn tracked_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.working.lock().unwrap().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub(crate) fn evict(&self, id: i64) {
        self.working.lock().unwrap().remove(&id);
    }

    /// Number of positions under management
    pub fn managed_count(&self) -> usize {
        self.working.lock().unwrap().len()
    }

    /// Persist `next` and, once durable, make it the live record. A store
    /// failure leaves `live` untouched so the transition can be retried.
    pub(crate) fn commit(
        &self,
        live: &mut ManagedPosition,
        mut next: ManagedPosition,
    ) -> Result<(), StoreError> {
        next.updated_at = Utc::now();
        self.store.upsert(&next)?;
        *live = next;
        Ok(())
    }

    /// Gateway read: one position snapshot from the store
    pub fn get_position(&self, id: i64) -> Result<ManagedPosition, EngineError> {
        self.store
            .get(id)?
            .ok_or(EngineError::NotFound(id))
    }

    /// Gateway read: list positions. The default view hides pending records
    /// older than the freshness window; they stay under management and
    /// appear with an explicit status filter or `all`.
    pub fn list_positions(&self, filter: StatusFilter) -> Result<Vec<ManagedPosition>, EngineError> {
        let mut positions = self.store.list(filter)?;
        if filter == StatusFilter::Default {
            let now = Utc::now();
            let window = self.settings.pending_stale_hours;
            positions.retain(|p| !p.is_stale_pending(now, window));
        }
        Ok(positions)
    }
}
