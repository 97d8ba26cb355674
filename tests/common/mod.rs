//! Shared test support: a scriptable in-memory broker and engine fixtures

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;

use trade_sentinel::broker::{
    BrokerError, BrokerPort, OrderRequest, OrderSnapshot, OrderStatus, PlacedOrder, Quote,
};
use trade_sentinel::config::EngineConfig;
use trade_sentinel::{Engine, OpenPositionRequest, PositionStore, Side};

/// One order as the stub broker holds it: the request that created it plus
/// the snapshot handed back on polls.
#[derive(Debug, Clone)]
pub struct StubOrder {
    pub request: OrderRequest,
    pub snapshot: OrderSnapshot,
}

/// In-memory broker whose order book the test script drives. Orders accept
/// on placement and only change state when the test says so.
#[derive(Default)]
pub struct StubBroker {
    orders: Mutex<HashMap<String, StubOrder>>,
    quotes: Mutex<HashMap<String, Quote>>,
    next_id: AtomicU64,
    reject_placements: Mutex<Option<String>>,
    fail_placements: AtomicBool,
    fail_gets: AtomicBool,
}

impl StubBroker {
    pub fn new() -> Self {
        Self::default()
    }

    // ---- scripting -------------------------------------------------------

    pub fn set_quote(&self, symbol: &str, bid: f64, ask: f64) {
        self.quotes.lock().unwrap().insert(
            symbol.to_string(),
            Quote {
                bid,
                ask,
                ts: Utc::now(),
            },
        );
    }

    /// Completely fill an order at the given price
    pub fn fill(&self, order_id: &str, price: f64) {
        let mut orders = self.orders.lock().unwrap();
        let order = orders.get_mut(order_id).expect("unknown stub order");
        order.snapshot.status = OrderStatus::Filled;
        order.snapshot.filled_qty = order.request.qty;
        order.snapshot.fill_avg_price = Some(price);
        order.snapshot.filled_at = Some(Utc::now());
    }

    /// Report a partial fill without completing the order
    pub fn fill_partially(&self, order_id: &str, qty: f64, price: f64) {
        let mut orders = self.orders.lock().unwrap();
        let order = orders.get_mut(order_id).expect("unknown stub order");
        order.snapshot.status = OrderStatus::PartiallyFilled;
        order.snapshot.filled_qty = qty;
        order.snapshot.fill_avg_price = Some(price);
    }

    /// Force an order into an arbitrary status (out-of-band cancels etc.)
    pub fn set_status(&self, order_id: &str, status: OrderStatus) {
        let mut orders = self.orders.lock().unwrap();
        orders.get_mut(order_id).expect("unknown stub order").snapshot.status = status;
    }

    /// Placements are rejected with this reason until cleared
    pub fn reject_next_placements(&self, reason: &str) {
        *self.reject_placements.lock().unwrap() = Some(reason.to_string());
    }

    /// All placements fail transiently while set
    pub fn set_fail_placements(&self, fail: bool) {
        self.fail_placements.store(fail, Ordering::SeqCst);
    }

    /// All order polls fail transiently while set
    pub fn set_fail_gets(&self, fail: bool) {
        self.fail_gets.store(fail, Ordering::SeqCst);
    }

    // ---- inspection ------------------------------------------------------

    pub fn order(&self, order_id: &str) -> StubOrder {
        self.orders
            .lock()
            .unwrap()
            .get(order_id)
            .expect("unknown stub order")
            .clone()
    }

    pub fn orders(&self) -> Vec<StubOrder> {
        self.orders.lock().unwrap().values().cloned().collect()
    }

    pub fn order_count(&self) -> usize {
        self.orders.lock().unwrap().len()
    }

    /// Orders the broker still considers live (accepting fills)
    pub fn live_orders(&self) -> Vec<StubOrder> {
        self.orders
            .lock()
            .unwrap()
            .values()
            .filter(|o| !o.snapshot.status.is_terminal())
            .cloned()
            .collect()
    }
}

#[async_trait]
impl BrokerPort for StubBroker {
    async fn place_order(&self, req: &OrderRequest) -> Result<PlacedOrder, BrokerError> {
        if let Some(reason) = self.reject_placements.lock().unwrap().clone() {
            return Err(BrokerError::Rejected { reason });
        }
        if self.fail_placements.load(Ordering::SeqCst) {
            return Err(BrokerError::Transient("stub placement outage".to_string()));
        }

        let id = format!("stub-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let snapshot = OrderSnapshot {
            id: id.clone(),
            status: OrderStatus::Accepted,
            filled_qty: 0.0,
            fill_avg_price: None,
            submitted_at: Some(Utc::now()),
            filled_at: None,
        };
        self.orders.lock().unwrap().insert(
            id.clone(),
            StubOrder {
                request: req.clone(),
                snapshot,
            },
        );
        Ok(PlacedOrder {
            id,
            status: OrderStatus::Accepted,
        })
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), BrokerError> {
        let mut orders = self.orders.lock().unwrap();
        let Some(order) = orders.get_mut(order_id) else {
            return Err(BrokerError::NotFound);
        };
        if order.snapshot.status.is_terminal() {
            return Err(BrokerError::AlreadyTerminal);
        }
        order.snapshot.status = OrderStatus::Canceled;
        Ok(())
    }

    async fn get_order(&self, order_id: &str) -> Result<OrderSnapshot, BrokerError> {
        if self.fail_gets.load(Ordering::SeqCst) {
            return Err(BrokerError::Transient("stub poll outage".to_string()));
        }
        self.orders
            .lock()
            .unwrap()
            .get(order_id)
            .map(|o| o.snapshot.clone())
            .ok_or(BrokerError::NotFound)
    }

    async fn latest_quote(&self, symbol: &str) -> Result<Quote, BrokerError> {
        self.quotes
            .lock()
            .unwrap()
            .get(symbol)
            .copied()
            .ok_or(BrokerError::NotFound)
    }
}

// ---- fixtures ------------------------------------------------------------

/// Engine wired to the stub broker and an in-memory store; zero cadence so
/// every `run_pass` call reconciles everything.
pub fn test_engine(broker: Arc<StubBroker>) -> Engine {
    Engine::new(
        test_settings(),
        broker,
        Arc::new(PositionStore::open_in_memory().unwrap()),
    )
}

/// Engine over a file-backed store, for crash/restart scenarios
pub fn test_engine_at(broker: Arc<StubBroker>, db_path: &PathBuf) -> Engine {
    Engine::new(
        test_settings(),
        broker,
        Arc::new(PositionStore::open(db_path, false).unwrap()),
    )
}

fn test_settings() -> EngineConfig {
    EngineConfig {
        poll_interval_secs: 0,
        pending_stale_hours: 24,
        poll_jitter_ms: 0,
    }
}

/// Fresh database path for a crash-safety test
pub fn temp_db_path(tag: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!(
        "trade-sentinel-test-{}-{}.db",
        tag,
        std::process::id()
    ));
    let _ = std::fs::remove_file(&path);
    path
}

/// Long SPY, allocation 1000, stop 5% / take 10%, market entry
pub fn long_spy() -> OpenPositionRequest {
    OpenPositionRequest {
        symbol: "SPY".to_string(),
        side: Side::Long,
        strategy_tag: "test".to_string(),
        allocation: 1000.0,
        entry_strategy: trade_sentinel::EntryStrategy::Market,
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
