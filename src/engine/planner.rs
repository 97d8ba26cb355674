//! Open-position planning
//!
//! Turns an [`OpenPositionRequest`] into a persisted `Pending` record with a
//! submitted entry order. The record is persisted before the entry order
//! goes out: the engine can never lose a broker order it created, at worst
//! it holds a record with no order.

use chrono::Utc;
use tracing::{error, info, warn};

use crate::broker::{BrokerError, OrderRequest, OrderSide, TimeInForce};
use crate::error::EngineError;
use crate::risk;
use crate::types::{
    EntryStrategy, ManagedPosition, OpenPositionRequest, PartialExit, PositionStatus, Side,
};

use super::Engine;

impl Engine {
    /// Gateway entry point: validate, plan the bracket, persist, submit.
    pub async fn open_position(
        &self,
        req: OpenPositionRequest,
    ) -> Result<ManagedPosition, EngineError> {
        req.validate()?;
        let symbol = req.symbol.trim().to_uppercase();

        // Price discovery: an explicit limit price wins, otherwise size from
        // the side of the book the entry would take.
        let planned_price = match (req.entry_strategy, req.entry_price) {
            (EntryStrategy::Limit, Some(price)) => price,
            _ => {
                let quote = self.broker.latest_quote(&symbol).await?;
                quote.entry_price(req.side).ok_or_else(|| {
                    EngineError::InvalidRequest(format!("no usable quote for {}", symbol))
                })?
            }
        };

        let quantity = risk::position_size(req.allocation, planned_price);
        if quantity < 1.0 {
            return Err(EngineError::AllocationBelowPrice {
                allocation: req.allocation,
                price: planned_price,
            });
        }

        let stop_price = match (req.stop_price, req.stop_percent) {
            (Some(price), _) => price,
            (None, Some(pct)) => risk::stop_from_percent(planned_price, pct, req.side),
            (None, None) => unreachable!("validated"),
        };
        let take_profit_price = match (req.take_profit_price, req.take_profit_percent) {
            (Some(price), _) => price,
            (None, Some(pct)) => risk::take_from_percent(planned_price, pct, req.side),
            (None, None) => unreachable!("validated"),
        };

        // Stop and take must bracket the entry in the profitable direction
        let ordered = match req.side {
            Side::Long => stop_price < planned_price && planned_price < take_profit_price,
            Side::Short => take_profit_price < planned_price && planned_price < stop_price,
        };
        if !ordered {
            return Err(EngineError::InvalidRequest(format!(
                "stop {:.2} / entry {:.2} / take {:.2} are not in profitable order for {}",
                stop_price, planned_price, take_profit_price, req.side
            )));
        }

        let partial_exit = req.partial_exit.as_ref().map(|pe| PartialExit {
            fraction: pe.fraction,
            trigger_percent: pe.trigger_percent,
            trigger_price: risk::partial_exit_trigger(planned_price, pe.trigger_percent, req.side),
            order_ids: vec![],
        });

        let now = Utc::now();
        let mut record = ManagedPosition {
            id: self.store.allocate_id(),
            symbol,
            side: req.side,
            strategy_tag: req.strategy_tag,
            quantity,
            remaining_quantity: quantity,
            allocation: req.allocation,
            entry_order_id: None,
            entry_order_type: req.entry_strategy,
            entry_price: planned_price,
            stop_price,
            stop_percent: req.stop_percent,
            stop_order_id: None,
            trailing_enabled: req.trailing_enabled,
            trailing_percent: req.trailing_percent,
            take_profit_price,
            take_profit_percent: req.take_profit_percent,
            take_profit_order_id: None,
            partial_exit,
            status: PositionStatus::Pending,
            current_price: planned_price,
            unrealized_pl: 0.0,
            unrealized_pl_pct: 0.0,
            notes: req.notes,
            tags: req.tags,
            created_at: now,
            updated_at: now,
            closed_at: None,
        };

        // Persist first; if this fails nothing has reached the broker
        self.store.upsert(&record)?;

        let entry_side = OrderSide::from(record.side);
        let order_req = match record.entry_order_type {
            EntryStrategy::Market => {
                OrderRequest::market(entry_side, &record.symbol, quantity, TimeInForce::Day)
            }
            EntryStrategy::Limit => OrderRequest::limit(
                entry_side,
                &record.symbol,
                quantity,
                planned_price,
                TimeInForce::Day,
            ),
        };

        match self.broker.place_order(&order_req).await {
            Ok(ack) => {
                info!(
                    "opened #{}: {} {} x{:.0} @ ~{:.2} | stop {:.2} take {:.2} | entry order {}",
                    record.id,
                    record.side,
                    record.symbol,
                    quantity,
                    planned_price,
                    stop_price,
                    take_profit_price,
                    ack.id
                );
                let mut next = record.clone();
                next.entry_order_id = Some(ack.id);
                self.commit(&mut record, next)?;
                self.adopt(record.clone());
                Ok(record)
            }
            Err(BrokerError::Rejected { reason }) => {
                error!("entry order rejected for #{}: {}", record.id, reason);
                let mut next = record.clone();
                next.status = PositionStatus::Failed;
                next.remaining_quantity = 0.0;
                next.closed_at = Some(Utc::now());
                next.push_note(&format!("entry rejected: {}", reason));
                self.commit(&mut record, next)?;
                Err(BrokerError::Rejected { reason }.into())
            }
            Err(e) => {
                // Outcome unknown or venue unavailable. The record stays
                // Pending with no entry order id; the supervisor has nothing
                // to poll, so recovery surfaces it for operator attention.
                warn!("entry submission for #{} did not complete: {}", record.id, e);
                self.adopt(record);
                Err(e.into())
            }
        }
    }
}
