//! Timer-driven reconciliation
//!
//! One pass walks every non-terminal record under its per-position lock,
//! polls the broker for the orders the record points at, and drives the
//! state machine from what the broker reports. Broker values win; the
//! engine never promotes a record to a terminal status on a transient
//! failure.
//!
//! Poll order within one record is fixed: stop before take-profit. When
//! both filled between passes the stop is observed first, the position ends
//! `StoppedOut`, and the take-profit cancel comes back `AlreadyTerminal`,
//! which counts as success.

use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerError, OrderRequest, OrderSide, OrderStatus, TimeInForce};
use crate::error::EngineError;
use crate::risk;
use crate::types::{ManagedPosition, PositionStatus, StatusFilter};

use super::{Engine, Slot};

impl Engine {
    /// One reconciliation pass over every non-terminal record.
    pub async fn run_pass(&self) -> Result<(), EngineError> {
        self.sync_working_set()?;

        for id in self.tracked_ids() {
            let Some(slot_arc) = self.slot(id) else {
                continue;
            };
            let mut slot = slot_arc.lock().await;

            if slot.record.is_terminal() {
                drop(slot);
                self.evict(id);
                continue;
            }
            if !self.poll_due(&slot, id) {
                continue;
            }
            slot.last_polled = Some(Instant::now());

            match self.reconcile(&mut slot.record).await {
                Ok(()) => {
                    let terminal = slot.record.is_terminal();
                    drop(slot);
                    if terminal {
                        self.evict(id);
                    }
                }
                Err(EngineError::Broker(e)) if e.is_transient() => {
                    warn!("#{} skipped this pass: {}", id, e);
                }
                Err(EngineError::Store(e)) => {
                    warn!("#{} state write failed, transition deferred: {}", id, e);
                }
                Err(e) => error!("#{} reconciliation error: {}", id, e),
            }
        }
        Ok(())
    }

    /// Top the working set up from the store so records created by another
    /// process (or before a restart) come under management.
    fn sync_working_set(&self) -> Result<(), EngineError> {
        for record in self.store.list(StatusFilter::NonTerminal)? {
            self.adopt(record);
        }
        Ok(())
    }

    fn poll_due(&self, slot: &Slot, id: i64) -> bool {
        let Some(last) = slot.last_polled else {
            return true;
        };
        // Deterministic per-id jitter so a restarted fleet of records does
        // not align every broker call on the same tick
        let jitter = if self.settings.poll_jitter_ms == 0 {
            0
        } else {
            (id as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15) % self.settings.poll_jitter_ms
        };
        let cadence = Duration::from_secs(self.settings.poll_interval_secs);
        last.elapsed() + Duration::from_millis(jitter) >= cadence
    }

    async fn reconcile(&self, rec: &mut ManagedPosition) -> Result<(), EngineError> {
        match rec.status {
            PositionStatus::Pending => self.reconcile_pending(rec).await,
            PositionStatus::Active | PositionStatus::Partial => self.reconcile_open(rec).await,
            _ => Ok(()),
        }
    }

    async fn reconcile_pending(&self, rec: &mut ManagedPosition) -> Result<(), EngineError> {
        let Some(entry_id) = rec.entry_order_id.clone() else {
            // The planner never got an order out; nothing to poll
            debug!("#{} pending with no entry order; awaiting operator", rec.id);
            return Ok(());
        };

        let snap = self.broker.get_order(&entry_id).await?;
        match snap.status {
            OrderStatus::Filled => {
                let mut next = rec.clone();
                if let Some(fill) = snap.fill_avg_price {
                    if fill > 0.0 {
                        next.entry_price = fill;
                    }
                }
                // Percent-derived protective prices bind to the actual fill
                if let Some(pct) = next.stop_percent {
                    next.stop_price = risk::stop_from_percent(next.entry_price, pct, next.side);
                }
                if let Some(pct) = next.take_profit_percent {
                    next.take_profit_price =
                        risk::take_from_percent(next.entry_price, pct, next.side);
                }
                if let Some(pe) = next.partial_exit.as_mut() {
                    pe.trigger_price =
                        risk::partial_exit_trigger(next.entry_price, pe.trigger_percent, next.side);
                }
                next.status = PositionStatus::Active;
                next.remaining_quantity = next.quantity;
                self.commit(rec, next)?;
                info!(
                    "#{} entry filled @ {:.2}; position active",
                    rec.id, rec.entry_price
                );
                self.ensure_protective_orders(rec).await
            }
            OrderStatus::Canceled | OrderStatus::Rejected | OrderStatus::Expired => {
                let mut next = rec.clone();
                next.status = PositionStatus::Failed;
                next.remaining_quantity = 0.0;
                next.closed_at = Some(Utc::now());
                next.push_note(&format!(
                    "entry order {} {} before fill",
                    entry_id,
                    status_word(snap.status)
                ));
                self.commit(rec, next)?;
                warn!("#{} failed: entry order {}", rec.id, status_word(snap.status));
                Ok(())
            }
            OrderStatus::PartiallyFilled => {
                // A partial entry is not entry completion; protective sizing
                // needs a definite quantity
                warn!(
                    "#{} entry {} partially filled ({:.0}); still pending",
                    rec.id, entry_id, snap.filled_qty
                );
                Ok(())
            }
            OrderStatus::Pending | OrderStatus::Accepted => Ok(()),
        }
    }

    async fn reconcile_open(&self, rec: &mut ManagedPosition) -> Result<(), EngineError> {
        self.ensure_protective_orders(rec).await?;

        // Stop first; the fixed order is the tie-break for a simultaneous
        // stop/take fill
        if let Some(stop_id) = rec.stop_order_id.clone() {
            match self.broker.get_order(&stop_id).await {
                Ok(snap) => match snap.status {
                    OrderStatus::Filled => {
                        return self.finish_stopped_out(rec, snap.fill_avg_price).await;
                    }
                    OrderStatus::Canceled | OrderStatus::Rejected | OrderStatus::Expired => {
                        warn!(
                            "#{} stop order {} gone out-of-band ({}); re-placing",
                            rec.id,
                            stop_id,
                            status_word(snap.status)
                        );
                        let mut next = rec.clone();
                        next.stop_order_id = None;
                        self.commit(rec, next)?;
                    }
                    _ => {}
                },
                Err(BrokerError::NotFound) => {
                    warn!("#{} stop order {} unknown to broker; re-placing", rec.id, stop_id);
                    let mut next = rec.clone();
                    next.stop_order_id = None;
                    self.commit(rec, next)?;
                }
                Err(e) => return Err(e.into()),
            }
        }

        if let Some(take_id) = rec.take_profit_order_id.clone() {
            match self.broker.get_order(&take_id).await {
                Ok(snap) => match snap.status {
                    OrderStatus::Filled => {
                        return self.finish_closed(rec, snap.fill_avg_price).await;
                    }
                    OrderStatus::Canceled | OrderStatus::Rejected | OrderStatus::Expired => {
                        warn!(
                            "#{} take-profit order {} gone out-of-band ({}); re-placing",
                            rec.id,
                            take_id,
                            status_word(snap.status)
                        );
                        let mut next = rec.clone();
                        next.take_profit_order_id = None;
                        self.commit(rec, next)?;
                    }
                    _ => {}
                },
                Err(BrokerError::NotFound) => {
                    warn!(
                        "#{} take-profit order {} unknown to broker; re-placing",
                        rec.id, take_id
                    );
                    let mut next = rec.clone();
                    next.take_profit_order_id = None;
                    self.commit(rec, next)?;
                }
                Err(e) => return Err(e.into()),
            }
        }

        // Partial-exit orders are only outstanding while Active; absorption
        // moves the record to Partial and retires them
        if rec.status == PositionStatus::Active {
            if let Some(pe) = rec.partial_exit.clone() {
                for order_id in &pe.order_ids {
                    match self.broker.get_order(order_id).await {
                        Ok(snap) => match snap.status {
                            OrderStatus::Filled => {
                                return self.absorb_partial_fill(rec, snap.filled_qty).await;
                            }
                            OrderStatus::Canceled
                            | OrderStatus::Rejected
                            | OrderStatus::Expired => {
                                warn!(
                                    "#{} partial-exit order {} gone without fill; re-placing",
                                    rec.id, order_id
                                );
                                let mut next = rec.clone();
                                if let Some(pe) = next.partial_exit.as_mut() {
                                    pe.order_ids.retain(|o| o != order_id);
                                }
                                self.commit(rec, next)?;
                            }
                            _ => {}
                        },
                        Err(BrokerError::NotFound) => {
                            let mut next = rec.clone();
                            if let Some(pe) = next.partial_exit.as_mut() {
                                pe.order_ids.retain(|o| o != order_id);
                            }
                            self.commit(rec, next)?;
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }

        // Refresh the mark; a flat quote costs no store write
        match self.broker.latest_quote(&rec.symbol).await {
            Ok(quote) => {
                if let Some(mark) = quote.mark(rec.side) {
                    let mut next = rec.clone();
                    if next.mark_to(mark) {
                        self.commit(rec, next)?;
                    }
                    if rec.trailing_enabled {
                        self.apply_trailing(rec, mark).await?;
                    }
                }
            }
            Err(e) => debug!("#{} quote refresh failed: {}", rec.id, e),
        }

        Ok(())
    }

    /// Invariant: an Active or Partial position carries exactly one live
    /// stop and one live take-profit at the broker, each sized to the
    /// remaining quantity. Missing orders are (re-)placed here; a failed
    /// placement is retried on the next pass and the record stays managed.
    async fn ensure_protective_orders(&self, rec: &mut ManagedPosition) -> Result<(), EngineError> {
        if !matches!(rec.status, PositionStatus::Active | PositionStatus::Partial) {
            return Ok(());
        }
        let exit_side = OrderSide::from(rec.side).opposite();

        if rec.stop_order_id.is_none() {
            let req = OrderRequest::stop(
                exit_side,
                &rec.symbol,
                rec.remaining_quantity,
                rec.stop_price,
                TimeInForce::Gtc,
            );
            match self.broker.place_order(&req).await {
                Ok(ack) => {
                    let mut next = rec.clone();
                    next.stop_order_id = Some(ack.id.clone());
                    self.commit(rec, next)?;
                    info!(
                        "#{} stop placed @ {:.2} x{:.0} ({})",
                        rec.id, rec.stop_price, rec.remaining_quantity, ack.id
                    );
                }
                Err(e) if e.is_transient() => {
                    warn!("#{} stop placement failed, retrying next pass: {}", rec.id, e)
                }
                Err(e) => error!("#{} stop placement rejected: {}", rec.id, e),
            }
        }

        if rec.take_profit_order_id.is_none() {
            let req = OrderRequest::limit(
                exit_side,
                &rec.symbol,
                rec.remaining_quantity,
                rec.take_profit_price,
                TimeInForce::Gtc,
            );
            match self.broker.place_order(&req).await {
                Ok(ack) => {
                    let mut next = rec.clone();
                    next.take_profit_order_id = Some(ack.id.clone());
                    self.commit(rec, next)?;
                    info!(
                        "#{} take-profit placed @ {:.2} x{:.0} ({})",
                        rec.id, rec.take_profit_price, rec.remaining_quantity, ack.id
                    );
                }
                Err(e) if e.is_transient() => warn!(
                    "#{} take-profit placement failed, retrying next pass: {}",
                    rec.id, e
                ),
                Err(e) => error!("#{} take-profit placement rejected: {}", rec.id, e),
            }
        }

        if rec.status == PositionStatus::Active {
            if let Some(pe) = rec.partial_exit.clone() {
                if pe.order_ids.is_empty() {
                    let qty = (rec.quantity * pe.fraction).floor();
                    if qty >= 1.0 {
                        let req = OrderRequest::limit(
                            exit_side,
                            &rec.symbol,
                            qty,
                            pe.trigger_price,
                            TimeInForce::Gtc,
                        );
                        match self.broker.place_order(&req).await {
                            Ok(ack) => {
                                let mut next = rec.clone();
                                if let Some(pe) = next.partial_exit.as_mut() {
                                    pe.order_ids.push(ack.id.clone());
                                }
                                self.commit(rec, next)?;
                                info!(
                                    "#{} partial-exit placed @ {:.2} x{:.0} ({})",
                                    rec.id, pe.trigger_price, qty, ack.id
                                );
                            }
                            Err(e) if e.is_transient() => warn!(
                                "#{} partial-exit placement failed, retrying next pass: {}",
                                rec.id, e
                            ),
                            Err(e) => {
                                error!("#{} partial-exit placement rejected: {}", rec.id, e)
                            }
                        }
                    } else {
                        debug!("#{} partial-exit size rounds to zero; skipped", rec.id);
                    }
                }
            }
        }

        Ok(())
    }

    /// Stop filled: terminal `StoppedOut`; the sibling take-profit and any
    /// partial-exit orders are cancelled best-effort.
    async fn finish_stopped_out(
        &self,
        rec: &mut ManagedPosition,
        fill_price: Option<f64>,
    ) -> Result<(), EngineError> {
        if let Some(take_id) = rec.take_profit_order_id.clone() {
            self.cancel_best_effort(rec.id, &take_id, "take-profit").await;
        }
        if let Some(pe) = rec.partial_exit.clone() {
            for order_id in &pe.order_ids {
                self.cancel_best_effort(rec.id, order_id, "partial-exit").await;
            }
        }

        let exit = fill_price.unwrap_or(rec.stop_price);
        let mut next = rec.clone();
        next.status = PositionStatus::StoppedOut;
        next.remaining_quantity = 0.0;
        next.current_price = exit;
        next.closed_at = Some(Utc::now());
        self.commit(rec, next)?;
        info!("🛑 #{} stopped out @ {:.2}", rec.id, exit);
        Ok(())
    }

    /// Take-profit filled: terminal `Closed`; the sibling stop and any
    /// partial-exit orders are cancelled best-effort.
    async fn finish_closed(
        &self,
        rec: &mut ManagedPosition,
        fill_price: Option<f64>,
    ) -> Result<(), EngineError> {
        if let Some(stop_id) = rec.stop_order_id.clone() {
            self.cancel_best_effort(rec.id, &stop_id, "stop").await;
        }
        if let Some(pe) = rec.partial_exit.clone() {
            for order_id in &pe.order_ids {
                self.cancel_best_effort(rec.id, order_id, "partial-exit").await;
            }
        }

        let exit = fill_price.unwrap_or(rec.take_profit_price);
        let mut next = rec.clone();
        next.status = PositionStatus::Closed;
        next.remaining_quantity = 0.0;
        next.current_price = exit;
        next.closed_at = Some(Utc::now());
        self.commit(rec, next)?;
        info!("🎯 #{} take-profit filled @ {:.2}; closed", rec.id, exit);
        Ok(())
    }

    /// A partial-exit order filled: shrink the exposure, then resize both
    /// protective orders to the new remaining quantity.
    async fn absorb_partial_fill(
        &self,
        rec: &mut ManagedPosition,
        filled_qty: f64,
    ) -> Result<(), EngineError> {
        if filled_qty > rec.remaining_quantity {
            // Internal inconsistency; fatal for this record only
            error!(
                "#{} partial fill {:.0} exceeds remaining {:.0}; failing record",
                rec.id, filled_qty, rec.remaining_quantity
            );
            if let Some(stop_id) = rec.stop_order_id.clone() {
                self.cancel_best_effort(rec.id, &stop_id, "stop").await;
            }
            if let Some(take_id) = rec.take_profit_order_id.clone() {
                self.cancel_best_effort(rec.id, &take_id, "take-profit").await;
            }
            let mut next = rec.clone();
            next.status = PositionStatus::Failed;
            next.remaining_quantity = 0.0;
            next.closed_at = Some(Utc::now());
            next.push_note(&format!(
                "invariant violated: partial fill {:.0} exceeds remaining {:.0}",
                filled_qty, rec.remaining_quantity
            ));
            self.commit(rec, next)?;
            return Ok(());
        }

        let mut next = rec.clone();
        next.remaining_quantity -= filled_qty;
        next.status = PositionStatus::Partial;
        self.commit(rec, next)?;
        info!(
            "#{} partial exit filled x{:.0}; remaining {:.0}",
            rec.id, filled_qty, rec.remaining_quantity
        );

        // Cancel-and-replace both protective orders at the reduced size
        if let Some(stop_id) = rec.stop_order_id.clone() {
            self.cancel_best_effort(rec.id, &stop_id, "stop").await;
        }
        if let Some(take_id) = rec.take_profit_order_id.clone() {
            self.cancel_best_effort(rec.id, &take_id, "take-profit").await;
        }
        let mut next = rec.clone();
        next.stop_order_id = None;
        next.take_profit_order_id = None;
        self.commit(rec, next)?;

        self.ensure_protective_orders(rec).await
    }

    /// One-way trailing ratchet: cancel the old stop, persist the improved
    /// price, place the replacement. If the replacement placement fails the
    /// record carries the ratcheted price with no live order and the next
    /// pass re-places it.
    async fn apply_trailing(
        &self,
        rec: &mut ManagedPosition,
        mark: f64,
    ) -> Result<(), EngineError> {
        let Some(pct) = rec.trailing_percent else {
            return Ok(());
        };
        let Some(new_stop) =
            risk::trailing_stop(mark, pct, rec.side, rec.entry_price, rec.stop_price)
        else {
            return Ok(());
        };

        if let Some(stop_id) = rec.stop_order_id.clone() {
            match self.broker.cancel_order(&stop_id).await {
                Ok(()) | Err(BrokerError::NotFound) => {}
                Err(BrokerError::AlreadyTerminal) => {
                    // The cancel may have raced a fill; check before replacing
                    if let Ok(snap) = self.broker.get_order(&stop_id).await {
                        if snap.status == OrderStatus::Filled {
                            return self.finish_stopped_out(rec, snap.fill_avg_price).await;
                        }
                    }
                }
                Err(e) => {
                    warn!("#{} trailing update deferred, cancel failed: {}", rec.id, e);
                    return Ok(());
                }
            }
        }

        let old_stop = rec.stop_price;
        let mut next = rec.clone();
        next.stop_price = new_stop;
        next.stop_order_id = None;
        self.commit(rec, next)?;

        let req = OrderRequest::stop(
            OrderSide::from(rec.side).opposite(),
            &rec.symbol,
            rec.remaining_quantity,
            new_stop,
            TimeInForce::Gtc,
        );
        match self.broker.place_order(&req).await {
            Ok(ack) => {
                let mut next = rec.clone();
                next.stop_order_id = Some(ack.id);
                self.commit(rec, next)?;
                info!(
                    "📈 #{} trailing stop {:.2} -> {:.2} (mark {:.2})",
                    rec.id, old_stop, new_stop, mark
                );
            }
            Err(e) => warn!(
                "#{} trailing stop replacement pending, will re-place: {}",
                rec.id, e
            ),
        }
        Ok(())
    }

    /// Operator-initiated close: cancel every engine order best-effort,
    /// market-exit any remaining exposure, then mark `Closed`. Cancellation
    /// errors never block the terminal transition; a failed exit submission
    /// is noted on the record and left for the broker to report.
    pub async fn close_position(&self, id: i64) -> Result<(), EngineError> {
        let slot_arc = match self.slot(id) {
            Some(slot) => slot,
            None => {
                let record = self.store.get(id)?.ok_or(EngineError::NotFound(id))?;
                if record.is_terminal() {
                    return Ok(());
                }
                self.adopt(record)
            }
        };
        let mut slot = slot_arc.lock().await;
        let rec = &mut slot.record;

        if rec.is_terminal() {
            return Ok(());
        }

        if rec.status == PositionStatus::Pending {
            if let Some(entry_id) = rec.entry_order_id.clone() {
                self.cancel_best_effort(id, &entry_id, "entry").await;
            }
        }
        if let Some(stop_id) = rec.stop_order_id.clone() {
            self.cancel_best_effort(id, &stop_id, "stop").await;
        }
        if let Some(take_id) = rec.take_profit_order_id.clone() {
            self.cancel_best_effort(id, &take_id, "take-profit").await;
        }
        if let Some(pe) = rec.partial_exit.clone() {
            for order_id in &pe.order_ids {
                self.cancel_best_effort(id, order_id, "partial-exit").await;
            }
        }

        let mut next = rec.clone();
        if matches!(rec.status, PositionStatus::Active | PositionStatus::Partial)
            && rec.remaining_quantity > 0.0
        {
            let req = OrderRequest::market(
                OrderSide::from(rec.side).opposite(),
                &rec.symbol,
                rec.remaining_quantity,
                TimeInForce::Day,
            );
            match self.broker.place_order(&req).await {
                Ok(ack) => info!("#{} market exit submitted ({})", id, ack.id),
                Err(e) => {
                    error!("#{} market exit submission failed: {}", id, e);
                    next.push_note(&format!("manual close exit failed: {}", e));
                }
            }
        }

        next.status = PositionStatus::Closed;
        next.remaining_quantity = 0.0;
        next.closed_at = Some(Utc::now());
        next.push_note("closed manually");
        self.commit(rec, next)?;
        drop(slot);
        self.evict(id);
        info!("#{} closed manually", id);
        Ok(())
    }

    /// Best-effort cancel; `NotFound` and `AlreadyTerminal` count as success
    async fn cancel_best_effort(&self, id: i64, order_id: &str, label: &str) {
        match self.broker.cancel_order(order_id).await {
            Ok(()) => debug!("#{} {} order {} cancelled", id, label, order_id),
            Err(BrokerError::NotFound) | Err(BrokerError::AlreadyTerminal) => {
                debug!("#{} {} order {} already done", id, label, order_id)
            }
            Err(e) => warn!("#{} could not cancel {} order {}: {}", id, label, order_id, e),
        }
    }
}

fn status_word(status: OrderStatus) -> &'static str {
    match status {
        OrderStatus::Pending => "pending",
        OrderStatus::Accepted => "accepted",
        OrderStatus::PartiallyFilled => "partially filled",
        OrderStatus::Filled => "filled",
        OrderStatus::Canceled => "cancelled",
        OrderStatus::Rejected => "rejected",
        OrderStatus::Expired => "expired",
    }
}
