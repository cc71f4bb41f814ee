//! Order router
//!
//! Entry point for intents. Gates each intent (kill switch, duplicate delivery,
//! reference price, busy key, budget), then drives the order through bounded
//! attempts, feeding everything it observes back through the FSM engine.
//!
//! No error escapes `handle_intent`: every path ends in an `ExecutionOutcome`
//! and a lifecycle event, with the reservation settled by the state machine.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use super::engine::FsmEngine;
use super::fills;
use super::idempotency::IdempotencyStore;
use super::BudgetLedger;
use crate::config::{AppConfig, ExecutionConfig};
use crate::domain::{
    CancelOutcome, FailReason, FsmEvent, FsmState, Intent, LifecycleEvent, OrderPhase,
    OrderRequest, OrderStatus, OrderStatusReport, Side, StateKey,
};
use crate::error::{FailureKind, OrdexError};
use crate::events::EventBus;
use crate::exchange::{ExchangeClient, PriceOracle};
use crate::persistence::{AuditLog, AuditRecord, Decision};

/// Runtime switches, read as a snapshot at the start of each intent
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuntimeFlags {
    /// Refuse new intents
    pub kill_switch: bool,
}

/// How an intent ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// Redelivery of an intent already handled
    Duplicate { intent_id: String },
    Filled {
        intent_id: String,
        filled_qty: Decimal,
        avg_price: Decimal,
        fees: Decimal,
    },
    Partial {
        intent_id: String,
        filled_qty: Decimal,
        remaining_qty: Decimal,
    },
    Failed {
        intent_id: String,
        reason: FailReason,
        exchange_error: Option<String>,
    },
}

impl ExecutionOutcome {
    pub fn intent_id(&self) -> &str {
        match self {
            ExecutionOutcome::Duplicate { intent_id }
            | ExecutionOutcome::Filled { intent_id, .. }
            | ExecutionOutcome::Partial { intent_id, .. }
            | ExecutionOutcome::Failed { intent_id, .. } => intent_id,
        }
    }

    pub fn is_filled(&self) -> bool {
        matches!(self, ExecutionOutcome::Filled { .. })
    }

    pub fn fail_reason(&self) -> Option<FailReason> {
        match self {
            ExecutionOutcome::Failed { reason, .. } => Some(*reason),
            _ => None,
        }
    }
}

impl std::fmt::Display for ExecutionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionOutcome::Duplicate { intent_id } => write!(f, "{} duplicate", intent_id),
            ExecutionOutcome::Filled {
                intent_id,
                filled_qty,
                avg_price,
                fees,
            } => write!(
                f,
                "{} filled {} @ {} (fees {})",
                intent_id, filled_qty, avg_price, fees
            ),
            ExecutionOutcome::Partial {
                intent_id,
                filled_qty,
                remaining_qty,
            } => write!(
                f,
                "{} partial {} filled, {} unfilled",
                intent_id, filled_qty, remaining_qty
            ),
            ExecutionOutcome::Failed {
                intent_id,
                reason,
                exchange_error,
            } => match exchange_error {
                Some(err) => write!(f, "{} failed: {} ({})", intent_id, reason, err),
                None => write!(f, "{} failed: {}", intent_id, reason),
            },
        }
    }
}

/// Where the attempt loop starts
#[derive(Debug, Clone)]
enum Step {
    /// Place a fresh order for this 1-based attempt
    Place(u32),
    /// An order is already working; wait on it
    Await {
        attempt: u32,
        client_order_id: String,
        exchange_order_id: String,
    },
}

/// Result of waiting on one working order
enum WaitOutcome {
    Filled,
    TimedOut,
    /// The venue closed the order with quantity left
    Closed(OrderStatus),
    Broken(String),
}

pub struct OrderRouter {
    engine: Arc<FsmEngine>,
    ledger: Arc<BudgetLedger>,
    idempotency: Arc<IdempotencyStore>,
    audit: Arc<dyn AuditLog>,
    exchange: Arc<dyn ExchangeClient>,
    oracle: Arc<dyn PriceOracle>,
    bus: EventBus,
    flags: watch::Receiver<RuntimeFlags>,
    execution: ExecutionConfig,
    fill_timeout: Duration,
}

impl OrderRouter {
    pub fn new(
        config: &AppConfig,
        engine: Arc<FsmEngine>,
        ledger: Arc<BudgetLedger>,
        exchange: Arc<dyn ExchangeClient>,
        oracle: Arc<dyn PriceOracle>,
    ) -> Self {
        let (_, flags) = watch::channel(RuntimeFlags {
            kill_switch: config.runtime.kill_switch,
        });
        Self {
            idempotency: engine.idempotency().clone(),
            audit: engine.audit().clone(),
            engine,
            ledger,
            exchange,
            oracle,
            bus: EventBus::default(),
            flags,
            execution: config.execution.clone(),
            fill_timeout: Duration::from_millis(config.timeouts.fill_timeout_ms),
        }
    }

    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.bus = bus;
        self
    }

    /// Drive the kill switch from a runtime control channel
    pub fn with_flags(mut self, flags: watch::Receiver<RuntimeFlags>) -> Self {
        self.flags = flags;
        self
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.bus
    }

    /// Run one intent on its own task
    pub fn submit(self: &Arc<Self>, intent: Intent) -> JoinHandle<ExecutionOutcome> {
        let router = Arc::clone(self);
        tokio::spawn(async move { router.handle_intent(intent).await })
    }

    #[instrument(skip(self, intent), fields(intent_id = %intent.intent_id, symbol = %intent.symbol, side = %intent.side))]
    pub async fn handle_intent(&self, intent: Intent) -> ExecutionOutcome {
        let key = intent.key();

        // Read once; the fingerprint is not recorded so redelivery after re-enable proceeds
        let kill_switch = self.flags.borrow().kill_switch;
        if kill_switch {
            warn!("Kill switch engaged, intent refused");
            self.record(&key, &intent.intent_id, Decision::KillSwitch, None).await;
            return self.fail(&intent, FailReason::KillSwitch, None);
        }

        match self
            .idempotency
            .admit(&IdempotencyStore::intent_fingerprint(&intent))
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!("Duplicate intent delivery ignored");
                self.record(&key, &intent.intent_id, Decision::DuplicateIgnored, None).await;
                return ExecutionOutcome::Duplicate {
                    intent_id: intent.intent_id.clone(),
                };
            }
            Err(e) => {
                error!(error = %e, "Intent fingerprint could not be persisted");
                return self.fail(&intent, FailReason::Error, Some(e.to_string()));
            }
        }

        if let Err(e) = intent.validate() {
            warn!(error = %e, "Invalid intent");
            self.record(&key, &intent.intent_id, Decision::InvalidIntent, Some(e.to_string()))
                .await;
            return self.fail(&intent, FailReason::InvalidIntent, Some(e.to_string()));
        }

        let Some(reference) = self.oracle.reference_price(&intent.symbol).await else {
            warn!("No reference price");
            self.record(&key, &intent.intent_id, Decision::NoPrice, None).await;
            return self.fail(&intent, FailReason::NoPrice, None);
        };

        let Some(_claim) = self.engine.claim(&key) else {
            self.record(&key, &intent.intent_id, Decision::KeyBusy, Some("claimed".into()))
                .await;
            return self.fail(&intent, FailReason::KeyBusy, None);
        };
        if let Some(phase) = self.busy_phase(&key).await {
            info!(phase = %phase, "Key busy");
            self.record(&key, &intent.intent_id, Decision::KeyBusy, Some(phase.to_string()))
                .await;
            return self.fail(&intent, FailReason::KeyBusy, None);
        }

        // Held at the price the order is sent at, not the intent's limit
        let order_price = self.guarded_price(intent.side, intent.limit_price, reference);
        let reservation = match self.ledger.reserve(
            &intent.symbol,
            intent.side,
            intent.quantity,
            order_price,
            &intent.intent_id,
        ) {
            Ok(reservation) => reservation,
            Err(e) => {
                let detail = match FailureKind::classify(&e) {
                    FailureKind::Insufficient(msg) => msg,
                    other => format!("{:?}", other),
                };
                warn!(error = %e, "Budget reservation failed");
                self.record(&key, &intent.intent_id, Decision::ReserveFailed, Some(detail.clone()))
                    .await;
                return self.fail(&intent, FailReason::ReserveFailed, Some(detail));
            }
        };

        let handle = reservation.handle;
        match self
            .engine
            .process_event(&key, FsmEvent::budget_reserved(intent.clone(), reservation))
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                self.release_quietly(&handle);
                return self.fail(&intent, FailReason::KeyBusy, None);
            }
            Err(e) => {
                error!(error = %e, "Failed to record reservation");
                self.release_quietly(&handle);
                return self.fail(&intent, FailReason::Error, Some(e.to_string()));
            }
        }

        self.drive(&intent, &key, order_price, Step::Place(1)).await
    }

    /// Continue a recovered in-flight order. `None` if the key holds nothing
    /// resumable or another task owns it.
    pub async fn resume(&self, key: &StateKey) -> Option<ExecutionOutcome> {
        let _claim = self.engine.claim(key)?;
        let state = self.engine.state(key).await?;
        let intent = state.intent.clone()?;
        let order_price = match state.reservation.as_ref().map(|r| r.reserved_price) {
            Some(price) if price > Decimal::ZERO => price,
            // Snapshots written before the price was kept with the reservation
            _ => {
                let reference = self
                    .oracle
                    .reference_price(&intent.symbol)
                    .await
                    .unwrap_or(intent.limit_price);
                self.guarded_price(intent.side, intent.limit_price, reference)
            }
        };

        let attempt = state.retry_count + 1;
        let step = match state.phase {
            OrderPhase::Sent | OrderPhase::Partial => {
                let client_order_id = state.order_context.client_order_id.clone()?;
                let exchange_order_id = state
                    .order_context
                    .exchange_order_id
                    .clone()
                    .unwrap_or_else(|| client_order_id.clone());
                Step::Await {
                    attempt,
                    client_order_id,
                    exchange_order_id,
                }
            }
            OrderPhase::Reserved | OrderPhase::Retry => Step::Place(attempt),
            OrderPhase::Filled | OrderPhase::Canceled | OrderPhase::FailedFinal => {
                return self.settled_outcome(&intent, &state);
            }
            OrderPhase::New | OrderPhase::Error => return None,
        };

        info!(key = %key, phase = %state.phase, attempt, "Resuming recovered order");
        Some(self.drive(&intent, key, order_price, step).await)
    }

    /// Sweep live orders that outlived their fill deadline on keys no task is
    /// driving (e.g. recovered orders not yet resumed). Each one is cancelled
    /// and reconciled before the timeout is applied. Other deadlines go through
    /// the engine's tick.
    pub async fn sweep(&self, now: DateTime<Utc>) -> usize {
        let mut applied = 0;
        for key in self.engine.keys() {
            let Some(state) = self.engine.state(&key).await else {
                continue;
            };
            if !state.phase.has_live_order() || self.engine.timeouts().check(&key, &state, now).is_empty() {
                continue;
            }
            let Some(_claim) = self.engine.claim(&key) else {
                continue;
            };
            // Re-read under the claim; a fill may have landed in between
            let Some(state) = self.engine.state(&key).await else {
                continue;
            };
            if !state.phase.has_live_order() {
                continue;
            }
            let (Some(intent), Some(client_order_id)) =
                (state.intent.as_ref(), state.order_context.client_order_id.clone())
            else {
                continue;
            };
            let exchange_order_id = state
                .order_context
                .exchange_order_id
                .clone()
                .unwrap_or_else(|| client_order_id.clone());

            info!(key = %key, client_order_id = %client_order_id, "Sweeping expired live order");
            let cancel = self.cancel_best_effort(&intent.symbol, &exchange_order_id).await;
            self.reconcile(&key, &intent.symbol, &exchange_order_id).await;
            if self
                .emit(&key, FsmEvent::timeout(&client_order_id, cancel).at(now))
                .await
            {
                applied += 1;
            }
        }
        applied + self.engine.tick(now).await
    }

    async fn drive(&self, intent: &Intent, key: &StateKey, order_price: Decimal, start: Step) -> ExecutionOutcome {
        let mut step = start;

        loop {
            let Some(state) = self.engine.state(key).await else {
                return self.fail(intent, FailReason::Error, Some("state missing".into()));
            };
            if let Some(outcome) = self.settled_outcome(intent, &state) {
                return outcome;
            }

            let (attempt, client_order_id, exchange_order_id) = match step {
                Step::Place(attempt) => {
                    if attempt > self.execution.max_retries {
                        self.emit(key, FsmEvent::attempts_exhausted(&intent.intent_id)).await;
                        return self.conclude(intent, key, Some(FailReason::RetriesExhausted)).await;
                    }

                    match self.place(intent, key, &state, order_price, attempt).await {
                        Ok(Some((client_order_id, exchange_order_id))) => {
                            (attempt, client_order_id, exchange_order_id)
                        }
                        Ok(None) => {
                            self.backoff(key, intent, attempt).await;
                            step = Step::Place(attempt + 1);
                            continue;
                        }
                        Err(reason) => {
                            self.emit(key, FsmEvent::order_rejected(&intent.intent_id, reason))
                                .await;
                            return self.conclude(intent, key, Some(FailReason::Rejected)).await;
                        }
                    }
                }
                Step::Await {
                    attempt,
                    client_order_id,
                    exchange_order_id,
                } => (attempt, client_order_id, exchange_order_id),
            };

            match self.await_fills(intent, key, &exchange_order_id).await {
                WaitOutcome::Filled => return self.conclude(intent, key, None).await,
                WaitOutcome::TimedOut => {
                    let cancel = self.cancel_best_effort(&intent.symbol, &exchange_order_id).await;
                    self.reconcile(key, &intent.symbol, &exchange_order_id).await;
                    self.emit(key, FsmEvent::timeout(&client_order_id, cancel)).await;
                }
                WaitOutcome::Closed(status) => {
                    info!(client_order_id = %client_order_id, status = ?status, "Venue closed the order unfilled");
                    self.emit(key, FsmEvent::timeout(&client_order_id, CancelOutcome::NotAttempted))
                        .await;
                }
                WaitOutcome::Broken(reason) => {
                    self.cancel_best_effort(&intent.symbol, &exchange_order_id).await;
                    self.reconcile(key, &intent.symbol, &exchange_order_id).await;
                    self.emit(key, FsmEvent::unexpected_error(reason)).await;
                    return self.conclude(intent, key, Some(FailReason::Error)).await;
                }
            }

            match self.engine.state(key).await {
                Some(state) if state.phase == OrderPhase::Retry => {
                    self.backoff(key, intent, attempt).await;
                    step = Step::Place(attempt + 1);
                }
                // Legacy cancel-and-stop, or filled during reconciliation
                _ => return self.conclude(intent, key, Some(FailReason::Canceled)).await,
            }
        }
    }

    /// Place one attempt. `Ok(Some(ids))` once an order is working, `Ok(None)` for
    /// a retryable failure, `Err(reason)` for a permanent rejection.
    async fn place(
        &self,
        intent: &Intent,
        key: &StateKey,
        state: &FsmState,
        order_price: Decimal,
        attempt: u32,
    ) -> Result<Option<(String, String)>, String> {
        let client_order_id = intent.client_order_id(attempt);
        let request = OrderRequest {
            client_order_id: client_order_id.clone(),
            symbol: intent.symbol.clone(),
            side: intent.side,
            quantity: state.order_context.remaining_qty(),
            limit_price: order_price,
            time_in_force: self.execution.time_in_force,
        };

        let failure = match self.exchange.place_order(&request).await {
            Ok(handle) => {
                debug!(attempt, client_order_id = %client_order_id, price = %request.limit_price, "Order placed");
                self.emit(
                    key,
                    FsmEvent::order_sent(&client_order_id, Some(handle.exchange_order_id.clone())),
                )
                .await;
                return Ok(Some((client_order_id, handle.exchange_order_id)));
            }
            Err(e) => FailureKind::classify(&OrdexError::Exchange(e)),
        };

        match failure {
            FailureKind::Transient(msg) => {
                warn!(attempt, error = %msg, "Transient placement failure");
                self.emit(key, FsmEvent::send_failed(&client_order_id, msg)).await;
                Ok(None)
            }
            FailureKind::Duplicate { client_order_id } => {
                match self.exchange.fetch_order(&intent.symbol, &client_order_id).await {
                    Ok(Some(report)) => {
                        info!(client_order_id = %client_order_id, "Adopting existing order");
                        self.emit(
                            key,
                            FsmEvent::order_sent(&client_order_id, Some(report.exchange_order_id.clone())),
                        )
                        .await;
                        self.apply_report(key, &report).await;
                        Ok(Some((client_order_id, report.exchange_order_id)))
                    }
                    Ok(None) | Err(_) => {
                        warn!(client_order_id = %client_order_id, "Duplicate order could not be fetched");
                        self.emit(
                            key,
                            FsmEvent::send_failed(&client_order_id, "duplicate order not found"),
                        )
                        .await;
                        Ok(None)
                    }
                }
            }
            FailureKind::Permanent(msg)
            | FailureKind::Insufficient(msg)
            | FailureKind::NoPrice(msg) => {
                warn!(attempt, error = %msg, "Order rejected");
                Err(msg)
            }
        }
    }

    async fn await_fills(&self, intent: &Intent, key: &StateKey, exchange_order_id: &str) -> WaitOutcome {
        let grace = Duration::from_millis(self.execution.wait_grace_ms);
        let deadline = tokio::time::Instant::now() + self.fill_timeout;

        loop {
            match self.engine.state(key).await {
                Some(state) if state.phase == OrderPhase::Filled => return WaitOutcome::Filled,
                Some(state) if state.phase.has_live_order() => {}
                _ => return WaitOutcome::Broken("order left the live phases while waiting".into()),
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return WaitOutcome::TimedOut;
            }
            let remaining = deadline - now;

            let waited = tokio::time::timeout(
                remaining + grace,
                self.exchange.wait_for_fill(
                    &intent.symbol,
                    exchange_order_id,
                    remaining.as_millis() as u64,
                ),
            )
            .await;

            let report = match waited {
                Err(_) => return WaitOutcome::TimedOut,
                Ok(Err(e)) if e.is_transient() => {
                    warn!(error = %e, "Transient error while waiting for fill");
                    return WaitOutcome::TimedOut;
                }
                Ok(Err(e)) => return WaitOutcome::Broken(e.to_string()),
                Ok(Ok(report)) => report,
            };

            if let Some(reason) = self.apply_report(key, &report).await {
                return WaitOutcome::Broken(reason);
            }

            if report.status.is_terminal() {
                return match self.engine.state(key).await {
                    Some(state) if state.phase == OrderPhase::Filled => WaitOutcome::Filled,
                    _ => WaitOutcome::Closed(report.status),
                };
            }
        }
    }

    /// Feed trades not yet applied as fill events. Returns a reason if a fill
    /// could not be applied.
    async fn apply_report(&self, key: &StateKey, report: &OrderStatusReport) -> Option<String> {
        let state = self.engine.state(key).await?;
        for event in fills::fill_events(&state.order_context, &report.trades) {
            let event_id = event.event_id.clone();
            if let Err(e) = self.engine.process_event(key, event).await {
                error!(event_id = %event_id, error = %e, "Fill could not be applied");
                return Some(e.to_string());
            }
        }
        None
    }

    /// Fetch the true remote state after a timeout and apply late fills
    async fn reconcile(&self, key: &StateKey, symbol: &str, exchange_order_id: &str) {
        match self.exchange.fetch_order(symbol, exchange_order_id).await {
            Ok(Some(report)) => {
                self.apply_report(key, &report).await;
            }
            Ok(None) => warn!(exchange_order_id, "Order unknown to the venue during reconcile"),
            Err(e) => warn!(exchange_order_id, error = %e, "Reconcile fetch failed"),
        }
    }

    async fn cancel_best_effort(&self, symbol: &str, exchange_order_id: &str) -> CancelOutcome {
        match self.exchange.cancel_order(symbol, exchange_order_id).await {
            Ok(()) => CancelOutcome::Canceled,
            Err(e) => {
                warn!(exchange_order_id, error = %e, "Cancel failed; proceeding");
                CancelOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Sleep out the backoff for a failed attempt. No FSM lock is held here.
    async fn backoff(&self, key: &StateKey, intent: &Intent, attempt: u32) {
        let delay = self.execution.backoff_for(attempt.saturating_sub(1));
        debug!(attempt, delay_ms = delay.as_millis() as u64, "Backing off");
        self.record(
            key,
            &intent.intent_id,
            Decision::Backoff,
            Some(format!("attempt {} failed, waiting {}ms", attempt, delay.as_millis())),
        )
        .await;
        tokio::time::sleep(delay).await;
    }

    /// Limit price clamped to within the slippage band of the reference price
    pub fn guarded_price(&self, side: Side, limit: Decimal, reference: Decimal) -> Decimal {
        let band = self.execution.slippage_band;
        match side {
            Side::Buy => limit.min(reference * (Decimal::ONE + band)),
            Side::Sell => limit.max(reference * (Decimal::ONE - band)),
        }
    }

    /// `Some(phase)` when the key cannot take a new intent. Terminal states past
    /// their cooldown are reset first.
    async fn busy_phase(&self, key: &StateKey) -> Option<OrderPhase> {
        let state = self.engine.state(key).await?;
        if state.phase == OrderPhase::New {
            return None;
        }
        if state.phase.is_terminal()
            && !self
                .engine
                .timeouts()
                .in_cooldown(&state, Utc::now())
        {
            let previous = state.intent_id().unwrap_or("none").to_string();
            self.emit(key, FsmEvent::cooldown_elapsed(&previous)).await;
            return match self.engine.state(key).await {
                Some(s) if s.phase != OrderPhase::New => Some(s.phase),
                _ => None,
            };
        }
        Some(state.phase)
    }

    /// Outcome for a state that needs no further driving
    fn settled_outcome(&self, intent: &Intent, state: &FsmState) -> Option<ExecutionOutcome> {
        match state.phase {
            OrderPhase::Filled => Some(self.finish(intent, state, None)),
            OrderPhase::Canceled => Some(self.finish(intent, state, Some(FailReason::Canceled))),
            OrderPhase::FailedFinal => {
                Some(self.finish(intent, state, Some(FailReason::RetriesExhausted)))
            }
            OrderPhase::Error => Some(self.finish(intent, state, Some(FailReason::Error))),
            _ => None,
        }
    }

    /// `reason` is what a non-filled end is reported as; `None` when a fill is expected
    async fn conclude(&self, intent: &Intent, key: &StateKey, reason: Option<FailReason>) -> ExecutionOutcome {
        match self.engine.state(key).await {
            Some(state) => self.finish(intent, &state, reason),
            None => self.fail(intent, FailReason::Error, Some("state missing".into())),
        }
    }

    /// Build the outcome from the final state and publish its lifecycle event
    fn finish(&self, intent: &Intent, state: &FsmState, reason: Option<FailReason>) -> ExecutionOutcome {
        let ctx = &state.order_context;

        if state.phase == OrderPhase::Filled {
            let avg_price = ctx.avg_fill_price.unwrap_or(Decimal::ZERO);
            self.bus.publish(LifecycleEvent::Filled {
                intent_id: intent.intent_id.clone(),
                symbol: intent.symbol.clone(),
                filled_qty: ctx.filled_qty,
                avg_price,
                fees: ctx.fees,
            });
            return ExecutionOutcome::Filled {
                intent_id: intent.intent_id.clone(),
                filled_qty: ctx.filled_qty,
                avg_price,
                fees: ctx.fees,
            };
        }

        if ctx.filled_qty > Decimal::ZERO {
            self.bus.publish(LifecycleEvent::Partial {
                intent_id: intent.intent_id.clone(),
                symbol: intent.symbol.clone(),
                filled_qty: ctx.filled_qty,
                remaining_qty: ctx.remaining_qty(),
            });
            return ExecutionOutcome::Partial {
                intent_id: intent.intent_id.clone(),
                filled_qty: ctx.filled_qty,
                remaining_qty: ctx.remaining_qty(),
            };
        }

        let reason = match (state.phase, reason) {
            (OrderPhase::Error, _) | (_, None) => FailReason::Error,
            (_, Some(reason)) => reason,
        };
        self.fail(intent, reason, ctx.last_error.clone())
    }

    fn fail(&self, intent: &Intent, reason: FailReason, exchange_error: Option<String>) -> ExecutionOutcome {
        self.bus.publish(LifecycleEvent::Failed {
            intent_id: intent.intent_id.clone(),
            symbol: intent.symbol.clone(),
            reason,
            exchange_error: exchange_error.clone(),
        });
        ExecutionOutcome::Failed {
            intent_id: intent.intent_id.clone(),
            reason,
            exchange_error,
        }
    }

    /// Apply an event, logging failures. The caller re-reads state to decide.
    async fn emit(&self, key: &StateKey, event: FsmEvent) -> bool {
        let kind = event.kind();
        match self.engine.process_event(key, event).await {
            Ok(applied) => applied,
            Err(e) => {
                error!(key = %key, event = %kind, error = %e, "Event processing failed");
                false
            }
        }
    }

    async fn record(&self, key: &StateKey, intent_id: &str, decision: Decision, detail: Option<String>) {
        let record = AuditRecord::decision(key, Some(intent_id), decision, detail);
        if let Err(e) = self.audit.append(record).await {
            error!(error = %e, "Failed to append audit record");
        }
    }

    fn release_quietly(&self, handle: &crate::domain::ReservationHandle) {
        if let Err(e) = self.ledger.release(handle) {
            error!(error = %e, "Failed to release reservation");
        }
    }
}
