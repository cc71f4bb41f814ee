//! FSM engine
//!
//! Drives every (symbol, side) state through the transition table. Each key has
//! its own async lock so different keys progress in parallel while events for
//! one key apply strictly in order.
//!
//! Per event:
//! 1. Look up `(phase, event)`; no entry is a no-op
//! 2. Idempotency check on the event fingerprint
//! 3. Run the action on a copy of the state (ledger effects included)
//! 4. Install the copy, write its snapshot, append history and audit

use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::fills;
use super::idempotency::IdempotencyStore;
use super::timeout::TimeoutManager;
use super::transitions::{strategy_for, Action, Target, Transition, TransitionStrategy};
use super::BudgetLedger;
use crate::config::AppConfig;
use crate::domain::{
    EventPayload, FsmEvent, FsmState, OrderContext, OrderPhase, StateKey, TransitionRecord,
};
use crate::error::{OrdexError, Result};
use crate::persistence::{AuditLog, AuditRecord, SnapshotStore};

pub struct FsmEngine {
    states: DashMap<StateKey, Arc<Mutex<FsmState>>>,
    claims: DashSet<StateKey>,
    ledger: Arc<BudgetLedger>,
    idempotency: Arc<IdempotencyStore>,
    snapshots: Arc<dyn SnapshotStore>,
    audit: Arc<dyn AuditLog>,
    strategy: Box<dyn TransitionStrategy>,
    timeouts: TimeoutManager,
    history_limit: usize,
}

/// Exclusive ownership of a key by one router task, released on drop
pub struct KeyClaim<'a> {
    claims: &'a DashSet<StateKey>,
    key: StateKey,
}

impl Drop for KeyClaim<'_> {
    fn drop(&mut self) {
        self.claims.remove(&self.key);
    }
}

impl FsmEngine {
    pub fn new(
        config: &AppConfig,
        ledger: Arc<BudgetLedger>,
        idempotency: Arc<IdempotencyStore>,
        snapshots: Arc<dyn SnapshotStore>,
        audit: Arc<dyn AuditLog>,
    ) -> Self {
        Self {
            states: DashMap::new(),
            claims: DashSet::new(),
            ledger,
            idempotency,
            snapshots,
            audit,
            strategy: strategy_for(config.execution.transition_strategy),
            timeouts: TimeoutManager::new(&config.timeouts),
            history_limit: config.fsm.history_limit,
        }
    }

    pub fn with_strategy(mut self, strategy: Box<dyn TransitionStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn timeouts(&self) -> &TimeoutManager {
        &self.timeouts
    }

    pub fn idempotency(&self) -> &Arc<IdempotencyStore> {
        &self.idempotency
    }

    pub fn audit(&self) -> &Arc<dyn AuditLog> {
        &self.audit
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    fn slot(&self, key: &StateKey) -> Arc<Mutex<FsmState>> {
        self.states
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(FsmState::new(key.clone(), Utc::now()))))
            .value()
            .clone()
    }

    /// Claim a key for one router task. `None` if another task owns it.
    pub fn claim(&self, key: &StateKey) -> Option<KeyClaim<'_>> {
        if self.claims.insert(key.clone()) {
            Some(KeyClaim {
                claims: &self.claims,
                key: key.clone(),
            })
        } else {
            None
        }
    }

    pub fn is_claimed(&self, key: &StateKey) -> bool {
        self.claims.contains(key)
    }

    /// Current state for a key, if the engine has seen it
    pub async fn state(&self, key: &StateKey) -> Option<FsmState> {
        let slot = self.states.get(key).map(|s| s.value().clone())?;
        let state = slot.lock().await;
        Some(state.clone())
    }

    /// Replace the live state for a key (used by recovery)
    pub async fn install(&self, state: FsmState) {
        let slot = self.slot(&state.key);
        let mut current = slot.lock().await;
        *current = state;
    }

    pub fn keys(&self) -> Vec<StateKey> {
        let mut keys: Vec<StateKey> = self.states.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Apply one event. `Ok(false)` when the event has no entry for the current
    /// phase or was already applied.
    pub async fn process_event(&self, key: &StateKey, event: FsmEvent) -> Result<bool> {
        let slot = self.slot(key);
        let mut current = slot.lock().await;
        let from = current.phase;
        let kind = event.kind();

        let Some(transition) = self.strategy.lookup(from, kind) else {
            debug!(key = %key, phase = %from, event = %kind, "No transition, event ignored");
            return Ok(false);
        };

        let fingerprint = IdempotencyStore::event_fingerprint(key, &event.event_id);
        if !self.idempotency.check_and_record(&fingerprint) {
            debug!(key = %key, event_id = %event.event_id, "Duplicate event ignored");
            return Ok(false);
        }

        let mut next = current.clone();
        let to = match self.apply(&mut next, &event, transition) {
            Ok(to) => to,
            Err(e) => {
                self.idempotency.forget(&fingerprint);
                warn!(key = %key, phase = %from, event = %kind, error = %e, "Transition action failed");
                return Err(e);
            }
        };

        next.phase = to;
        next.version += 1;
        next.last_transition_at = event.at;
        next.push_history(
            TransitionRecord {
                from,
                to,
                event: kind,
                event_id: event.event_id.clone(),
                timestamp: event.at,
            },
            self.history_limit,
        );

        let intent_id = next
            .intent_id()
            .or_else(|| current.intent_id())
            .map(str::to_string);
        *current = next;

        let persisted = if matches!(to, OrderPhase::Filled | OrderPhase::New) {
            self.snapshots.delete(key).await
        } else {
            self.snapshots.save(&current).await
        };

        let record = AuditRecord::transition(
            key,
            intent_id.as_deref(),
            from,
            to,
            kind,
            &event.event_id,
            event.at,
        );
        if let Err(e) = self.audit.append(record).await {
            error!(key = %key, error = %e, "Failed to append audit record");
        }

        if let Err(e) = persisted {
            error!(key = %key, phase = %to, error = %e, "Snapshot write failed");
            return Err(e);
        }

        info!(
            key = %key,
            intent_id = intent_id.as_deref().unwrap_or("-"),
            "{} -> {} on {}",
            from,
            to,
            kind
        );
        Ok(true)
    }

    /// Run the action against `state` and resolve the target phase
    fn apply(&self, state: &mut FsmState, event: &FsmEvent, transition: Transition) -> Result<OrderPhase> {
        match (transition.action, &event.payload) {
            (Action::StoreReservation, EventPayload::BudgetReserved { intent, reservation }) => {
                let already_stored =
                    state.reservation.as_ref().map(|r| r.handle) == Some(reservation.handle);
                if !already_stored {
                    state.intent = Some(intent.clone());
                    state.reservation = Some(reservation.clone());
                    state.order_context = OrderContext::new(intent.quantity);
                    state.retry_count = 0;
                }
            }

            (
                Action::RecordSend,
                EventPayload::OrderSent {
                    client_order_id,
                    exchange_order_id,
                },
            ) => {
                let ctx = &mut state.order_context;
                if ctx.sent_client_ids.insert(client_order_id.clone()) {
                    ctx.attempt_count += 1;
                    ctx.exchange_order_id = exchange_order_id.clone();
                } else if exchange_order_id.is_some() {
                    ctx.exchange_order_id = exchange_order_id.clone();
                }
                ctx.client_order_id = Some(client_order_id.clone());
                ctx.first_sent_at.get_or_insert(event.at);
                ctx.last_update_at = Some(event.at);
            }

            (
                Action::ApplyFill,
                EventPayload::FillPartial { trade } | EventPayload::FillComplete { trade },
            ) => {
                let outcome = fills::accumulate_trade(&mut state.order_context, trade)?;
                if outcome.applied {
                    let handle = state.reservation.as_ref().map(|r| r.handle).ok_or_else(|| {
                        OrdexError::BudgetAccounting(format!(
                            "fill {} on {} without a reservation",
                            trade.trade_id, state.key
                        ))
                    })?;
                    let committed =
                        self.ledger
                            .commit(&handle, trade.quantity, trade.price, trade.fee)?;
                    state.reservation = Some(committed);
                    state.order_context.last_update_at = Some(event.at);
                }
            }

            (Action::RecordTimeout | Action::ReleaseRemaining, EventPayload::Timeout { cancel }) => {
                if transition.action == Action::RecordTimeout {
                    state.retry_count += 1;
                }
                state.order_context.last_error = Some(format!("fill timeout, cancel {:?}", cancel));
            }

            (Action::RecordSendFailure, EventPayload::SendFailed { reason }) => {
                state.retry_count += 1;
                state.order_context.last_error = Some(reason.clone());
            }

            (Action::RecordRejection, EventPayload::OrderRejected { reason }) => {
                state.order_context.last_error = Some(reason.clone());
            }

            (Action::ReleaseRemaining, EventPayload::AttemptsExhausted) => {}

            (Action::CaptureError, EventPayload::UnexpectedError { reason }) => {
                error!(key = %state.key, phase = %state.phase, reason = %reason, "Unexpected execution error");
                state.order_context.last_error = Some(reason.clone());
            }

            (Action::Revalidate, EventPayload::Recover) => {
                if state.order_context.filled_qty.is_zero() {
                    reset(state, event.at);
                }
            }

            (Action::Reset, EventPayload::CooldownElapsed) => reset(state, event.at),

            (action, _) => {
                return Err(OrdexError::Internal(format!(
                    "action {:?} cannot take a {} payload",
                    action,
                    event.kind()
                )))
            }
        }

        let to = match transition.target {
            Target::Fixed(phase) => phase,
            Target::FillProgress if state.order_context.is_fully_filled() => OrderPhase::Filled,
            Target::FillProgress => OrderPhase::Partial,
            Target::Revalidate if state.order_context.filled_qty.is_zero() => OrderPhase::New,
            Target::Revalidate => OrderPhase::FailedFinal,
        };

        // Phases that hold no budget settle whatever is still outstanding
        if !to.holds_budget() {
            if let Some(reservation) = state.reservation.as_ref().filter(|r| !r.settled) {
                let settled = self.ledger.release(&reservation.handle)?;
                state.reservation = Some(settled);
            }
        }

        Ok(to)
    }

    /// Feed deadline breaches for unclaimed keys through the transition table.
    ///
    /// Live orders (SENT, PARTIAL) are never moved here: leaving them needs a
    /// cancel and reconcile against the venue, which the router's sweep does.
    pub async fn tick(&self, now: DateTime<Utc>) -> usize {
        let mut applied = 0;
        for key in self.keys() {
            if self.is_claimed(&key) {
                continue;
            }
            let Some(state) = self.state(&key).await else {
                continue;
            };
            if state.phase.has_live_order() {
                debug!(key = %key, phase = %state.phase, "Live order left to the router sweep");
                continue;
            }
            for timeout in self.timeouts.check(&key, &state, now) {
                match self.process_event(&key, timeout.into_fsm_event(now)).await {
                    Ok(true) => applied += 1,
                    Ok(false) => {}
                    Err(e) => warn!(key = %key, error = %e, "Timeout event failed"),
                }
            }
        }
        applied
    }
}

/// Fresh NEW state for the key, keeping history and version
fn reset(state: &mut FsmState, at: DateTime<Utc>) {
    let mut fresh = FsmState::new(state.key.clone(), at);
    fresh.history = std::mem::take(&mut state.history);
    fresh.version = state.version;
    *state = fresh;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BudgetConfig, TransitionStrategyKind};
    use crate::domain::{CancelOutcome, Intent, Side, Trade};
    use crate::execution::LegacyTransitions;
    use crate::persistence::{MemoryAuditLog, MemorySnapshotStore};
    use chrono::Duration;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    struct Harness {
        engine: FsmEngine,
        ledger: Arc<BudgetLedger>,
        snapshots: Arc<MemorySnapshotStore>,
        audit: Arc<MemoryAuditLog>,
    }

    fn harness_with(config: AppConfig) -> Harness {
        let ledger = Arc::new(BudgetLedger::new(&config.budget));
        let snapshots = Arc::new(MemorySnapshotStore::new());
        let audit = Arc::new(MemoryAuditLog::new());
        let engine = FsmEngine::new(
            &config,
            ledger.clone(),
            Arc::new(IdempotencyStore::new(&config.idempotency)),
            snapshots.clone(),
            audit.clone(),
        );
        Harness {
            engine,
            ledger,
            snapshots,
            audit,
        }
    }

    fn harness() -> Harness {
        let mut config = AppConfig::default_config();
        config.budget = BudgetConfig {
            initial_capital: dec!(1000),
            reserve_buffer: Decimal::ZERO,
            ..BudgetConfig::default()
        };
        harness_with(config)
    }

    fn intent() -> Intent {
        Intent::new("BTC/USDT", Side::Buy, dec!(1), dec!(100), Utc::now(), b"engine-test")
    }

    async fn reserve_and_send(h: &Harness, intent: &Intent) -> StateKey {
        let key = intent.key();
        let res = h
            .ledger
            .reserve(&intent.symbol, intent.side, intent.quantity, intent.limit_price, &intent.intent_id)
            .unwrap();
        assert!(h
            .engine
            .process_event(&key, FsmEvent::budget_reserved(intent.clone(), res))
            .await
            .unwrap());
        assert!(h
            .engine
            .process_event(&key, FsmEvent::order_sent(&intent.client_order_id(1), Some("ex-1".into())))
            .await
            .unwrap());
        key
    }

    #[tokio::test]
    async fn test_partial_then_complete_fills() {
        let h = harness();
        let intent = intent();
        let key = reserve_and_send(&h, &intent).await;

        h.engine
            .process_event(&key, FsmEvent::fill_partial(Trade::new("t-1", dec!(0.4), dec!(100), Decimal::ZERO)))
            .await
            .unwrap();
        assert_eq!(h.engine.state(&key).await.unwrap().phase, OrderPhase::Partial);

        h.engine
            .process_event(&key, FsmEvent::fill_complete(Trade::new("t-2", dec!(0.6), dec!(102), Decimal::ZERO)))
            .await
            .unwrap();

        let state = h.engine.state(&key).await.unwrap();
        assert_eq!(state.phase, OrderPhase::Filled);
        assert_eq!(state.order_context.avg_fill_price, Some(dec!(101.2)));
        let reservation = state.reservation.unwrap();
        assert!(reservation.settled);
        assert!(reservation.is_balanced());
        // Filled snapshots are dropped immediately
        assert!(h.snapshots.load(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_events_without_entry_are_noops() {
        let h = harness();
        let key = StateKey::new("BTC/USDT", Side::Buy);
        let applied = h
            .engine
            .process_event(&key, FsmEvent::fill_partial(Trade::new("t-1", dec!(1), dec!(1), Decimal::ZERO)))
            .await
            .unwrap();
        assert!(!applied);
        assert_eq!(h.engine.state(&key).await.unwrap().phase, OrderPhase::New);
        assert!(h.audit.all().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_fill_applies_once() {
        let h = harness();
        let intent = intent();
        let key = reserve_and_send(&h, &intent).await;
        let fill = FsmEvent::fill_partial(Trade::new("t-1", dec!(0.4), dec!(100), Decimal::ZERO));

        assert!(h.engine.process_event(&key, fill.clone()).await.unwrap());
        assert!(!h.engine.process_event(&key, fill).await.unwrap());

        let state = h.engine.state(&key).await.unwrap();
        assert_eq!(state.order_context.filled_qty, dec!(0.4));
        assert_eq!(state.reservation.unwrap().committed_qty, dec!(0.4));
    }

    #[tokio::test]
    async fn test_failed_action_leaves_state_and_allows_retry() {
        let h = harness();
        let intent = intent();
        let key = reserve_and_send(&h, &intent).await;
        let before = h.engine.state(&key).await.unwrap();

        // Overfill is rejected as malformed input
        let bad = FsmEvent::fill_partial(Trade::new("t-9", dec!(5), dec!(100), Decimal::ZERO));
        assert!(matches!(
            h.engine.process_event(&key, bad).await,
            Err(OrdexError::Fill(_))
        ));
        assert_eq!(h.engine.state(&key).await.unwrap(), before);

        // The fingerprint was forgotten, so a corrected report with the same id applies
        let good = FsmEvent::fill_partial(Trade::new("t-9", dec!(0.5), dec!(100), Decimal::ZERO));
        assert!(h.engine.process_event(&key, good).await.unwrap());
    }

    #[tokio::test]
    async fn test_timeout_then_exhausted_releases_budget() {
        let h = harness();
        let intent = intent();
        let key = reserve_and_send(&h, &intent).await;

        h.engine
            .process_event(&key, FsmEvent::fill_partial(Trade::new("t-1", dec!(0.6), dec!(100), Decimal::ZERO)))
            .await
            .unwrap();
        h.engine
            .process_event(&key, FsmEvent::timeout(&intent.client_order_id(1), CancelOutcome::Canceled))
            .await
            .unwrap();
        assert_eq!(h.engine.state(&key).await.unwrap().phase, OrderPhase::Retry);

        h.engine
            .process_event(&key, FsmEvent::attempts_exhausted(&intent.intent_id))
            .await
            .unwrap();

        let state = h.engine.state(&key).await.unwrap();
        assert_eq!(state.phase, OrderPhase::FailedFinal);
        let reservation = state.reservation.unwrap();
        assert_eq!(reservation.committed_notional, dec!(60));
        assert_eq!(reservation.released_notional, dec!(40));
        assert_eq!(h.ledger.available(), dec!(940));
    }

    #[tokio::test]
    async fn test_legacy_strategy_cancels_on_timeout() {
        let mut h = harness();
        h.engine = h.engine.with_strategy(Box::new(LegacyTransitions));
        let intent = intent();
        let key = reserve_and_send(&h, &intent).await;

        h.engine
            .process_event(&key, FsmEvent::timeout(&intent.client_order_id(1), CancelOutcome::Canceled))
            .await
            .unwrap();
        let state = h.engine.state(&key).await.unwrap();
        assert_eq!(state.phase, OrderPhase::Canceled);
        assert!(state.reservation.unwrap().settled);
        assert_eq!(h.ledger.available(), dec!(1000));
    }

    #[tokio::test]
    async fn test_error_then_recover_paths() {
        let h = harness();
        let intent = intent();
        let key = reserve_and_send(&h, &intent).await;

        h.engine
            .process_event(&key, FsmEvent::unexpected_error("boom"))
            .await
            .unwrap();
        let state = h.engine.state(&key).await.unwrap();
        assert_eq!(state.phase, OrderPhase::Error);
        assert_eq!(h.ledger.available(), dec!(1000));

        h.engine.process_event(&key, FsmEvent::recover()).await.unwrap();
        let state = h.engine.state(&key).await.unwrap();
        assert_eq!(state.phase, OrderPhase::New);
        assert!(state.intent.is_none());
        assert!(!state.history.is_empty());
    }

    #[tokio::test]
    async fn test_tick_cools_down_terminal_states() {
        let h = harness();
        let intent = intent();
        let key = reserve_and_send(&h, &intent).await;
        h.engine
            .process_event(&key, FsmEvent::order_rejected(&intent.intent_id, "bad symbol"))
            .await
            .unwrap();
        assert!(h.snapshots.load(&key).await.unwrap().is_some());

        // Within cooldown nothing happens
        assert_eq!(h.engine.tick(Utc::now()).await, 0);

        let later = Utc::now() + Duration::seconds(60);
        assert_eq!(h.engine.tick(later).await, 1);
        assert_eq!(h.engine.state(&key).await.unwrap().phase, OrderPhase::New);
        assert!(h.snapshots.load(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_tick_leaves_live_orders_and_skips_claimed_keys() {
        let h = harness();
        let sent = reserve_and_send(&h, &intent()).await;

        let parked = Intent::new("ETH/USDT", Side::Buy, dec!(1), dec!(100), Utc::now(), b"parked");
        let parked_key = parked.key();
        let res = h
            .ledger
            .reserve(&parked.symbol, parked.side, parked.quantity, parked.limit_price, &parked.intent_id)
            .unwrap();
        h.engine
            .process_event(&parked_key, FsmEvent::budget_reserved(parked.clone(), res))
            .await
            .unwrap();

        // Past both the fill timeout and the order lifetime
        let later = Utc::now() + Duration::minutes(10);
        {
            let _claim = h.engine.claim(&parked_key).unwrap();
            assert!(h.engine.claim(&parked_key).is_none());
            assert_eq!(h.engine.tick(later).await, 0);
        }
        assert_eq!(h.engine.state(&sent).await.unwrap().phase, OrderPhase::Sent);

        assert_eq!(h.engine.tick(later).await, 1);
        assert_eq!(h.engine.state(&parked_key).await.unwrap().phase, OrderPhase::Error);
        // The live order still holds its budget; the parked one was released
        assert_eq!(h.engine.state(&sent).await.unwrap().phase, OrderPhase::Sent);
        assert_eq!(h.ledger.available(), dec!(900));
    }

    #[tokio::test]
    async fn test_complete_fill_replayed_against_restored_snapshot() {
        let h = harness();
        let intent = intent();
        let key = reserve_and_send(&h, &intent).await;
        let snapshot = h.snapshots.load(&key).await.unwrap().unwrap();
        assert_eq!(snapshot.phase, OrderPhase::Sent);

        // Restart from the SENT snapshot
        let config = AppConfig::default_config();
        let ledger = Arc::new(BudgetLedger::new(&BudgetConfig {
            initial_capital: dec!(1000),
            reserve_buffer: Decimal::ZERO,
            ..BudgetConfig::default()
        }));
        ledger.restore(snapshot.reservation.as_ref().unwrap()).unwrap();
        let snapshots = Arc::new(MemorySnapshotStore::new());
        let engine = FsmEngine::new(
            &config,
            ledger.clone(),
            Arc::new(IdempotencyStore::new(&config.idempotency)),
            snapshots.clone(),
            Arc::new(MemoryAuditLog::new()),
        );
        engine.install(snapshot).await;
        assert_eq!(ledger.available(), dec!(900));

        let fill = FsmEvent::fill_complete(Trade::new("t-9", dec!(1), dec!(100), Decimal::ZERO));
        assert!(engine.process_event(&key, fill.clone()).await.unwrap());
        assert!(!engine.process_event(&key, fill).await.unwrap());

        let state = engine.state(&key).await.unwrap();
        assert_eq!(state.phase, OrderPhase::Filled);
        assert_eq!(state.order_context.filled_qty, dec!(1));
        let reservation = state.reservation.unwrap();
        assert_eq!(reservation.committed_notional, dec!(100));
        assert!(reservation.settled);
        assert_eq!(ledger.available(), dec!(900));
        assert_eq!(ledger.snapshot().unwrap().committed_total, dec!(100));
        assert!(snapshots.load(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_replay_after_restart_is_idempotent() {
        let h = harness();
        let intent = intent();
        let key = reserve_and_send(&h, &intent).await;
        let fill = FsmEvent::fill_partial(Trade::new("t-1", dec!(0.4), dec!(100), Decimal::ZERO));
        h.engine.process_event(&key, fill.clone()).await.unwrap();

        // Simulated restart: fresh engine and idempotency store, ledger restored from the snapshot
        let snapshot = h.snapshots.load(&key).await.unwrap().unwrap();
        let config = AppConfig::default_config();
        let ledger = Arc::new(BudgetLedger::new(&BudgetConfig {
            initial_capital: dec!(1000),
            reserve_buffer: Decimal::ZERO,
            ..BudgetConfig::default()
        }));
        ledger.restore(snapshot.reservation.as_ref().unwrap()).unwrap();
        let engine = FsmEngine::new(
            &config,
            ledger.clone(),
            Arc::new(IdempotencyStore::new(&config.idempotency)),
            Arc::new(MemorySnapshotStore::new()),
            Arc::new(MemoryAuditLog::new()),
        );
        engine.install(snapshot).await;

        // Replaying the same fill changes nothing
        engine.process_event(&key, fill).await.unwrap();
        let state = engine.state(&key).await.unwrap();
        assert_eq!(state.order_context.filled_qty, dec!(0.4));
        assert_eq!(state.reservation.as_ref().unwrap().committed_qty, dec!(0.4));
        // Only the outstanding 60 is held again
        assert_eq!(ledger.available(), dec!(940));
    }

    #[tokio::test]
    async fn test_every_transition_is_audited() {
        let h = harness();
        let intent = intent();
        reserve_and_send(&h, &intent).await;
        let records = h.audit.by_intent(&intent.intent_id).await.unwrap();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn test_strategy_selected_from_config() {
        let mut config = AppConfig::default_config();
        config.execution.transition_strategy = TransitionStrategyKind::Legacy;
        let h = harness_with(config);
        assert_eq!(h.engine.strategy_name(), "legacy");
    }
}
