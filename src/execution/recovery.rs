//! Startup recovery
//!
//! Reloads the intent fingerprints still live in the journal, then loads
//! every snapshot, validates it, restores its reservation into the ledger and
//! installs it in the engine. In-flight orders are reconciled
//! against the exchange before the router resumes them, so fills that landed
//! while the process was down are applied exactly once.

use chrono::Utc;
use std::fmt;
use std::sync::Arc;
use tracing::{error, info, warn};

use super::engine::FsmEngine;
use super::fills;
use super::idempotency::IdempotencyStore;
use super::BudgetLedger;
use crate::domain::{FsmEvent, FsmState, OrderPhase, StateKey};
use crate::error::{OrdexError, Result};
use crate::exchange::ExchangeClient;
use crate::persistence::{AuditRecord, Decision, SnapshotStore};

/// What recovery did, per key
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Snapshots restored as-is
    pub restored: Vec<StateKey>,
    /// Snapshots that failed validation and were reset to NEW
    pub reset: Vec<(StateKey, String)>,
    /// Keys with an order still in progress, to hand to `OrderRouter::resume`
    pub resumable: Vec<StateKey>,
    /// Fill events applied during reconciliation
    pub fills_applied: usize,
    /// Intent fingerprints reloaded from the journal
    pub fingerprints_reloaded: usize,
}

impl fmt::Display for RecoveryReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "restored={} reset={} resumable={} fills_applied={} fingerprints={}",
            self.restored.len(),
            self.reset.len(),
            self.resumable.len(),
            self.fills_applied,
            self.fingerprints_reloaded
        )?;
        for (key, reason) in &self.reset {
            writeln!(f, "  reset {}: {}", key, reason)?;
        }
        for key in &self.resumable {
            writeln!(f, "  resumable {}", key)?;
        }
        Ok(())
    }
}

pub struct RecoveryManager {
    engine: Arc<FsmEngine>,
    ledger: Arc<BudgetLedger>,
    snapshots: Arc<dyn SnapshotStore>,
    exchange: Arc<dyn ExchangeClient>,
}

impl RecoveryManager {
    pub fn new(
        engine: Arc<FsmEngine>,
        ledger: Arc<BudgetLedger>,
        snapshots: Arc<dyn SnapshotStore>,
        exchange: Arc<dyn ExchangeClient>,
    ) -> Self {
        Self {
            engine,
            ledger,
            snapshots,
            exchange,
        }
    }

    /// Restore all snapshots. Per-key failures are reset or logged; only a
    /// failure to read the store at all is returned.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport {
            fingerprints_reloaded: self.engine.idempotency().reload(Utc::now()).await?,
            ..RecoveryReport::default()
        };

        let states = self.snapshots.list().await?;
        info!(snapshots = states.len(), "Starting recovery");

        for state in states {
            let key = state.key.clone();

            if let Err(e) = validate(&state) {
                warn!(key = %key, phase = %state.phase, error = %e, "Discarding inconsistent snapshot");
                self.reset_stale(&state, &e).await?;
                report.reset.push((key, e.to_string()));
                continue;
            }

            if let Some(reservation) = &state.reservation {
                self.ledger.restore(reservation)?;
            }
            // Redelivery of a recovered intent must not start a second order,
            // even if its journal entry was lost or has expired
            if let Some(intent) = &state.intent {
                self.engine
                    .idempotency()
                    .check_and_record(&IdempotencyStore::intent_fingerprint(intent));
            }

            let phase = state.phase;
            self.engine.install(state).await;
            self.audit(&key, Decision::Recovered, Some(phase.to_string())).await;
            report.restored.push(key.clone());

            report.fills_applied += self.reconcile(&key).await;

            if let Some(state) = self.engine.state(&key).await {
                if state.phase.holds_budget() {
                    report.resumable.push(key);
                }
            }
        }

        info!(
            restored = report.restored.len(),
            reset = report.reset.len(),
            resumable = report.resumable.len(),
            "Recovery complete"
        );
        Ok(report)
    }

    /// Bring one installed state in line with the exchange. Returns the number
    /// of fills applied.
    async fn reconcile(&self, key: &StateKey) -> usize {
        let Some(state) = self.engine.state(key).await else {
            return 0;
        };

        match state.phase {
            OrderPhase::Sent | OrderPhase::Partial => {
                let order_id = state
                    .order_context
                    .exchange_order_id
                    .clone()
                    .or_else(|| state.order_context.client_order_id.clone());
                match order_id {
                    Some(order_id) => self.apply_remote_fills(key, &state, &order_id).await,
                    None => 0,
                }
            }
            // The next attempt may have reached the exchange before the crash
            // without `order_sent` being recorded
            OrderPhase::Reserved | OrderPhase::Retry => {
                let Some(intent) = state.intent.as_ref() else {
                    return 0;
                };
                let client_order_id = intent.client_order_id(state.retry_count + 1);
                match self.exchange.fetch_order(&intent.symbol, &client_order_id).await {
                    Ok(Some(remote)) => {
                        info!(key = %key, client_order_id = %client_order_id, "Adopting order placed before restart");
                        let sent = FsmEvent::order_sent(&client_order_id, Some(remote.exchange_order_id.clone()));
                        if let Err(e) = self.engine.process_event(key, sent).await {
                            error!(key = %key, error = %e, "Failed to adopt order");
                            return 0;
                        }
                        match self.engine.state(key).await {
                            Some(adopted) => self.apply_fills(key, &adopted, &remote.trades).await,
                            None => 0,
                        }
                    }
                    Ok(None) => 0,
                    Err(e) => {
                        warn!(key = %key, error = %e, "Reconcile fetch failed");
                        0
                    }
                }
            }
            OrderPhase::Error => {
                if let Err(e) = self.engine.process_event(key, FsmEvent::recover()).await {
                    error!(key = %key, error = %e, "Recover event failed");
                }
                0
            }
            OrderPhase::New | OrderPhase::Filled | OrderPhase::Canceled | OrderPhase::FailedFinal => 0,
        }
    }

    async fn apply_remote_fills(&self, key: &StateKey, state: &FsmState, order_id: &str) -> usize {
        let symbol = &state.key.symbol;
        match self.exchange.fetch_order(symbol, order_id).await {
            Ok(Some(remote)) => self.apply_fills(key, state, &remote.trades).await,
            Ok(None) => {
                warn!(key = %key, order_id, "Recovered order unknown to the exchange");
                0
            }
            Err(e) => {
                warn!(key = %key, order_id, error = %e, "Reconcile fetch failed");
                0
            }
        }
    }

    async fn apply_fills(&self, key: &StateKey, state: &FsmState, trades: &[crate::domain::Trade]) -> usize {
        let mut applied = 0;
        for event in fills::fill_events(&state.order_context, trades) {
            match self.engine.process_event(key, event).await {
                Ok(true) => applied += 1,
                Ok(false) => {}
                Err(e) => {
                    error!(key = %key, error = %e, "Recovered fill could not be applied");
                    break;
                }
            }
        }
        applied
    }

    /// Replace an inconsistent snapshot with a fresh NEW state. Its reservation
    /// is never restored, so the capital it held returns to the pool.
    async fn reset_stale(&self, state: &FsmState, err: &OrdexError) -> Result<()> {
        let key = state.key.clone();
        let mut fresh = FsmState::new(key.clone(), Utc::now());
        fresh.version = state.version;
        fresh.history = state.history.clone();
        self.engine.install(fresh).await;
        self.snapshots.delete(&key).await?;

        let peak = self.ledger.rebase_peak()?;
        info!(key = %key, %peak, "Capital watermark rebased after stale state reset");

        let record = AuditRecord::decision(
            &key,
            state.intent_id(),
            Decision::StaleStateReset,
            Some(err.to_string()),
        );
        if let Err(e) = self.engine.audit().append(record).await {
            error!(key = %key, error = %e, "Failed to append audit record");
        }
        Ok(())
    }

    async fn audit(&self, key: &StateKey, decision: Decision, detail: Option<String>) {
        let intent_id = self.engine.state(key).await.and_then(|s| s.intent_id().map(str::to_string));
        let record = AuditRecord::decision(key, intent_id.as_deref(), decision, detail);
        if let Err(e) = self.engine.audit().append(record).await {
            error!(key = %key, error = %e, "Failed to append audit record");
        }
    }
}

/// Internal consistency of a recovered state
pub fn validate(state: &FsmState) -> Result<()> {
    let ctx = &state.order_context;
    let inconsistent = |reason: &str| OrdexError::InconsistentRecoveredState {
        key: state.key.to_string(),
        reason: reason.to_string(),
    };

    if ctx.filled_qty > ctx.requested_qty {
        return Err(inconsistent("filled quantity exceeds requested quantity"));
    }
    if !ctx.filled_qty.is_zero() && ctx.first_sent_at.is_none() {
        return Err(inconsistent("fills recorded but no send time"));
    }
    if state.phase.has_live_order() && ctx.client_order_id.is_none() {
        return Err(inconsistent("live order without a client order id"));
    }
    if state.phase != OrderPhase::New && state.intent.is_none() {
        return Err(inconsistent("phase requires an intent"));
    }
    if state.phase.holds_budget() {
        match &state.reservation {
            None => return Err(inconsistent("phase holds budget but has no reservation")),
            Some(reservation) if reservation.settled => {
                return Err(inconsistent("phase holds budget but reservation is settled"))
            }
            Some(reservation) if reservation.committed_qty != ctx.filled_qty => {
                return Err(inconsistent("committed quantity differs from filled quantity"))
            }
            Some(_) => {}
        }
    }
    Ok(())
}
