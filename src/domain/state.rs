use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use uuid::Uuid;

use super::{BudgetReservation, Intent, OrderContext, StateKey, Trade};

/// Order lifecycle phases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderPhase {
    /// No intent in flight
    New,
    /// Budget reserved, nothing sent yet
    Reserved,
    /// Order live on the exchange, no fills
    Sent,
    /// Order live with some fills
    Partial,
    /// Fully filled
    Filled,
    /// Cancelled without retry
    Canceled,
    /// Unexpected failure, reservation released, awaiting recover
    Error,
    /// Waiting for backoff before the next attempt
    Retry,
    /// Gave up; filled part committed, remainder released
    FailedFinal,
}

impl OrderPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderPhase::New => "NEW",
            OrderPhase::Reserved => "RESERVED",
            OrderPhase::Sent => "SENT",
            OrderPhase::Partial => "PARTIAL",
            OrderPhase::Filled => "FILLED",
            OrderPhase::Canceled => "CANCELED",
            OrderPhase::Error => "ERROR",
            OrderPhase::Retry => "RETRY",
            OrderPhase::FailedFinal => "FAILED_FINAL",
        }
    }

    /// Is this a terminal phase for the current order?
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderPhase::Filled | OrderPhase::Canceled | OrderPhase::FailedFinal
        )
    }

    /// Does this phase imply an order may be working on the exchange?
    pub fn has_live_order(&self) -> bool {
        matches!(self, OrderPhase::Sent | OrderPhase::Partial)
    }

    /// Does this phase hold budget that must eventually be settled?
    pub fn holds_budget(&self) -> bool {
        matches!(
            self,
            OrderPhase::Reserved | OrderPhase::Sent | OrderPhase::Partial | OrderPhase::Retry
        )
    }
}

impl fmt::Display for OrderPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for OrderPhase {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, <Self as TryFrom<&str>>::Error> {
        match s.to_uppercase().as_str() {
            "NEW" => Ok(OrderPhase::New),
            "RESERVED" => Ok(OrderPhase::Reserved),
            "SENT" => Ok(OrderPhase::Sent),
            "PARTIAL" => Ok(OrderPhase::Partial),
            "FILLED" => Ok(OrderPhase::Filled),
            "CANCELED" => Ok(OrderPhase::Canceled),
            "ERROR" => Ok(OrderPhase::Error),
            "RETRY" => Ok(OrderPhase::Retry),
            "FAILED_FINAL" => Ok(OrderPhase::FailedFinal),
            _ => Err(format!("Unknown phase: {}", s)),
        }
    }
}

/// Event types recognised by the transition table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    BudgetReserved,
    OrderSent,
    FillPartial,
    FillComplete,
    Timeout,
    SendFailed,
    AttemptsExhausted,
    OrderRejected,
    UnexpectedError,
    Recover,
    CooldownElapsed,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::BudgetReserved => "budget_reserved",
            EventKind::OrderSent => "order_sent",
            EventKind::FillPartial => "fill_partial",
            EventKind::FillComplete => "fill_complete",
            EventKind::Timeout => "timeout",
            EventKind::SendFailed => "send_failed",
            EventKind::AttemptsExhausted => "attempts_exhausted",
            EventKind::OrderRejected => "order_rejected",
            EventKind::UnexpectedError => "unexpected_error",
            EventKind::Recover => "recover",
            EventKind::CooldownElapsed => "cooldown_elapsed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What happened to the best-effort remote cancel issued before a timeout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CancelOutcome {
    Canceled,
    Failed { reason: String },
    NotAttempted,
}

/// Event payloads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    BudgetReserved {
        intent: Intent,
        reservation: BudgetReservation,
    },
    OrderSent {
        client_order_id: String,
        exchange_order_id: Option<String>,
    },
    FillPartial {
        trade: Trade,
    },
    FillComplete {
        trade: Trade,
    },
    Timeout {
        cancel: CancelOutcome,
    },
    SendFailed {
        reason: String,
    },
    AttemptsExhausted,
    OrderRejected {
        reason: String,
    },
    UnexpectedError {
        reason: String,
    },
    Recover,
    CooldownElapsed,
}

/// An input to the FSM. `event_id` is the idempotency fingerprint within
/// one (symbol, side) key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsmEvent {
    pub event_id: String,
    pub payload: EventPayload,
    pub at: DateTime<Utc>,
}

impl FsmEvent {
    pub fn new(event_id: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            event_id: event_id.into(),
            payload,
            at: Utc::now(),
        }
    }

    pub fn at(mut self, at: DateTime<Utc>) -> Self {
        self.at = at;
        self
    }

    pub fn budget_reserved(intent: Intent, reservation: BudgetReservation) -> Self {
        Self::new(
            format!("reserve:{}", intent.intent_id),
            EventPayload::BudgetReserved {
                intent,
                reservation,
            },
        )
    }

    pub fn order_sent(client_order_id: &str, exchange_order_id: Option<String>) -> Self {
        Self::new(
            format!("sent:{}", client_order_id),
            EventPayload::OrderSent {
                client_order_id: client_order_id.to_string(),
                exchange_order_id,
            },
        )
    }

    pub fn fill_partial(trade: Trade) -> Self {
        Self::new(
            format!("fill:{}", trade.trade_id),
            EventPayload::FillPartial { trade },
        )
    }

    pub fn fill_complete(trade: Trade) -> Self {
        Self::new(
            format!("fill:{}", trade.trade_id),
            EventPayload::FillComplete { trade },
        )
    }

    pub fn timeout(client_order_id: &str, cancel: CancelOutcome) -> Self {
        Self::new(
            format!("timeout:{}", client_order_id),
            EventPayload::Timeout { cancel },
        )
    }

    pub fn send_failed(client_order_id: &str, reason: impl Into<String>) -> Self {
        Self::new(
            format!("send_failed:{}", client_order_id),
            EventPayload::SendFailed {
                reason: reason.into(),
            },
        )
    }

    pub fn attempts_exhausted(intent_id: &str) -> Self {
        Self::new(
            format!("exhausted:{}", intent_id),
            EventPayload::AttemptsExhausted,
        )
    }

    pub fn order_rejected(intent_id: &str, reason: impl Into<String>) -> Self {
        Self::new(
            format!("rejected:{}", intent_id),
            EventPayload::OrderRejected {
                reason: reason.into(),
            },
        )
    }

    /// Errors are never deduplicated: each occurrence gets a fresh id.
    pub fn unexpected_error(reason: impl Into<String>) -> Self {
        Self::new(
            format!("error:{}", Uuid::new_v4()),
            EventPayload::UnexpectedError {
                reason: reason.into(),
            },
        )
    }

    pub fn recover() -> Self {
        Self::new(format!("recover:{}", Uuid::new_v4()), EventPayload::Recover)
    }

    pub fn cooldown_elapsed(intent_id: &str) -> Self {
        Self::new(format!("cooldown:{}", intent_id), EventPayload::CooldownElapsed)
    }

    pub fn kind(&self) -> EventKind {
        match &self.payload {
            EventPayload::BudgetReserved { .. } => EventKind::BudgetReserved,
            EventPayload::OrderSent { .. } => EventKind::OrderSent,
            EventPayload::FillPartial { .. } => EventKind::FillPartial,
            EventPayload::FillComplete { .. } => EventKind::FillComplete,
            EventPayload::Timeout { .. } => EventKind::Timeout,
            EventPayload::SendFailed { .. } => EventKind::SendFailed,
            EventPayload::AttemptsExhausted => EventKind::AttemptsExhausted,
            EventPayload::OrderRejected { .. } => EventKind::OrderRejected,
            EventPayload::UnexpectedError { .. } => EventKind::UnexpectedError,
            EventPayload::Recover => EventKind::Recover,
            EventPayload::CooldownElapsed => EventKind::CooldownElapsed,
        }
    }
}

/// State transition record (bounded per-state history)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: OrderPhase,
    pub to: OrderPhase,
    pub event: EventKind,
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
}

/// Per-(symbol, side) execution state. This is what gets snapshotted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsmState {
    pub key: StateKey,
    pub phase: OrderPhase,
    pub intent: Option<Intent>,
    pub reservation: Option<BudgetReservation>,
    pub order_context: OrderContext,
    pub retry_count: u32,
    pub last_transition_at: DateTime<Utc>,
    pub history: VecDeque<TransitionRecord>,
    /// Incremented on every applied transition
    pub version: u64,
}

impl FsmState {
    pub fn new(key: StateKey, now: DateTime<Utc>) -> Self {
        Self {
            key,
            phase: OrderPhase::New,
            intent: None,
            reservation: None,
            order_context: OrderContext::new(rust_decimal::Decimal::ZERO),
            retry_count: 0,
            last_transition_at: now,
            history: VecDeque::new(),
            version: 0,
        }
    }

    pub fn intent_id(&self) -> Option<&str> {
        self.intent.as_ref().map(|i| i.intent_id.as_str())
    }

    pub fn push_history(&mut self, record: TransitionRecord, limit: usize) {
        self.history.push_back(record);
        while self.history.len() > limit.max(1) {
            self.history.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Side;

    #[test]
    fn test_terminal_phases() {
        assert!(OrderPhase::Filled.is_terminal());
        assert!(OrderPhase::Canceled.is_terminal());
        assert!(OrderPhase::FailedFinal.is_terminal());
        assert!(!OrderPhase::Error.is_terminal());
        assert!(!OrderPhase::Retry.is_terminal());
        assert!(!OrderPhase::New.is_terminal());
    }

    #[test]
    fn test_phase_from_str() {
        assert_eq!(
            OrderPhase::try_from("failed_final").unwrap(),
            OrderPhase::FailedFinal
        );
        assert_eq!(OrderPhase::try_from("SENT").unwrap(), OrderPhase::Sent);
        assert!(OrderPhase::try_from("DONE").is_err());
    }

    #[test]
    fn test_fill_events_share_fingerprint() {
        let trade = Trade::new("t-1", rust_decimal::Decimal::ONE, rust_decimal::Decimal::TEN, rust_decimal::Decimal::ZERO);
        let partial = FsmEvent::fill_partial(trade.clone());
        let complete = FsmEvent::fill_complete(trade);
        assert_eq!(partial.event_id, complete.event_id);
        assert_eq!(partial.kind(), EventKind::FillPartial);
        assert_eq!(complete.kind(), EventKind::FillComplete);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut state = FsmState::new(StateKey::new("BTC/USDT", Side::Buy), Utc::now());
        for i in 0..10 {
            state.push_history(
                TransitionRecord {
                    from: OrderPhase::New,
                    to: OrderPhase::Reserved,
                    event: EventKind::BudgetReserved,
                    event_id: format!("e-{}", i),
                    timestamp: Utc::now(),
                },
                4,
            );
        }
        assert_eq!(state.history.len(), 4);
        assert_eq!(state.history.front().unwrap().event_id, "e-6");
    }

    #[test]
    fn test_unexpected_errors_are_never_deduplicated() {
        let a = FsmEvent::unexpected_error("x");
        let b = FsmEvent::unexpected_error("x");
        assert_ne!(a.event_id, b.event_id);
    }
}
