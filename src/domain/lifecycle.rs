use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Why an intent ended without a fill
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailReason {
    KillSwitch,
    InvalidIntent,
    NoPrice,
    KeyBusy,
    ReserveFailed,
    Rejected,
    RetriesExhausted,
    Canceled,
    Error,
}

impl FailReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailReason::KillSwitch => "kill_switch",
            FailReason::InvalidIntent => "invalid_intent",
            FailReason::NoPrice => "no_price",
            FailReason::KeyBusy => "key_busy",
            FailReason::ReserveFailed => "reserve_failed",
            FailReason::Rejected => "rejected",
            FailReason::RetriesExhausted => "retries_exhausted",
            FailReason::Canceled => "canceled",
            FailReason::Error => "error",
        }
    }
}

impl fmt::Display for FailReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Events published to position-management and observability subscribers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "topic")]
pub enum LifecycleEvent {
    #[serde(rename = "order.filled")]
    Filled {
        intent_id: String,
        symbol: String,
        filled_qty: Decimal,
        avg_price: Decimal,
        fees: Decimal,
    },
    #[serde(rename = "order.failed")]
    Failed {
        intent_id: String,
        symbol: String,
        reason: FailReason,
        exchange_error: Option<String>,
    },
    #[serde(rename = "order.partial")]
    Partial {
        intent_id: String,
        symbol: String,
        filled_qty: Decimal,
        remaining_qty: Decimal,
    },
}

impl LifecycleEvent {
    pub fn topic(&self) -> &'static str {
        match self {
            LifecycleEvent::Filled { .. } => "order.filled",
            LifecycleEvent::Failed { .. } => "order.failed",
            LifecycleEvent::Partial { .. } => "order.partial",
        }
    }

    pub fn intent_id(&self) -> &str {
        match self {
            LifecycleEvent::Filled { intent_id, .. }
            | LifecycleEvent::Failed { intent_id, .. }
            | LifecycleEvent::Partial { intent_id, .. } => intent_id,
        }
    }
}
