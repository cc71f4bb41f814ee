use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::Side;

/// Opaque reference to a reservation held by the budget ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReservationHandle(Uuid);

impl ReservationHandle {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn id(&self) -> Uuid {
        self.0
    }
}

impl Default for ReservationHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ReservationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Capital held for one intent.
///
/// `reserved_notional` only grows (initial hold plus any overage top-ups);
/// `committed_notional + released_notional` converges to it once settled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetReservation {
    pub handle: ReservationHandle,
    pub symbol: String,
    pub side: Side,
    pub intent_id: String,
    pub reserved_qty: Decimal,
    /// Limit price the hold was sized at; orders for this intent are sent at it
    #[serde(default)]
    pub reserved_price: Decimal,
    pub reserved_notional: Decimal,
    pub committed_qty: Decimal,
    pub committed_notional: Decimal,
    pub released_notional: Decimal,
    /// Surplus from fills that is held until settlement (on-terminal policy)
    #[serde(default)]
    pub held_surplus: Decimal,
    pub settled: bool,
    pub created_at: DateTime<Utc>,
}

impl BudgetReservation {
    /// Notional still spoken for and not yet committed or released
    pub fn outstanding(&self) -> Decimal {
        self.reserved_notional - self.committed_notional - self.released_notional
    }

    /// Quantity not yet covered by commits
    pub fn uncommitted_qty(&self) -> Decimal {
        (self.reserved_qty - self.committed_qty).max(Decimal::ZERO)
    }

    /// `committed + released == reserved`
    pub fn is_balanced(&self) -> bool {
        self.committed_notional + self.released_notional == self.reserved_notional
    }
}
