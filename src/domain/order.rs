use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::str::FromStr;

use super::Side;

/// Time in force
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    /// Good Till Cancelled
    GTC,
    /// Fill Or Kill
    FOK,
    /// Immediate Or Cancel
    IOC,
}

impl Default for TimeInForce {
    fn default() -> Self {
        TimeInForce::GTC
    }
}

impl FromStr for TimeInForce {
    type Err = &'static str;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "GTC" => Ok(TimeInForce::GTC),
            "FOK" => Ok(TimeInForce::FOK),
            "IOC" => Ok(TimeInForce::IOC),
            _ => Err("invalid time in force; expected GTC|FOK|IOC"),
        }
    }
}

/// Order status as reported by the exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    /// Accepted, resting on the book, no fills yet
    Open,
    /// Order partially filled, still working
    PartiallyFilled,
    /// Order fully filled
    Filled,
    /// Order cancelled
    Cancelled,
    /// Order rejected by exchange
    Rejected,
    /// Order expired
    Expired,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled
                | OrderStatus::Cancelled
                | OrderStatus::Rejected
                | OrderStatus::Expired
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(self, OrderStatus::Open | OrderStatus::PartiallyFilled)
    }
}

/// Order request (what we send to the exchange for one attempt)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub client_order_id: String,
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    pub limit_price: Decimal,
    pub time_in_force: TimeInForce,
}

/// Exchange acknowledgement of a placed order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderHandle {
    pub exchange_order_id: String,
    pub client_order_id: String,
}

/// A single execution reported by the exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trade {
    pub trade_id: String,
    pub quantity: Decimal,
    pub price: Decimal,
    pub fee: Decimal,
}

impl Trade {
    pub fn new(trade_id: impl Into<String>, quantity: Decimal, price: Decimal, fee: Decimal) -> Self {
        Self {
            trade_id: trade_id.into(),
            quantity,
            price,
            fee,
        }
    }
}

/// Remote view of one order, as returned by fetch/wait calls
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderStatusReport {
    pub exchange_order_id: String,
    pub client_order_id: String,
    pub status: OrderStatus,
    pub filled_qty: Decimal,
    pub avg_price: Option<Decimal>,
    /// Every trade on the order so far, not just new ones
    pub trades: Vec<Trade>,
}

/// Mutable per-order execution record, owned by exactly one FSM state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderContext {
    pub client_order_id: Option<String>,
    pub exchange_order_id: Option<String>,
    pub requested_qty: Decimal,
    pub filled_qty: Decimal,
    pub avg_fill_price: Option<Decimal>,
    pub fees: Decimal,
    pub attempt_count: u32,
    pub first_sent_at: Option<DateTime<Utc>>,
    pub last_update_at: Option<DateTime<Utc>>,
    /// Trade ids already folded into `filled_qty`
    #[serde(default)]
    pub applied_trades: BTreeSet<String>,
    /// Client order ids already counted as an attempt
    #[serde(default)]
    pub sent_client_ids: BTreeSet<String>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl OrderContext {
    pub fn new(requested_qty: Decimal) -> Self {
        Self {
            client_order_id: None,
            exchange_order_id: None,
            requested_qty,
            filled_qty: Decimal::ZERO,
            avg_fill_price: None,
            fees: Decimal::ZERO,
            attempt_count: 0,
            first_sent_at: None,
            last_update_at: None,
            applied_trades: BTreeSet::new(),
            sent_client_ids: BTreeSet::new(),
            last_error: None,
        }
    }

    pub fn remaining_qty(&self) -> Decimal {
        (self.requested_qty - self.filled_qty).max(Decimal::ZERO)
    }

    pub fn is_fully_filled(&self) -> bool {
        self.requested_qty > Decimal::ZERO && self.filled_qty >= self.requested_qty
    }

    /// Calculate actual fill value (excluding fees)
    pub fn fill_value(&self) -> Decimal {
        match self.avg_fill_price {
            Some(price) => price * self.filled_qty,
            None => Decimal::ZERO,
        }
    }

    /// Calculate fill percentage
    pub fn fill_pct(&self) -> Decimal {
        if self.requested_qty.is_zero() {
            return Decimal::ZERO;
        }
        self.filled_qty / self.requested_qty * Decimal::from(100)
    }
}
