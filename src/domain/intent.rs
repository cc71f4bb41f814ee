use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::error::{OrdexError, Result};

/// Order side (buy or sell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Side {
    type Err = &'static str;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "buy" | "b" => Ok(Side::Buy),
            "sell" | "s" => Ok(Side::Sell),
            _ => Err("invalid side; expected buy|sell"),
        }
    }
}

/// Identity of one live FSM: exactly one state exists per (symbol, side).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StateKey {
    pub symbol: String,
    pub side: Side,
}

impl StateKey {
    pub fn new(symbol: impl Into<String>, side: Side) -> Self {
        Self {
            symbol: symbol.into(),
            side,
        }
    }

    /// Filesystem-safe name, e.g. `BTC_USDT-buy`
    pub fn file_stem(&self) -> String {
        let symbol: String = self
            .symbol
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        format!("{}-{}", symbol, self.side)
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.symbol, self.side)
    }
}

/// Immutable request to execute one side of a trade.
///
/// Intents are delivered at-least-once, so `intent_id` is derived from the
/// creation timestamp, the symbol, and a hash of the decision inputs: the
/// same decision always produces the same id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intent {
    pub intent_id: String,
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    pub limit_price: Decimal,
    pub created_at: DateTime<Utc>,
}

impl Intent {
    pub fn new(
        symbol: impl Into<String>,
        side: Side,
        quantity: Decimal,
        limit_price: Decimal,
        created_at: DateTime<Utc>,
        inputs: &[u8],
    ) -> Self {
        let symbol = symbol.into();
        let intent_id = Self::derive_id(created_at, &symbol, inputs);
        Self {
            intent_id,
            symbol,
            side,
            quantity,
            limit_price,
            created_at,
        }
    }

    /// Deterministic id: sha256(created_at_ms || symbol || sha256(inputs))
    pub fn derive_id(created_at: DateTime<Utc>, symbol: &str, inputs: &[u8]) -> String {
        let input_hash = Sha256::digest(inputs);

        let mut hasher = Sha256::new();
        hasher.update(created_at.timestamp_millis().to_le_bytes());
        hasher.update(symbol.as_bytes());
        hasher.update(input_hash);
        let digest = hex::encode(hasher.finalize());
        digest[..32].to_string()
    }

    pub fn key(&self) -> StateKey {
        StateKey::new(self.symbol.clone(), self.side)
    }

    pub fn notional(&self) -> Decimal {
        self.quantity * self.limit_price
    }

    /// Client order id for a given attempt (1-based). Stable across restarts so
    /// the exchange can detect resubmission of the same attempt.
    pub fn client_order_id(&self, attempt: u32) -> String {
        format!("{}-{}", &self.intent_id[..16.min(self.intent_id.len())], attempt)
    }

    pub fn validate(&self) -> Result<()> {
        if self.symbol.trim().is_empty() {
            return Err(OrdexError::Validation("intent symbol is empty".to_string()));
        }
        if self.quantity <= Decimal::ZERO {
            return Err(OrdexError::Validation(format!(
                "intent quantity must be positive, got {}",
                self.quantity
            )));
        }
        if self.limit_price <= Decimal::ZERO {
            return Err(OrdexError::Validation(format!(
                "intent limit price must be positive, got {}",
                self.limit_price
            )));
        }
        Ok(())
    }
}
