use rust_decimal::Decimal;
use thiserror::Error;

/// Main error type for the execution engine
#[derive(Error, Debug)]
pub enum OrdexError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Budget errors
    #[error("Insufficient budget for {symbol}: requested {requested}, available {available}")]
    InsufficientBudget {
        symbol: String,
        requested: Decimal,
        available: Decimal,
    },

    #[error("Budget accounting failure: {0}")]
    BudgetAccounting(String),

    // Market data errors
    #[error("No reference price for {0}")]
    NoReferencePrice(String),

    // Exchange errors
    #[error("Exchange error: {0}")]
    Exchange(#[from] ExchangeError),

    // Fill errors
    #[error("Malformed fill: {0}")]
    Fill(#[from] FillError),

    // State machine errors
    #[error("Inconsistent recovered state for {key}: {reason}")]
    InconsistentRecoveredState { key: String, reason: String },

    #[error("Snapshot error: {0}")]
    Snapshot(String),

    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for OrdexError
pub type Result<T> = std::result::Result<T, OrdexError>;

/// Errors reported by an exchange adapter, already classified by retryability.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExchangeError {
    /// Network failures, rate limits, 5xx responses. Retried with backoff.
    #[error("transient exchange error: {0}")]
    Transient(String),

    /// Invalid order, unknown symbol, auth failures. Never retried.
    #[error("permanent exchange error: {0}")]
    Permanent(String),

    /// The exchange already holds an order with this client id.
    #[error("duplicate order: client_order_id={client_order_id}")]
    Duplicate { client_order_id: String },
}

impl ExchangeError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ExchangeError::Transient(_))
    }
}

/// Reasons a fill report is rejected as malformed input
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FillError {
    #[error("fill quantity must be positive, got {0}")]
    NonPositiveQuantity(Decimal),

    #[error("fill price must be positive, got {0}")]
    NonPositivePrice(Decimal),

    #[error("fill fee cannot be negative, got {0}")]
    NegativeFee(Decimal),

    #[error("fill of {fill_qty} exceeds remaining {remaining_qty} (requested {requested_qty})")]
    ExceedsRemaining {
        fill_qty: Decimal,
        remaining_qty: Decimal,
        requested_qty: Decimal,
    },

    #[error("fill is missing a trade id")]
    MissingTradeId,
}

/// Closed classification of every failure the router can observe.
///
/// Matched exhaustively once, at the router boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    Transient(String),
    Permanent(String),
    Duplicate { client_order_id: String },
    Insufficient(String),
    NoPrice(String),
}

impl FailureKind {
    /// Classify an engine error. Anything that is not an exchange, budget or
    /// price failure is treated as permanent for the intent it occurred in.
    pub fn classify(err: &OrdexError) -> Self {
        match err {
            OrdexError::Exchange(ExchangeError::Transient(msg)) => {
                FailureKind::Transient(msg.clone())
            }
            OrdexError::Exchange(ExchangeError::Permanent(msg)) => {
                FailureKind::Permanent(msg.clone())
            }
            OrdexError::Exchange(ExchangeError::Duplicate { client_order_id }) => {
                FailureKind::Duplicate {
                    client_order_id: client_order_id.clone(),
                }
            }
            OrdexError::InsufficientBudget { .. } => FailureKind::Insufficient(err.to_string()),
            OrdexError::NoReferencePrice(symbol) => FailureKind::NoPrice(symbol.clone()),
            other => FailureKind::Permanent(other.to_string()),
        }
    }
}
