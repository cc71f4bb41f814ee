//! Crash-safe order execution core
//!
//! Turns trading intents into exchange orders through a per-(symbol, side)
//! state machine, with atomic budget reservation, idempotent event handling,
//! bounded retries and snapshot-based recovery.

pub mod cli;
pub mod config;
pub mod domain;
pub mod error;
pub mod events;
pub mod exchange;
pub mod execution;
pub mod persistence;

pub use config::AppConfig;
pub use domain::{
    BudgetReservation, FsmEvent, FsmState, Intent, LifecycleEvent, OrderContext, OrderPhase, Side,
    StateKey,
};
pub use error::{ExchangeError, FailureKind, OrdexError, Result};
pub use events::EventBus;
pub use exchange::{ExchangeClient, PaperExchange, PaperStep, PriceOracle, StaticPriceOracle};
pub use execution::{
    BudgetLedger, ExecutionOutcome, FsmEngine, IdempotencyStore, OrderRouter, RecoveryManager,
    RecoveryReport, RuntimeFlags,
};
pub use persistence::{AuditLog, FingerprintJournal, SnapshotStore};
