//! Order execution core
//!
//! Leaf-first: idempotency store, budget ledger, timeout manager, fill
//! accumulator, transition table, FSM engine, recovery, order router.

pub mod budget;
pub mod engine;
pub mod fills;
pub mod idempotency;
pub mod recovery;
pub mod router;
pub mod timeout;
pub mod transitions;

pub use budget::{BudgetLedger, LedgerSnapshot};
pub use engine::{FsmEngine, KeyClaim};
pub use fills::{accumulate, accumulate_trade, fill_events, FillOutcome};
pub use idempotency::IdempotencyStore;
pub use recovery::{RecoveryManager, RecoveryReport};
pub use router::{ExecutionOutcome, OrderRouter, RuntimeFlags};
pub use timeout::{TimeoutEvent, TimeoutManager};
pub use transitions::{
    strategy_for, Action, LegacyTransitions, StandardTransitions, Target, Transition,
    TransitionStrategy,
};
