//! Transition tables
//!
//! Pure `(phase, event) -> (target, action)` lookup. Absence of an entry means
//! the event is not valid in that phase and is ignored by the engine.

use crate::config::TransitionStrategyKind;
use crate::domain::{EventKind, OrderPhase};

/// Where a transition lands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Fixed(OrderPhase),
    /// PARTIAL or FILLED, decided by the accumulated fill after the action runs
    FillProgress,
    /// NEW when nothing was filled, FAILED_FINAL otherwise
    Revalidate,
}

/// Side effect run on the state copy before the phase changes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    StoreReservation,
    RecordSend,
    ApplyFill,
    RecordTimeout,
    RecordSendFailure,
    RecordRejection,
    ReleaseRemaining,
    CaptureError,
    Revalidate,
    Reset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub target: Target,
    pub action: Action,
}

impl Transition {
    const fn to(phase: OrderPhase, action: Action) -> Self {
        Self {
            target: Target::Fixed(phase),
            action,
        }
    }
}

/// Pluggable transition logic
pub trait TransitionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn lookup(&self, phase: OrderPhase, event: EventKind) -> Option<Transition>;
}

/// Timeouts go to RETRY and the router re-attempts after backoff
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardTransitions;

impl TransitionStrategy for StandardTransitions {
    fn name(&self) -> &'static str {
        "standard"
    }

    fn lookup(&self, phase: OrderPhase, event: EventKind) -> Option<Transition> {
        use EventKind as E;
        use OrderPhase as P;

        let transition = match (phase, event) {
            (P::New, E::BudgetReserved) => Transition::to(P::Reserved, Action::StoreReservation),

            (P::Reserved | P::Retry, E::OrderSent) => Transition::to(P::Sent, Action::RecordSend),
            (P::Reserved | P::Retry, E::SendFailed) => {
                Transition::to(P::Retry, Action::RecordSendFailure)
            }

            (P::Sent | P::Partial, E::FillPartial | E::FillComplete) => Transition {
                target: Target::FillProgress,
                action: Action::ApplyFill,
            },
            (P::Sent | P::Partial, E::Timeout) => Transition::to(P::Retry, Action::RecordTimeout),

            (P::Retry, E::AttemptsExhausted) => {
                Transition::to(P::FailedFinal, Action::ReleaseRemaining)
            }
            (P::Reserved | P::Sent | P::Partial | P::Retry, E::OrderRejected) => {
                Transition::to(P::FailedFinal, Action::RecordRejection)
            }

            (p, E::UnexpectedError) if !p.is_terminal() => {
                Transition::to(P::Error, Action::CaptureError)
            }
            (P::Error, E::Recover) => Transition {
                target: Target::Revalidate,
                action: Action::Revalidate,
            },

            (p, E::CooldownElapsed) if p.is_terminal() => Transition::to(P::New, Action::Reset),

            _ => return None,
        };
        Some(transition)
    }
}

/// Cancel-and-stop: a timed out order is canceled and never retried
#[derive(Debug, Default, Clone, Copy)]
pub struct LegacyTransitions;

impl TransitionStrategy for LegacyTransitions {
    fn name(&self) -> &'static str {
        "legacy"
    }

    fn lookup(&self, phase: OrderPhase, event: EventKind) -> Option<Transition> {
        match (phase, event) {
            (OrderPhase::Sent | OrderPhase::Partial, EventKind::Timeout) => Some(Transition::to(
                OrderPhase::Canceled,
                Action::ReleaseRemaining,
            )),
            _ => StandardTransitions.lookup(phase, event),
        }
    }
}

pub fn strategy_for(kind: TransitionStrategyKind) -> Box<dyn TransitionStrategy> {
    match kind {
        TransitionStrategyKind::Standard => Box::new(StandardTransitions),
        TransitionStrategyKind::Legacy => Box::new(LegacyTransitions),
    }
}
