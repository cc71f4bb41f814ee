use chrono::{DateTime, Duration, Utc};

use crate::config::TimeoutConfig;
use crate::domain::{CancelOutcome, FsmEvent, FsmState, OrderPhase, StateKey};

/// Deadline breaches detected for one state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeoutEvent {
    /// A live order waited longer than the fill timeout
    FillTimeout {
        key: StateKey,
        client_order_id: Option<String>,
    },
    /// RESERVED, RETRY or ERROR outlived the maximum order lifetime
    LifetimeExceeded {
        key: StateKey,
        phase: OrderPhase,
        intent_id: Option<String>,
    },
    /// Terminal phase cooled down; the key may accept a new intent
    CooldownElapsed {
        key: StateKey,
        intent_id: Option<String>,
    },
}

impl TimeoutEvent {
    pub fn key(&self) -> &StateKey {
        match self {
            TimeoutEvent::FillTimeout { key, .. }
            | TimeoutEvent::LifetimeExceeded { key, .. }
            | TimeoutEvent::CooldownElapsed { key, .. } => key,
        }
    }

    /// Map onto the FSM event fed through the regular transition table
    pub fn into_fsm_event(self, now: DateTime<Utc>) -> FsmEvent {
        let event = match self {
            TimeoutEvent::FillTimeout {
                client_order_id, ..
            } => FsmEvent::timeout(
                client_order_id.as_deref().unwrap_or("unknown"),
                CancelOutcome::NotAttempted,
            ),
            TimeoutEvent::LifetimeExceeded {
                phase: OrderPhase::Retry,
                intent_id,
                ..
            } => FsmEvent::attempts_exhausted(intent_id.as_deref().unwrap_or("unknown")),
            TimeoutEvent::LifetimeExceeded {
                phase: OrderPhase::Error,
                ..
            } => FsmEvent::recover(),
            TimeoutEvent::LifetimeExceeded { phase, .. } => {
                FsmEvent::unexpected_error(format!("order lifetime exceeded in {}", phase))
            }
            TimeoutEvent::CooldownElapsed { intent_id, .. } => {
                FsmEvent::cooldown_elapsed(intent_id.as_deref().unwrap_or("none"))
            }
        };
        event.at(now)
    }
}

/// Computes deadline breaches from state timestamps. Holds no state of its own.
#[derive(Debug, Clone)]
pub struct TimeoutManager {
    fill_timeout: Duration,
    cooldown: Duration,
    max_order_lifetime: Duration,
}

impl TimeoutManager {
    pub fn new(config: &TimeoutConfig) -> Self {
        Self {
            fill_timeout: Duration::milliseconds(config.fill_timeout_ms as i64),
            cooldown: Duration::milliseconds(config.cooldown_ms as i64),
            max_order_lifetime: Duration::milliseconds(config.max_order_lifetime_ms as i64),
        }
    }

    /// Deadline for the state's current phase, if it has one
    pub fn deadline(&self, state: &FsmState) -> Option<DateTime<Utc>> {
        let window = match state.phase {
            OrderPhase::New => return None,
            OrderPhase::Sent | OrderPhase::Partial => self.fill_timeout,
            OrderPhase::Reserved | OrderPhase::Retry | OrderPhase::Error => {
                self.max_order_lifetime
            }
            OrderPhase::Filled | OrderPhase::Canceled | OrderPhase::FailedFinal => self.cooldown,
        };
        Some(state.last_transition_at + window)
    }

    /// Whether a terminal state is still inside its cooldown window
    pub fn in_cooldown(&self, state: &FsmState, now: DateTime<Utc>) -> bool {
        state.phase.is_terminal() && now < state.last_transition_at + self.cooldown
    }

    pub fn check(&self, key: &StateKey, state: &FsmState, now: DateTime<Utc>) -> Vec<TimeoutEvent> {
        let Some(deadline) = self.deadline(state) else {
            return Vec::new();
        };
        if now < deadline {
            return Vec::new();
        }

        let intent_id = state.intent_id().map(str::to_string);
        let event = match state.phase {
            OrderPhase::Sent | OrderPhase::Partial => TimeoutEvent::FillTimeout {
                key: key.clone(),
                client_order_id: state.order_context.client_order_id.clone(),
            },
            OrderPhase::Reserved | OrderPhase::Retry | OrderPhase::Error => {
                TimeoutEvent::LifetimeExceeded {
                    key: key.clone(),
                    phase: state.phase,
                    intent_id,
                }
            }
            _ => TimeoutEvent::CooldownElapsed {
                key: key.clone(),
                intent_id,
            },
        };
        vec![event]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EventKind, Side};

    fn manager() -> TimeoutManager {
        TimeoutManager::new(&TimeoutConfig {
            fill_timeout_ms: 5_000,
            cooldown_ms: 2_000,
            max_order_lifetime_ms: 60_000,
        })
    }

    fn state_in(phase: OrderPhase, at: DateTime<Utc>) -> FsmState {
        let mut state = FsmState::new(StateKey::new("BTC/USDT", Side::Buy), at);
        state.phase = phase;
        state.order_context.client_order_id = Some("abc-1".to_string());
        state
    }

    #[test]
    fn test_new_never_times_out() {
        let t0 = Utc::now();
        let state = state_in(OrderPhase::New, t0);
        assert!(manager()
            .check(&state.key, &state, t0 + Duration::days(1))
            .is_empty());
    }

    #[test]
    fn test_fill_timeout_for_live_orders() {
        let t0 = Utc::now();
        let mgr = manager();
        for phase in [OrderPhase::Sent, OrderPhase::Partial] {
            let state = state_in(phase, t0);
            assert!(mgr.check(&state.key, &state, t0 + Duration::seconds(4)).is_empty());
            let events = mgr.check(&state.key, &state, t0 + Duration::seconds(5));
            assert_eq!(events.len(), 1);
            assert!(matches!(events[0], TimeoutEvent::FillTimeout { .. }));
            let fsm = events[0].clone().into_fsm_event(t0);
            assert_eq!(fsm.kind(), EventKind::Timeout);
            assert_eq!(fsm.event_id, "timeout:abc-1");
        }
    }

    #[test]
    fn test_lifetime_maps_by_phase() {
        let t0 = Utc::now();
        let mgr = manager();
        let later = t0 + Duration::seconds(61);

        let retry = state_in(OrderPhase::Retry, t0);
        let events = mgr.check(&retry.key, &retry, later);
        assert_eq!(
            events[0].clone().into_fsm_event(later).kind(),
            EventKind::AttemptsExhausted
        );

        let reserved = state_in(OrderPhase::Reserved, t0);
        let events = mgr.check(&reserved.key, &reserved, later);
        assert_eq!(
            events[0].clone().into_fsm_event(later).kind(),
            EventKind::UnexpectedError
        );

        let errored = state_in(OrderPhase::Error, t0);
        let events = mgr.check(&errored.key, &errored, later);
        assert_eq!(
            events[0].clone().into_fsm_event(later).kind(),
            EventKind::Recover
        );
    }

    #[test]
    fn test_cooldown_after_terminal() {
        let t0 = Utc::now();
        let mgr = manager();
        let state = state_in(OrderPhase::FailedFinal, t0);
        assert!(mgr.in_cooldown(&state, t0 + Duration::seconds(1)));
        assert!(!mgr.in_cooldown(&state, t0 + Duration::seconds(2)));
        let events = mgr.check(&state.key, &state, t0 + Duration::seconds(2));
        assert!(matches!(events[0], TimeoutEvent::CooldownElapsed { .. }));
    }

    #[test]
    fn test_check_does_not_mutate() {
        let t0 = Utc::now();
        let state = state_in(OrderPhase::Sent, t0);
        let before = state.clone();
        manager().check(&state.key, &state, t0 + Duration::minutes(10));
        assert_eq!(state, before);
    }
}
