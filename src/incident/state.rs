//! The incident lifecycle as a pure function over (state, event).
//!
//! ```text
//! Detected -> Diagnosing -> Remediating -> Verifying -> Resolved
//!                 ^                            |
//!                 +------ (attempts remain) ---+---> Escalated
//! ```
//!
//! `Escalate` and `Abandon` are accepted from every non-terminal state.
//! Terminal states accept nothing.

use thiserror::Error;
use uuid::Uuid;

use super::{IncidentEvent, IncidentState};

/// The effect of a valid event.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub to: IncidentState,
    pub attempt_count: u32,
    pub plan_id: Option<Uuid>,
}

#[derive(Debug, Clone, Error, PartialEq)]
#[error("event '{event}' is not valid in state {from}")]
pub struct InvalidTransition {
    pub from: IncidentState,
    pub event: &'static str,
}

pub fn apply(
    state: IncidentState,
    attempt_count: u32,
    max_attempts: u32,
    event: &IncidentEvent,
) -> Result<Transition, InvalidTransition> {
    use IncidentEvent as E;
    use IncidentState as S;

    let to = |to| Transition {
        to,
        attempt_count,
        plan_id: None,
    };

    if state.is_terminal() {
        return Err(InvalidTransition {
            from: state,
            event: event.label(),
        });
    }

    match (state, event) {
        (_, E::Escalate { .. }) => Ok(to(S::Escalated)),
        (_, E::Abandon { .. }) => Ok(to(S::Abandoned)),
        (S::Detected, E::BeginDiagnosis) => Ok(to(S::Diagnosing)),
        (S::Diagnosing, E::PlanIssued { plan_id }) => Ok(Transition {
            to: S::Remediating,
            attempt_count,
            plan_id: Some(*plan_id),
        }),
        (S::Diagnosing, E::DecisionExhausted { .. }) => Ok(to(S::Escalated)),
        (S::Remediating, E::AttemptFinished { .. }) => Ok(Transition {
            to: S::Verifying,
            attempt_count: attempt_count.saturating_add(1),
            plan_id: None,
        }),
        (S::Verifying, E::VerificationPassed) => Ok(to(S::Resolved)),
        (S::Verifying, E::VerificationFailed { .. }) if attempt_count < max_attempts => {
            Ok(to(S::Diagnosing))
        }
        (S::Verifying, E::VerificationFailed { .. }) => Ok(to(S::Escalated)),
        (from, event) => Err(InvalidTransition {
            from,
            event: event.label(),
        }),
    }
}
