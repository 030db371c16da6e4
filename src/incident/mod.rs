//! Incidents: the data model, the pure lifecycle state machine, and the
//! registry that owns every mutation.

pub mod registry;
pub mod state;

pub use registry::{IncidentRegistry, OpenRequest};
pub use state::{apply, InvalidTransition, Transition};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::detect::{FaultKind, Severity};
use crate::storage::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentState {
    Detected,
    Diagnosing,
    Remediating,
    Verifying,
    Resolved,
    Escalated,
    Abandoned,
}

impl IncidentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentState::Detected => "detected",
            IncidentState::Diagnosing => "diagnosing",
            IncidentState::Remediating => "remediating",
            IncidentState::Verifying => "verifying",
            IncidentState::Resolved => "resolved",
            IncidentState::Escalated => "escalated",
            IncidentState::Abandoned => "abandoned",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "detected" => Some(IncidentState::Detected),
            "diagnosing" => Some(IncidentState::Diagnosing),
            "remediating" => Some(IncidentState::Remediating),
            "verifying" => Some(IncidentState::Verifying),
            "resolved" => Some(IncidentState::Resolved),
            "escalated" => Some(IncidentState::Escalated),
            "abandoned" => Some(IncidentState::Abandoned),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            IncidentState::Resolved | IncidentState::Escalated | IncidentState::Abandoned
        )
    }
}

impl std::fmt::Display for IncidentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs to the incident state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum IncidentEvent {
    BeginDiagnosis,
    PlanIssued { plan_id: Uuid },
    DecisionExhausted { reason: String },
    AttemptFinished { attempt_id: Uuid, succeeded: bool },
    VerificationPassed,
    VerificationFailed { reason: String },
    Escalate { reason: String },
    Abandon { reason: String },
}

impl IncidentEvent {
    pub fn label(&self) -> &'static str {
        match self {
            IncidentEvent::BeginDiagnosis => "begin_diagnosis",
            IncidentEvent::PlanIssued { .. } => "plan_issued",
            IncidentEvent::DecisionExhausted { .. } => "decision_exhausted",
            IncidentEvent::AttemptFinished { .. } => "attempt_finished",
            IncidentEvent::VerificationPassed => "verification_passed",
            IncidentEvent::VerificationFailed { .. } => "verification_failed",
            IncidentEvent::Escalate { .. } => "escalate",
            IncidentEvent::Abandon { .. } => "abandon",
        }
    }

    pub fn reason(&self) -> Option<String> {
        match self {
            IncidentEvent::DecisionExhausted { reason }
            | IncidentEvent::VerificationFailed { reason }
            | IncidentEvent::Escalate { reason }
            | IncidentEvent::Abandon { reason } => Some(reason.clone()),
            IncidentEvent::PlanIssued { plan_id } => Some(format!("plan {plan_id}")),
            IncidentEvent::AttemptFinished {
                attempt_id,
                succeeded,
            } => Some(format!(
                "attempt {attempt_id} {}",
                if *succeeded { "succeeded" } else { "failed" }
            )),
            IncidentEvent::BeginDiagnosis | IncidentEvent::VerificationPassed => None,
        }
    }
}

/// One entry of an incident's history. `from` is `None` for the opening
/// record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub seq: u32,
    pub from: Option<IncidentState>,
    pub to: IncidentState,
    pub event: String,
    pub reason: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub incident_id: Uuid,
    pub entity_id: String,
    pub signature: String,
    pub rule_name: String,
    pub metric_name: String,
    pub kind: FaultKind,
    pub severity: Severity,
    pub opened_at: DateTime<Utc>,
    pub state: IncidentState,
    pub attempt_count: u32,
    pub last_plan_id: Option<Uuid>,
    /// Optimistic concurrency token, bumped by every transition.
    pub version: i64,
    pub closed_at: Option<DateTime<Utc>>,
    pub history: Vec<TransitionRecord>,
}

impl Incident {
    pub fn is_open(&self) -> bool {
        !self.state.is_terminal()
    }
}

/// How an incident is closed from outside the control loop.
#[derive(Debug, Clone, PartialEq)]
pub enum CloseOutcome {
    Resolved,
    Escalated { reason: String },
    Abandoned { reason: String },
}

impl CloseOutcome {
    pub fn into_event(self) -> IncidentEvent {
        match self {
            CloseOutcome::Resolved => IncidentEvent::VerificationPassed,
            CloseOutcome::Escalated { reason } => IncidentEvent::Escalate { reason },
            CloseOutcome::Abandoned { reason } => IncidentEvent::Abandon { reason },
        }
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("incident {incident_id}: {source}")]
    InvalidTransition {
        incident_id: Uuid,
        #[source]
        source: InvalidTransition,
    },
    #[error("incident {0} not found")]
    NotFound(Uuid),
    #[error("incident {0} kept changing under concurrent updates")]
    Contention(Uuid),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RegistryError {
    pub fn is_invalid_transition(&self) -> bool {
        matches!(self, RegistryError::InvalidTransition { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(IncidentState::Resolved.is_terminal());
        assert!(IncidentState::Escalated.is_terminal());
        assert!(IncidentState::Abandoned.is_terminal());
        assert!(!IncidentState::Verifying.is_terminal());
    }

    #[test]
    fn test_state_names_parse_back() {
        for s in [
            IncidentState::Detected,
            IncidentState::Diagnosing,
            IncidentState::Remediating,
            IncidentState::Verifying,
            IncidentState::Resolved,
            IncidentState::Escalated,
            IncidentState::Abandoned,
        ] {
            assert_eq!(IncidentState::parse(s.as_str()), Some(s));
        }
        assert_eq!(IncidentState::parse("open"), None);
    }

    #[test]
    fn test_close_outcome_events() {
        assert_eq!(CloseOutcome::Resolved.into_event(), IncidentEvent::VerificationPassed);
        assert_eq!(
            CloseOutcome::Abandoned { reason: "operator".into() }.into_event().label(),
            "abandon"
        );
    }
}
