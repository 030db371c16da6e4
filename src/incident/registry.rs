//! The incident registry: single source of truth for what is happening and
//! what has been tried.
//!
//! Creation is compare-and-create on (entity_id, signature); every
//! transition is compare-and-swap on the incident's version. Both commit
//! their audit record in the same transaction as the state change.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::state::apply;
use super::{CloseOutcome, Incident, IncidentEvent, IncidentState, RegistryError, TransitionRecord};
use crate::audit::{AuditKind, AuditLogger, AuditRecord};
use crate::detect::{FaultKind, Severity, Signal};
use crate::storage::Store;

/// Give up on a transition after this many lost compare-and-swap races.
const MAX_SWAP_TRIES: u32 = 8;

/// What the detector knows when it asks for an incident.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenRequest {
    pub entity_id: String,
    pub signature: String,
    pub kind: FaultKind,
    pub severity: Severity,
    pub rule_name: String,
    pub metric_name: String,
}

impl OpenRequest {
    pub fn from_signal(signal: &Signal, signature: String) -> Self {
        Self {
            entity_id: signal.entity_id.clone(),
            signature,
            kind: signal.kind,
            severity: signal.severity,
            rule_name: signal.rule_name.clone(),
            metric_name: signal.metric_name.clone(),
        }
    }
}

pub struct IncidentRegistry {
    audit: Arc<AuditLogger>,
    max_attempts: u32,
}

impl IncidentRegistry {
    pub fn new(audit: Arc<AuditLogger>, max_attempts: u32) -> Self {
        Self {
            audit,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    fn store(&self) -> &Store {
        self.audit.store()
    }

    /// Return the open incident for (entity_id, signature), creating it in
    /// `Detected` if there is none. The flag is `true` when it was created.
    pub async fn open_or_get(&self, req: &OpenRequest) -> Result<(Incident, bool), RegistryError> {
        let now = Utc::now();
        let candidate = Incident {
            incident_id: Uuid::new_v4(),
            entity_id: req.entity_id.clone(),
            signature: req.signature.clone(),
            rule_name: req.rule_name.clone(),
            metric_name: req.metric_name.clone(),
            kind: req.kind,
            severity: req.severity,
            opened_at: now,
            state: IncidentState::Detected,
            attempt_count: 0,
            last_plan_id: None,
            version: 0,
            closed_at: None,
            history: vec![TransitionRecord {
                seq: 0,
                from: None,
                to: IncidentState::Detected,
                event: "opened".into(),
                reason: None,
                at: now,
            }],
        };

        let record = AuditRecord::new(AuditKind::IncidentOpened)
            .with_incident(candidate.incident_id)
            .with_field("entity_id", req.entity_id.clone())
            .with_field("signature", req.signature.clone())
            .with_field("kind", req.kind.as_str())
            .with_field("severity", req.severity.as_str())
            .with_field("rule", req.rule_name.clone());
        let (incident, created) = self
            .audit
            .commit(record, |store, rec| store.create_incident_if_absent(&candidate, rec))
            .await?;

        if created {
            info!(
                incident_id = %incident.incident_id,
                entity = %incident.entity_id,
                signature = %incident.signature,
                severity = %incident.severity,
                "incident opened"
            );
        } else {
            debug!(incident_id = %incident.incident_id, signature = %incident.signature, "incident already open");
        }
        Ok((incident, created))
    }

    /// Apply `event` to the incident.
    ///
    /// An event the current state does not accept leaves the incident
    /// untouched, is audited as rejected, and returns
    /// [`RegistryError::InvalidTransition`].
    pub async fn transition(&self, incident_id: Uuid, event: IncidentEvent) -> Result<Incident, RegistryError> {
        for _ in 0..MAX_SWAP_TRIES {
            let current = self
                .store()
                .get_incident(&incident_id)?
                .ok_or(RegistryError::NotFound(incident_id))?;

            let step = match apply(current.state, current.attempt_count, self.max_attempts, &event) {
                Ok(step) => step,
                Err(source) => {
                    warn!(
                        incident_id = %incident_id,
                        state = %current.state,
                        event = event.label(),
                        "invalid transition dropped"
                    );
                    self.audit
                        .record(
                            AuditRecord::new(AuditKind::TransitionRejected)
                                .with_incident(incident_id)
                                .with_field("state", current.state.as_str())
                                .with_field("event", event.label())
                                .with_field("version", current.version),
                        )
                        .await?;
                    return Err(RegistryError::InvalidTransition { incident_id, source });
                }
            };

            let now = Utc::now();
            let record = TransitionRecord {
                seq: current.history.last().map_or(0, |h| h.seq + 1),
                from: Some(current.state),
                to: step.to,
                event: event.label().to_string(),
                reason: event.reason(),
                at: now,
            };
            let mut next = current.clone();
            next.state = step.to;
            next.attempt_count = step.attempt_count;
            next.last_plan_id = step.plan_id.or(current.last_plan_id);
            next.version = current.version + 1;
            if step.to.is_terminal() {
                next.closed_at = Some(now);
            }
            next.history.push(record.clone());

            let audit = AuditRecord::new(AuditKind::Transition)
                .with_incident(incident_id)
                .with_field("from", current.state.as_str())
                .with_field("to", step.to.as_str())
                .with_field("event", event.label())
                .with_field("reason", event.reason())
                .with_field("attempt_count", next.attempt_count)
                .with_field("version", next.version);
            let swapped = self
                .audit
                .commit(audit, |store, rec| store.swap_incident(current.version, &next, &record, rec))
                .await?;

            if swapped {
                info!(
                    incident_id = %incident_id,
                    from = %current.state,
                    to = %next.state,
                    event = event.label(),
                    attempt_count = next.attempt_count,
                    "incident transition"
                );
                return Ok(next);
            }
            debug!(incident_id = %incident_id, version = current.version, "lost transition race, retrying");
        }
        warn!(incident_id = %incident_id, event = event.label(), "transition abandoned under contention");
        Err(RegistryError::Contention(incident_id))
    }

    /// Close an incident from outside the control loop.
    pub async fn close(&self, incident_id: Uuid, outcome: CloseOutcome) -> Result<Incident, RegistryError> {
        self.transition(incident_id, outcome.into_event()).await
    }

    pub fn get(&self, incident_id: &Uuid) -> Result<Option<Incident>, RegistryError> {
        Ok(self.store().get_incident(incident_id)?)
    }

    pub fn list_open(&self) -> Result<Vec<Incident>, RegistryError> {
        Ok(self.store().list_incidents(true, usize::MAX >> 1)?)
    }

    pub fn list_recent(&self, limit: usize) -> Result<Vec<Incident>, RegistryError> {
        Ok(self.store().list_incidents(false, limit)?)
    }

    pub fn history(&self, incident_id: &Uuid) -> Result<Vec<TransitionRecord>, RegistryError> {
        self.get(incident_id)?
            .map(|i| i.history)
            .ok_or(RegistryError::NotFound(*incident_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use crate::storage::open_memory_pool;

    fn registry(max_attempts: u32) -> IncidentRegistry {
        let store = Store::new(open_memory_pool().unwrap());
        IncidentRegistry::new(Arc::new(AuditLogger::new(store, RetryPolicy::once())), max_attempts)
    }

    fn request(entity: &str) -> OpenRequest {
        OpenRequest {
            entity_id: entity.into(),
            signature: format!("{entity}/active-fault/cpu"),
            kind: FaultKind::ActiveFault,
            severity: Severity::High,
            rule_name: "cpu-saturation".into(),
            metric_name: "cpu".into(),
        }
    }

    fn audit_kinds(reg: &IncidentRegistry, id: &Uuid) -> Vec<AuditKind> {
        reg.store()
            .audit_for_incident(id)
            .unwrap()
            .into_iter()
            .map(|r| r.kind)
            .collect()
    }

    #[tokio::test]
    async fn test_open_is_idempotent() {
        let reg = registry(3);
        let (a, created_a) = reg.open_or_get(&request("web")).await.unwrap();
        let (b, created_b) = reg.open_or_get(&request("web")).await.unwrap();
        assert!(created_a);
        assert!(!created_b);
        assert_eq!(a.incident_id, b.incident_id);
        assert_eq!(a.state, IncidentState::Detected);
        assert_eq!(audit_kinds(&reg, &a.incident_id), vec![AuditKind::IncidentOpened]);

        let (other, created) = reg.open_or_get(&request("db")).await.unwrap();
        assert!(created);
        assert_ne!(other.incident_id, a.incident_id);
    }

    #[tokio::test]
    async fn test_full_lifecycle_to_resolved() {
        let reg = registry(3);
        let (inc, _) = reg.open_or_get(&request("web")).await.unwrap();
        let id = inc.incident_id;
        let plan_id = Uuid::new_v4();

        reg.transition(id, IncidentEvent::BeginDiagnosis).await.unwrap();
        let inc = reg.transition(id, IncidentEvent::PlanIssued { plan_id }).await.unwrap();
        assert_eq!(inc.last_plan_id, Some(plan_id));
        let inc = reg
            .transition(
                id,
                IncidentEvent::AttemptFinished {
                    attempt_id: Uuid::new_v4(),
                    succeeded: true,
                },
            )
            .await
            .unwrap();
        assert_eq!(inc.attempt_count, 1);
        let inc = reg.transition(id, IncidentEvent::VerificationPassed).await.unwrap();
        assert_eq!(inc.state, IncidentState::Resolved);
        assert!(inc.closed_at.is_some());

        let history = reg.history(&id).unwrap();
        let seqs: Vec<u32> = history.iter().map(|h| h.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
        assert_eq!(history, inc.history);
        assert_eq!(reg.get(&id).unwrap().unwrap(), inc);

        // A resolved incident no longer blocks a new one for the same key.
        let (fresh, created) = reg.open_or_get(&request("web")).await.unwrap();
        assert!(created);
        assert_ne!(fresh.incident_id, id);
    }

    #[tokio::test]
    async fn test_invalid_transition_leaves_state() {
        let reg = registry(3);
        let (inc, _) = reg.open_or_get(&request("web")).await.unwrap();

        let err = reg
            .transition(inc.incident_id, IncidentEvent::VerificationPassed)
            .await
            .unwrap_err();
        assert!(err.is_invalid_transition());

        let after = reg.get(&inc.incident_id).unwrap().unwrap();
        assert_eq!(after, inc);
        assert_eq!(
            audit_kinds(&reg, &inc.incident_id),
            vec![AuditKind::IncidentOpened, AuditKind::TransitionRejected]
        );
    }

    #[tokio::test]
    async fn test_failed_verification_escalates_at_max_attempts() {
        let reg = registry(2);
        let (inc, _) = reg.open_or_get(&request("web")).await.unwrap();
        let id = inc.incident_id;
        reg.transition(id, IncidentEvent::BeginDiagnosis).await.unwrap();

        let mut last = inc;
        for _ in 0..2 {
            reg.transition(id, IncidentEvent::PlanIssued { plan_id: Uuid::new_v4() })
                .await
                .unwrap();
            reg.transition(
                id,
                IncidentEvent::AttemptFinished {
                    attempt_id: Uuid::new_v4(),
                    succeeded: true,
                },
            )
            .await
            .unwrap();
            last = reg
                .transition(id, IncidentEvent::VerificationFailed { reason: "still hot".into() })
                .await
                .unwrap();
        }
        assert_eq!(last.attempt_count, 2);
        assert_eq!(last.state, IncidentState::Escalated);
        assert!(reg.list_open().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_close_abandons() {
        let reg = registry(3);
        let (inc, _) = reg.open_or_get(&request("web")).await.unwrap();
        let closed = reg
            .close(inc.incident_id, CloseOutcome::Abandoned { reason: "operator".into() })
            .await
            .unwrap();
        assert_eq!(closed.state, IncidentState::Abandoned);
        assert_eq!(closed.history.last().unwrap().reason.as_deref(), Some("operator"));

        let err = reg
            .close(inc.incident_id, CloseOutcome::Escalated { reason: "late".into() })
            .await
            .unwrap_err();
        assert!(err.is_invalid_transition());
        assert_eq!(reg.list_recent(10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_concurrent_events_apply_once() {
        let reg = Arc::new(registry(3));
        let (inc, _) = reg.open_or_get(&request("web")).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let reg = reg.clone();
            let id = inc.incident_id;
            handles.push(tokio::spawn(async move {
                reg.transition(id, IncidentEvent::BeginDiagnosis).await
            }));
        }
        let mut ok = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(_) => ok += 1,
                Err(e) => assert!(e.is_invalid_transition()),
            }
        }
        assert_eq!(ok, 1);
        let after = reg.get(&inc.incident_id).unwrap().unwrap();
        assert_eq!(after.state, IncidentState::Diagnosing);
        assert_eq!(after.version, 1);
    }

    #[tokio::test]
    async fn test_unknown_incident() {
        let reg = registry(3);
        let err = reg
            .transition(Uuid::new_v4(), IncidentEvent::BeginDiagnosis)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::NotFound(_)));
    }
}
