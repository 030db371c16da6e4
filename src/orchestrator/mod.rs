//! The control loop: detect, decide, act, verify.
//!
//! [`Orchestrator::run_cycle`] drives one incident from whatever state the
//! registry holds until it is terminal, deferred, or cancelled. Each step
//! reads the incident back from the store first, so a cycle interrupted at
//! any point resumes correctly when the incident is picked up again.
//! [`engine::Engine`] feeds it from the observation source through a
//! bounded worker pool.

pub mod engine;
pub mod queue;

pub use engine::{Engine, TickSummary};
pub use queue::{PendingContext, Submitted, WorkQueue};

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::{AuditKind, AuditLogger, AuditRecord};
use crate::broker::{DecisionBroker, DecisionOutcome, OracleError, Plan};
use crate::config::OrchestratorConfig;
use crate::detect::WindowStore;
use crate::executor::{FailureClass, RemediationAttempt, RemediationExecutor};
use crate::incident::{Incident, IncidentEvent, IncidentRegistry, IncidentState, RegistryError};
use crate::observe::Observation;
use crate::retry::RetryPolicy;
use crate::storage::StoreError;
use crate::verify::{Verdict, Verifier};

/// Consecutive rejected transitions tolerated before a cycle gives up.
const MAX_STALLS: u32 = 3;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("incident {0} not found")]
    NotFound(Uuid),
    #[error("cycle cancelled")]
    Cancelled,
    #[error(transparent)]
    Registry(RegistryError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<RegistryError> for OrchestratorError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::Store(e) => OrchestratorError::Store(e),
            RegistryError::NotFound(id) => OrchestratorError::NotFound(id),
            other => OrchestratorError::Registry(other),
        }
    }
}

impl OrchestratorError {
    /// The cycle stopped because the store could not record a step; it is
    /// safe to retry later from the last durable state.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, OrchestratorError::Store(StoreError::Unavailable(_)))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// The incident reached this terminal state.
    Finished(IncidentState),
    /// The oracle budget for the entity is spent; try again after this long.
    Deferred(Duration),
}

enum Decision {
    Plan(Plan),
    Exhausted(String),
    Deferred(Duration),
}

pub struct Orchestrator {
    registry: Arc<IncidentRegistry>,
    broker: Arc<DecisionBroker>,
    executor: Arc<RemediationExecutor>,
    verifier: Verifier,
    windows: Arc<WindowStore>,
    queue: Arc<WorkQueue>,
    config: OrchestratorConfig,
    escalate_on_nontransient: bool,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<IncidentRegistry>,
        broker: Arc<DecisionBroker>,
        executor: Arc<RemediationExecutor>,
        verifier: Verifier,
        windows: Arc<WindowStore>,
        queue: Arc<WorkQueue>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            registry,
            broker,
            executor,
            verifier,
            windows,
            queue,
            config,
            escalate_on_nontransient: false,
        }
    }

    /// Escalate as soon as a step fails non-transiently instead of going
    /// through verification and another decision cycle.
    pub fn with_escalate_on_nontransient(mut self, enabled: bool) -> Self {
        self.escalate_on_nontransient = enabled;
        self
    }

    pub fn registry(&self) -> &Arc<IncidentRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn windows(&self) -> &Arc<WindowStore> {
        &self.windows
    }

    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    pub fn audit(&self) -> &Arc<AuditLogger> {
        self.broker.audit()
    }

    /// Drive `incident_id` until it is terminal or the oracle defers it.
    ///
    /// Returns `Err(Cancelled)` without any further transition once `cancel`
    /// fires; the incident stays in its last recorded state and the next
    /// cycle picks up from there.
    pub async fn run_cycle(
        &self,
        incident_id: Uuid,
        mut ctx: PendingContext,
        cancel: &CancellationToken,
    ) -> Result<CycleOutcome, OrchestratorError> {
        let mut stalls = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(OrchestratorError::Cancelled);
            }
            let incident = self
                .registry
                .get(&incident_id)?
                .ok_or(OrchestratorError::NotFound(incident_id))?;
            debug!(incident_id = %incident_id, state = %incident.state, "cycle step");

            let event = match incident.state {
                IncidentState::Detected => IncidentEvent::BeginDiagnosis,
                IncidentState::Diagnosing => {
                    ctx.merge(self.queue.take_pending(&incident_id).await);
                    match self.decide(&incident, &ctx, cancel).await? {
                        Decision::Plan(plan) => IncidentEvent::PlanIssued { plan_id: plan.plan_id },
                        Decision::Exhausted(reason) => IncidentEvent::DecisionExhausted { reason },
                        Decision::Deferred(wait) => return Ok(CycleOutcome::Deferred(wait)),
                    }
                }
                IncidentState::Remediating => self.remediate(&incident, cancel).await?,
                IncidentState::Verifying => self.verify(&incident, cancel).await?,
                IncidentState::Resolved | IncidentState::Escalated | IncidentState::Abandoned => {
                    return Ok(CycleOutcome::Finished(incident.state))
                }
            };

            match self.registry.transition(incident_id, event).await {
                Ok(_) => stalls = 0,
                Err(e) if e.is_invalid_transition() && stalls < MAX_STALLS => {
                    // Someone else moved the incident; re-read and continue.
                    stalls += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn decide(
        &self,
        incident: &Incident,
        ctx: &PendingContext,
        cancel: &CancellationToken,
    ) -> Result<Decision, OrchestratorError> {
        let budget = self.config.decision_retry.attempts();
        let spent = self.failed_decisions_this_round(incident)?;
        if spent >= budget {
            warn!(incident_id = %incident.incident_id, budget, spent, "decision budget exhausted");
            return Ok(Decision::Exhausted(format!(
                "no valid plan after {spent} oracle calls"
            )));
        }

        // Calls already spent this round, before a deferral, still count.
        let policy = RetryPolicy {
            max_attempts: budget - spent,
            ..self.config.decision_retry.clone()
        };
        let result = policy
            .run(cancel, |n| async move {
                debug!(incident_id = %incident.incident_id, attempt = spent + n, budget, "requesting plan");
                let recent = self.recent_observations(incident, ctx).await;
                self.broker.request_plan(incident, &recent, cancel).await
            })
            .await;

        match result {
            Ok(plan) => Ok(Decision::Plan(plan)),
            Err(OracleError::RateLimited { retry_after, .. }) => Ok(Decision::Deferred(retry_after)),
            Err(OracleError::Cancelled) => Err(OrchestratorError::Cancelled),
            Err(OracleError::Store(e)) => Err(OrchestratorError::Store(e)),
            Err(_) if cancel.is_cancelled() => Err(OrchestratorError::Cancelled),
            Err(e) => {
                let spent = self.failed_decisions_this_round(incident)?;
                warn!(incident_id = %incident.incident_id, budget, spent, error = %e, "decision budget exhausted");
                Ok(Decision::Exhausted(format!(
                    "no valid plan after {spent} oracle calls: {e}"
                )))
            }
        }
    }

    /// Oracle calls that produced no plan since the incident last entered
    /// `Diagnosing`, counted from the durable decision records.
    fn failed_decisions_this_round(&self, incident: &Incident) -> Result<u32, OrchestratorError> {
        let round_start = incident
            .history
            .iter()
            .rev()
            .find(|t| t.to == IncidentState::Diagnosing)
            .map_or(incident.opened_at, |t| t.at);
        let failed = self
            .audit()
            .store()
            .decisions_for_incident(&incident.incident_id)?
            .iter()
            .filter(|d| d.created_at >= round_start && d.outcome != DecisionOutcome::Accepted)
            .count();
        Ok(failed as u32)
    }

    /// The entity's current window plus anything carried in `ctx` that the
    /// window no longer holds.
    async fn recent_observations(&self, incident: &Incident, ctx: &PendingContext) -> Vec<Observation> {
        let mut recent = self.windows.entity_window(&incident.entity_id).await;
        for obs in &ctx.observations {
            if obs.entity_id == incident.entity_id && !recent.contains(obs) {
                recent.push(obs.clone());
            }
        }
        recent
    }

    async fn remediate(
        &self,
        incident: &Incident,
        cancel: &CancellationToken,
    ) -> Result<IncidentEvent, OrchestratorError> {
        let plan = match incident.last_plan_id {
            Some(plan_id) => self.audit().store().get_plan(&plan_id)?,
            None => None,
        };
        let Some(plan) = plan else {
            warn!(incident_id = %incident.incident_id, plan_id = ?incident.last_plan_id, "remediating without a stored plan");
            return Ok(IncidentEvent::Escalate {
                reason: "remediation plan missing from the store".into(),
            });
        };

        let attempt = self.attempt_for(&plan, cancel).await?;
        if cancel.is_cancelled() {
            return Err(OrchestratorError::Cancelled);
        }

        if self.escalate_on_nontransient && attempt.halted_by == Some(FailureClass::NonTransient) {
            return Ok(IncidentEvent::Escalate {
                reason: format!("attempt {} failed non-transiently", attempt.attempt_id),
            });
        }
        Ok(IncidentEvent::AttemptFinished {
            attempt_id: attempt.attempt_id,
            succeeded: attempt.succeeded(),
        })
    }

    /// Reuse a finished attempt, close out an interrupted one, or execute
    /// the plan afresh. A plan is executed at most once.
    async fn attempt_for(
        &self,
        plan: &Plan,
        cancel: &CancellationToken,
    ) -> Result<RemediationAttempt, OrchestratorError> {
        let existing = self
            .audit()
            .store()
            .attempts_for_plan(&plan.plan_id)?
            .into_iter()
            .last();
        let attempt = match existing {
            Some(attempt) if attempt.is_finished() => attempt,
            Some(attempt) => self.executor.recover(plan, attempt).await?,
            None => self.executor.execute(plan, cancel).await?,
        };
        Ok(attempt)
    }

    async fn verify(
        &self,
        incident: &Incident,
        cancel: &CancellationToken,
    ) -> Result<IncidentEvent, OrchestratorError> {
        let attempt = match incident.last_plan_id {
            Some(plan_id) => self.audit().store().attempts_for_plan(&plan_id)?.into_iter().last(),
            None => None,
        };

        let (verdict, attempt_id) = match attempt {
            Some(a) if a.succeeded() => {
                let since = a.finished_at.unwrap_or(a.started_at);
                (self.await_verdict(incident, since, cancel).await?, Some(a.attempt_id))
            }
            Some(a) => (
                Verdict::StillFaulted {
                    detail: format!(
                        "remediation attempt failed ({})",
                        a.halted_by.map_or("incomplete", |h| h.as_str())
                    ),
                },
                Some(a.attempt_id),
            ),
            None => (
                Verdict::StillFaulted {
                    detail: "no remediation attempt recorded".into(),
                },
                None,
            ),
        };

        info!(
            incident_id = %incident.incident_id,
            verdict = verdict.label(),
            detail = verdict.detail().unwrap_or(""),
            "verification finished"
        );
        self.audit()
            .record(
                AuditRecord::new(AuditKind::Verification)
                    .with_incident(incident.incident_id)
                    .with_field("verdict", verdict.label())
                    .with_field("detail", verdict.detail().map(str::to_string))
                    .with_field("attempt_id", attempt_id.map(|id| id.to_string())),
            )
            .await?;

        // Inconclusive counts as still faulted.
        Ok(match verdict {
            Verdict::Resolved => IncidentEvent::VerificationPassed,
            Verdict::StillFaulted { detail } | Verdict::Inconclusive { detail } => {
                IncidentEvent::VerificationFailed { reason: detail }
            }
        })
    }

    /// Sample the entity after the settle delay until the verdict is
    /// conclusive or the verification window closes.
    async fn await_verdict(
        &self,
        incident: &Incident,
        attempt_finished: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Verdict, OrchestratorError> {
        let settle = chrono::Duration::from_std(self.config.settle_delay()).unwrap_or_else(|_| chrono::Duration::zero());
        let fresh_after = attempt_finished + settle;
        if let Ok(wait) = (fresh_after - Utc::now()).to_std() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(OrchestratorError::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
        }

        let deadline = Instant::now() + self.config.verification_window();
        loop {
            let post = self.windows.since(&incident.entity_id, fresh_after).await;
            let verdict = self.verifier.verify(incident, &post);
            if !matches!(verdict, Verdict::Inconclusive { .. }) || Instant::now() >= deadline {
                return Ok(verdict);
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(OrchestratorError::Cancelled),
                _ = tokio::time::sleep(self.config.verification_poll()) => {}
            }
        }
    }
}
