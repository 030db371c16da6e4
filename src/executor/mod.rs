//! Remediation executor.
//!
//! Runs a plan's steps strictly in order against the sandbox. The first step
//! that fails (after its own retry budget) halts the plan; every later step
//! is recorded as skipped. Each outcome is committed as it completes, so a
//! crash mid-plan leaves a partial attempt that [`RemediationExecutor::recover`]
//! can close out on restart.

pub mod command;

pub use command::CommandSandbox;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::{AuditKind, AuditLogger, AuditRecord};
use crate::broker::{truncate, ActionKind, Plan, Step};
use crate::retry::{RetryPolicy, Transience};
use crate::storage::StoreError;

/// Default cap on the sandbox output kept per step.
pub const DEFAULT_OUTPUT_LIMIT: usize = 4096;

// ---------------------------------------------------------------------------
// Attempt model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepStatus {
    Success,
    Failed,
    TimedOut,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Success => "success",
            StepStatus::Failed => "failed",
            StepStatus::TimedOut => "timed-out",
            StepStatus::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(StepStatus::Success),
            "failed" => Some(StepStatus::Failed),
            "timed-out" => Some(StepStatus::TimedOut),
            "skipped" => Some(StepStatus::Skipped),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub step_id: u32,
    pub status: StepStatus,
    pub output: String,
    pub duration_ms: u64,
    /// Sandbox calls made for this step; zero when skipped.
    pub tries: u32,
}

/// Why an attempt stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// A transient failure outlived the step retry budget.
    Transient,
    NonTransient,
    /// Cancelled, or found unfinished after a restart.
    Interrupted,
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::Transient => "transient",
            FailureClass::NonTransient => "non_transient",
            FailureClass::Interrupted => "interrupted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "transient" => Some(FailureClass::Transient),
            "non_transient" => Some(FailureClass::NonTransient),
            "interrupted" => Some(FailureClass::Interrupted),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemediationAttempt {
    pub attempt_id: Uuid,
    pub plan_id: Uuid,
    pub incident_id: Uuid,
    /// In plan order.
    pub outcomes: Vec<StepOutcome>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub halted_by: Option<FailureClass>,
}

impl RemediationAttempt {
    pub fn start(plan: &Plan) -> Self {
        Self {
            attempt_id: Uuid::new_v4(),
            plan_id: plan.plan_id,
            incident_id: plan.incident_id,
            outcomes: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
            halted_by: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }

    /// Finished with every step successful. A zero-step plan succeeds.
    pub fn succeeded(&self) -> bool {
        self.is_finished()
            && self.halted_by.is_none()
            && self.outcomes.iter().all(|o| o.status == StepStatus::Success)
    }
}

// ---------------------------------------------------------------------------
// Sandbox seam
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct SandboxOutput {
    pub exit_status: i32,
    pub output: String,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SandboxError {
    /// The sandbox refused the action. Retrying will not help.
    #[error("sandbox rejected action: {0}")]
    Rejected(String),
    #[error("sandbox unavailable: {0}")]
    Unavailable(String),
}

/// Runs one action against infrastructure. The executor applies its own
/// timeout around every call, so an implementation that hangs is cut off.
#[async_trait::async_trait]
pub trait Sandbox: Send + Sync {
    async fn run(
        &self,
        kind: ActionKind,
        parameters: &BTreeMap<String, String>,
        timeout: Duration,
    ) -> Result<SandboxOutput, SandboxError>;
}

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("step timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("non-transient failure: {0}")]
    NonTransient(String),
    #[error("execution cancelled")]
    Cancelled,
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl Transience for ExecutionError {
    fn is_transient(&self) -> bool {
        matches!(self, ExecutionError::Timeout { .. } | ExecutionError::Transient(_))
    }
}

// ---------------------------------------------------------------------------
// RemediationExecutor
// ---------------------------------------------------------------------------

pub struct RemediationExecutor {
    sandbox: Arc<dyn Sandbox>,
    audit: Arc<AuditLogger>,
    retry: RetryPolicy,
    output_limit: usize,
}

impl RemediationExecutor {
    /// `retry` is the per-step budget for transient failures.
    pub fn new(sandbox: Arc<dyn Sandbox>, audit: Arc<AuditLogger>, retry: RetryPolicy) -> Self {
        Self {
            sandbox,
            audit,
            retry,
            output_limit: DEFAULT_OUTPUT_LIMIT,
        }
    }

    pub fn with_output_limit(mut self, bytes: usize) -> Self {
        self.output_limit = bytes;
        self
    }

    /// Execute `plan` as a new attempt.
    ///
    /// Sandbox failures never surface as errors here; they end up in the
    /// returned attempt. Only a store failure, which means the attempt can
    /// no longer be recorded, is returned as `Err`.
    pub async fn execute(
        &self,
        plan: &Plan,
        cancel: &CancellationToken,
    ) -> Result<RemediationAttempt, StoreError> {
        let mut attempt = RemediationAttempt::start(plan);
        let started = AuditRecord::new(AuditKind::AttemptStarted)
            .with_incident(plan.incident_id)
            .with_field("attempt_id", attempt.attempt_id.to_string())
            .with_field("plan_id", plan.plan_id.to_string())
            .with_field("steps", plan.steps.len());
        self.audit
            .commit(started, |store, rec| store.begin_attempt(&attempt, rec))
            .await?;
        info!(
            incident_id = %plan.incident_id,
            attempt_id = %attempt.attempt_id,
            steps = plan.steps.len(),
            "remediation attempt started"
        );

        for (position, step) in plan.steps.iter().enumerate() {
            let (outcome, failure) = if attempt.halted_by.is_some() {
                (skipped(step), None)
            } else {
                self.run_step(&attempt, step, cancel).await?
            };
            self.record_outcome(&mut attempt, position, outcome).await?;
            if let Some(class) = failure {
                attempt.halted_by = Some(class);
            }
        }

        self.finish(attempt).await
    }

    /// Close out an attempt found in the store after a restart.
    ///
    /// A finished attempt is returned as is. Otherwise the first step with
    /// no recorded outcome is marked failed as interrupted, the rest are
    /// skipped, and the attempt is finished.
    pub async fn recover(
        &self,
        plan: &Plan,
        mut attempt: RemediationAttempt,
    ) -> Result<RemediationAttempt, StoreError> {
        if attempt.is_finished() {
            return Ok(attempt);
        }
        warn!(
            incident_id = %attempt.incident_id,
            attempt_id = %attempt.attempt_id,
            recorded = attempt.outcomes.len(),
            steps = plan.steps.len(),
            "recovering interrupted remediation attempt"
        );

        if attempt.outcomes.iter().any(|o| o.status != StepStatus::Success) {
            attempt.halted_by = Some(FailureClass::Interrupted);
        }
        for (position, step) in plan.steps.iter().enumerate().skip(attempt.outcomes.len()) {
            let outcome = if attempt.halted_by.is_some() {
                skipped(step)
            } else {
                attempt.halted_by = Some(FailureClass::Interrupted);
                StepOutcome {
                    step_id: step.step_id,
                    status: StepStatus::Failed,
                    output: "interrupted before the outcome was recorded".into(),
                    duration_ms: 0,
                    tries: 0,
                }
            };
            self.record_outcome(&mut attempt, position, outcome).await?;
        }

        self.finish(attempt).await
    }

    async fn run_step(
        &self,
        attempt: &RemediationAttempt,
        step: &Step,
        cancel: &CancellationToken,
    ) -> Result<(StepOutcome, Option<FailureClass>), StoreError> {
        let started = Instant::now();
        let mut tries = 0u32;
        let result = self
            .retry
            .run(cancel, |n| {
                tries = n;
                self.call_sandbox(attempt, step, n, cancel)
            })
            .await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let (status, output, failure) = match result {
            Ok(output) => (StepStatus::Success, output, None),
            Err(ExecutionError::Store(e)) => return Err(e),
            Err(e @ ExecutionError::Timeout { .. }) => {
                (StepStatus::TimedOut, e.to_string(), Some(FailureClass::Transient))
            }
            Err(e @ ExecutionError::Transient(_)) => {
                (StepStatus::Failed, e.to_string(), Some(FailureClass::Transient))
            }
            Err(e @ ExecutionError::NonTransient(_)) => {
                (StepStatus::Failed, e.to_string(), Some(FailureClass::NonTransient))
            }
            Err(ExecutionError::Cancelled) => (
                StepStatus::Failed,
                "cancelled".to_string(),
                Some(FailureClass::Interrupted),
            ),
        };

        if let Some(class) = failure {
            warn!(
                attempt_id = %attempt.attempt_id,
                step_id = step.step_id,
                action = %step.action_kind,
                tries,
                class = class.as_str(),
                "step failed, halting plan"
            );
        }

        Ok((
            StepOutcome {
                step_id: step.step_id,
                status,
                output: truncate(&output, self.output_limit),
                duration_ms,
                tries,
            },
            failure,
        ))
    }

    /// One sandbox call, bounded by the step timeout and `cancel`, with its
    /// own audit record.
    async fn call_sandbox(
        &self,
        attempt: &RemediationAttempt,
        step: &Step,
        try_no: u32,
        cancel: &CancellationToken,
    ) -> Result<String, ExecutionError> {
        let timeout = step.timeout();
        let started = Instant::now();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ExecutionError::Cancelled),
            res = tokio::time::timeout(timeout, self.sandbox.run(step.action_kind, &step.parameters, timeout)) => {
                match res {
                    Err(_) => Err(ExecutionError::Timeout { after_ms: step.timeout_ms }),
                    Ok(Err(SandboxError::Unavailable(msg))) => Err(ExecutionError::Transient(msg)),
                    Ok(Err(SandboxError::Rejected(msg))) => Err(ExecutionError::NonTransient(msg)),
                    Ok(Ok(out)) if out.exit_status != 0 => Err(ExecutionError::NonTransient(format!(
                        "exit status {}: {}",
                        out.exit_status,
                        out.output.trim()
                    ))),
                    Ok(Ok(out)) => Ok(out.output),
                }
            }
        };
        let latency_ms = started.elapsed().as_millis() as u64;

        let record = AuditRecord::new(AuditKind::SandboxCall)
            .with_incident(attempt.incident_id)
            .with_field("attempt_id", attempt.attempt_id.to_string())
            .with_field("step_id", step.step_id)
            .with_field("action", step.action_kind.as_str())
            .with_field("try", try_no)
            .with_field("latency_ms", latency_ms)
            .with_field("ok", result.is_ok())
            .with_field("error", result.as_ref().err().map(|e| e.to_string()));
        self.audit.record(record).await?;

        result
    }

    async fn record_outcome(
        &self,
        attempt: &mut RemediationAttempt,
        position: usize,
        outcome: StepOutcome,
    ) -> Result<(), StoreError> {
        let record = AuditRecord::new(AuditKind::StepOutcome)
            .with_incident(attempt.incident_id)
            .with_field("attempt_id", attempt.attempt_id.to_string())
            .with_field("step_id", outcome.step_id)
            .with_field("status", outcome.status.as_str())
            .with_field("tries", outcome.tries)
            .with_field("duration_ms", outcome.duration_ms);
        let attempt_id = attempt.attempt_id;
        self.audit
            .commit(record, |store, rec| {
                store.append_step_outcome(&attempt_id, position, &outcome, rec)
            })
            .await?;
        attempt.outcomes.push(outcome);
        Ok(())
    }

    async fn finish(&self, mut attempt: RemediationAttempt) -> Result<RemediationAttempt, StoreError> {
        attempt.finished_at = Some(Utc::now());
        let record = AuditRecord::new(AuditKind::AttemptFinished)
            .with_incident(attempt.incident_id)
            .with_field("attempt_id", attempt.attempt_id.to_string())
            .with_field("succeeded", attempt.succeeded())
            .with_field("halted_by", attempt.halted_by.map(|h| h.as_str()));
        self.audit
            .commit(record, |store, rec| store.finish_attempt(&attempt, rec))
            .await?;
        info!(
            incident_id = %attempt.incident_id,
            attempt_id = %attempt.attempt_id,
            succeeded = attempt.succeeded(),
            halted_by = ?attempt.halted_by,
            "remediation attempt finished"
        );
        Ok(attempt)
    }
}

fn skipped(step: &Step) -> StepOutcome {
    StepOutcome {
        step_id: step.step_id,
        status: StepStatus::Skipped,
        output: String::new(),
        duration_ms: 0,
        tries: 0,
    }
}
