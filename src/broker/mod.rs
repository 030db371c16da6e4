//! Decision broker: asks the reasoning oracle for a remediation plan and
//! refuses to trust the answer until it has been validated.
//!
//! One call to [`DecisionBroker::request_plan`] is one oracle round trip and
//! always leaves exactly one [`DecisionRecord`] behind, whether the oracle
//! answered, timed out, returned garbage, or the call was cancelled.

pub mod context;
pub mod http;
pub mod ratelimit;
pub mod validate;

pub use context::{ContextLimits, OracleRequest};
pub use ratelimit::RateLimiter;
pub use validate::{parse_plan, PlanError, PlanLimits};

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
use crate::config::BrokerConfig;
use crate::incident::Incident;
use crate::observe::Observation;
use crate::retry::Transience;
use crate::storage::StoreError;

/// Longest raw oracle response kept in a decision record.
pub const MAX_RAW_RESPONSE: usize = 16 * 1024;

// ---------------------------------------------------------------------------
// Plan model
// ---------------------------------------------------------------------------

/// The closed set of remediation actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionKind {
    RestartService,
    ScaleResource,
    ClearDisk,
    ThrottleTraffic,
    CustomCommand,
    NoOp,
}

impl ActionKind {
    pub const ALL: [ActionKind; 6] = [
        ActionKind::RestartService,
        ActionKind::ScaleResource,
        ActionKind::ClearDisk,
        ActionKind::ThrottleTraffic,
        ActionKind::CustomCommand,
        ActionKind::NoOp,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::RestartService => "restart-service",
            ActionKind::ScaleResource => "scale-resource",
            ActionKind::ClearDisk => "clear-disk",
            ActionKind::ThrottleTraffic => "throttle-traffic",
            ActionKind::CustomCommand => "custom-command",
            ActionKind::NoOp => "no-op",
        }
    }

    /// Parameters a step of this kind must carry.
    pub fn required_params(&self) -> &'static [&'static str] {
        match self {
            ActionKind::RestartService => &["service"],
            ActionKind::ScaleResource => &["resource", "replicas"],
            ActionKind::ClearDisk => &["path"],
            ActionKind::ThrottleTraffic => &["target", "rate_limit"],
            ActionKind::CustomCommand => &["command"],
            ActionKind::NoOp => &[],
        }
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ActionKind {
    type Err = String;

    /// Accepts `restart-service`, `restart_service` and `RESTART_SERVICE`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('_', "-");
        ActionKind::ALL
            .into_iter()
            .find(|k| k.as_str() == normalized)
            .ok_or_else(|| format!("unknown action kind '{s}'"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// 1-based position within the plan.
    pub step_id: u32,
    pub action_kind: ActionKind,
    pub parameters: BTreeMap<String, String>,
    pub timeout_ms: u64,
}

impl Step {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// An immutable, validated set of steps issued for one decision cycle. An
/// empty plan is the oracle saying no action is needed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub plan_id: Uuid,
    pub incident_id: Uuid,
    pub steps: Vec<Step>,
    pub issued_at: DateTime<Utc>,
    pub oracle_confidence: f64,
}

// ---------------------------------------------------------------------------
// Decision records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DecisionOutcome {
    Accepted,
    RejectedMalformed,
    Timeout,
}

impl DecisionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionOutcome::Accepted => "accepted",
            DecisionOutcome::RejectedMalformed => "rejected-malformed",
            DecisionOutcome::Timeout => "timeout",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "accepted" => Some(DecisionOutcome::Accepted),
            "rejected-malformed" => Some(DecisionOutcome::RejectedMalformed),
            "timeout" => Some(DecisionOutcome::Timeout),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub record_id: Uuid,
    pub incident_id: Uuid,
    pub request_context_digest: String,
    /// Truncated to [`MAX_RAW_RESPONSE`] bytes.
    pub raw_response: String,
    pub parsed_plan_id: Option<Uuid>,
    pub latency_ms: u64,
    pub outcome: DecisionOutcome,
    /// Why the response was rejected, if it was.
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Errors and the oracle seam
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("oracle did not answer within {after_ms}ms")]
    Timeout { after_ms: u64 },
    #[error("malformed oracle response: {0}")]
    Malformed(String),
    #[error("oracle transport failure: {0}")]
    Transport(String),
    #[error("oracle rate limit reached for {entity}, retry in {retry_after:?}")]
    RateLimited { entity: String, retry_after: Duration },
    #[error("oracle call cancelled")]
    Cancelled,
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl Transience for OracleError {
    /// Timeouts and bad answers spend the decision budget; everything else
    /// stops the retry loop immediately.
    fn is_transient(&self) -> bool {
        matches!(
            self,
            OracleError::Timeout { .. } | OracleError::Malformed(_) | OracleError::Transport(_)
        )
    }
}

/// The external reasoning service. Implementations return the raw response
/// text; the broker owns parsing and validation.
#[async_trait::async_trait]
pub trait Oracle: Send + Sync {
    fn name(&self) -> &str;

    async fn propose(&self, request: &OracleRequest) -> anyhow::Result<String>;
}

// ---------------------------------------------------------------------------
// DecisionBroker
// ---------------------------------------------------------------------------

enum CallResult {
    Answered(String),
    Failed(String),
    TimedOut,
    Cancelled,
}

pub struct DecisionBroker {
    oracle: Arc<dyn Oracle>,
    audit: Arc<AuditLogger>,
    limiter: RateLimiter,
    plan_limits: PlanLimits,
    context_limits: ContextLimits,
    timeout: Duration,
}

impl DecisionBroker {
    pub fn new(config: &BrokerConfig, oracle: Arc<dyn Oracle>, audit: Arc<AuditLogger>) -> Self {
        Self {
            oracle,
            audit,
            limiter: RateLimiter::new(
                config.rate_limit_calls,
                Duration::from_secs(config.rate_limit_window_secs),
            ),
            plan_limits: config.plan_limits(),
            context_limits: config.context_limits(),
            timeout: Duration::from_millis(config.oracle_timeout_ms),
        }
    }

    pub fn audit(&self) -> &Arc<AuditLogger> {
        &self.audit
    }

    /// Ask the oracle for a plan for `incident`.
    ///
    /// The decision record (and the plan, when one is accepted) is durably
    /// written before this returns, on every path except the rate limit,
    /// where no call is made and a deferral is audited instead.
    pub async fn request_plan(
        &self,
        incident: &Incident,
        recent: &[Observation],
        cancel: &CancellationToken,
    ) -> Result<Plan, OracleError> {
        if let Err(retry_after) = self.limiter.check_and_record(&incident.entity_id).await {
            self.audit
                .record(
                    AuditRecord::new(AuditKind::DecisionDeferred)
                        .with_incident(incident.incident_id)
                        .with_field("entity_id", incident.entity_id.clone())
                        .with_field("retry_after_ms", retry_after.as_millis() as u64),
                )
                .await?;
            return Err(OracleError::RateLimited {
                entity: incident.entity_id.clone(),
                retry_after,
            });
        }

        let request = OracleRequest::build(
            incident,
            recent,
            &self.context_limits,
            &self.plan_limits.allowed,
        );

        let started = Instant::now();
        let call = tokio::select! {
            biased;
            _ = cancel.cancelled() => CallResult::Cancelled,
            res = tokio::time::timeout(self.timeout, self.oracle.propose(&request)) => match res {
                Ok(Ok(raw)) => CallResult::Answered(raw),
                Ok(Err(e)) => CallResult::Failed(format!("{e:#}")),
                Err(_) => CallResult::TimedOut,
            },
        };
        let latency_ms = started.elapsed().as_millis() as u64;

        let (raw, parsed, outcome_err) = match call {
            CallResult::Answered(raw) => {
                match parse_plan(&raw, incident.incident_id, &self.plan_limits) {
                    Ok(plan) => (raw, Some(plan), None),
                    Err(e) => (raw, None, Some(OracleError::Malformed(e.to_string()))),
                }
            }
            CallResult::Failed(msg) => (String::new(), None, Some(OracleError::Transport(msg))),
            CallResult::TimedOut => (
                String::new(),
                None,
                Some(OracleError::Timeout {
                    after_ms: self.timeout.as_millis() as u64,
                }),
            ),
            CallResult::Cancelled => (String::new(), None, Some(OracleError::Cancelled)),
        };

        let outcome = match &outcome_err {
            None => DecisionOutcome::Accepted,
            Some(OracleError::Timeout { .. }) | Some(OracleError::Cancelled) => DecisionOutcome::Timeout,
            Some(_) => DecisionOutcome::RejectedMalformed,
        };
        let record = DecisionRecord {
            record_id: Uuid::new_v4(),
            incident_id: incident.incident_id,
            request_context_digest: request.context_digest.clone(),
            raw_response: truncate(&raw, MAX_RAW_RESPONSE),
            parsed_plan_id: parsed.as_ref().map(|p| p.plan_id),
            latency_ms,
            outcome,
            detail: outcome_err.as_ref().map(|e| e.to_string()),
            created_at: Utc::now(),
        };

        let audit = AuditRecord::new(AuditKind::Decision)
            .with_incident(incident.incident_id)
            .with_field("decision_id", record.record_id.to_string())
            .with_field("oracle", self.oracle.name())
            .with_field("outcome", outcome.as_str())
            .with_field("latency_ms", latency_ms)
            .with_field("context_digest", record.request_context_digest.clone())
            .with_field("plan_id", record.parsed_plan_id.map(|id| id.to_string()))
            .with_field("steps", parsed.as_ref().map(|p| p.steps.len()))
            .with_field("detail", record.detail.clone());
        self.audit
            .commit(audit, |store, rec| store.insert_decision(&record, parsed.as_ref(), rec))
            .await?;

        match (parsed, outcome_err) {
            (Some(plan), None) => {
                info!(
                    incident_id = %incident.incident_id,
                    plan_id = %plan.plan_id,
                    steps = plan.steps.len(),
                    confidence = plan.oracle_confidence,
                    latency_ms,
                    "oracle plan accepted"
                );
                Ok(plan)
            }
            (_, Some(e)) => {
                warn!(incident_id = %incident.incident_id, outcome = outcome.as_str(), latency_ms, error = %e, "oracle call failed");
                Err(e)
            }
            (None, None) => Err(OracleError::Malformed("no plan produced".into())),
        }
    }
}

/// Cut `s` to at most `max` bytes on a char boundary.
pub fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}
