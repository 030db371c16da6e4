//! Bounded, deterministic oracle request context.
//!
//! The context keeps the most recent observations and the most recent
//! history entries; whatever is cut is counted, not silently dropped. The
//! same inputs always serialize to the same bytes, so the SHA-256 digest
//! recorded with each decision identifies exactly what the oracle saw.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::broker::{truncate, ActionKind};
use crate::detect::{FaultKind, Severity};
use crate::incident::{Incident, IncidentState};
use crate::observe::{Observation, ObservationValue};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextLimits {
    pub max_observations: usize,
    pub max_history: usize,
    /// Longest log line passed through, in bytes.
    pub max_log_line: usize,
}

impl Default for ContextLimits {
    fn default() -> Self {
        Self {
            max_observations: 50,
            max_history: 10,
            max_log_line: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentSummary {
    pub incident_id: Uuid,
    pub entity_id: String,
    pub signature: String,
    pub rule_name: String,
    pub metric_name: String,
    pub kind: FaultKind,
    pub severity: Severity,
    pub state: IncidentState,
    pub attempt_count: u32,
    pub opened_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryLine {
    pub from: Option<IncidentState>,
    pub to: IncidentState,
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationLine {
    pub metric: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Everything the oracle is told about an incident.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OracleContext {
    pub incident: IncidentSummary,
    pub history: Vec<HistoryLine>,
    pub omitted_history: usize,
    /// Oldest first.
    pub observations: Vec<ObservationLine>,
    pub omitted_observations: usize,
    pub allowed_actions: Vec<ActionKind>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OracleRequest {
    pub context: OracleContext,
    /// Hex SHA-256 of the serialized context.
    pub context_digest: String,
}

impl OracleRequest {
    pub fn build(
        incident: &Incident,
        recent: &[Observation],
        limits: &ContextLimits,
        allowed: &[ActionKind],
    ) -> Self {
        let mut observations: Vec<&Observation> = recent.iter().collect();
        observations.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.metric_name.cmp(&b.metric_name))
        });
        let omitted_observations = observations.len().saturating_sub(limits.max_observations);
        let observations = observations[omitted_observations..]
            .iter()
            .map(|o| match &o.value {
                ObservationValue::Metric(v) => ObservationLine {
                    metric: o.metric_name.clone(),
                    value: Some(*v),
                    log: None,
                    timestamp: o.timestamp,
                },
                ObservationValue::Log(line) => ObservationLine {
                    metric: o.metric_name.clone(),
                    value: None,
                    log: Some(truncate(line, limits.max_log_line)),
                    timestamp: o.timestamp,
                },
            })
            .collect();

        let omitted_history = incident.history.len().saturating_sub(limits.max_history);
        let history = incident.history[omitted_history..]
            .iter()
            .map(|h| HistoryLine {
                from: h.from,
                to: h.to,
                event: h.event.clone(),
                reason: h.reason.clone(),
            })
            .collect();

        let mut allowed_actions = allowed.to_vec();
        allowed_actions.sort();
        allowed_actions.dedup();

        let context = OracleContext {
            incident: IncidentSummary {
                incident_id: incident.incident_id,
                entity_id: incident.entity_id.clone(),
                signature: incident.signature.clone(),
                rule_name: incident.rule_name.clone(),
                metric_name: incident.metric_name.clone(),
                kind: incident.kind,
                severity: incident.severity,
                state: incident.state,
                attempt_count: incident.attempt_count,
                opened_at: incident.opened_at,
            },
            history,
            omitted_history,
            observations,
            omitted_observations,
            allowed_actions,
        };
        let context_digest = digest(&context);
        Self {
            context,
            context_digest,
        }
    }

    /// The context as pretty JSON, for prompt-based oracles.
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(&self.context).unwrap_or_default()
    }
}

fn digest(context: &OracleContext) -> String {
    let bytes = serde_json::to_vec(context).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::incident::TransitionRecord;

    fn incident(history_len: usize) -> Incident {
        let now = Utc::now();
        Incident {
            incident_id: Uuid::new_v4(),
            entity_id: "db".into(),
            signature: "db/active-fault/memory".into(),
            rule_name: "memory-pressure".into(),
            metric_name: "memory".into(),
            kind: FaultKind::ActiveFault,
            severity: Severity::High,
            opened_at: now,
            state: IncidentState::Diagnosing,
            attempt_count: 0,
            last_plan_id: None,
            version: 0,
            closed_at: None,
            history: (0..history_len)
                .map(|i| TransitionRecord {
                    seq: i as u32,
                    from: None,
                    to: IncidentState::Diagnosing,
                    event: format!("e{i}"),
                    reason: None,
                    at: now,
                })
                .collect(),
        }
    }

    fn samples(n: usize) -> Vec<Observation> {
        let start = Utc::now() - chrono::Duration::hours(1);
        (0..n)
            .map(|i| {
                Observation::metric("db", "memory", i as f64, start + chrono::Duration::seconds(i as i64), "t")
            })
            .collect()
    }

    #[test]
    fn test_keeps_most_recent_observations() {
        let limits = ContextLimits {
            max_observations: 5,
            ..ContextLimits::default()
        };
        let mut obs = samples(20);
        obs.reverse(); // arrival order must not matter
        let req = OracleRequest::build(&incident(1), &obs, &limits, &ActionKind::ALL);

        assert_eq!(req.context.omitted_observations, 15);
        let values: Vec<f64> = req.context.observations.iter().filter_map(|o| o.value).collect();
        assert_eq!(values, vec![15.0, 16.0, 17.0, 18.0, 19.0]);
    }

    #[test]
    fn test_history_truncated_from_the_front() {
        let limits = ContextLimits {
            max_history: 3,
            ..ContextLimits::default()
        };
        let req = OracleRequest::build(&incident(8), &[], &limits, &[]);
        assert_eq!(req.context.omitted_history, 5);
        assert_eq!(req.context.history[0].event, "e5");
        assert_eq!(req.context.history[2].event, "e7");
    }

    #[test]
    fn test_digest_is_deterministic() {
        let inc = incident(2);
        let obs = samples(4);
        let a = OracleRequest::build(&inc, &obs, &ContextLimits::default(), &[ActionKind::NoOp]);
        let b = OracleRequest::build(&inc, &obs, &ContextLimits::default(), &[ActionKind::NoOp]);
        assert_eq!(a.context_digest, b.context_digest);
        assert_eq!(a.context_digest.len(), 64);

        let c = OracleRequest::build(&inc, &obs[..3], &ContextLimits::default(), &[ActionKind::NoOp]);
        assert_ne!(a.context_digest, c.context_digest);
    }
}
