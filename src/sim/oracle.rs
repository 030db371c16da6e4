//! A deterministic stand-in for the reasoning service.

use serde_json::json;

use crate::broker::{ActionKind, Oracle, OracleRequest};
use crate::observe::LOG_METRIC;

/// Maps the incident's metric to a single remediation step.
#[derive(Debug, Default, Clone)]
pub struct HeuristicOracle;

impl HeuristicOracle {
    pub fn new() -> Self {
        Self
    }

    fn choose(metric: &str, entity: &str, attempt: u32) -> Option<(ActionKind, serde_json::Value)> {
        let step = match metric {
            "cpu" => (
                ActionKind::ScaleResource,
                json!({"resource": entity, "replicas": 3 + attempt}),
            ),
            "memory" | "error_count" | LOG_METRIC => (ActionKind::RestartService, json!({"service": entity})),
            "disk" => (
                ActionKind::ClearDisk,
                json!({"path": format!("/var/log/{entity}"), "service": entity}),
            ),
            "p99_latency_ms" => (
                ActionKind::ThrottleTraffic,
                json!({"target": entity, "rate_limit": 500}),
            ),
            _ => return None,
        };
        Some(step)
    }
}

#[async_trait::async_trait]
impl Oracle for HeuristicOracle {
    fn name(&self) -> &str {
        "heuristic"
    }

    async fn propose(&self, request: &OracleRequest) -> anyhow::Result<String> {
        let incident = &request.context.incident;
        let step = Self::choose(&incident.metric_name, &incident.entity_id, incident.attempt_count)
            .filter(|(kind, _)| request.context.allowed_actions.contains(kind));

        let response = match step {
            Some((kind, parameters)) => json!({
                "steps": [{"action_kind": kind.as_str(), "parameters": parameters}],
                "confidence": 0.7,
                "rationale": format!("{} on {} usually clears with {kind}", incident.metric_name, incident.entity_id),
            }),
            None => json!({"action": "no-action", "confidence": 0.2}),
        };
        Ok(response.to_string())
    }
}
