//! Trust boundary for oracle output.
//!
//! A response either becomes a complete, valid [`Plan`] or is rejected as a
//! whole. Nothing partially valid gets through.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

use super::{ActionKind, Plan, Step};

#[derive(Debug, Clone, PartialEq)]
pub struct PlanLimits {
    pub max_steps: usize,
    pub allowed: Vec<ActionKind>,
    pub max_params: usize,
    pub max_key_len: usize,
    pub max_value_len: usize,
    pub default_timeout_ms: u64,
    pub max_timeout_ms: u64,
}

impl Default for PlanLimits {
    fn default() -> Self {
        Self {
            max_steps: 8,
            allowed: ActionKind::ALL
                .into_iter()
                .filter(|k| *k != ActionKind::CustomCommand)
                .collect(),
            max_params: 16,
            max_key_len: 64,
            max_value_len: 1024,
            default_timeout_ms: 30_000,
            max_timeout_ms: 300_000,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum PlanError {
    #[error("response is not JSON: {0}")]
    NotJson(String),
    #[error("unexpected response shape: {0}")]
    UnexpectedShape(String),
    #[error("plan has {count} steps, at most {max} allowed")]
    TooManySteps { count: usize, max: usize },
    #[error("step {index}: {reason}")]
    UnknownAction { index: usize, reason: String },
    #[error("step {index}: action '{kind}' is not allowed")]
    ActionNotAllowed { index: usize, kind: ActionKind },
    #[error("step {index}: '{kind}' requires parameter '{param}'")]
    MissingParameter {
        index: usize,
        kind: ActionKind,
        param: &'static str,
    },
    #[error("step {index}: parameter '{param}' {reason}")]
    InvalidParameter {
        index: usize,
        param: String,
        reason: String,
    },
    #[error("step {index}: {count} parameters, at most {max} allowed")]
    TooManyParameters { index: usize, count: usize, max: usize },
    #[error("step {index}: timeout {timeout_ms}ms outside (0, {max}]")]
    InvalidTimeout { index: usize, timeout_ms: u64, max: u64 },
    #[error("confidence {0} outside [0, 1]")]
    InvalidConfidence(f64),
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    steps: Option<Vec<WireStep>>,
    #[serde(default)]
    confidence: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct WireStep {
    #[serde(alias = "action", alias = "kind")]
    action_kind: String,
    #[serde(default)]
    parameters: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

/// Remove a surrounding markdown code fence, if any.
pub fn strip_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string ("json") on the opening line.
    let body = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

fn is_no_action(action: &str) -> bool {
    matches!(
        action.trim().to_ascii_lowercase().replace('_', "-").as_str(),
        "no-action" | "none"
    )
}

/// Parse and validate an oracle response into a plan for `incident_id`.
///
/// Accepted forms are `{"action": "no-action"}` (an empty plan) and
/// `{"steps": [...], "confidence": 0.0..=1.0}`. Step ids are assigned by
/// position; any numbering the oracle supplies is ignored.
pub fn parse_plan(raw: &str, incident_id: Uuid, limits: &PlanLimits) -> Result<Plan, PlanError> {
    let body = strip_fences(raw);
    let wire: WireResponse =
        serde_json::from_str(body).map_err(|e| PlanError::NotJson(e.to_string()))?;

    let confidence = wire.confidence.unwrap_or(0.0);
    if !(0.0..=1.0).contains(&confidence) {
        return Err(PlanError::InvalidConfidence(confidence));
    }

    let wire_steps = match (wire.action.as_deref(), wire.steps) {
        (Some(action), None) if is_no_action(action) => Vec::new(),
        (Some(action), Some(steps)) if is_no_action(action) && steps.is_empty() => Vec::new(),
        (Some(action), _) => {
            return Err(PlanError::UnexpectedShape(format!(
                "top-level action '{action}' is not 'no-action'"
            )))
        }
        (None, Some(steps)) if steps.is_empty() => {
            return Err(PlanError::UnexpectedShape(
                "empty step list; use {\"action\": \"no-action\"}".into(),
            ))
        }
        (None, Some(steps)) => steps,
        (None, None) => {
            return Err(PlanError::UnexpectedShape("neither 'steps' nor 'action' present".into()))
        }
    };

    if wire_steps.len() > limits.max_steps {
        return Err(PlanError::TooManySteps {
            count: wire_steps.len(),
            max: limits.max_steps,
        });
    }

    let steps = wire_steps
        .into_iter()
        .enumerate()
        .map(|(i, s)| validate_step(i + 1, s, limits))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Plan {
        plan_id: Uuid::new_v4(),
        incident_id,
        steps,
        issued_at: Utc::now(),
        oracle_confidence: confidence,
    })
}

fn validate_step(index: usize, wire: WireStep, limits: &PlanLimits) -> Result<Step, PlanError> {
    let kind: ActionKind = wire
        .action_kind
        .parse()
        .map_err(|reason| PlanError::UnknownAction { index, reason })?;
    if !limits.allowed.contains(&kind) {
        return Err(PlanError::ActionNotAllowed { index, kind });
    }

    if wire.parameters.len() > limits.max_params {
        return Err(PlanError::TooManyParameters {
            index,
            count: wire.parameters.len(),
            max: limits.max_params,
        });
    }
    let mut parameters = BTreeMap::new();
    for (key, value) in wire.parameters {
        let invalid = |reason: String| PlanError::InvalidParameter {
            index,
            param: key.clone(),
            reason,
        };
        if key.is_empty() || key.len() > limits.max_key_len {
            return Err(invalid(format!("name must be 1..={} bytes", limits.max_key_len)));
        }
        let value = match value {
            serde_json::Value::String(s) => s,
            serde_json::Value::Number(n) => n.to_string(),
            serde_json::Value::Bool(b) => b.to_string(),
            other => return Err(invalid(format!("must be a scalar, got {other}"))),
        };
        if value.len() > limits.max_value_len {
            return Err(invalid(format!("longer than {} bytes", limits.max_value_len)));
        }
        parameters.insert(key, value);
    }

    for &param in kind.required_params() {
        match parameters.get(param) {
            Some(v) if !v.trim().is_empty() => {}
            _ => return Err(PlanError::MissingParameter { index, kind, param }),
        }
    }
    check_shape(index, kind, &parameters)?;

    let timeout_ms = wire.timeout_ms.unwrap_or(limits.default_timeout_ms);
    if timeout_ms == 0 || timeout_ms > limits.max_timeout_ms {
        return Err(PlanError::InvalidTimeout {
            index,
            timeout_ms,
            max: limits.max_timeout_ms,
        });
    }

    Ok(Step {
        step_id: index as u32,
        action_kind: kind,
        parameters,
        timeout_ms,
    })
}

/// Kind-specific value checks beyond presence.
fn check_shape(index: usize, kind: ActionKind, params: &BTreeMap<String, String>) -> Result<(), PlanError> {
    let positive = |name: &str| -> Result<(), PlanError> {
        let raw = params.get(name).map(String::as_str).unwrap_or_default();
        match raw.trim().parse::<u64>() {
            Ok(n) if n > 0 => Ok(()),
            _ => Err(PlanError::InvalidParameter {
                index,
                param: name.to_string(),
                reason: format!("must be a positive integer, got '{raw}'"),
            }),
        }
    };
    match kind {
        ActionKind::ScaleResource => positive("replicas"),
        ActionKind::ThrottleTraffic => positive("rate_limit"),
        ActionKind::ClearDisk => {
            let path = params.get("path").map(String::as_str).unwrap_or_default();
            if path.starts_with('/') && !path.split('/').any(|seg| seg == "..") {
                Ok(())
            } else {
                Err(PlanError::InvalidParameter {
                    index,
                    param: "path".into(),
                    reason: format!("must be an absolute path without '..', got '{path}'"),
                })
            }
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> Result<Plan, PlanError> {
        parse_plan(raw, Uuid::new_v4(), &PlanLimits::default())
    }

    #[test]
    fn test_valid_two_step_plan() {
        let plan = parse(
            r#"{
                "steps": [
                    {"action_kind": "scale-resource", "parameters": {"resource": "web-api", "replicas": 4}},
                    {"action": "restart_service", "parameters": {"service": "web-api"}, "timeout_ms": 10000}
                ],
                "confidence": 0.75
            }"#,
        )
        .unwrap();
        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.steps[0].step_id, 1);
        assert_eq!(plan.steps[0].parameters["replicas"], "4");
        assert_eq!(plan.steps[0].timeout_ms, 30_000);
        assert_eq!(plan.steps[1].action_kind, ActionKind::RestartService);
        assert_eq!(plan.steps[1].timeout_ms, 10_000);
        assert_eq!(plan.oracle_confidence, 0.75);
    }

    #[test]
    fn test_fenced_response_is_accepted() {
        let raw = "```json\n{\"action\": \"no-action\", \"confidence\": 0.9}\n```";
        let plan = parse(raw).unwrap();
        assert!(plan.steps.is_empty());
    }

    #[test]
    fn test_one_bad_step_rejects_whole_plan() {
        let err = parse(
            r#"{"steps": [
                {"action_kind": "restart-service", "parameters": {"service": "db"}},
                {"action_kind": "format-disk", "parameters": {}}
            ], "confidence": 0.5}"#,
        )
        .unwrap_err();
        assert!(matches!(err, PlanError::UnknownAction { index: 2, .. }));
    }

    #[test]
    fn test_custom_command_not_allowed_by_default() {
        let err = parse(r#"{"steps": [{"action_kind": "custom-command", "parameters": {"command": "rm -rf /"}}]}"#)
            .unwrap_err();
        assert_eq!(
            err,
            PlanError::ActionNotAllowed {
                index: 1,
                kind: ActionKind::CustomCommand
            }
        );
    }

    #[test]
    fn test_parameter_shapes() {
        assert!(matches!(
            parse(r#"{"steps": [{"action_kind": "restart-service", "parameters": {}}]}"#),
            Err(PlanError::MissingParameter { param: "service", .. })
        ));
        assert!(matches!(
            parse(r#"{"steps": [{"action_kind": "scale-resource", "parameters": {"resource": "x", "replicas": "-1"}}]}"#),
            Err(PlanError::InvalidParameter { .. })
        ));
        assert!(matches!(
            parse(r#"{"steps": [{"action_kind": "clear-disk", "parameters": {"path": "var/log"}}]}"#),
            Err(PlanError::InvalidParameter { .. })
        ));
        assert!(matches!(
            parse(r#"{"steps": [{"action_kind": "clear-disk", "parameters": {"path": "/var/../etc"}}]}"#),
            Err(PlanError::InvalidParameter { .. })
        ));
        assert!(matches!(
            parse(r#"{"steps": [{"action_kind": "no-op", "parameters": {"nested": {"a": 1}}}]}"#),
            Err(PlanError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_limits() {
        let many: Vec<String> = (0..9)
            .map(|_| r#"{"action_kind": "no-op"}"#.to_string())
            .collect();
        let raw = format!(r#"{{"steps": [{}]}}"#, many.join(","));
        assert_eq!(
            parse(&raw).unwrap_err(),
            PlanError::TooManySteps { count: 9, max: 8 }
        );

        assert!(matches!(
            parse(r#"{"steps": [{"action_kind": "no-op", "timeout_ms": 0}]}"#),
            Err(PlanError::InvalidTimeout { .. })
        ));
        assert!(matches!(
            parse(r#"{"steps": [{"action_kind": "no-op"}], "confidence": 1.5}"#),
            Err(PlanError::InvalidConfidence(_))
        ));
    }

    #[test]
    fn test_garbage_and_empty_shapes() {
        assert!(matches!(parse("restart everything"), Err(PlanError::NotJson(_))));
        assert!(matches!(parse(r#"{"steps": []}"#), Err(PlanError::UnexpectedShape(_))));
        assert!(matches!(parse(r#"{"action": "panic"}"#), Err(PlanError::UnexpectedShape(_))));
        assert!(matches!(parse("{}"), Err(PlanError::UnexpectedShape(_))));
    }
}
