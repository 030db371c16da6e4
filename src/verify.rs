//! Post-remediation verification.
//!
//! The rule that opened the incident is re-run against observations sampled
//! after the attempt finished (plus the settle delay). Only positive
//! evidence of health resolves an incident; missing data never does.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::detect::engine::{log_lines, metric_samples, RuleRef};
use crate::detect::{Detector, FaultKind};
use crate::incident::Incident;
use crate::observe::Observation;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Resolved,
    StillFaulted { detail: String },
    Inconclusive { detail: String },
}

impl Verdict {
    pub fn label(&self) -> &'static str {
        match self {
            Verdict::Resolved => "resolved",
            Verdict::StillFaulted { .. } => "still_faulted",
            Verdict::Inconclusive { .. } => "inconclusive",
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, Verdict::Resolved)
    }

    pub fn detail(&self) -> Option<&str> {
        match self {
            Verdict::Resolved => None,
            Verdict::StillFaulted { detail } | Verdict::Inconclusive { detail } => Some(detail),
        }
    }
}

pub struct Verifier {
    detector: Arc<Detector>,
}

impl Verifier {
    pub fn new(detector: Arc<Detector>) -> Self {
        Self { detector }
    }

    /// Judge `incident` from `post_window`, which must hold only the
    /// entity's observations taken after the settle delay.
    pub fn verify(&self, incident: &Incident, post_window: &[Observation]) -> Verdict {
        let Some(rule) = self.detector.rule(&incident.rule_name) else {
            return Verdict::Inconclusive {
                detail: format!("rule '{}' is no longer configured", incident.rule_name),
            };
        };

        match rule {
            RuleRef::Threshold(rule) => {
                let metrics = metric_samples(post_window);
                let samples = metrics.get(rule.metric.as_str()).map(Vec::as_slice).unwrap_or(&[]);
                if let Some(f) = rule.evaluate_fault(samples) {
                    return Verdict::StillFaulted { detail: f.detail };
                }
                if incident.kind == FaultKind::PredictedRisk {
                    if let Some(f) = rule.evaluate_risk(samples) {
                        return Verdict::StillFaulted { detail: f.detail };
                    }
                }

                let needed = rule.min_samples.max(1);
                if samples.len() < needed {
                    return Verdict::Inconclusive {
                        detail: format!(
                            "{} fresh {} samples, need {needed}",
                            samples.len(),
                            rule.metric
                        ),
                    };
                }
                let tail = &samples[samples.len() - needed..];
                match tail.iter().find(|(_, v)| rule.comparison.violates(*v, rule.threshold)) {
                    Some((_, v)) => Verdict::StillFaulted {
                        detail: format!("{} = {v:.2} still beyond {:.2}", rule.metric, rule.threshold),
                    },
                    None => Verdict::Resolved,
                }
            }
            RuleRef::Log(rule) => {
                let lines = log_lines(post_window);
                if let Some(f) = rule.evaluate(&lines) {
                    return Verdict::StillFaulted { detail: f.detail };
                }
                if post_window.is_empty() {
                    Verdict::Inconclusive {
                        detail: "no fresh observations".into(),
                    }
                } else {
                    Verdict::Resolved
                }
            }
        }
    }
}
