//! Anomaly detection: sliding windows, threshold/trend rules, and the
//! signals they emit.
//!
//! The detector never touches the incident registry. It only produces
//! [`Signal`]s; the orchestrator decides what to do with them.

pub mod anomaly;
pub mod engine;
pub mod rules;
pub mod window;

pub use engine::Detector;
pub use window::WindowStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum DetectError {
    #[error("insufficient samples: need {needed}, have {have}")]
    InsufficientSamples { needed: usize, have: usize },
    #[error("all samples share one timestamp")]
    DegenerateTimeline,
}

/// Incident severity, ordered from least to most urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Severity::Low),
            "medium" => Some(Severity::Medium),
            "high" => Some(Severity::High),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }

    /// One step more urgent, saturating at `Critical`.
    pub fn raised(self) -> Self {
        match self {
            Severity::Low => Severity::Medium,
            Severity::Medium => Severity::High,
            Severity::High | Severity::Critical => Severity::Critical,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a problem is happening now or is projected to happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FaultKind {
    ActiveFault,
    PredictedRisk,
}

impl FaultKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FaultKind::ActiveFault => "active-fault",
            FaultKind::PredictedRisk => "predicted-risk",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active-fault" => Some(FaultKind::ActiveFault),
            "predicted-risk" => Some(FaultKind::PredictedRisk),
            _ => None,
        }
    }
}

impl std::fmt::Display for FaultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A detection result for one entity and one rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub entity_id: String,
    pub rule_name: String,
    pub metric_name: String,
    pub kind: FaultKind,
    pub severity: Severity,
    /// Latest observed value (or matching line count for log rules).
    pub value: f64,
    pub detail: String,
    pub observed_at: DateTime<Utc>,
}

/// Derives the deduplication key that identifies "the same underlying
/// problem" across repeated detections.
pub trait Fingerprint: Send + Sync {
    fn signature(&self, signal: &Signal) -> String;
}

/// `"{entity_id}/{kind}/{metric}"`.
///
/// The rule name is deliberately left out so that two rules watching the
/// same metric collapse into one incident.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultFingerprint;

impl Fingerprint for DefaultFingerprint {
    fn signature(&self, signal: &Signal) -> String {
        format!("{}/{}/{}", signal.entity_id, signal.kind, signal.metric_name)
    }
}
