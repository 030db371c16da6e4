//! Rule evaluation over an entity's window.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::trace;

use crate::detect::rules::{Finding, LogPatternRule, ThresholdRule};
use crate::detect::window::WindowStore;
use crate::detect::{DefaultFingerprint, FaultKind, Fingerprint, Severity, Signal};
use crate::observe::{Observation, LOG_METRIC};

/// A rule looked up by name, for re-evaluation during verification.
#[derive(Debug, Clone, Copy)]
pub enum RuleRef<'a> {
    Threshold(&'a ThresholdRule),
    Log(&'a LogPatternRule),
}

pub struct Detector {
    threshold_rules: Vec<ThresholdRule>,
    log_rules: Vec<LogPatternRule>,
    fingerprint: Arc<dyn Fingerprint>,
}

impl Detector {
    pub fn new(threshold_rules: Vec<ThresholdRule>, log_rules: Vec<LogPatternRule>) -> Self {
        Self {
            threshold_rules,
            log_rules,
            fingerprint: Arc::new(DefaultFingerprint),
        }
    }

    pub fn with_fingerprint(mut self, fingerprint: Arc<dyn Fingerprint>) -> Self {
        self.fingerprint = fingerprint;
        self
    }

    pub fn signature(&self, signal: &Signal) -> String {
        self.fingerprint.signature(signal)
    }

    pub fn rule(&self, name: &str) -> Option<RuleRef<'_>> {
        if let Some(rule) = self.threshold_rules.iter().find(|r| r.name == name) {
            return Some(RuleRef::Threshold(rule));
        }
        self.log_rules
            .iter()
            .find(|r| r.name == name)
            .map(RuleRef::Log)
    }

    /// Evaluate every rule against one entity's window.
    ///
    /// At most one signal per signature is returned (the most severe).
    /// Predicted risks are raised to `high` when some other metric on the
    /// same entity is signalling too.
    pub fn evaluate(&self, entity_id: &str, window: &[Observation]) -> Vec<Signal> {
        let metrics = metric_samples(window);
        let lines = log_lines(window);

        let mut signals = Vec::new();
        for rule in &self.threshold_rules {
            let Some(samples) = metrics.get(rule.metric.as_str()) else {
                continue;
            };
            let finding = rule
                .evaluate_fault(samples)
                .or_else(|| rule.evaluate_risk(samples));
            if let Some(finding) = finding {
                signals.push(to_signal(entity_id, &rule.name, &rule.metric, finding));
            }
        }
        for rule in &self.log_rules {
            if let Some(finding) = rule.evaluate(&lines) {
                signals.push(to_signal(entity_id, &rule.name, LOG_METRIC, finding));
            }
        }

        let signalling: HashSet<String> = signals.iter().map(|s| s.metric_name.clone()).collect();
        for signal in signals.iter_mut() {
            if signal.kind == FaultKind::PredictedRisk
                && signalling.iter().any(|m| m != &signal.metric_name)
            {
                signal.severity = signal.severity.max(Severity::High);
                signal.detail.push_str(" (corroborated)");
            }
        }

        let mut by_signature: BTreeMap<String, Signal> = BTreeMap::new();
        for signal in signals {
            let key = self.signature(&signal);
            match by_signature.get(&key) {
                Some(existing) if existing.severity >= signal.severity => {}
                _ => {
                    by_signature.insert(key, signal);
                }
            }
        }
        let out: Vec<Signal> = by_signature.into_values().collect();
        trace!(entity = %entity_id, signals = out.len(), "evaluated window");
        out
    }

    /// Evaluate the current window of every listed entity.
    pub async fn scan(&self, windows: &WindowStore, entities: &[String]) -> Vec<Signal> {
        let mut signals = Vec::new();
        for entity in entities {
            let window = windows.entity_window(entity).await;
            signals.extend(self.evaluate(entity, &window));
        }
        signals
    }
}

fn to_signal(entity_id: &str, rule_name: &str, metric: &str, finding: Finding) -> Signal {
    Signal {
        entity_id: entity_id.to_string(),
        rule_name: rule_name.to_string(),
        metric_name: metric.to_string(),
        kind: finding.kind,
        severity: finding.severity,
        value: finding.value,
        detail: finding.detail,
        observed_at: finding.observed_at,
    }
}

/// Time-ordered `(timestamp, value)` samples per metric.
pub fn metric_samples(window: &[Observation]) -> BTreeMap<&str, Vec<(DateTime<Utc>, f64)>> {
    let mut out: BTreeMap<&str, Vec<(DateTime<Utc>, f64)>> = BTreeMap::new();
    for obs in window {
        if let Some(v) = obs.as_metric() {
            out.entry(obs.metric_name.as_str())
                .or_default()
                .push((obs.timestamp, v));
        }
    }
    for samples in out.values_mut() {
        samples.sort_by(|a, b| a.0.cmp(&b.0));
    }
    out
}

/// Time-ordered log lines.
pub fn log_lines(window: &[Observation]) -> Vec<(DateTime<Utc>, &str)> {
    let mut lines: Vec<(DateTime<Utc>, &str)> = window
        .iter()
        .filter_map(|o| o.as_log().map(|l| (o.timestamp, l)))
        .collect();
    lines.sort_by(|a, b| a.0.cmp(&b.0));
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::rules::{default_log_rules, default_threshold_rules};

    fn detector() -> Detector {
        Detector::new(default_threshold_rules(), default_log_rules())
    }

    fn ramp(entity: &str, metric: &str, values: &[f64]) -> Vec<Observation> {
        let start = Utc::now() - chrono::Duration::minutes(5);
        values
            .iter()
            .enumerate()
            .map(|(i, v)| {
                Observation::metric(
                    entity,
                    metric,
                    *v,
                    start + chrono::Duration::seconds(10 * i as i64),
                    "test",
                )
            })
            .collect()
    }

    #[test]
    fn test_sustained_cpu_fault() {
        let window = ramp("web-api", "cpu", &[40.0, 92.0, 95.0, 97.0, 96.0]);
        let signals = detector().evaluate("web-api", &window);
        assert_eq!(signals.len(), 1);
        let s = &signals[0];
        assert_eq!(s.kind, FaultKind::ActiveFault);
        assert_eq!(s.rule_name, "cpu-saturation");
        assert_eq!(detector().signature(s), "web-api/active-fault/cpu");
    }

    #[test]
    fn test_healthy_window_is_silent() {
        let window = ramp("cache", "cpu", &[20.0, 22.0, 19.0, 21.0]);
        assert!(detector().evaluate("cache", &window).is_empty());
    }

    #[test]
    fn test_risk_alone_stays_at_most_medium() {
        let window = ramp("db", "memory", &[60.0, 65.0, 70.0, 75.0, 80.0]);
        let signals = detector().evaluate("db", &window);
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].kind, FaultKind::PredictedRisk);
        assert!(signals[0].severity <= Severity::Medium);
    }

    #[test]
    fn test_corroborated_risk_is_raised() {
        let mut window = ramp("db", "memory", &[60.0, 65.0, 70.0, 75.0, 80.0]);
        window.extend(ramp("db", "cpu", &[90.0, 91.0, 92.0, 93.0, 94.0]));
        let signals = detector().evaluate("db", &window);
        let risk = signals
            .iter()
            .find(|s| s.kind == FaultKind::PredictedRisk)
            .unwrap();
        assert_eq!(risk.severity, Severity::High);
    }

    #[test]
    fn test_log_rules_collapse_to_one_signature() {
        let now = Utc::now();
        let mut window = Vec::new();
        for i in 0..6 {
            window.push(Observation::log(
                "auth-service",
                format!("ERROR auth-service request {i} failed"),
                now - chrono::Duration::seconds(10 - i),
                "logs",
            ));
        }
        window.push(Observation::log("auth-service", "auth-service CRASH", now, "logs"));
        let signals = detector().evaluate("auth-service", &window);
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].rule_name, "service-crash");
        assert_eq!(signals[0].severity, Severity::Critical);
    }

    #[test]
    fn test_rule_lookup() {
        let d = detector();
        assert!(matches!(d.rule("cpu-saturation"), Some(RuleRef::Threshold(_))));
        assert!(matches!(d.rule("service-crash"), Some(RuleRef::Log(_))));
        assert!(d.rule("nope").is_none());
    }
}
