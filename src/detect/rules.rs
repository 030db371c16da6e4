//! Detection rules: sustained-threshold faults, trend-projected risks, and
//! log-pattern faults.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::detect::anomaly::TimeSeries;
use crate::detect::{FaultKind, Severity};

/// Which side of the threshold is unhealthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    Above,
    Below,
}

impl Comparison {
    pub fn violates(&self, value: f64, threshold: f64) -> bool {
        match self {
            Comparison::Above => value >= threshold,
            Comparison::Below => value <= threshold,
        }
    }
}

fn default_comparison() -> Comparison {
    Comparison::Above
}

fn default_min_samples() -> usize {
    2
}

fn default_horizon_secs() -> u64 {
    900
}

/// A metric threshold, debounced by a minimum sustained duration, with an
/// optional early-warning trend threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdRule {
    pub name: String,
    pub metric: String,
    #[serde(default = "default_comparison")]
    pub comparison: Comparison,
    pub threshold: f64,
    /// The threshold must be violated continuously for at least this long.
    #[serde(default)]
    pub sustain_secs: u64,
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
    pub severity: Severity,
    /// Level at which a projected trend counts as a risk. `None` disables
    /// prediction for this rule.
    #[serde(default)]
    pub risk_threshold: Option<f64>,
    #[serde(default = "default_horizon_secs")]
    pub horizon_secs: u64,
}

/// Lines containing `pattern`, at least `min_count` of them within
/// `window_secs` of the newest log line, constitute an active fault.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogPatternRule {
    pub name: String,
    pub pattern: String,
    #[serde(default = "one")]
    pub min_count: usize,
    #[serde(default = "default_log_window")]
    pub window_secs: u64,
    pub severity: Severity,
}

fn one() -> usize {
    1
}

fn default_log_window() -> u64 {
    300
}

/// What a rule concluded about a window.
#[derive(Debug, Clone, PartialEq)]
pub struct Finding {
    pub kind: FaultKind,
    pub severity: Severity,
    pub value: f64,
    pub detail: String,
    pub observed_at: DateTime<Utc>,
}

impl ThresholdRule {
    /// Active fault: the trailing run of violating samples spans at least
    /// `sustain_secs` and holds at least `min_samples` samples.
    ///
    /// `samples` must be sorted by time.
    pub fn evaluate_fault(&self, samples: &[(DateTime<Utc>, f64)]) -> Option<Finding> {
        let (last_ts, last_value) = *samples.last()?;
        let run: Vec<_> = samples
            .iter()
            .rev()
            .take_while(|(_, v)| self.comparison.violates(*v, self.threshold))
            .collect();
        if run.len() < self.min_samples.max(1) {
            return None;
        }
        let run_start = run.last().map(|(t, _)| *t)?;
        let sustained = (last_ts - run_start).num_seconds();
        if sustained < self.sustain_secs as i64 {
            return None;
        }
        Some(Finding {
            kind: FaultKind::ActiveFault,
            severity: self.severity,
            value: last_value,
            detail: format!(
                "{} = {:.2} beyond {:.2} for {}s ({} samples)",
                self.metric,
                last_value,
                self.threshold,
                sustained,
                run.len()
            ),
            observed_at: last_ts,
        })
    }

    /// Predicted risk: a monotonic trend that is not yet violating the
    /// fault threshold but projects across `risk_threshold` within the
    /// horizon. Severity is `low` when the crossing lies beyond half the
    /// horizon and `medium` otherwise; it is never higher on its own.
    pub fn evaluate_risk(&self, samples: &[(DateTime<Utc>, f64)]) -> Option<Finding> {
        let risk_threshold = self.risk_threshold?;
        let (last_ts, last_value) = *samples.last()?;
        if samples.len() < self.min_samples.max(3) {
            return None;
        }
        if self.comparison.violates(last_value, self.threshold) {
            return None;
        }
        let series = TimeSeries::from_samples(samples);
        let worsening = self.comparison == Comparison::Above;
        if !series.is_monotonic(worsening) {
            return None;
        }
        let eta = if self.comparison.violates(last_value, risk_threshold) {
            0.0
        } else {
            series.seconds_until(risk_threshold).ok().flatten()?
        };
        if eta > self.horizon_secs as f64 {
            return None;
        }
        let severity = if eta > self.horizon_secs as f64 / 2.0 {
            Severity::Low
        } else {
            Severity::Medium
        };
        Some(Finding {
            kind: FaultKind::PredictedRisk,
            severity,
            value: last_value,
            detail: format!(
                "{} = {:.2} trending toward {:.2}, projected crossing in {:.0}s",
                self.metric, last_value, risk_threshold, eta
            ),
            observed_at: last_ts,
        })
    }
}

impl LogPatternRule {
    /// `lines` must be sorted by time.
    pub fn evaluate(&self, lines: &[(DateTime<Utc>, &str)]) -> Option<Finding> {
        let (newest, _) = *lines.last()?;
        let cutoff = newest - chrono::Duration::seconds(self.window_secs as i64);
        let matching: Vec<DateTime<Utc>> = lines
            .iter()
            .filter(|(t, line)| *t >= cutoff && self.matches(line))
            .map(|(t, _)| *t)
            .collect();
        let matches = matching.len();
        if matches < self.min_count.max(1) {
            return None;
        }
        let last_match = matching.last().copied().unwrap_or(newest);
        Some(Finding {
            kind: FaultKind::ActiveFault,
            severity: self.severity,
            value: matches as f64,
            detail: format!(
                "{} log lines matching '{}' within {}s",
                matches, self.pattern, self.window_secs
            ),
            observed_at: last_match,
        })
    }

    pub fn matches(&self, line: &str) -> bool {
        line.contains(&self.pattern)
    }
}

fn threshold(
    name: &str,
    metric: &str,
    threshold: f64,
    severity: Severity,
    predict: bool,
) -> ThresholdRule {
    ThresholdRule {
        name: name.to_string(),
        metric: metric.to_string(),
        comparison: Comparison::Above,
        threshold,
        sustain_secs: 30,
        min_samples: default_min_samples(),
        severity,
        risk_threshold: predict.then_some(threshold),
        horizon_secs: default_horizon_secs(),
    }
}

/// Rules for the metrics the fleet agents publish.
pub fn default_threshold_rules() -> Vec<ThresholdRule> {
    vec![
        threshold("cpu-saturation", "cpu", 85.0, Severity::High, true),
        threshold("memory-pressure", "memory", 85.0, Severity::High, true),
        threshold("disk-full", "disk", 90.0, Severity::Critical, true),
        threshold("error-burst", "error_count", 30.0, Severity::Medium, false),
        threshold("latency-spike", "p99_latency_ms", 4000.0, Severity::High, false),
    ]
}

pub fn default_log_rules() -> Vec<LogPatternRule> {
    vec![
        LogPatternRule {
            name: "service-crash".into(),
            pattern: "CRASH".into(),
            min_count: 1,
            window_secs: default_log_window(),
            severity: Severity::Critical,
        },
        LogPatternRule {
            name: "error-flood".into(),
            pattern: "ERROR".into(),
            min_count: 5,
            window_secs: 60,
            severity: Severity::High,
        },
    ]
}
