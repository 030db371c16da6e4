//! Observation intake -- normalizes metric samples and log lines from the
//! monitored fleet into uniform [`Observation`] records.
//!
//! Intake is stateless: it validates and reshapes, it never buffers.
//! [`feed`] holds the concrete sources the daemon polls.

pub mod feed;

pub use feed::{JsonlFeed, SnapshotFeed};

use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Metric name used for log-line observations.
pub const LOG_METRIC: &str = "log";

#[derive(Debug, Error, PartialEq)]
pub enum IntakeError {
    #[error("observation has an empty entity id")]
    EmptyEntity,
    #[error("metric {metric} on {entity} has a non-finite value")]
    NonFinite { entity: String, metric: String },
    #[error("empty log line from {entity}")]
    EmptyLogLine { entity: String },
    #[error("observation from {entity} is {ahead_secs}s in the future")]
    FromTheFuture { entity: String, ahead_secs: i64 },
    #[error("malformed metrics snapshot: {0}")]
    MalformedSnapshot(String),
}

/// The payload of an observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ObservationValue {
    Metric(f64),
    Log(String),
}

/// A normalized, immutable observation of one monitored entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub entity_id: String,
    pub metric_name: String,
    pub value: ObservationValue,
    pub timestamp: DateTime<Utc>,
    pub source_tag: String,
}

impl Observation {
    pub fn metric(
        entity_id: impl Into<String>,
        metric_name: impl Into<String>,
        value: f64,
        timestamp: DateTime<Utc>,
        source_tag: impl Into<String>,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            metric_name: metric_name.into(),
            value: ObservationValue::Metric(value),
            timestamp,
            source_tag: source_tag.into(),
        }
    }

    pub fn log(
        entity_id: impl Into<String>,
        line: impl Into<String>,
        timestamp: DateTime<Utc>,
        source_tag: impl Into<String>,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            metric_name: LOG_METRIC.to_string(),
            value: ObservationValue::Log(line.into()),
            timestamp,
            source_tag: source_tag.into(),
        }
    }

    pub fn as_metric(&self) -> Option<f64> {
        match self.value {
            ObservationValue::Metric(v) => Some(v),
            ObservationValue::Log(_) => None,
        }
    }

    pub fn as_log(&self) -> Option<&str> {
        match &self.value {
            ObservationValue::Log(line) => Some(line),
            ObservationValue::Metric(_) => None,
        }
    }
}

/// An event as delivered by an observation source, before validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RawEvent {
    Metric {
        entity: String,
        name: String,
        value: f64,
        timestamp: DateTime<Utc>,
        source: String,
    },
    Log {
        entity: String,
        line: String,
        timestamp: DateTime<Utc>,
        source: String,
    },
}

/// Pull interface to the metric/log source. Delivery is at-least-once and
/// may be out of order; windowing downstream absorbs both.
#[async_trait::async_trait]
pub trait ObservationSource: Send + Sync {
    /// Return every event that arrived since the previous poll.
    async fn poll(&self) -> Result<Vec<RawEvent>>;
}

/// Validate one raw event and turn it into an [`Observation`].
pub fn normalize(
    raw: RawEvent,
    now: DateTime<Utc>,
    max_future_skew: chrono::Duration,
) -> Result<Observation, IntakeError> {
    let obs = match raw {
        RawEvent::Metric {
            entity,
            name,
            value,
            timestamp,
            source,
        } => {
            if !value.is_finite() {
                return Err(IntakeError::NonFinite {
                    entity,
                    metric: name,
                });
            }
            Observation::metric(entity.trim(), name.trim(), value, timestamp, source)
        }
        RawEvent::Log {
            entity,
            line,
            timestamp,
            source,
        } => {
            let trimmed = line.trim_end();
            if trimmed.is_empty() {
                return Err(IntakeError::EmptyLogLine { entity });
            }
            Observation::log(entity.trim(), trimmed, timestamp, source)
        }
    };

    if obs.entity_id.is_empty() {
        return Err(IntakeError::EmptyEntity);
    }
    let ahead = obs.timestamp - now;
    if ahead > max_future_skew {
        return Err(IntakeError::FromTheFuture {
            entity: obs.entity_id,
            ahead_secs: ahead.num_seconds(),
        });
    }
    Ok(obs)
}

/// Expand a metrics-generator snapshot into raw metric events.
///
/// Expected shape:
/// `{"timestamp": <unix secs>, "services": {"<svc>": {"cpu": 42.0, ...}}}`.
/// Non-numeric fields are skipped.
pub fn normalize_snapshot(
    snapshot: &serde_json::Value,
    source: &str,
) -> Result<Vec<RawEvent>, IntakeError> {
    let ts_secs = snapshot
        .get("timestamp")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| IntakeError::MalformedSnapshot("missing integer 'timestamp'".into()))?;
    let timestamp = Utc
        .timestamp_opt(ts_secs, 0)
        .single()
        .ok_or_else(|| IntakeError::MalformedSnapshot(format!("timestamp {ts_secs} out of range")))?;
    let services = snapshot
        .get("services")
        .and_then(|v| v.as_object())
        .ok_or_else(|| IntakeError::MalformedSnapshot("missing 'services' object".into()))?;

    let mut events = Vec::new();
    for (service, metrics) in services {
        let Some(metrics) = metrics.as_object() else {
            continue;
        };
        for (name, value) in metrics {
            if let Some(v) = value.as_f64() {
                events.push(RawEvent::Metric {
                    entity: service.clone(),
                    name: name.clone(),
                    value: v,
                    timestamp,
                    source: source.to_string(),
                });
            }
        }
    }
    Ok(events)
}
