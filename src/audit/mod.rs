//! Audit trail: every transition, oracle call, sandbox call and step
//! outcome becomes one [`AuditRecord`].
//!
//! Records are appended to the store in the same transaction as the state
//! change they describe (see [`AuditLogger::commit`]). Each record carries a
//! unique `record_id` and is written with `INSERT OR IGNORE`, so retrying a
//! write after a transient store failure cannot duplicate it. Committed
//! records are then fanned out to an optional JSON-lines mirror and to a
//! broadcast feed for the dashboard. Slow feed subscribers lag and lose
//! records; publishing never waits on them.

pub mod mirror;

pub use mirror::JsonlMirror;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::retry::RetryPolicy;
use crate::storage::{Store, StoreError};

/// Capacity of the dashboard feed before lagging subscribers start losing
/// records.
pub const FEED_CAPACITY: usize = 1024;

// ---------------------------------------------------------------------------
// AuditKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    IncidentOpened,
    Transition,
    /// An event arrived that the incident's current state does not accept.
    TransitionRejected,
    /// One oracle call, whatever its outcome.
    Decision,
    /// An oracle call skipped by the per-entity rate limit.
    DecisionDeferred,
    SandboxCall,
    StepOutcome,
    AttemptStarted,
    AttemptFinished,
    Verification,
    Error,
}

impl AuditKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditKind::IncidentOpened => "incident_opened",
            AuditKind::Transition => "transition",
            AuditKind::TransitionRejected => "transition_rejected",
            AuditKind::Decision => "decision",
            AuditKind::DecisionDeferred => "decision_deferred",
            AuditKind::SandboxCall => "sandbox_call",
            AuditKind::StepOutcome => "step_outcome",
            AuditKind::AttemptStarted => "attempt_started",
            AuditKind::AttemptFinished => "attempt_finished",
            AuditKind::Verification => "verification",
            AuditKind::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "incident_opened" => AuditKind::IncidentOpened,
            "transition" => AuditKind::Transition,
            "transition_rejected" => AuditKind::TransitionRejected,
            "decision" => AuditKind::Decision,
            "decision_deferred" => AuditKind::DecisionDeferred,
            "sandbox_call" => AuditKind::SandboxCall,
            "step_outcome" => AuditKind::StepOutcome,
            "attempt_started" => AuditKind::AttemptStarted,
            "attempt_finished" => AuditKind::AttemptFinished,
            "verification" => AuditKind::Verification,
            "error" => AuditKind::Error,
            _ => return None,
        })
    }
}

impl std::fmt::Display for AuditKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// AuditRecord
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Idempotency key.
    pub record_id: Uuid,
    /// Store-assigned position in the trail; `None` until committed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incident_id: Option<Uuid>,
    pub kind: AuditKind,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(kind: AuditKind) -> Self {
        Self {
            record_id: Uuid::new_v4(),
            seq: None,
            incident_id: None,
            kind,
            payload: serde_json::Value::Object(Default::default()),
            created_at: Utc::now(),
        }
    }

    pub fn with_incident(mut self, incident_id: Uuid) -> Self {
        self.incident_id = Some(incident_id);
        self
    }

    /// Replace the whole payload.
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Set one payload field. No-op if the payload is not an object.
    pub fn with_field(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        if let serde_json::Value::Object(map) = &mut self.payload {
            map.insert(key.to_string(), value.into());
        }
        self
    }
}

// ---------------------------------------------------------------------------
// AuditLogger
// ---------------------------------------------------------------------------

pub struct AuditLogger {
    store: Store,
    feed: broadcast::Sender<AuditRecord>,
    mirror: Option<JsonlMirror>,
    retry: RetryPolicy,
    shutdown: CancellationToken,
}

impl AuditLogger {
    /// `retry` governs how long a write keeps retrying while the store is
    /// unavailable.
    pub fn new(store: Store, retry: RetryPolicy) -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            store,
            feed,
            mirror: None,
            retry,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_mirror(mut self, mirror: JsonlMirror) -> Self {
        self.mirror = Some(mirror);
        self
    }

    /// Stop waiting out store backoff once `token` fires.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AuditRecord> {
        self.feed.subscribe()
    }

    /// Append a standalone record.
    pub async fn record(&self, record: AuditRecord) -> Result<(), StoreError> {
        self.commit(record, |store, rec| Ok(((), store.append_audit(rec)?)))
            .await
    }

    /// Run `write`, which must persist its domain change and `record` in one
    /// transaction, retrying while the store reports itself unavailable.
    ///
    /// `write` returns the audit sequence number it assigned, or `None`
    /// when nothing was appended (a compare-and-swap that lost, or a record
    /// already present from an earlier try). Only appended records are
    /// published.
    pub async fn commit<T, F>(&self, mut record: AuditRecord, write: F) -> Result<T, StoreError>
    where
        F: Fn(&Store, &AuditRecord) -> Result<(T, Option<i64>), StoreError>,
    {
        let result = self
            .retry
            .run(&self.shutdown, |attempt| {
                let out = write(&self.store, &record);
                if let Err(e) = &out {
                    warn!(attempt, kind = %record.kind, error = %e, "audit write failed");
                }
                async move { out }
            })
            .await;

        match result {
            Ok((value, seq)) => {
                if let Some(seq) = seq {
                    record.seq = Some(seq);
                    self.publish(record).await;
                }
                Ok(value)
            }
            Err(e) => {
                error!(kind = %record.kind, record_id = %record.record_id, error = %e, "audit write abandoned");
                Err(e)
            }
        }
    }

    async fn publish(&self, record: AuditRecord) {
        debug!(seq = ?record.seq, kind = %record.kind, incident_id = ?record.incident_id, "audit record committed");
        if let Some(mirror) = &self.mirror {
            if let Err(e) = mirror.append(&record).await {
                warn!(path = %mirror.path().display(), error = %e, "audit mirror write failed");
            }
        }
        // No subscribers is not an error.
        let _ = self.feed.send(record);
    }
}
