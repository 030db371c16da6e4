//! SQLite storage layer -- schema, queries, migrations.
//!
//! Every write that changes incident, plan, decision or attempt state also
//! appends its audit record inside the same transaction. Writers use
//! `BEGIN IMMEDIATE` so compare-and-create and compare-and-swap see a
//! stable snapshot; readers go through WAL and never block writers.

pub mod schema;

use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior};
use thiserror::Error;
use uuid::Uuid;

use crate::audit::{AuditKind, AuditRecord};
use crate::broker::{DecisionOutcome, DecisionRecord, Plan, Step};
use crate::detect::{FaultKind, Severity};
use crate::executor::{FailureClass, RemediationAttempt, StepOutcome, StepStatus};
use crate::incident::{Incident, IncidentState, TransitionRecord};
use crate::retry::Transience;

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &str) -> Result<Pool> {
    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA mmap_size = 30000000000;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager)?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// A private in-memory database. Limited to one connection, since each
/// in-memory connection would otherwise see its own empty database.
pub fn open_memory_pool() -> Result<Pool> {
    let manager = SqliteConnectionManager::memory()
        .with_init(|c| c.execute_batch("PRAGMA foreign_keys = ON;"));
    let pool = R2D2Pool::builder().max_size(1).build(manager)?;

    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StoreError {
    /// The database could not be reached or was busy. Retryable.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("sqlite error: {0}")]
    Sqlite(rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("{0} not found")]
    NotFound(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(err, _)
                if matches!(
                    err.code,
                    ErrorCode::DatabaseBusy
                        | ErrorCode::DatabaseLocked
                        | ErrorCode::SystemIoFailure
                        | ErrorCode::CannotOpen
                        | ErrorCode::DiskFull
                ) =>
            {
                StoreError::Unavailable(e.to_string())
            }
            _ => StoreError::Sqlite(e),
        }
    }
}

impl From<r2d2::Error> for StoreError {
    fn from(e: r2d2::Error) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

impl Transience for StoreError {
    fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

// ---------------------------------------------------------------------------
// Column helpers
// ---------------------------------------------------------------------------

fn ts(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn conversion_err(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, msg.into())
}

fn get_ts(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_err(idx, format!("bad timestamp '{raw}': {e}")))
}

fn get_opt_ts(row: &Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<String>>(idx)? {
        None => Ok(None),
        Some(_) => get_ts(row, idx).map(Some),
    }
}

fn get_uuid(row: &Row, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw).map_err(|e| conversion_err(idx, format!("bad uuid '{raw}': {e}")))
}

fn get_opt_uuid(row: &Row, idx: usize) -> rusqlite::Result<Option<Uuid>> {
    match row.get::<_, Option<String>>(idx)? {
        None => Ok(None),
        Some(_) => get_uuid(row, idx).map(Some),
    }
}

fn get_enum<T>(row: &Row, idx: usize, parse: fn(&str) -> Option<T>) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    parse(&raw).ok_or_else(|| conversion_err(idx, format!("unknown value '{raw}'")))
}

fn get_opt_enum<T>(row: &Row, idx: usize, parse: fn(&str) -> Option<T>) -> rusqlite::Result<Option<T>> {
    match row.get::<_, Option<String>>(idx)? {
        None => Ok(None),
        Some(_) => get_enum(row, idx, parse).map(Some),
    }
}

const INCIDENT_COLUMNS: &str = "incident_id, entity_id, signature, rule_name, metric_name, kind, \
     severity, opened_at, state, attempt_count, last_plan_id, version, closed_at";

fn incident_from_row(row: &Row) -> rusqlite::Result<Incident> {
    Ok(Incident {
        incident_id: get_uuid(row, 0)?,
        entity_id: row.get(1)?,
        signature: row.get(2)?,
        rule_name: row.get(3)?,
        metric_name: row.get(4)?,
        kind: get_enum(row, 5, FaultKind::parse)?,
        severity: get_enum(row, 6, Severity::parse)?,
        opened_at: get_ts(row, 7)?,
        state: get_enum(row, 8, IncidentState::parse)?,
        attempt_count: row.get(9)?,
        last_plan_id: get_opt_uuid(row, 10)?,
        version: row.get(11)?,
        closed_at: get_opt_ts(row, 12)?,
        history: Vec::new(),
    })
}

fn load_incident(conn: &Connection, incident_id: &Uuid) -> Result<Option<Incident>, StoreError> {
    let sql = format!("SELECT {INCIDENT_COLUMNS} FROM incidents WHERE incident_id = ?1");
    let incident = conn
        .query_row(&sql, params![incident_id.to_string()], incident_from_row)
        .optional()?;
    match incident {
        Some(mut incident) => {
            incident.history = load_history(conn, incident_id)?;
            Ok(Some(incident))
        }
        None => Ok(None),
    }
}

fn load_history(conn: &Connection, incident_id: &Uuid) -> Result<Vec<TransitionRecord>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT seq, from_state, to_state, event, reason, at
         FROM incident_history WHERE incident_id = ?1 ORDER BY seq",
    )?;
    let rows = stmt
        .query_map(params![incident_id.to_string()], |row| {
            Ok(TransitionRecord {
                seq: row.get(0)?,
                from: get_opt_enum(row, 1, IncidentState::parse)?,
                to: get_enum(row, 2, IncidentState::parse)?,
                event: row.get(3)?,
                reason: row.get(4)?,
                at: get_ts(row, 5)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn insert_history(conn: &Connection, incident_id: &Uuid, record: &TransitionRecord) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO incident_history (incident_id, seq, from_state, to_state, event, reason, at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            incident_id.to_string(),
            record.seq,
            record.from.map(|s| s.as_str()),
            record.to.as_str(),
            record.event,
            record.reason,
            ts(&record.at),
        ],
    )?;
    Ok(())
}

/// Append an audit row. `None` when a row with the same `record_id`
/// already exists.
fn insert_audit(conn: &Connection, rec: &AuditRecord) -> Result<Option<i64>, StoreError> {
    let changed = conn.execute(
        "INSERT OR IGNORE INTO audit_log (record_id, incident_id, kind, payload_json, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            rec.record_id.to_string(),
            rec.incident_id.map(|id| id.to_string()),
            rec.kind.as_str(),
            serde_json::to_string(&rec.payload)?,
            ts(&rec.created_at),
        ],
    )?;
    Ok((changed > 0).then(|| conn.last_insert_rowid()))
}

fn audit_from_row(row: &Row) -> rusqlite::Result<(AuditRecord, String)> {
    let payload_json: String = row.get(4)?;
    Ok((
        AuditRecord {
            seq: Some(row.get(0)?),
            record_id: get_uuid(row, 1)?,
            incident_id: get_opt_uuid(row, 2)?,
            kind: get_enum(row, 3, AuditKind::parse)?,
            payload: serde_json::Value::Null,
            created_at: get_ts(row, 5)?,
        },
        payload_json,
    ))
}

fn decision_from_row(row: &Row) -> rusqlite::Result<DecisionRecord> {
    Ok(DecisionRecord {
        record_id: get_uuid(row, 0)?,
        incident_id: get_uuid(row, 1)?,
        request_context_digest: row.get(2)?,
        raw_response: row.get(3)?,
        parsed_plan_id: get_opt_uuid(row, 4)?,
        latency_ms: row.get(5)?,
        outcome: get_enum(row, 6, DecisionOutcome::parse)?,
        detail: row.get(7)?,
        created_at: get_ts(row, 8)?,
    })
}

fn attempt_from_row(row: &Row) -> rusqlite::Result<RemediationAttempt> {
    Ok(RemediationAttempt {
        attempt_id: get_uuid(row, 0)?,
        plan_id: get_uuid(row, 1)?,
        incident_id: get_uuid(row, 2)?,
        outcomes: Vec::new(),
        started_at: get_ts(row, 3)?,
        finished_at: get_opt_ts(row, 4)?,
        halted_by: get_opt_enum(row, 5, FailureClass::parse)?,
    })
}

fn load_step_outcomes(conn: &Connection, attempt_id: &Uuid) -> Result<Vec<StepOutcome>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT step_id, status, output, duration_ms, tries
         FROM attempt_steps WHERE attempt_id = ?1 ORDER BY position",
    )?;
    let rows = stmt
        .query_map(params![attempt_id.to_string()], |row| {
            Ok(StepOutcome {
                step_id: row.get(0)?,
                status: get_enum(row, 1, StepStatus::parse)?,
                output: row.get(2)?,
                duration_ms: row.get(3)?,
                tries: row.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Typed access to the database. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    pool: Pool,
}

impl Store {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn open(path: &str) -> Result<Self> {
        Ok(Self::new(open_pool(path)?))
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    // -- incidents ----------------------------------------------------------

    /// Insert `candidate` unless an open incident with the same
    /// (entity_id, signature) exists, in which case that one is returned
    /// and nothing is written. The boolean is `true` when `candidate` was
    /// inserted.
    pub fn create_incident_if_absent(
        &self,
        candidate: &Incident,
        audit: &AuditRecord,
    ) -> Result<((Incident, bool), Option<i64>), StoreError> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing: Option<String> = tx
            .query_row(
                "SELECT incident_id FROM incidents
                 WHERE entity_id = ?1 AND signature = ?2 AND terminal = 0",
                params![candidate.entity_id, candidate.signature],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(raw) = existing {
            let id = Uuid::parse_str(&raw).map_err(|e| StoreError::NotFound(format!("incident {raw}: {e}")))?;
            let incident = load_incident(&tx, &id)?
                .ok_or_else(|| StoreError::NotFound(format!("incident {id}")))?;
            return Ok(((incident, false), None));
        }

        tx.execute(
            "INSERT INTO incidents
                (incident_id, entity_id, signature, rule_name, metric_name, kind, severity,
                 opened_at, state, terminal, attempt_count, last_plan_id, version, closed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                candidate.incident_id.to_string(),
                candidate.entity_id,
                candidate.signature,
                candidate.rule_name,
                candidate.metric_name,
                candidate.kind.as_str(),
                candidate.severity.as_str(),
                ts(&candidate.opened_at),
                candidate.state.as_str(),
                candidate.state.is_terminal(),
                candidate.attempt_count,
                candidate.last_plan_id.map(|id| id.to_string()),
                candidate.version,
                candidate.closed_at.as_ref().map(ts),
            ],
        )?;
        for record in &candidate.history {
            insert_history(&tx, &candidate.incident_id, record)?;
        }
        let seq = insert_audit(&tx, audit)?;
        tx.commit()?;
        Ok(((candidate.clone(), true), seq))
    }

    pub fn get_incident(&self, incident_id: &Uuid) -> Result<Option<Incident>, StoreError> {
        let conn = self.pool.get()?;
        load_incident(&conn, incident_id)
    }

    /// Replace the incident row if it is still at `expected_version`,
    /// appending `record` to its history and `audit` to the trail.
    /// Returns `false` (and writes nothing) if another writer got there
    /// first.
    pub fn swap_incident(
        &self,
        expected_version: i64,
        next: &Incident,
        record: &TransitionRecord,
        audit: &AuditRecord,
    ) -> Result<(bool, Option<i64>), StoreError> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let changed = tx.execute(
            "UPDATE incidents
             SET state = ?1, terminal = ?2, attempt_count = ?3, last_plan_id = ?4,
                 severity = ?5, version = ?6, closed_at = ?7
             WHERE incident_id = ?8 AND version = ?9",
            params![
                next.state.as_str(),
                next.state.is_terminal(),
                next.attempt_count,
                next.last_plan_id.map(|id| id.to_string()),
                next.severity.as_str(),
                next.version,
                next.closed_at.as_ref().map(ts),
                next.incident_id.to_string(),
                expected_version,
            ],
        )?;
        if changed == 0 {
            return Ok((false, None));
        }
        insert_history(&tx, &next.incident_id, record)?;
        let seq = insert_audit(&tx, audit)?;
        tx.commit()?;
        Ok((true, seq))
    }

    /// Most recently opened first.
    pub fn list_incidents(&self, open_only: bool, limit: usize) -> Result<Vec<Incident>, StoreError> {
        let conn = self.pool.get()?;
        let filter = if open_only { "WHERE terminal = 0" } else { "" };
        let sql = format!(
            "SELECT {INCIDENT_COLUMNS} FROM incidents {filter} ORDER BY opened_at DESC LIMIT ?1"
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut incidents = stmt
            .query_map(params![limit as i64], incident_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        for incident in incidents.iter_mut() {
            incident.history = load_history(&conn, &incident.incident_id)?;
        }
        Ok(incidents)
    }

    // -- decisions and plans --------------------------------------------------

    /// Persist one oracle interaction, plus the plan it produced if any.
    pub fn insert_decision(
        &self,
        record: &DecisionRecord,
        plan: Option<&Plan>,
        audit: &AuditRecord,
    ) -> Result<((), Option<i64>), StoreError> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if let Some(plan) = plan {
            tx.execute(
                "INSERT INTO plans (plan_id, incident_id, issued_at, oracle_confidence, steps_json)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    plan.plan_id.to_string(),
                    plan.incident_id.to_string(),
                    ts(&plan.issued_at),
                    plan.oracle_confidence,
                    serde_json::to_string(&plan.steps)?,
                ],
            )?;
        }
        tx.execute(
            "INSERT INTO decisions
                (record_id, incident_id, request_context_digest, raw_response, parsed_plan_id,
                 latency_ms, outcome, detail, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.record_id.to_string(),
                record.incident_id.to_string(),
                record.request_context_digest,
                record.raw_response,
                record.parsed_plan_id.map(|id| id.to_string()),
                record.latency_ms,
                record.outcome.as_str(),
                record.detail,
                ts(&record.created_at),
            ],
        )?;
        let seq = insert_audit(&tx, audit)?;
        tx.commit()?;
        Ok(((), seq))
    }

    pub fn decisions_for_incident(&self, incident_id: &Uuid) -> Result<Vec<DecisionRecord>, StoreError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT record_id, incident_id, request_context_digest, raw_response, parsed_plan_id,
                    latency_ms, outcome, detail, created_at
             FROM decisions WHERE incident_id = ?1 ORDER BY created_at, rowid",
        )?;
        let rows = stmt
            .query_map(params![incident_id.to_string()], decision_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get_plan(&self, plan_id: &Uuid) -> Result<Option<Plan>, StoreError> {
        let conn = self.pool.get()?;
        let row = conn
            .query_row(
                "SELECT plan_id, incident_id, issued_at, oracle_confidence, steps_json
                 FROM plans WHERE plan_id = ?1",
                params![plan_id.to_string()],
                |row| {
                    Ok((
                        get_uuid(row, 0)?,
                        get_uuid(row, 1)?,
                        get_ts(row, 2)?,
                        row.get::<_, f64>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;
        let Some((plan_id, incident_id, issued_at, oracle_confidence, steps_json)) = row else {
            return Ok(None);
        };
        let steps: Vec<Step> = serde_json::from_str(&steps_json)?;
        Ok(Some(Plan {
            plan_id,
            incident_id,
            steps,
            issued_at,
            oracle_confidence,
        }))
    }

    // -- attempts -------------------------------------------------------------

    pub fn begin_attempt(
        &self,
        attempt: &RemediationAttempt,
        audit: &AuditRecord,
    ) -> Result<((), Option<i64>), StoreError> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT INTO attempts (attempt_id, plan_id, incident_id, started_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                attempt.attempt_id.to_string(),
                attempt.plan_id.to_string(),
                attempt.incident_id.to_string(),
                ts(&attempt.started_at),
            ],
        )?;
        let seq = insert_audit(&tx, audit)?;
        tx.commit()?;
        Ok(((), seq))
    }

    pub fn append_step_outcome(
        &self,
        attempt_id: &Uuid,
        position: usize,
        outcome: &StepOutcome,
        audit: &AuditRecord,
    ) -> Result<((), Option<i64>), StoreError> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT INTO attempt_steps (attempt_id, position, step_id, status, output, duration_ms, tries)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                attempt_id.to_string(),
                position as i64,
                outcome.step_id,
                outcome.status.as_str(),
                outcome.output,
                outcome.duration_ms,
                outcome.tries,
            ],
        )?;
        let seq = insert_audit(&tx, audit)?;
        tx.commit()?;
        Ok(((), seq))
    }

    pub fn finish_attempt(
        &self,
        attempt: &RemediationAttempt,
        audit: &AuditRecord,
    ) -> Result<((), Option<i64>), StoreError> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let changed = tx.execute(
            "UPDATE attempts SET finished_at = ?1, halted_by = ?2 WHERE attempt_id = ?3",
            params![
                attempt.finished_at.as_ref().map(ts),
                attempt.halted_by.map(|h| h.as_str()),
                attempt.attempt_id.to_string(),
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("attempt {}", attempt.attempt_id)));
        }
        let seq = insert_audit(&tx, audit)?;
        tx.commit()?;
        Ok(((), seq))
    }

    pub fn get_attempt(&self, attempt_id: &Uuid) -> Result<Option<RemediationAttempt>, StoreError> {
        let conn = self.pool.get()?;
        let attempt = conn
            .query_row(
                "SELECT attempt_id, plan_id, incident_id, started_at, finished_at, halted_by
                 FROM attempts WHERE attempt_id = ?1",
                params![attempt_id.to_string()],
                attempt_from_row,
            )
            .optional()?;
        match attempt {
            Some(mut attempt) => {
                attempt.outcomes = load_step_outcomes(&conn, &attempt.attempt_id)?;
                Ok(Some(attempt))
            }
            None => Ok(None),
        }
    }

    pub fn attempts_for_plan(&self, plan_id: &Uuid) -> Result<Vec<RemediationAttempt>, StoreError> {
        self.attempts_where("plan_id", plan_id)
    }

    pub fn attempts_for_incident(&self, incident_id: &Uuid) -> Result<Vec<RemediationAttempt>, StoreError> {
        self.attempts_where("incident_id", incident_id)
    }

    fn attempts_where(&self, column: &str, id: &Uuid) -> Result<Vec<RemediationAttempt>, StoreError> {
        let conn = self.pool.get()?;
        let sql = format!(
            "SELECT attempt_id, plan_id, incident_id, started_at, finished_at, halted_by
             FROM attempts WHERE {column} = ?1 ORDER BY started_at, rowid"
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut attempts = stmt
            .query_map(params![id.to_string()], attempt_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        for attempt in attempts.iter_mut() {
            attempt.outcomes = load_step_outcomes(&conn, &attempt.attempt_id)?;
        }
        Ok(attempts)
    }

    // -- audit ----------------------------------------------------------------

    pub fn append_audit(&self, rec: &AuditRecord) -> Result<Option<i64>, StoreError> {
        let conn = self.pool.get()?;
        insert_audit(&conn, rec)
    }

    /// Records with `seq > after`, oldest first.
    pub fn audit_after(&self, after: i64, limit: usize) -> Result<Vec<AuditRecord>, StoreError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT seq, record_id, incident_id, kind, payload_json, created_at
             FROM audit_log WHERE seq > ?1 ORDER BY seq LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![after, limit as i64], audit_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        with_payloads(rows)
    }

    pub fn audit_for_incident(&self, incident_id: &Uuid) -> Result<Vec<AuditRecord>, StoreError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT seq, record_id, incident_id, kind, payload_json, created_at
             FROM audit_log WHERE incident_id = ?1 ORDER BY seq",
        )?;
        let rows = stmt
            .query_map(params![incident_id.to_string()], audit_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        with_payloads(rows)
    }

    /// Highest committed audit sequence number, 0 when empty.
    pub fn last_audit_seq(&self) -> Result<i64, StoreError> {
        let conn = self.pool.get()?;
        let seq: Option<i64> = conn.query_row("SELECT MAX(seq) FROM audit_log", [], |row| row.get(0))?;
        Ok(seq.unwrap_or(0))
    }
}

fn with_payloads(rows: Vec<(AuditRecord, String)>) -> Result<Vec<AuditRecord>, StoreError> {
    rows.into_iter()
        .map(|(mut rec, json)| {
            rec.payload = serde_json::from_str(&json)?;
            Ok(rec)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::ActionKind;
    use std::collections::BTreeMap;

    fn store() -> Store {
        Store::new(open_memory_pool().unwrap())
    }

    fn candidate(entity: &str) -> Incident {
        let now = Utc::now();
        Incident {
            incident_id: Uuid::new_v4(),
            entity_id: entity.into(),
            signature: format!("{entity}/active-fault/cpu"),
            rule_name: "cpu-saturation".into(),
            metric_name: "cpu".into(),
            kind: FaultKind::ActiveFault,
            severity: Severity::High,
            opened_at: now,
            state: IncidentState::Detected,
            attempt_count: 0,
            last_plan_id: None,
            version: 0,
            closed_at: None,
            history: vec![TransitionRecord {
                seq: 0,
                from: None,
                to: IncidentState::Detected,
                event: "opened".into(),
                reason: None,
                at: now,
            }],
        }
    }

    #[test]
    fn test_create_if_absent_returns_existing() {
        let store = store();
        let first = candidate("web-api");
        let ((created, inserted), seq) = store
            .create_incident_if_absent(&first, &AuditRecord::new(AuditKind::IncidentOpened))
            .unwrap();
        assert!(inserted);
        assert!(seq.is_some());
        assert_eq!(created, first);

        let second = candidate("web-api");
        let ((existing, inserted), seq) = store
            .create_incident_if_absent(&second, &AuditRecord::new(AuditKind::IncidentOpened))
            .unwrap();
        assert!(!inserted);
        assert!(seq.is_none());
        assert_eq!(existing.incident_id, first.incident_id);
        assert_eq!(store.audit_after(0, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_swap_requires_expected_version() {
        let store = store();
        let inc = candidate("db");
        store
            .create_incident_if_absent(&inc, &AuditRecord::new(AuditKind::IncidentOpened))
            .unwrap();

        let mut next = inc.clone();
        next.state = IncidentState::Diagnosing;
        next.version = 1;
        let record = TransitionRecord {
            seq: 1,
            from: Some(IncidentState::Detected),
            to: IncidentState::Diagnosing,
            event: "begin_diagnosis".into(),
            reason: None,
            at: Utc::now(),
        };
        let (swapped, _) = store
            .swap_incident(0, &next, &record, &AuditRecord::new(AuditKind::Transition))
            .unwrap();
        assert!(swapped);

        // Stale writer.
        let (swapped, seq) = store
            .swap_incident(0, &next, &record, &AuditRecord::new(AuditKind::Transition))
            .unwrap();
        assert!(!swapped);
        assert!(seq.is_none());

        let loaded = store.get_incident(&inc.incident_id).unwrap().unwrap();
        assert_eq!(loaded.state, IncidentState::Diagnosing);
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.history.len(), 2);
    }

    #[test]
    fn test_plan_decision_and_attempt_round_trip() {
        let store = store();
        let inc = candidate("cache");
        store
            .create_incident_if_absent(&inc, &AuditRecord::new(AuditKind::IncidentOpened))
            .unwrap();

        let plan = Plan {
            plan_id: Uuid::new_v4(),
            incident_id: inc.incident_id,
            steps: vec![Step {
                step_id: 1,
                action_kind: ActionKind::RestartService,
                parameters: BTreeMap::from([("service".to_string(), "cache".to_string())]),
                timeout_ms: 5_000,
            }],
            issued_at: Utc::now(),
            oracle_confidence: 0.8,
        };
        let decision = DecisionRecord {
            record_id: Uuid::new_v4(),
            incident_id: inc.incident_id,
            request_context_digest: "abc".into(),
            raw_response: "{}".into(),
            parsed_plan_id: Some(plan.plan_id),
            latency_ms: 12,
            outcome: DecisionOutcome::Accepted,
            detail: None,
            created_at: Utc::now(),
        };
        store
            .insert_decision(&decision, Some(&plan), &AuditRecord::new(AuditKind::Decision))
            .unwrap();
        assert_eq!(store.get_plan(&plan.plan_id).unwrap().unwrap(), plan);
        assert_eq!(store.decisions_for_incident(&inc.incident_id).unwrap(), vec![decision]);

        let mut attempt = RemediationAttempt::start(&plan);
        store
            .begin_attempt(&attempt, &AuditRecord::new(AuditKind::AttemptStarted))
            .unwrap();
        let outcome = StepOutcome {
            step_id: 1,
            status: StepStatus::Success,
            output: "restarted".into(),
            duration_ms: 40,
            tries: 1,
        };
        store
            .append_step_outcome(&attempt.attempt_id, 0, &outcome, &AuditRecord::new(AuditKind::StepOutcome))
            .unwrap();
        attempt.outcomes.push(outcome);
        attempt.finished_at = Some(Utc::now());
        store
            .finish_attempt(&attempt, &AuditRecord::new(AuditKind::AttemptFinished))
            .unwrap();

        let loaded = store.attempts_for_plan(&plan.plan_id).unwrap();
        assert_eq!(loaded, vec![attempt]);
        assert_eq!(store.last_audit_seq().unwrap(), 5);
    }

    #[test]
    fn test_list_open_excludes_terminal() {
        let store = store();
        let open = candidate("a");
        let mut closed = candidate("b");
        closed.state = IncidentState::Resolved;
        closed.closed_at = Some(Utc::now());
        for inc in [&open, &closed] {
            store
                .create_incident_if_absent(inc, &AuditRecord::new(AuditKind::IncidentOpened))
                .unwrap();
        }
        let listed = store.list_incidents(true, 10).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].incident_id, open.incident_id);
        assert_eq!(store.list_incidents(false, 10).unwrap().len(), 2);
    }

    #[test]
    fn test_busy_maps_to_unavailable() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        let mapped: StoreError = err.into();
        assert!(mapped.is_transient());
    }
}
