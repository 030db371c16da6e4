//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

pub const SCHEMA_VERSION: i64 = 1;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS incidents (
            incident_id TEXT PRIMARY KEY,
            entity_id TEXT NOT NULL,
            signature TEXT NOT NULL,
            rule_name TEXT NOT NULL,
            metric_name TEXT NOT NULL,
            kind TEXT NOT NULL,
            severity TEXT NOT NULL,
            opened_at TEXT NOT NULL,
            state TEXT NOT NULL,
            terminal INTEGER NOT NULL DEFAULT 0,
            attempt_count INTEGER NOT NULL DEFAULT 0,
            last_plan_id TEXT,
            version INTEGER NOT NULL DEFAULT 0,
            closed_at TEXT
        );

        -- At most one non-terminal incident per (entity, signature).
        CREATE UNIQUE INDEX IF NOT EXISTS idx_incidents_open_key
            ON incidents(entity_id, signature) WHERE terminal = 0;
        CREATE INDEX IF NOT EXISTS idx_incidents_opened ON incidents(opened_at);

        CREATE TABLE IF NOT EXISTS incident_history (
            incident_id TEXT NOT NULL,
            seq INTEGER NOT NULL,
            from_state TEXT,
            to_state TEXT NOT NULL,
            event TEXT NOT NULL,
            reason TEXT,
            at TEXT NOT NULL,
            PRIMARY KEY (incident_id, seq),
            FOREIGN KEY (incident_id) REFERENCES incidents(incident_id)
        );

        CREATE TABLE IF NOT EXISTS plans (
            plan_id TEXT PRIMARY KEY,
            incident_id TEXT NOT NULL,
            issued_at TEXT NOT NULL,
            oracle_confidence REAL NOT NULL,
            steps_json TEXT NOT NULL,
            FOREIGN KEY (incident_id) REFERENCES incidents(incident_id)
        );

        CREATE TABLE IF NOT EXISTS decisions (
            record_id TEXT PRIMARY KEY,
            incident_id TEXT NOT NULL,
            request_context_digest TEXT NOT NULL,
            raw_response TEXT NOT NULL,
            parsed_plan_id TEXT,
            latency_ms INTEGER NOT NULL,
            outcome TEXT NOT NULL,
            detail TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY (incident_id) REFERENCES incidents(incident_id)
        );
        CREATE INDEX IF NOT EXISTS idx_decisions_incident ON decisions(incident_id);

        CREATE TABLE IF NOT EXISTS attempts (
            attempt_id TEXT PRIMARY KEY,
            plan_id TEXT NOT NULL,
            incident_id TEXT NOT NULL,
            started_at TEXT NOT NULL,
            finished_at TEXT,
            halted_by TEXT,
            FOREIGN KEY (plan_id) REFERENCES plans(plan_id)
        );
        CREATE INDEX IF NOT EXISTS idx_attempts_plan ON attempts(plan_id);
        CREATE INDEX IF NOT EXISTS idx_attempts_incident ON attempts(incident_id);

        CREATE TABLE IF NOT EXISTS attempt_steps (
            attempt_id TEXT NOT NULL,
            position INTEGER NOT NULL,
            step_id INTEGER NOT NULL,
            status TEXT NOT NULL,
            output TEXT NOT NULL,
            duration_ms INTEGER NOT NULL,
            tries INTEGER NOT NULL DEFAULT 1,
            PRIMARY KEY (attempt_id, position),
            FOREIGN KEY (attempt_id) REFERENCES attempts(attempt_id)
        );

        CREATE TABLE IF NOT EXISTS audit_log (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            record_id TEXT NOT NULL UNIQUE,
            incident_id TEXT,
            kind TEXT NOT NULL,
            payload_json TEXT NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_audit_incident ON audit_log(incident_id);",
    )?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        [SCHEMA_VERSION],
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_creates_tables() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();

        for table in ["incidents", "incident_history", "plans", "decisions", "attempts", "audit_log"] {
            let count: i64 = conn
                .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
                .unwrap();
            assert_eq!(count, 0, "{table} should start empty");
        }
    }

    #[test]
    fn test_open_key_is_unique_only_while_open() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();

        let insert = "INSERT INTO incidents
            (incident_id, entity_id, signature, rule_name, metric_name, kind, severity, opened_at, state, terminal)
            VALUES (?1, 'db', 'db/active-fault/cpu', 'cpu-saturation', 'cpu', 'active-fault', 'high', '2024-01-01T00:00:00Z', ?2, ?3)";
        conn.execute(insert, rusqlite::params!["a", "resolved", 1]).unwrap();
        conn.execute(insert, rusqlite::params!["b", "detected", 0]).unwrap();
        assert!(conn.execute(insert, rusqlite::params!["c", "detected", 0]).is_err());
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap(); // Should not error
    }
}
