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

        CREATE TABLE IF NOT EXISTS agent_state (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            enabled INTEGER NOT NULL DEFAULT 1,
            lock_holder TEXT,
            lock_acquired_at TEXT,
            last_run_at TEXT,
            last_outcome TEXT,
            updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );

        CREATE TABLE IF NOT EXISTS findings (
            id TEXT PRIMARY KEY,
            category TEXT NOT NULL,
            severity TEXT NOT NULL,
            signature TEXT NOT NULL,
            evidence_json TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'open',
            occurrences INTEGER NOT NULL DEFAULT 1,
            first_seen_at TEXT NOT NULL,
            detected_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            last_run_id TEXT
        );

        -- At most one active (open or actioned) finding per signature.
        CREATE UNIQUE INDEX IF NOT EXISTS idx_findings_active_signature
            ON findings(signature) WHERE status IN ('open', 'actioned');
        CREATE INDEX IF NOT EXISTS idx_findings_status ON findings(status, detected_at);

        CREATE TABLE IF NOT EXISTS tasks (
            id TEXT PRIMARY KEY,
            finding_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            attempts INTEGER NOT NULL DEFAULT 0,
            result_json TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            completed_at TEXT,
            last_run_id TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status, created_at);
        CREATE INDEX IF NOT EXISTS idx_tasks_finding ON tasks(finding_id);

        CREATE TABLE IF NOT EXISTS log_entries (
            id INTEGER PRIMARY KEY,
            run_id TEXT NOT NULL,
            level TEXT NOT NULL,
            message TEXT NOT NULL,
            context_json TEXT,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_log_entries_run ON log_entries(run_id);
        CREATE INDEX IF NOT EXISTS idx_log_entries_created ON log_entries(created_at);

        CREATE TABLE IF NOT EXISTS reports (
            id TEXT PRIMARY KEY,
            run_id TEXT NOT NULL UNIQUE,
            window_start TEXT NOT NULL,
            window_end TEXT NOT NULL,
            tasks_completed INTEGER NOT NULL,
            tasks_retrying INTEGER NOT NULL,
            tasks_unresolved INTEGER NOT NULL,
            findings_detected INTEGER NOT NULL,
            findings_created INTEGER NOT NULL,
            findings_resolved INTEGER NOT NULL,
            narrative TEXT NOT NULL,
            generated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_reports_generated ON reports(generated_at);

        CREATE TABLE IF NOT EXISTS signal_errors (
            id INTEGER PRIMARY KEY,
            occurred_at TEXT NOT NULL,
            route TEXT NOT NULL,
            status INTEGER,
            message TEXT NOT NULL DEFAULT ''
        );
        CREATE INDEX IF NOT EXISTS idx_signal_errors_time ON signal_errors(occurred_at);

        CREATE TABLE IF NOT EXISTS signal_latency (
            id INTEGER PRIMARY KEY,
            occurred_at TEXT NOT NULL,
            endpoint TEXT NOT NULL,
            latency_ms REAL NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_signal_latency_time ON signal_latency(occurred_at);

        CREATE TABLE IF NOT EXISTS signal_logs (
            id INTEGER PRIMARY KEY,
            occurred_at TEXT NOT NULL,
            level TEXT NOT NULL,
            message TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_signal_logs_time ON signal_logs(occurred_at);

        -- The agent state row exists from first deployment onwards.
        INSERT OR IGNORE INTO agent_state (id, enabled) VALUES (1, 1);",
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

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM findings", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);

        let enabled: i64 = conn
            .query_row("SELECT enabled FROM agent_state WHERE id = 1", [], |row| row.get(0))
            .unwrap();
        assert_eq!(enabled, 1);
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        conn.execute("UPDATE agent_state SET enabled = 0", []).unwrap();
        migrate(&conn).unwrap();

        let enabled: i64 = conn
            .query_row("SELECT enabled FROM agent_state WHERE id = 1", [], |row| row.get(0))
            .unwrap();
        assert_eq!(enabled, 0, "re-running migrations must not reset operator state");
    }

    #[test]
    fn test_active_signature_is_unique() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        let insert = "INSERT INTO findings (id, category, severity, signature, evidence_json, status,
                          first_seen_at, detected_at, updated_at)
                      VALUES (?1, 'performance', 'warning', 'sig', '{}', ?2, 't', 't', 't')";
        conn.execute(insert, ["a", "resolved"]).unwrap();
        conn.execute(insert, ["b", "open"]).unwrap();
        assert!(conn.execute(insert, ["c", "actioned"]).is_err());
    }
}
