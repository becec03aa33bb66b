//! Append-only run journals: technical log entries and executive reports.

use std::fmt;
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{parse_col, parse_json, parse_ts, ts, Pool, UnknownValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
            LogLevel::Critical => "critical",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = UnknownValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(LogLevel::Info),
            "warning" => Ok(LogLevel::Warning),
            "error" => Ok(LogLevel::Error),
            "critical" => Ok(LogLevel::Critical),
            other => Err(UnknownValue {
                what: "log level",
                value: other.to_string(),
            }),
        }
    }
}

/// One significant event in a run. Never mutated once written.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    pub id: i64,
    pub run_id: String,
    pub level: LogLevel,
    pub message: String,
    pub context: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

/// The executive summary of one completed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub id: Uuid,
    pub run_id: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub tasks_completed: u32,
    pub tasks_retrying: u32,
    pub tasks_unresolved: u32,
    pub findings_detected: u32,
    pub findings_created: u32,
    pub findings_resolved: u32,
    pub narrative: String,
    pub generated_at: DateTime<Utc>,
}

/// Filters for the log view; all optional.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogQuery {
    pub level: Option<LogLevel>,
    pub run_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

pub const DEFAULT_LIMIT: usize = 100;
pub const MAX_LIMIT: usize = 1000;

fn log_from_row(row: &Row<'_>) -> rusqlite::Result<LogEntry> {
    let context: Option<String> = row.get(4)?;
    Ok(LogEntry {
        id: row.get(0)?,
        run_id: row.get(1)?,
        level: parse_col(&row.get::<_, String>(2)?)?,
        message: row.get(3)?,
        context: context.as_deref().map(parse_json).transpose()?,
        timestamp: parse_ts(&row.get::<_, String>(5)?)?,
    })
}

fn report_from_row(row: &Row<'_>) -> rusqlite::Result<Report> {
    Ok(Report {
        id: parse_col(&row.get::<_, String>(0)?)?,
        run_id: row.get(1)?,
        window_start: parse_ts(&row.get::<_, String>(2)?)?,
        window_end: parse_ts(&row.get::<_, String>(3)?)?,
        tasks_completed: row.get(4)?,
        tasks_retrying: row.get(5)?,
        tasks_unresolved: row.get(6)?,
        findings_detected: row.get(7)?,
        findings_created: row.get(8)?,
        findings_resolved: row.get(9)?,
        narrative: row.get(10)?,
        generated_at: parse_ts(&row.get::<_, String>(11)?)?,
    })
}

const REPORT_COLUMNS: &str = "id, run_id, window_start, window_end, tasks_completed, tasks_retrying,
                              tasks_unresolved, findings_detected, findings_created, findings_resolved,
                              narrative, generated_at";

#[derive(Clone)]
pub struct JournalStore {
    pool: Pool,
}

impl JournalStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn append(
        &self,
        run_id: &str,
        level: LogLevel,
        message: &str,
        context: Option<&serde_json::Value>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO log_entries (run_id, level, message, context_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                run_id,
                level.as_str(),
                message,
                context.map(|c| c.to_string()),
                ts(at)
            ],
        )?;
        Ok(())
    }

    /// Oldest first within the filter, capped at `limit`.
    pub fn logs(&self, query: &LogQuery) -> Result<Vec<LogEntry>> {
        let conn = self.pool.get()?;
        let limit = query.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);
        let mut stmt = conn.prepare(
            "SELECT id, run_id, level, message, context_json, created_at FROM log_entries
             WHERE (?1 IS NULL OR level = ?1)
               AND (?2 IS NULL OR run_id = ?2)
               AND (?3 IS NULL OR created_at >= ?3)
               AND (?4 IS NULL OR created_at <= ?4)
             ORDER BY id LIMIT ?5",
        )?;
        let rows = stmt.query_map(
            params![
                query.level.map(|l| l.as_str()),
                query.run_id,
                query.since.map(ts),
                query.until.map(ts),
                limit as i64
            ],
            log_from_row,
        )?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Insert the run's report. A second report for the same run is rejected.
    pub fn insert_report(&self, report: &Report) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            &format!(
                "INSERT INTO reports ({REPORT_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
            ),
            params![
                report.id.to_string(),
                report.run_id,
                ts(report.window_start),
                ts(report.window_end),
                report.tasks_completed,
                report.tasks_retrying,
                report.tasks_unresolved,
                report.findings_detected,
                report.findings_created,
                report.findings_resolved,
                report.narrative,
                ts(report.generated_at)
            ],
        )
        .with_context(|| format!("Failed to insert report for run {}", report.run_id))?;
        Ok(())
    }

    pub fn report_for_run(&self, run_id: &str) -> Result<Option<Report>> {
        let conn = self.pool.get()?;
        let report = conn
            .query_row(
                &format!("SELECT {REPORT_COLUMNS} FROM reports WHERE run_id = ?1"),
                params![run_id],
                report_from_row,
            )
            .optional()?;
        Ok(report)
    }

    /// Chronological (oldest first) within the optional time range.
    pub fn reports(
        &self,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Report>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {REPORT_COLUMNS} FROM reports
             WHERE (?1 IS NULL OR generated_at >= ?1)
               AND (?2 IS NULL OR generated_at <= ?2)
             ORDER BY generated_at LIMIT ?3"
        ))?;
        let rows = stmt.query_map(
            params![since.map(ts), until.map(ts), limit.min(MAX_LIMIT) as i64],
            report_from_row,
        )?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// The newest `limit` reports, returned oldest first.
    pub fn recent_reports(&self, limit: usize) -> Result<Vec<Report>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {REPORT_COLUMNS} FROM reports ORDER BY generated_at DESC LIMIT ?1"
        ))?;
        let rows = stmt.query_map(params![limit.min(MAX_LIMIT) as i64], report_from_row)?;
        let mut reports = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        reports.reverse();
        Ok(reports)
    }

    pub fn latest_report(&self) -> Result<Option<Report>> {
        let conn = self.pool.get()?;
        let report = conn
            .query_row(
                &format!("SELECT {REPORT_COLUMNS} FROM reports ORDER BY generated_at DESC LIMIT 1"),
                [],
                report_from_row,
            )
            .optional()?;
        Ok(report)
    }

    pub fn count_reports(&self) -> Result<i64> {
        let conn = self.pool.get()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM reports", [], |row| row.get(0))?)
    }

    pub fn count_logs(&self) -> Result<i64> {
        let conn = self.pool.get()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM log_entries", [], |row| row.get(0))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::testing::temp_pool;
    use serde_json::json;

    fn report(run_id: &str, at: DateTime<Utc>) -> Report {
        Report {
            id: Uuid::new_v4(),
            run_id: run_id.to_string(),
            window_start: at - chrono::Duration::hours(1),
            window_end: at,
            tasks_completed: 1,
            tasks_retrying: 0,
            tasks_unresolved: 0,
            findings_detected: 2,
            findings_created: 2,
            findings_resolved: 1,
            narrative: "All quiet.".to_string(),
            generated_at: at,
        }
    }

    #[test]
    fn test_log_filters() {
        let (_dir, pool) = temp_pool();
        let journal = JournalStore::new(pool);
        let now = Utc::now();
        journal.append("run-1", LogLevel::Info, "scan started", None, now).unwrap();
        journal
            .append("run-1", LogLevel::Warning, "task skipped", Some(&json!({ "task": "t" })), now)
            .unwrap();
        journal.append("run-2", LogLevel::Info, "scan started", None, now).unwrap();

        let all = journal.logs(&LogQuery::default()).unwrap();
        assert_eq!(all.len(), 3);

        let warnings = journal
            .logs(&LogQuery { level: Some(LogLevel::Warning), ..Default::default() })
            .unwrap();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].context, Some(json!({ "task": "t" })));

        let run2 = journal
            .logs(&LogQuery { run_id: Some("run-2".to_string()), ..Default::default() })
            .unwrap();
        assert_eq!(run2.len(), 1);
    }

    #[test]
    fn test_one_report_per_run() {
        let (_dir, pool) = temp_pool();
        let journal = JournalStore::new(pool);
        let now = Utc::now();
        journal.insert_report(&report("run-1", now)).unwrap();
        assert!(journal.insert_report(&report("run-1", now)).is_err());

        journal
            .insert_report(&report("run-2", now + chrono::Duration::hours(1)))
            .unwrap();
        let reports = journal.reports(None, None, 10).unwrap();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].run_id, "run-1");
        assert_eq!(journal.latest_report().unwrap().unwrap().run_id, "run-2");
        assert_eq!(journal.report_for_run("run-1").unwrap().unwrap().findings_resolved, 1);
    }
}
