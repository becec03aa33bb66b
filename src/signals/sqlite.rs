//! Signal tables in the agent database.
//!
//! The ingest endpoints append rows here as they arrive; the monitor reads
//! them back by time window. Rows are pruned once they fall out of the
//! retention period.

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::params;

use super::{ErrorEvent, LatencySample, LineLevel, LogLine, SignalError, SignalSource};
use crate::storage::{parse_ts, ts, Pool};

/// Append error events. Returns the number of rows written.
pub fn ingest_errors(pool: &Pool, events: &[ErrorEvent]) -> Result<usize> {
    let mut conn = pool.get()?;
    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO signal_errors (occurred_at, route, status, message) VALUES (?1, ?2, ?3, ?4)",
        )?;
        for e in events {
            stmt.execute(params![ts(e.timestamp), e.route, e.status, e.message])?;
        }
    }
    tx.commit()?;
    Ok(events.len())
}

pub fn ingest_latency(pool: &Pool, samples: &[LatencySample]) -> Result<usize> {
    let mut conn = pool.get()?;
    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO signal_latency (occurred_at, endpoint, latency_ms) VALUES (?1, ?2, ?3)",
        )?;
        for s in samples {
            stmt.execute(params![ts(s.timestamp), s.endpoint, s.latency_ms])?;
        }
    }
    tx.commit()?;
    Ok(samples.len())
}

pub fn ingest_logs(pool: &Pool, lines: &[LogLine]) -> Result<usize> {
    let mut conn = pool.get()?;
    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO signal_logs (occurred_at, level, message) VALUES (?1, ?2, ?3)",
        )?;
        for l in lines {
            stmt.execute(params![ts(l.timestamp), l.level.as_str(), l.message])?;
        }
    }
    tx.commit()?;
    Ok(lines.len())
}

/// Delete signal rows older than `before`. Returns the number removed.
pub fn prune(pool: &Pool, before: DateTime<Utc>) -> Result<usize> {
    let conn = pool.get()?;
    let cutoff = ts(before);
    let mut removed = 0;
    for table in ["signal_errors", "signal_latency", "signal_logs"] {
        removed += conn.execute(
            &format!("DELETE FROM {table} WHERE occurred_at < ?1"),
            params![cutoff],
        )?;
    }
    Ok(removed)
}

/// Reads the signal tables. Queries run on the blocking pool.
#[derive(Clone)]
pub struct SqliteSignalSource {
    pool: Pool,
}

impl SqliteSignalSource {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    async fn query<T, F>(&self, sql: &'static str, since: DateTime<Utc>, until: DateTime<Utc>, map: F) -> Result<Vec<T>, SignalError>
    where
        T: Send + 'static,
        F: Fn(&rusqlite::Row<'_>) -> rusqlite::Result<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<T>, SignalError> {
            let conn = pool.get().map_err(|e| SignalError::Storage(e.to_string()))?;
            let mut stmt = conn
                .prepare(sql)
                .map_err(|e| SignalError::Storage(e.to_string()))?;
            let rows = stmt
                .query_map(params![ts(since), ts(until)], |row| map(row))
                .map_err(|e| SignalError::Storage(e.to_string()))?;
            let mut out = Vec::new();
            for r in rows {
                out.push(r.map_err(|e| SignalError::Storage(e.to_string()))?);
            }
            Ok(out)
        })
        .await
        .map_err(|e| SignalError::Storage(format!("signal query task failed: {e}")))?
    }
}

#[async_trait::async_trait]
impl SignalSource for SqliteSignalSource {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn recent_errors(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<ErrorEvent>, SignalError> {
        self.query(
            "SELECT occurred_at, route, status, message FROM signal_errors
             WHERE occurred_at >= ?1 AND occurred_at <= ?2 ORDER BY occurred_at",
            since,
            until,
            |row| {
                Ok(ErrorEvent {
                    timestamp: parse_ts(&row.get::<_, String>(0)?)?,
                    route: row.get(1)?,
                    status: row.get(2)?,
                    message: row.get(3)?,
                })
            },
        )
        .await
    }

    async fn recent_latency(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<LatencySample>, SignalError> {
        self.query(
            "SELECT occurred_at, endpoint, latency_ms FROM signal_latency
             WHERE occurred_at >= ?1 AND occurred_at <= ?2 ORDER BY occurred_at",
            since,
            until,
            |row| {
                Ok(LatencySample {
                    timestamp: parse_ts(&row.get::<_, String>(0)?)?,
                    endpoint: row.get(1)?,
                    latency_ms: row.get(2)?,
                })
            },
        )
        .await
    }

    async fn recent_logs(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<LogLine>, SignalError> {
        self.query(
            "SELECT occurred_at, level, message FROM signal_logs
             WHERE occurred_at >= ?1 AND occurred_at <= ?2 ORDER BY occurred_at",
            since,
            until,
            |row| {
                Ok(LogLine {
                    timestamp: parse_ts(&row.get::<_, String>(0)?)?,
                    level: LineLevel::parse(&row.get::<_, String>(1)?),
                    message: row.get(2)?,
                })
            },
        )
        .await
    }
}
