//! Agent control state: the enable toggle and the cross-run lock.
//!
//! The state lives behind the [`StateStore`] trait and is passed into the
//! scheduler explicitly. Lock acquisition and release are compare-and-swap
//! updates on a single row, so two triggers racing for the lock cannot both
//! win.

use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use serde::Serialize;
use thiserror::Error;

use crate::storage::{parse_ts, parse_ts_opt, ts, Pool};

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state store connection failed: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("state store query failed: {0}")]
    Sql(#[from] rusqlite::Error),
}

/// Who holds the run lock and since when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunLock {
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
}

impl RunLock {
    pub fn is_stale(&self, now: DateTime<Utc>, stale_after: chrono::Duration) -> bool {
        now - self.acquired_at >= stale_after
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentState {
    pub enabled: bool,
    pub lock: Option<RunLock>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_outcome: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Result of a lock acquisition attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Acquire {
    /// The caller now holds the lock. `forced` names an abandoned holder that
    /// was displaced because its lock was stale.
    Acquired { forced: Option<RunLock> },
    /// Someone else holds a live lock.
    Held(RunLock),
}

/// What a release attempt found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Release {
    /// The caller held the lock and has now freed it.
    Released,
    /// Nobody held the lock.
    AlreadyFree,
    /// A later run force-released the caller's lock and holds it now.
    TakenOver { holder: String },
}

pub trait StateStore: Send + Sync {
    fn load(&self) -> Result<AgentState, StateError>;

    fn set_enabled(&self, enabled: bool, now: DateTime<Utc>) -> Result<AgentState, StateError>;

    fn try_acquire(
        &self,
        run_id: &str,
        now: DateTime<Utc>,
        stale_after: chrono::Duration,
    ) -> Result<Acquire, StateError>;

    /// Release the lock if `run_id` still holds it. Never frees a lock held
    /// by someone else.
    fn release(&self, run_id: &str, now: DateTime<Utc>) -> Result<Release, StateError>;

    fn record_run(&self, at: DateTime<Utc>, outcome: &str) -> Result<(), StateError>;
}

fn state_from_row(row: &Row<'_>) -> rusqlite::Result<AgentState> {
    let holder: Option<String> = row.get(1)?;
    let acquired_at = parse_ts_opt(row.get(2)?)?;
    let lock = match (holder, acquired_at) {
        (Some(holder), Some(acquired_at)) => Some(RunLock { holder, acquired_at }),
        _ => None,
    };
    Ok(AgentState {
        enabled: row.get::<_, i64>(0)? != 0,
        lock,
        last_run_at: parse_ts_opt(row.get(3)?)?,
        last_outcome: row.get(4)?,
        updated_at: parse_ts(&row.get::<_, String>(5)?)?,
    })
}

/// State store backed by the `agent_state` row.
#[derive(Clone)]
pub struct SqliteStateStore {
    pool: Pool,
}

impl SqliteStateStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

impl StateStore for SqliteStateStore {
    fn load(&self) -> Result<AgentState, StateError> {
        let conn = self.pool.get()?;
        let state = conn.query_row(
            "SELECT enabled, lock_holder, lock_acquired_at, last_run_at, last_outcome, updated_at
             FROM agent_state WHERE id = 1",
            [],
            state_from_row,
        )?;
        Ok(state)
    }

    fn set_enabled(&self, enabled: bool, now: DateTime<Utc>) -> Result<AgentState, StateError> {
        {
            let conn = self.pool.get()?;
            conn.execute(
                "UPDATE agent_state SET enabled = ?1, updated_at = ?2 WHERE id = 1",
                params![enabled as i64, ts(now)],
            )?;
        }
        self.load()
    }

    fn try_acquire(
        &self,
        run_id: &str,
        now: DateTime<Utc>,
        stale_after: chrono::Duration,
    ) -> Result<Acquire, StateError> {
        let current = self.load()?;
        let conn = self.pool.get()?;

        let (changed, forced) = match current.lock {
            None => {
                let changed = conn.execute(
                    "UPDATE agent_state SET lock_holder = ?1, lock_acquired_at = ?2, updated_at = ?2
                     WHERE id = 1 AND lock_holder IS NULL",
                    params![run_id, ts(now)],
                )?;
                (changed, None)
            }
            Some(lock) if !lock.is_stale(now, stale_after) => return Ok(Acquire::Held(lock)),
            Some(lock) => {
                // Swap only against the holder we judged stale.
                let changed = conn.execute(
                    "UPDATE agent_state SET lock_holder = ?1, lock_acquired_at = ?2, updated_at = ?2
                     WHERE id = 1 AND lock_holder = ?3",
                    params![run_id, ts(now), lock.holder],
                )?;
                (changed, Some(lock))
            }
        };
        drop(conn);

        if changed == 1 {
            return Ok(Acquire::Acquired { forced });
        }

        // Lost the race: report whoever won.
        match self.load()?.lock {
            Some(lock) => Ok(Acquire::Held(lock)),
            None => Ok(Acquire::Held(RunLock {
                holder: "unknown".to_string(),
                acquired_at: now,
            })),
        }
    }

    fn release(&self, run_id: &str, now: DateTime<Utc>) -> Result<Release, StateError> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE agent_state SET lock_holder = NULL, lock_acquired_at = NULL, updated_at = ?2
             WHERE id = 1 AND lock_holder = ?1",
            params![run_id, ts(now)],
        )?;
        if changed == 1 {
            return Ok(Release::Released);
        }
        let holder: Option<String> =
            conn.query_row("SELECT lock_holder FROM agent_state WHERE id = 1", [], |row| row.get(0))?;
        Ok(match holder {
            None => Release::AlreadyFree,
            Some(holder) => Release::TakenOver { holder },
        })
    }

    fn record_run(&self, at: DateTime<Utc>, outcome: &str) -> Result<(), StateError> {
        let conn = self.pool.get()?;
        conn.execute(
            "UPDATE agent_state SET last_run_at = ?1, last_outcome = ?2, updated_at = ?1 WHERE id = 1",
            params![ts(at), outcome],
        )?;
        Ok(())
    }
}
