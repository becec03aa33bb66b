//! Task queue: persisted remediation work and its lifecycle transitions.
//!
//! Each transition that also moves the originating finding runs in one
//! transaction, so a task and its finding never disagree after a crash.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{parse_col, parse_json, parse_ts, parse_ts_opt, stored, ts, Pool, UnknownValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::Skipped)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = UnknownValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "succeeded" => Ok(TaskStatus::Succeeded),
            "failed" => Ok(TaskStatus::Failed),
            "skipped" => Ok(TaskStatus::Skipped),
            other => Err(UnknownValue {
                what: "task status",
                value: other.to_string(),
            }),
        }
    }
}

/// A unit of remediation work derived from an actionable finding.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Task {
    pub id: Uuid,
    /// Back-reference to the originating finding.
    pub finding_id: Uuid,
    pub kind: String,
    pub status: TaskStatus,
    pub attempts: u32,
    pub result: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_run_id: Option<String>,
}

/// A task found in `running` or `failed` from an interrupted run.
#[derive(Debug, Clone)]
pub struct Recovered {
    pub task_id: Uuid,
    pub finding_id: Uuid,
    pub requeued: bool,
}

const COLUMNS: &str = "id, finding_id, kind, status, attempts, result_json,
                       created_at, updated_at, completed_at, last_run_id";

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    let result: Option<String> = row.get(5)?;
    Ok(Task {
        id: parse_col(&row.get::<_, String>(0)?)?,
        finding_id: parse_col(&row.get::<_, String>(1)?)?,
        kind: row.get(2)?,
        status: parse_col(&row.get::<_, String>(3)?)?,
        attempts: row.get(4)?,
        result: result.as_deref().map(parse_json).transpose()?,
        created_at: parse_ts(&row.get::<_, String>(6)?)?,
        updated_at: parse_ts(&row.get::<_, String>(7)?)?,
        completed_at: parse_ts_opt(row.get(8)?)?,
        last_run_id: row.get(9)?,
    })
}

fn set_finding_status(
    tx: &Transaction<'_>,
    finding_id: Uuid,
    from: &str,
    to: &str,
    now: DateTime<Utc>,
) -> rusqlite::Result<usize> {
    tx.execute(
        "UPDATE findings SET status = ?3, updated_at = ?4 WHERE id = ?1 AND status = ?2",
        params![finding_id.to_string(), from, to, ts(now)],
    )
}

#[derive(Clone)]
pub struct TaskQueue {
    pool: Pool,
}

impl TaskQueue {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Open the single task for an open finding and mark the finding
    /// `actioned`. Returns `None` if the finding is no longer open.
    pub fn open_for_finding(
        &self,
        finding_id: Uuid,
        kind: &str,
        run_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>> {
        let now = stored(now);
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if set_finding_status(&tx, finding_id, "open", "actioned", now)? == 0 {
            return Ok(None);
        }

        let task = Task {
            id: Uuid::new_v4(),
            finding_id,
            kind: kind.to_string(),
            status: TaskStatus::Pending,
            attempts: 0,
            result: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            last_run_id: Some(run_id.to_string()),
        };
        tx.execute(
            "INSERT INTO tasks (id, finding_id, kind, status, attempts, created_at, updated_at, last_run_id)
             VALUES (?1, ?2, ?3, 'pending', 0, ?4, ?4, ?5)",
            params![task.id.to_string(), finding_id.to_string(), kind, ts(now), run_id],
        )
        .context("Failed to insert task")?;

        tx.commit()?;
        Ok(Some(task))
    }

    /// Snapshot of every pending task, oldest first, stamped with `run_id`.
    pub fn claim_pending(&self, run_id: &str) -> Result<Vec<Task>> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut tasks = Vec::new();
        {
            let mut stmt = tx.prepare(&format!(
                "SELECT {COLUMNS} FROM tasks WHERE status = 'pending' ORDER BY created_at, id"
            ))?;
            let rows = stmt.query_map([], task_from_row)?;
            for r in rows {
                tasks.push(r?);
            }
        }
        for task in &mut tasks {
            tx.execute(
                "UPDATE tasks SET last_run_id = ?2 WHERE id = ?1",
                params![task.id.to_string(), run_id],
            )?;
            task.last_run_id = Some(run_id.to_string());
        }

        tx.commit()?;
        Ok(tasks)
    }

    /// Requeue or close tasks left `running` or `failed` by an interrupted run.
    ///
    /// A stranded `running` task counts as one consumed attempt.
    pub fn recover_stranded(
        &self,
        run_id: &str,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<Recovered>> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let stranded: Vec<Task> = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {COLUMNS} FROM tasks
                 WHERE (status = 'running' AND (last_run_id IS NULL OR last_run_id != ?1))
                    OR status = 'failed'"
            ))?;
            let rows = stmt.query_map(params![run_id], task_from_row)?;
            rows.collect::<rusqlite::Result<_>>()?
        };

        let mut recovered = Vec::new();
        for task in stranded {
            let (attempts, requeue) = match task.status {
                TaskStatus::Running => {
                    let attempts = (task.attempts + 1).min(max_attempts);
                    (attempts, attempts < max_attempts)
                }
                _ => (task.attempts, false),
            };
            let result = serde_json::json!({
                "error": "interrupted",
                "previous_status": task.status.as_str(),
            })
            .to_string();

            if requeue {
                tx.execute(
                    "UPDATE tasks SET status = 'pending', attempts = ?2, result_json = ?3, updated_at = ?4
                     WHERE id = ?1",
                    params![task.id.to_string(), attempts, result, ts(now)],
                )?;
            } else {
                tx.execute(
                    "UPDATE tasks SET status = 'skipped', attempts = ?2, result_json = ?3,
                                      updated_at = ?4, completed_at = ?4
                     WHERE id = ?1",
                    params![task.id.to_string(), attempts, result, ts(now)],
                )?;
                set_finding_status(&tx, task.finding_id, "actioned", "ignored", now)?;
            }
            recovered.push(Recovered {
                task_id: task.id,
                finding_id: task.finding_id,
                requeued: requeue,
            });
        }

        tx.commit()?;
        Ok(recovered)
    }

    /// `pending -> running`. False if the task was not pending.
    pub fn mark_running(&self, id: Uuid, run_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE tasks SET status = 'running', updated_at = ?2, last_run_id = ?3
             WHERE id = ?1 AND status = 'pending'",
            params![id.to_string(), ts(now), run_id],
        )?;
        Ok(changed == 1)
    }

    /// `running -> succeeded`, finding `actioned -> resolved`.
    pub fn complete(
        &self,
        task: &Task,
        attempts: u32,
        result: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE tasks SET status = 'succeeded', attempts = ?2, result_json = ?3,
                              updated_at = ?4, completed_at = ?4
             WHERE id = ?1 AND status = 'running'",
            params![task.id.to_string(), attempts, result.to_string(), ts(now)],
        )?;
        if changed != 1 {
            anyhow::bail!("task {} was not running", task.id);
        }
        set_finding_status(&tx, task.finding_id, "actioned", "resolved", now)?;
        tx.commit()?;
        Ok(())
    }

    /// `running -> pending` for another attempt in a later run.
    pub fn requeue(
        &self,
        task: &Task,
        attempts: u32,
        result: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE tasks SET status = 'pending', attempts = ?2, result_json = ?3, updated_at = ?4
             WHERE id = ?1 AND status = 'running'",
            params![task.id.to_string(), attempts, result.to_string(), ts(now)],
        )?;
        if changed != 1 {
            anyhow::bail!("task {} was not running", task.id);
        }
        Ok(())
    }

    /// `running -> failed`: the handler gave up or the attempt budget is spent.
    pub fn fail(
        &self,
        task: &Task,
        attempts: u32,
        result: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE tasks SET status = 'failed', attempts = ?2, result_json = ?3, updated_at = ?4
             WHERE id = ?1 AND status = 'running'",
            params![task.id.to_string(), attempts, result.to_string(), ts(now)],
        )?;
        if changed != 1 {
            anyhow::bail!("task {} was not running", task.id);
        }
        Ok(())
    }

    /// `failed -> skipped` (terminal), finding `actioned -> ignored`.
    pub fn skip_failed(&self, task: &Task, now: DateTime<Utc>) -> Result<()> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE tasks SET status = 'skipped', updated_at = ?2, completed_at = ?2
             WHERE id = ?1 AND status = 'failed'",
            params![task.id.to_string(), ts(now)],
        )?;
        set_finding_status(&tx, task.finding_id, "actioned", "ignored", now)?;
        tx.commit()?;
        Ok(())
    }

    /// Unregistered kind: task skipped without consuming an attempt, finding
    /// back to `open` for manual triage.
    pub fn skip_unroutable(
        &self,
        task: &Task,
        result: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE tasks SET status = 'skipped', result_json = ?2, updated_at = ?3, completed_at = ?3
             WHERE id = ?1 AND status IN ('pending', 'running')",
            params![task.id.to_string(), result.to_string(), ts(now)],
        )?;
        set_finding_status(&tx, task.finding_id, "actioned", "open", now)?;
        tx.commit()?;
        Ok(())
    }

    pub fn get(&self, id: Uuid) -> Result<Option<Task>> {
        let conn = self.pool.get()?;
        let task = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM tasks WHERE id = ?1"),
                params![id.to_string()],
                task_from_row,
            )
            .optional()?;
        Ok(task)
    }

    pub fn for_finding(&self, finding_id: Uuid) -> Result<Vec<Task>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM tasks WHERE finding_id = ?1 ORDER BY created_at"
        ))?;
        let rows = stmt.query_map(params![finding_id.to_string()], task_from_row)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Newest first, optionally filtered by status.
    pub fn list(&self, status: Option<TaskStatus>, limit: usize) -> Result<Vec<Task>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM tasks
             WHERE (?1 IS NULL OR status = ?1)
             ORDER BY created_at DESC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![status.map(|s| s.as_str()), limit as i64], task_from_row)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn count_by_status(&self) -> Result<BTreeMap<String, i64>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM tasks GROUP BY status")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }
}
