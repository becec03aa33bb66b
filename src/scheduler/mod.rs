//! Run orchestration: one guarded Monitor -> Executor -> Reporter pass per
//! trigger.
//!
//! `run_once` is the only entry point. It checks the enable toggle, takes the
//! cross-run lock, runs the pipeline under an overall timeout with panics
//! caught, and releases the lock on every exit path. Once the lock is held
//! the run continues on its own task, so dropping the `run_once` future does
//! not strand the lock.

pub mod cron;

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use self::cron::CronTrigger;
use crate::config::ScheduleConfig;
use crate::executor::Executor;
use crate::monitor::{Monitor, Pass};
use crate::report::{Journal, Reporter};
use crate::state::{Acquire, Release, RunLock, StateError, StateStore};
use crate::storage::journal::{JournalStore, Report};
use crate::storage::Pool;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("agent state unavailable: {0}")]
    State(#[from] StateError),
    #[error("run {run_id} could not release the run lock after {attempts} attempts")]
    LockRelease { run_id: String, attempts: u32 },
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub findings_detected: usize,
    pub findings_created: usize,
    pub tasks_opened: usize,
    pub tasks_completed: usize,
    pub tasks_retrying: usize,
    pub tasks_unresolved: usize,
    pub skipped_passes: Vec<Pass>,
    pub report: Option<Report>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum RunOutcome {
    /// The agent is switched off; nothing was touched.
    Disabled,
    /// Another run holds a live lock; this trigger was dropped.
    AlreadyRunning { holder: String, since: DateTime<Utc> },
    Completed(RunSummary),
    /// The pipeline panicked or exceeded the run timeout. The lock was
    /// still released.
    Aborted { run_id: String, reason: String },
}

impl RunOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            RunOutcome::Disabled => "disabled",
            RunOutcome::AlreadyRunning { .. } => "already-running",
            RunOutcome::Completed(_) => "completed",
            RunOutcome::Aborted { .. } => "aborted",
        }
    }
}

struct Retention {
    pool: Pool,
    keep: chrono::Duration,
}

/// Cheap to clone; every trigger path shares the same components.
#[derive(Clone)]
pub struct Scheduler {
    state: Arc<dyn StateStore>,
    monitor: Arc<Monitor>,
    executor: Arc<Executor>,
    reporter: Arc<Reporter>,
    journal: JournalStore,
    retention: Option<Arc<Retention>>,
    cfg: ScheduleConfig,
}

impl Scheduler {
    pub fn new(
        state: Arc<dyn StateStore>,
        monitor: Monitor,
        executor: Executor,
        reporter: Reporter,
        journal: JournalStore,
        cfg: ScheduleConfig,
    ) -> Self {
        Self {
            state,
            monitor: Arc::new(monitor),
            executor: Arc::new(executor),
            reporter: Arc::new(reporter),
            journal,
            retention: None,
            cfg,
        }
    }

    /// Prune locally ingested signal rows older than `keep` after each run.
    pub fn with_signal_retention(mut self, pool: Pool, keep: chrono::Duration) -> Self {
        self.retention = Some(Arc::new(Retention { pool, keep }));
        self
    }

    pub fn state(&self) -> &Arc<dyn StateStore> {
        &self.state
    }

    pub async fn run_once(&self, trigger_time: DateTime<Utc>) -> Result<RunOutcome, SchedulerError> {
        let state = self.state.load()?;
        if !state.enabled {
            debug!("agent disabled, trigger ignored");
            return Ok(RunOutcome::Disabled);
        }

        let run_id = Uuid::new_v4().to_string();
        let forced = match self
            .state
            .try_acquire(&run_id, trigger_time, self.cfg.lock_stale_after())?
        {
            Acquire::Acquired { forced } => forced,
            Acquire::Held(lock) => {
                info!(holder = %lock.holder, since = %lock.acquired_at, "run already in progress, trigger skipped");
                return Ok(RunOutcome::AlreadyRunning {
                    holder: lock.holder,
                    since: lock.acquired_at,
                });
            }
        };

        // From here the lock is ours. The locked section runs as its own task
        // so the release still happens if the caller stops polling us.
        let this = self.clone();
        let task_run_id = run_id.clone();
        let locked = tokio::spawn(async move { this.locked_run(task_run_id, forced, trigger_time).await });
        match locked.await {
            Ok(result) => result,
            Err(e) => {
                let journal = Journal::new(self.journal.clone(), run_id.clone());
                journal.critical("run task failed", Some(json!({ "error": e.to_string() })));
                self.release(&journal).await?;
                self.record(&journal, "aborted");
                Ok(RunOutcome::Aborted {
                    run_id,
                    reason: format!("run task failed: {e}"),
                })
            }
        }
    }

    async fn locked_run(
        &self,
        run_id: String,
        forced: Option<RunLock>,
        trigger_time: DateTime<Utc>,
    ) -> Result<RunOutcome, SchedulerError> {
        let journal = Journal::new(self.journal.clone(), run_id.clone());
        if let Some(abandoned) = forced {
            journal.warning(
                "force-released stale run lock",
                Some(json!({
                    "abandoned_holder": abandoned.holder,
                    "acquired_at": abandoned.acquired_at,
                })),
            );
        }
        journal.info("run started", Some(json!({ "trigger_time": trigger_time })));

        let pipeline = AssertUnwindSafe(self.pipeline(&journal, trigger_time)).catch_unwind();
        let outcome = match tokio::time::timeout(self.cfg.run_timeout(), pipeline).await {
            Ok(Ok(summary)) => RunOutcome::Completed(summary),
            Ok(Err(panic)) => {
                let reason = crate::panic_message(panic.as_ref());
                journal.critical("run pipeline panicked", Some(json!({ "panic": reason })));
                RunOutcome::Aborted {
                    run_id: run_id.clone(),
                    reason: format!("panicked: {reason}"),
                }
            }
            Err(_) => {
                journal.error(
                    "run exceeded its time budget and was abandoned",
                    Some(json!({ "timeout_secs": self.cfg.run_timeout_secs })),
                );
                RunOutcome::Aborted {
                    run_id: run_id.clone(),
                    reason: "timed out".to_string(),
                }
            }
        };

        self.release(&journal).await?;
        self.record(&journal, outcome.label());
        Ok(outcome)
    }

    fn record(&self, journal: &Journal, label: &str) {
        if let Err(e) = self.state.record_run(Utc::now(), label) {
            journal.error("failed to record run outcome", Some(json!({ "error": e.to_string() })));
        }
    }

    async fn pipeline(&self, journal: &Journal, trigger_time: DateTime<Utc>) -> RunSummary {
        let window = self.monitor.window(trigger_time);

        // Snapshot before the Monitor runs: tasks it opens wait for the next run.
        let snapshot = self.executor.claim(journal);
        let scan = self.monitor.scan(journal, trigger_time).await;
        let execution = self.executor.execute_all(journal, snapshot).await;

        let report = match self.reporter.summarize(journal, window, &scan, &execution).await {
            Ok(report) => Some(report),
            Err(e) => {
                journal.error("report generation failed", Some(json!({ "error": format!("{e:#}") })));
                None
            }
        };

        if let Some(retention) = &self.retention {
            match crate::signals::sqlite::prune(&retention.pool, trigger_time - retention.keep) {
                Ok(0) => {}
                Ok(n) => debug!(run_id = journal.run_id(), pruned = n, "pruned old signal rows"),
                Err(e) => journal.warning(
                    "failed to prune old signal rows",
                    Some(json!({ "error": format!("{e:#}") })),
                ),
            }
        }

        let summary = RunSummary {
            run_id: journal.run_id().to_string(),
            started_at: trigger_time,
            finished_at: Utc::now(),
            findings_detected: scan.findings.len(),
            findings_created: scan.created(),
            tasks_opened: scan.tasks_opened,
            tasks_completed: execution.succeeded(),
            tasks_retrying: execution.retrying(),
            tasks_unresolved: execution.unresolved(),
            skipped_passes: scan.skipped_passes(),
            report,
        };
        journal.info(
            "run completed",
            Some(json!({
                "findings_detected": summary.findings_detected,
                "tasks_completed": summary.tasks_completed,
                "tasks_unresolved": summary.tasks_unresolved,
            })),
        );
        summary
    }

    async fn release(&self, journal: &Journal) -> Result<(), SchedulerError> {
        let attempts = self.cfg.release_attempts.max(1);
        for attempt in 1..=attempts {
            match self.state.release(journal.run_id(), Utc::now()) {
                Ok(Release::Released) => return Ok(()),
                Ok(Release::AlreadyFree) => {
                    warn!(run_id = journal.run_id(), "run lock was already free at release");
                    return Ok(());
                }
                Ok(Release::TakenOver { holder }) => {
                    journal.warning(
                        "run lock was taken over before release",
                        Some(json!({ "holder": holder })),
                    );
                    return Ok(());
                }
                Err(e) => {
                    warn!(run_id = journal.run_id(), attempt, error = %e, "failed to release run lock");
                    if attempt < attempts {
                        tokio::time::sleep(Duration::from_millis(self.cfg.release_backoff_ms * attempt as u64)).await;
                    }
                }
            }
        }
        journal.critical(
            "run lock could not be released",
            Some(json!({ "attempts": attempts })),
        );
        Err(SchedulerError::LockRelease {
            run_id: journal.run_id().to_string(),
            attempts,
        })
    }
}
