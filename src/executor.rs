//! Executor: drain the pending task snapshot through the remediation
//! handlers, one task at a time. A handler that panics fails its own task
//! and nothing else.

use std::panic::AssertUnwindSafe;

use chrono::Utc;
use futures::FutureExt;
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use crate::config::ExecutorConfig;
use crate::remediation::{Registry, RemediationOutcome, RemediationRequest};
use crate::report::Journal;
use crate::storage::findings::FindingStore;
use crate::storage::tasks::{Task, TaskQueue};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "kebab-case")]
pub enum TaskResult {
    Succeeded,
    /// Back to `pending` for a later run.
    Retrying { attempts: u32, reason: String },
    /// Retry budget spent; task skipped, finding ignored.
    Exhausted { attempts: u32, reason: String },
    /// Handler reported a non-retryable failure.
    Fatal { attempts: u32, reason: String },
    /// No handler registered for the task's kind.
    UnknownKind,
    /// The task was no longer pending when its turn came.
    NotClaimable,
    /// A storage write failed mid-transition; the task is recovered by the
    /// next run.
    Interrupted { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskRun {
    pub task_id: Uuid,
    pub finding_id: Uuid,
    pub kind: String,
    pub signature: Option<String>,
    #[serde(flatten)]
    pub result: TaskResult,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionResult {
    pub outcomes: Vec<TaskRun>,
}

impl ExecutionResult {
    pub fn succeeded(&self) -> usize {
        self.count(|r| matches!(r, TaskResult::Succeeded))
    }

    pub fn retrying(&self) -> usize {
        self.count(|r| matches!(r, TaskResult::Retrying { .. }))
    }

    /// Tasks that ended without fixing their finding and will not be retried.
    pub fn unresolved(&self) -> usize {
        self.count(|r| {
            matches!(
                r,
                TaskResult::Exhausted { .. } | TaskResult::Fatal { .. } | TaskResult::UnknownKind
            )
        })
    }

    fn count(&self, f: impl Fn(&TaskResult) -> bool) -> usize {
        self.outcomes.iter().filter(|o| f(&o.result)).count()
    }
}

pub struct Executor {
    queue: TaskQueue,
    findings: FindingStore,
    registry: Registry,
    cfg: ExecutorConfig,
}

impl Executor {
    pub fn new(queue: TaskQueue, findings: FindingStore, registry: Registry, cfg: ExecutorConfig) -> Self {
        Self {
            queue,
            findings,
            registry,
            cfg,
        }
    }

    /// Recover tasks stranded by an interrupted run and snapshot the pending
    /// queue. Called at run start, so tasks opened later in the same run wait
    /// for the next one.
    pub fn claim(&self, journal: &Journal) -> Vec<Task> {
        let run_id = journal.run_id();

        match self.queue.recover_stranded(run_id, self.cfg.max_attempts, Utc::now()) {
            Ok(recovered) => {
                for r in recovered {
                    journal.warning(
                        if r.requeued {
                            "requeued task interrupted by an earlier run"
                        } else {
                            "skipped task interrupted by an earlier run, finding ignored"
                        },
                        Some(json!({ "task_id": r.task_id, "finding_id": r.finding_id })),
                    );
                }
            }
            Err(e) => journal.error(
                "failed to recover stranded tasks",
                Some(json!({ "error": format!("{e:#}") })),
            ),
        }

        match self.queue.claim_pending(run_id) {
            Ok(tasks) => {
                tracing::debug!(run_id, pending = tasks.len(), "claimed task snapshot");
                tasks
            }
            Err(e) => {
                journal.error(
                    "failed to read pending tasks",
                    Some(json!({ "error": format!("{e:#}") })),
                );
                Vec::new()
            }
        }
    }

    /// Execute a claimed snapshot in order.
    pub async fn execute_all(&self, journal: &Journal, tasks: Vec<Task>) -> ExecutionResult {
        let mut result = ExecutionResult::default();
        for task in tasks {
            result.outcomes.push(self.execute(journal, task).await);
        }
        result
    }

    pub async fn execute(&self, journal: &Journal, task: Task) -> TaskRun {
        let finding = match self.findings.get(task.finding_id) {
            Ok(f) => f,
            Err(e) => {
                journal.error(
                    "failed to load finding for task",
                    Some(json!({ "task_id": task.id, "error": format!("{e:#}") })),
                );
                None
            }
        };
        let mut run = TaskRun {
            task_id: task.id,
            finding_id: task.finding_id,
            kind: task.kind.clone(),
            signature: finding.as_ref().map(|f| f.signature.clone()),
            result: TaskResult::NotClaimable,
        };

        let Some(handler) = self.registry.handler(&task.kind) else {
            journal.error(
                "no handler registered for task kind, finding reopened",
                Some(json!({ "task_id": task.id, "kind": task.kind })),
            );
            run.result = match self.queue.skip_unroutable(
                &task,
                &json!({ "error": format!("unknown remediation kind '{}'", task.kind) }),
                Utc::now(),
            ) {
                Ok(()) => TaskResult::UnknownKind,
                Err(e) => self.interrupted(journal, &task, e),
            };
            return run;
        };

        match self.queue.mark_running(task.id, journal.run_id(), Utc::now()) {
            Ok(true) => {}
            Ok(false) => {
                journal.warning("task was no longer pending", Some(json!({ "task_id": task.id })));
                return run;
            }
            Err(e) => {
                run.result = self.interrupted(journal, &task, e);
                return run;
            }
        }

        let attempts = task.attempts + 1;
        let outcome = match finding {
            Some(f) => {
                let request = RemediationRequest {
                    task_id: task.id,
                    finding_id: f.id,
                    kind: task.kind.clone(),
                    category: f.category,
                    severity: f.severity,
                    signature: f.signature,
                    evidence: f.evidence,
                    attempt: attempts,
                };
                let timeout = self.cfg.handler_timeout();
                let call = AssertUnwindSafe(tokio::time::timeout(timeout, handler.remediate(&request)));
                match call.catch_unwind().await {
                    Ok(Ok(outcome)) => outcome,
                    Ok(Err(_)) => RemediationOutcome::Retryable(format!("handler timed out after {timeout:?}")),
                    Err(panic) => {
                        RemediationOutcome::Fatal(format!("handler panicked: {}", crate::panic_message(panic.as_ref())))
                    }
                }
            }
            None => RemediationOutcome::Fatal("originating finding is missing".to_string()),
        };

        run.result = match self.settle(journal, &task, attempts, outcome) {
            Ok(result) => result,
            Err(e) => self.interrupted(journal, &task, e),
        };
        run
    }

    /// Persist a handler outcome and log it.
    fn settle(
        &self,
        journal: &Journal,
        task: &Task,
        attempts: u32,
        outcome: RemediationOutcome,
    ) -> anyhow::Result<TaskResult> {
        let now = Utc::now();
        let context = |extra: serde_json::Value| {
            let mut ctx = json!({
                "task_id": task.id,
                "finding_id": task.finding_id,
                "kind": task.kind,
                "attempts": attempts,
            });
            if let (Some(obj), Some(extra)) = (ctx.as_object_mut(), extra.as_object()) {
                obj.extend(extra.clone());
            }
            ctx
        };

        match outcome {
            RemediationOutcome::Success(detail) => {
                self.queue.complete(task, attempts, &detail, now)?;
                journal.info("remediation succeeded, finding resolved", Some(context(json!({}))));
                Ok(TaskResult::Succeeded)
            }
            RemediationOutcome::Retryable(reason) if attempts < self.cfg.max_attempts => {
                self.queue.requeue(task, attempts, &json!({ "error": reason }), now)?;
                journal.info(
                    "remediation will be retried next run",
                    Some(context(json!({ "reason": reason }))),
                );
                Ok(TaskResult::Retrying { attempts, reason })
            }
            RemediationOutcome::Retryable(reason) => {
                self.queue.fail(task, attempts, &json!({ "error": reason }), now)?;
                self.queue.skip_failed(task, now)?;
                journal.warning(
                    "retry budget exhausted, task skipped and finding ignored",
                    Some(context(json!({ "reason": reason }))),
                );
                Ok(TaskResult::Exhausted { attempts, reason })
            }
            RemediationOutcome::Fatal(reason) => {
                journal.error("remediation failed", Some(context(json!({ "reason": reason }))));
                self.queue.fail(task, attempts, &json!({ "error": reason }), now)?;
                self.queue.skip_failed(task, now)?;
                journal.warning("task skipped and finding ignored", Some(context(json!({}))));
                Ok(TaskResult::Fatal { attempts, reason })
            }
        }
    }

    fn interrupted(&self, journal: &Journal, task: &Task, e: anyhow::Error) -> TaskResult {
        let reason = format!("{e:#}");
        journal.error(
            "failed to persist task transition",
            Some(json!({ "task_id": task.id, "error": reason })),
        );
        TaskResult::Interrupted { reason }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::detect::{Anomaly, Category, Severity};
    use crate::remediation::RemediationHandler;
    use crate::storage::findings::FindingStatus;
    use crate::storage::journal::JournalStore;
    use crate::storage::tasks::TaskStatus;
    use crate::storage::testing::temp_pool;

    /// Replays a fixed outcome and counts calls.
    struct Scripted {
        outcome: RemediationOutcome,
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl RemediationHandler for Scripted {
        fn kind(&self) -> &str {
            "scripted"
        }

        async fn remediate(&self, _request: &RemediationRequest) -> RemediationOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcome.clone()
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        findings: FindingStore,
        queue: TaskQueue,
        journal: JournalStore,
        handler: Arc<Scripted>,
        executor: Executor,
    }

    fn fixture(outcome: RemediationOutcome, max_attempts: u32) -> Fixture {
        let (dir, pool) = temp_pool();
        let findings = FindingStore::new(pool.clone());
        let queue = TaskQueue::new(pool.clone());
        let handler = Arc::new(Scripted { outcome, calls: AtomicUsize::new(0) });
        let mut registry = Registry::new();
        registry.register(handler.clone()).unwrap();
        let executor = Executor::new(
            queue.clone(),
            findings.clone(),
            registry,
            ExecutorConfig { max_attempts, ..ExecutorConfig::default() },
        );
        Fixture { _dir: dir, findings, queue, journal: JournalStore::new(pool), handler, executor }
    }

    async fn run(fx: &Fixture, run_id: &str) -> ExecutionResult {
        let journal = Journal::new(fx.journal.clone(), run_id);
        let tasks = fx.executor.claim(&journal);
        fx.executor.execute_all(&journal, tasks).await
    }

    fn open_task(fx: &Fixture, kind: &str) -> (Uuid, Uuid) {
        open_task_for(fx, kind, "error-pattern:500:/x")
    }

    fn open_task_for(fx: &Fixture, kind: &str, signature: &str) -> (Uuid, Uuid) {
        let now = Utc::now();
        let finding = fx
            .findings
            .upsert(
                &Anomaly {
                    category: Category::ErrorPattern,
                    severity: Severity::Warning,
                    signature: signature.to_string(),
                    evidence: json!({ "count": 50 }),
                },
                "run-0",
                now,
            )
            .unwrap()
            .finding;
        let task = fx.queue.open_for_finding(finding.id, kind, "run-0", now).unwrap().unwrap();
        (task.id, finding.id)
    }

    #[tokio::test]
    async fn test_success_resolves_finding() {
        let fx = fixture(RemediationOutcome::Success(json!({ "ok": true })), 3);
        let (task_id, finding_id) = open_task(&fx, "scripted");

        let result = run(&fx, "run-1").await;
        assert_eq!(result.succeeded(), 1);
        assert_eq!(fx.queue.get(task_id).unwrap().unwrap().status, TaskStatus::Succeeded);
        assert_eq!(fx.findings.get(finding_id).unwrap().unwrap().status, FindingStatus::Resolved);
    }

    #[tokio::test]
    async fn test_retryable_until_budget_is_spent() {
        let fx = fixture(RemediationOutcome::Retryable("503".into()), 3);
        let (task_id, finding_id) = open_task(&fx, "scripted");

        for (n, expected) in [(1, "retrying"), (2, "retrying"), (3, "exhausted")] {
            let result = run(&fx, &format!("run-{n}")).await;
            assert_eq!(result.outcomes.len(), 1);
            let label = match &result.outcomes[0].result {
                TaskResult::Retrying { .. } => "retrying",
                TaskResult::Exhausted { .. } => "exhausted",
                other => panic!("unexpected {other:?}"),
            };
            assert_eq!(label, expected);
        }

        let task = fx.queue.get(task_id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Skipped);
        assert_eq!(task.attempts, 3);
        assert_eq!(fx.findings.get(finding_id).unwrap().unwrap().status, FindingStatus::Ignored);

        // Nothing left to run: the handler is never called a fourth time.
        let result = run(&fx, "run-4").await;
        assert!(result.outcomes.is_empty());
        assert_eq!(fx.handler.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fatal_skips_immediately() {
        let fx = fixture(RemediationOutcome::Fatal("bad request".into()), 3);
        let (task_id, finding_id) = open_task(&fx, "scripted");

        let result = run(&fx, "run-1").await;
        assert_eq!(result.unresolved(), 1);
        let task = fx.queue.get(task_id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Skipped);
        assert_eq!(task.attempts, 1);
        assert_eq!(fx.findings.get(finding_id).unwrap().unwrap().status, FindingStatus::Ignored);
    }

    #[tokio::test]
    async fn test_unknown_kind_reopens_finding() {
        let fx = fixture(RemediationOutcome::Success(json!({})), 3);
        let (task_id, finding_id) = open_task(&fx, "not-registered");

        let result = run(&fx, "run-1").await;
        assert!(matches!(result.outcomes[0].result, TaskResult::UnknownKind));
        let task = fx.queue.get(task_id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Skipped);
        assert_eq!(task.attempts, 0);
        assert_eq!(fx.findings.get(finding_id).unwrap().unwrap().status, FindingStatus::Open);
        assert_eq!(fx.handler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_tasks_opened_after_the_snapshot_wait_for_the_next_run() {
        let fx = fixture(RemediationOutcome::Success(json!({})), 3);
        let (first, _) = open_task_for(&fx, "scripted", "error-pattern:500:/a");

        let journal = Journal::new(fx.journal.clone(), "run-1");
        let snapshot = fx.executor.claim(&journal);
        let (late, _) = open_task_for(&fx, "scripted", "error-pattern:500:/b");
        let result = fx.executor.execute_all(&journal, snapshot).await;

        assert_eq!(result.outcomes.len(), 1);
        assert_eq!(result.outcomes[0].task_id, first);
        assert_eq!(fx.queue.get(late).unwrap().unwrap().status, TaskStatus::Pending);

        let next = run(&fx, "run-2").await;
        assert_eq!(next.outcomes.len(), 1);
        assert_eq!(next.outcomes[0].task_id, late);
    }

    struct Panicking;

    #[async_trait::async_trait]
    impl RemediationHandler for Panicking {
        fn kind(&self) -> &str {
            "panicking"
        }

        async fn remediate(&self, _request: &RemediationRequest) -> RemediationOutcome {
            panic!("handler blew up");
        }
    }

    #[tokio::test]
    async fn test_panicking_handler_fails_only_its_task() {
        let (dir, pool) = temp_pool();
        let findings = FindingStore::new(pool.clone());
        let queue = TaskQueue::new(pool.clone());
        let handler = Arc::new(Scripted {
            outcome: RemediationOutcome::Success(json!({})),
            calls: AtomicUsize::new(0),
        });
        let mut registry = Registry::new();
        registry.register(handler.clone()).unwrap();
        registry.register(Arc::new(Panicking)).unwrap();
        let executor = Executor::new(queue.clone(), findings.clone(), registry, ExecutorConfig::default());
        let fx = Fixture { _dir: dir, findings, queue, journal: JournalStore::new(pool), handler, executor };

        let (bad_task, bad_finding) = open_task_for(&fx, "panicking", "error-pattern:500:/a");
        let (good_task, good_finding) = open_task_for(&fx, "scripted", "error-pattern:500:/b");

        let result = run(&fx, "run-1").await;
        assert_eq!(result.outcomes.len(), 2);
        let bad = result.outcomes.iter().find(|o| o.task_id == bad_task).unwrap();
        match &bad.result {
            TaskResult::Fatal { reason, .. } => assert!(reason.contains("handler blew up"), "{reason}"),
            other => panic!("expected fatal, got {other:?}"),
        }
        assert_eq!(fx.queue.get(bad_task).unwrap().unwrap().status, TaskStatus::Skipped);
        assert_eq!(fx.findings.get(bad_finding).unwrap().unwrap().status, FindingStatus::Ignored);

        assert_eq!(fx.queue.get(good_task).unwrap().unwrap().status, TaskStatus::Succeeded);
        assert_eq!(fx.findings.get(good_finding).unwrap().unwrap().status, FindingStatus::Resolved);
    }
}
