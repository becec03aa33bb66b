//! End-to-end runs through the scheduler against an on-disk database.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::Notify;

use opswarden::config::{ExecutorConfig, MonitorConfig, ScheduleConfig};
use opswarden::detect::{Category, Severity};
use opswarden::executor::Executor;
use opswarden::monitor::{Monitor, Pass};
use opswarden::remediation::{Registry, RemediationHandler, RemediationOutcome, RemediationRequest};
use opswarden::report::{Reporter, TemplateSummarizer};
use opswarden::scheduler::{RunOutcome, Scheduler, SchedulerError};
use opswarden::signals::{ErrorEvent, LatencySample, LogLine, SignalError, SignalSource};
use opswarden::state::{Acquire, AgentState, Release, SqliteStateStore, StateError, StateStore};
use opswarden::storage::findings::{FindingStatus, FindingStore};
use opswarden::storage::journal::{JournalStore, LogLevel, LogQuery};
use opswarden::storage::tasks::{TaskQueue, TaskStatus};
use opswarden::storage::open_pool;

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Signals {
    errors: Vec<ErrorEvent>,
    latency: Vec<LatencySample>,
    logs: Vec<LogLine>,
}

#[async_trait::async_trait]
impl SignalSource for Signals {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn recent_errors(&self, _since: DateTime<Utc>, _until: DateTime<Utc>) -> Result<Vec<ErrorEvent>, SignalError> {
        Ok(self.errors.clone())
    }

    async fn recent_latency(&self, _since: DateTime<Utc>, _until: DateTime<Utc>) -> Result<Vec<LatencySample>, SignalError> {
        Ok(self.latency.clone())
    }

    async fn recent_logs(&self, _since: DateTime<Utc>, _until: DateTime<Utc>) -> Result<Vec<LogLine>, SignalError> {
        Ok(self.logs.clone())
    }
}

/// Error reads panic; latency reads report a slow endpoint.
struct Exploding {
    now: DateTime<Utc>,
}

#[async_trait::async_trait]
impl SignalSource for Exploding {
    fn name(&self) -> &str {
        "exploding"
    }

    async fn recent_errors(&self, _since: DateTime<Utc>, _until: DateTime<Utc>) -> Result<Vec<ErrorEvent>, SignalError> {
        panic!("signal backend exploded");
    }

    async fn recent_latency(&self, _since: DateTime<Utc>, _until: DateTime<Utc>) -> Result<Vec<LatencySample>, SignalError> {
        Ok((0..5)
            .map(|_| LatencySample { timestamp: self.now, endpoint: "/y".into(), latency_ms: 6_000.0 })
            .collect())
    }

    async fn recent_logs(&self, _since: DateTime<Utc>, _until: DateTime<Utc>) -> Result<Vec<LogLine>, SignalError> {
        Ok(Vec::new())
    }
}

/// Error reads park until released, announcing that they started.
struct Gated {
    entered: Arc<Notify>,
    gate: Arc<Notify>,
    delay: Option<Duration>,
}

#[async_trait::async_trait]
impl SignalSource for Gated {
    fn name(&self) -> &str {
        "gated"
    }

    async fn recent_errors(&self, _since: DateTime<Utc>, _until: DateTime<Utc>) -> Result<Vec<ErrorEvent>, SignalError> {
        self.entered.notify_one();
        match self.delay {
            Some(d) => tokio::time::sleep(d).await,
            None => self.gate.notified().await,
        }
        Ok(Vec::new())
    }

    async fn recent_latency(&self, _since: DateTime<Utc>, _until: DateTime<Utc>) -> Result<Vec<LatencySample>, SignalError> {
        Ok(Vec::new())
    }

    async fn recent_logs(&self, _since: DateTime<Utc>, _until: DateTime<Utc>) -> Result<Vec<LogLine>, SignalError> {
        Ok(Vec::new())
    }
}

struct Handler {
    kind: &'static str,
    outcome: RemediationOutcome,
    calls: AtomicUsize,
}

impl Handler {
    fn new(kind: &'static str, outcome: RemediationOutcome) -> Arc<Self> {
        Arc::new(Self { kind, outcome, calls: AtomicUsize::new(0) })
    }
}

#[async_trait::async_trait]
impl RemediationHandler for Handler {
    fn kind(&self) -> &str {
        self.kind
    }

    async fn remediate(&self, _request: &RemediationRequest) -> RemediationOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.outcome.clone()
    }
}

/// Delegates to the real store but can never release the lock.
struct StuckLock(SqliteStateStore);

impl StateStore for StuckLock {
    fn load(&self) -> Result<AgentState, StateError> {
        self.0.load()
    }

    fn set_enabled(&self, enabled: bool, now: DateTime<Utc>) -> Result<AgentState, StateError> {
        self.0.set_enabled(enabled, now)
    }

    fn try_acquire(&self, run_id: &str, now: DateTime<Utc>, stale_after: chrono::Duration) -> Result<Acquire, StateError> {
        self.0.try_acquire(run_id, now, stale_after)
    }

    fn release(&self, _run_id: &str, _now: DateTime<Utc>) -> Result<Release, StateError> {
        Err(StateError::Sql(rusqlite::Error::QueryReturnedNoRows))
    }

    fn record_run(&self, at: DateTime<Utc>, outcome: &str) -> Result<(), StateError> {
        self.0.record_run(at, outcome)
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    _dir: tempfile::TempDir,
    scheduler: Scheduler,
    state: SqliteStateStore,
    findings: FindingStore,
    tasks: TaskQueue,
    journal: JournalStore,
}

fn quick_schedule() -> ScheduleConfig {
    ScheduleConfig {
        release_backoff_ms: 1,
        ..ScheduleConfig::default()
    }
}

fn harness_with(
    source: Arc<dyn SignalSource>,
    handlers: &[Arc<Handler>],
    routes: &[(Category, &str)],
    schedule: ScheduleConfig,
    stuck_lock: bool,
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let pool = open_pool(dir.path().join("agent.db").to_str().unwrap()).unwrap();

    let mut registry = Registry::new();
    for h in handlers {
        registry.register(h.clone()).unwrap();
    }
    for (category, kind) in routes {
        registry.route(*category, *kind);
    }
    registry.validate().unwrap();

    let findings = FindingStore::new(pool.clone());
    let tasks = TaskQueue::new(pool.clone());
    let journal = JournalStore::new(pool.clone());
    let sqlite_state = SqliteStateStore::new(pool.clone());

    let monitor = Monitor::new(source, findings.clone(), tasks.clone(), registry.clone(), MonitorConfig::default());
    let executor = Executor::new(
        tasks.clone(),
        findings.clone(),
        registry,
        ExecutorConfig { max_attempts: 3, ..ExecutorConfig::default() },
    );
    let reporter = Reporter::new(journal.clone(), Arc::new(TemplateSummarizer), Duration::from_secs(5));
    let state: Arc<dyn StateStore> = if stuck_lock {
        Arc::new(StuckLock(sqlite_state.clone()))
    } else {
        Arc::new(sqlite_state.clone())
    };
    let scheduler = Scheduler::new(
        state,
        monitor,
        executor,
        reporter,
        journal.clone(),
        schedule,
    );

    Harness { _dir: dir, scheduler, state: sqlite_state, findings, tasks, journal }
}

fn harness(
    source: Arc<dyn SignalSource>,
    handlers: &[Arc<Handler>],
    routes: &[(Category, &str)],
) -> Harness {
    harness_with(source, handlers, routes, quick_schedule(), false)
}

fn burst(now: DateTime<Utc>, route: &str, n: usize) -> Vec<ErrorEvent> {
    (0..n)
        .map(|i| ErrorEvent {
            timestamp: now - chrono::Duration::seconds(i as i64 + 1),
            route: route.to_string(),
            status: Some(500),
            message: "upstream connect error".to_string(),
        })
        .collect()
}

fn completed(outcome: RunOutcome) -> opswarden::scheduler::RunSummary {
    match outcome {
        RunOutcome::Completed(summary) => summary,
        other => panic!("expected a completed run, got {other:?}"),
    }
}

fn assert_lock_free(h: &Harness) {
    assert!(h.state.load().unwrap().lock.is_none(), "run lock still held");
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn error_burst_is_remediated_on_the_following_run() {
    let now = Utc::now();
    let handler = Handler::new("restart", RemediationOutcome::Success(json!({ "restarted": true })));
    let h = harness(
        Arc::new(Signals { errors: burst(now, "/x", 50), ..Default::default() }),
        &[handler.clone()],
        &[(Category::ErrorPattern, "restart")],
    );

    // The first run detects and queues; its task is not in that run's snapshot.
    let first = completed(h.scheduler.run_once(now).await.unwrap());
    assert_eq!(first.findings_detected, 1);
    assert_eq!(first.tasks_opened, 1);
    assert_eq!(first.tasks_completed, 0);
    assert_eq!(handler.calls.load(Ordering::SeqCst), 0);

    let findings = h.findings.list(None, 10).unwrap();
    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].category, Category::ErrorPattern);
    assert_eq!(findings[0].severity, Severity::Warning);
    assert_eq!(findings[0].status, FindingStatus::Actioned);

    let second = completed(h.scheduler.run_once(now + chrono::Duration::seconds(1)).await.unwrap());
    assert_eq!(second.tasks_opened, 0);
    assert_eq!(second.tasks_completed, 1);

    let findings = h.findings.list(None, 10).unwrap();
    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].status, FindingStatus::Resolved);

    let tasks = h.tasks.for_finding(findings[0].id).unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].kind, "restart");
    assert_eq!(tasks[0].status, TaskStatus::Succeeded);
    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);

    let report = h.journal.report_for_run(&second.run_id).unwrap().unwrap();
    assert_eq!(report.tasks_completed, 1);
    assert_eq!(report.findings_resolved, 1);
    assert_lock_free(&h);
}

#[tokio::test]
async fn unrouted_slow_endpoint_stays_open() {
    let now = Utc::now();
    let h = harness(
        Arc::new(Signals {
            latency: vec![LatencySample { timestamp: now, endpoint: "/y".into(), latency_ms: 6_000.0 }],
            ..Default::default()
        }),
        &[Handler::new("restart", RemediationOutcome::Success(json!({})))],
        &[(Category::ErrorPattern, "restart")],
    );

    let summary = completed(h.scheduler.run_once(now).await.unwrap());
    assert_eq!(summary.findings_created, 1);
    assert_eq!(summary.tasks_opened, 0);

    let findings = h.findings.list(None, 10).unwrap();
    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].category, Category::Performance);
    assert_eq!(findings[0].status, FindingStatus::Open);
    assert!(h.tasks.list(None, 10).unwrap().is_empty());
}

#[tokio::test]
async fn retry_budget_exhaustion_is_reported() {
    let now = Utc::now();
    let handler = Handler::new("restart", RemediationOutcome::Retryable("503 from fix endpoint".into()));
    let h = harness(
        Arc::new(Signals { errors: burst(now, "/x", 50), ..Default::default() }),
        &[handler.clone()],
        &[(Category::ErrorPattern, "restart")],
    );

    // Run 1 queues the task; runs 2 to 4 each spend one attempt.
    let mut last = None;
    for i in 0..4 {
        let trigger = now + chrono::Duration::seconds(i);
        last = Some(completed(h.scheduler.run_once(trigger).await.unwrap()));
    }
    let last = last.unwrap();
    assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    assert_eq!(last.tasks_unresolved, 1);

    // One finding across all four runs, one task, now closed out.
    let findings = h.findings.list(None, 10).unwrap();
    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].status, FindingStatus::Ignored);
    assert_eq!(findings[0].occurrences, 4);
    let tasks = h.tasks.for_finding(findings[0].id).unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].status, TaskStatus::Skipped);
    assert_eq!(tasks[0].attempts, 3);

    let report = h.journal.report_for_run(&last.run_id).unwrap().unwrap();
    assert!(report.narrative.contains("1 unresolved issue(s)"), "{}", report.narrative);
}

#[tokio::test]
async fn disabled_agent_does_nothing() {
    let now = Utc::now();
    let h = harness(
        Arc::new(Signals { errors: burst(now, "/x", 50), ..Default::default() }),
        &[Handler::new("restart", RemediationOutcome::Success(json!({})))],
        &[(Category::ErrorPattern, "restart")],
    );
    h.state.set_enabled(false, now).unwrap();

    let outcome = h.scheduler.run_once(now).await.unwrap();
    assert!(matches!(outcome, RunOutcome::Disabled));

    assert!(h.findings.list(None, 10).unwrap().is_empty());
    assert!(h.tasks.list(None, 10).unwrap().is_empty());
    assert_eq!(h.journal.count_logs().unwrap(), 0);
    assert_eq!(h.journal.count_reports().unwrap(), 0);
    let state = h.state.load().unwrap();
    assert!(state.lock.is_none());
    assert!(state.last_run_at.is_none());
}

// ---------------------------------------------------------------------------
// Run lock and failure containment
// ---------------------------------------------------------------------------

#[tokio::test]
async fn panicking_signal_pass_is_isolated_from_the_run() {
    let now = Utc::now();
    let h = harness(Arc::new(Exploding { now }), &[], &[]);

    let summary = completed(h.scheduler.run_once(now).await.unwrap());
    assert_eq!(summary.skipped_passes, vec![Pass::ErrorPattern]);
    assert_eq!(summary.findings_detected, 1);
    assert!(summary.report.is_some());

    let findings = h.findings.list(None, 10).unwrap();
    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].category, Category::Performance);

    assert_lock_free(&h);
    assert_eq!(h.state.load().unwrap().last_outcome.as_deref(), Some("completed"));
    assert_eq!(h.journal.count_reports().unwrap(), 1);

    let errors = h
        .journal
        .logs(&LogQuery { level: Some(LogLevel::Error), ..Default::default() })
        .unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].message, "detection pass skipped");
    let critical = h
        .journal
        .logs(&LogQuery { level: Some(LogLevel::Critical), ..Default::default() })
        .unwrap();
    assert!(critical.is_empty());
}

#[tokio::test]
async fn run_timeout_aborts_and_releases_the_lock() {
    let source = Gated {
        entered: Arc::new(Notify::new()),
        gate: Arc::new(Notify::new()),
        delay: Some(Duration::from_secs(5)),
    };
    let schedule = ScheduleConfig { run_timeout_secs: 1, ..quick_schedule() };
    let h = harness_with(Arc::new(source), &[], &[], schedule, false);

    let outcome = h.scheduler.run_once(Utc::now()).await.unwrap();
    match outcome {
        RunOutcome::Aborted { reason, .. } => assert_eq!(reason, "timed out"),
        other => panic!("expected aborted run, got {other:?}"),
    }
    assert_lock_free(&h);
    assert_eq!(h.journal.count_reports().unwrap(), 0);
}

#[tokio::test]
async fn duplicate_trigger_is_skipped_while_a_run_is_in_flight() {
    let entered = Arc::new(Notify::new());
    let gate = Arc::new(Notify::new());
    let h = harness(
        Arc::new(Gated { entered: entered.clone(), gate: gate.clone(), delay: None }),
        &[],
        &[],
    );

    let first = {
        let scheduler = h.scheduler.clone();
        tokio::spawn(async move { scheduler.run_once(Utc::now()).await })
    };
    entered.notified().await;

    let second = h.scheduler.run_once(Utc::now()).await.unwrap();
    let holder = match second {
        RunOutcome::AlreadyRunning { holder, .. } => holder,
        other => panic!("expected AlreadyRunning, got {other:?}"),
    };

    gate.notify_one();
    let first = completed(first.await.unwrap().unwrap());
    assert_eq!(first.run_id, holder);

    // Only the winning run left a trace.
    assert_eq!(h.journal.count_reports().unwrap(), 1);
    let logs = h.journal.logs(&LogQuery::default()).unwrap();
    assert!(logs.iter().all(|l| l.run_id == first.run_id));
    assert_lock_free(&h);
}

#[tokio::test]
async fn dropped_trigger_still_releases_the_lock() {
    let entered = Arc::new(Notify::new());
    let gate = Arc::new(Notify::new());
    let h = harness(
        Arc::new(Gated { entered: entered.clone(), gate: gate.clone(), delay: None }),
        &[],
        &[],
    );

    // The caller gives up while the run is parked inside the Monitor.
    let abandoned = tokio::time::timeout(Duration::from_millis(300), h.scheduler.run_once(Utc::now())).await;
    assert!(abandoned.is_err());
    entered.notified().await;
    assert!(h.state.load().unwrap().lock.is_some());

    gate.notify_one();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while h.state.load().unwrap().lock.is_some() {
        assert!(tokio::time::Instant::now() < deadline, "run lock never released");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(h.state.load().unwrap().last_outcome.as_deref(), Some("completed"));

    // The next trigger is not locked out.
    let next = {
        let scheduler = h.scheduler.clone();
        tokio::spawn(async move { scheduler.run_once(Utc::now()).await })
    };
    entered.notified().await;
    gate.notify_one();
    completed(next.await.unwrap().unwrap());
    assert_eq!(h.journal.count_reports().unwrap(), 2);
    assert_lock_free(&h);
}

#[tokio::test]
async fn stale_lock_from_a_crashed_run_is_taken_over() {
    let h = harness(Arc::new(Signals::default()), &[], &[]);
    let now = Utc::now();
    let crashed_at = now - chrono::Duration::hours(3);
    assert!(matches!(
        h.state.try_acquire("crashed-run", crashed_at, chrono::Duration::minutes(90)).unwrap(),
        Acquire::Acquired { .. }
    ));

    let summary = completed(h.scheduler.run_once(now).await.unwrap());
    let warnings = h
        .journal
        .logs(&LogQuery {
            level: Some(LogLevel::Warning),
            run_id: Some(summary.run_id.clone()),
            ..Default::default()
        })
        .unwrap();
    assert!(warnings.iter().any(|l| l.message == "force-released stale run lock"
        && l.context.as_ref().map(|c| c["abandoned_holder"] == "crashed-run").unwrap_or(false)));
    assert_lock_free(&h);
}

#[tokio::test]
async fn live_lock_held_elsewhere_blocks_the_run() {
    let h = harness(Arc::new(Signals::default()), &[], &[]);
    let now = Utc::now();
    h.state.try_acquire("other-host", now, chrono::Duration::minutes(90)).unwrap();

    let outcome = h.scheduler.run_once(now + chrono::Duration::minutes(5)).await.unwrap();
    assert!(matches!(outcome, RunOutcome::AlreadyRunning { ref holder, .. } if holder == "other-host"));
    assert_eq!(h.journal.count_logs().unwrap(), 0);
}

#[tokio::test]
async fn unreleasable_lock_is_a_run_error() {
    let h = harness_with(Arc::new(Signals::default()), &[], &[], quick_schedule(), true);

    let err = h.scheduler.run_once(Utc::now()).await.unwrap_err();
    assert!(matches!(err, SchedulerError::LockRelease { attempts: 5, .. }));
    assert!(h.state.load().unwrap().lock.is_some());
    let critical = h
        .journal
        .logs(&LogQuery { level: Some(LogLevel::Critical), ..Default::default() })
        .unwrap();
    assert_eq!(critical.len(), 1);
}

#[tokio::test]
async fn one_report_per_completed_run() {
    let now = Utc::now();
    let h = harness(
        Arc::new(Signals { errors: burst(now, "/x", 50), ..Default::default() }),
        &[Handler::new("restart", RemediationOutcome::Retryable("busy".into()))],
        &[(Category::ErrorPattern, "restart")],
    );

    let mut completed_runs = 0;
    for i in 0..4 {
        if let RunOutcome::Completed(_) = h.scheduler.run_once(now + chrono::Duration::seconds(i)).await.unwrap() {
            completed_runs += 1;
        }
    }
    assert_eq!(completed_runs, 4);
    assert_eq!(h.journal.count_reports().unwrap(), completed_runs);
    assert_eq!(h.state.load().unwrap().last_outcome.as_deref(), Some("completed"));

    // Never more than one active finding for the signature.
    let active: Vec<_> = h
        .findings
        .list(None, 50)
        .unwrap()
        .into_iter()
        .filter(|f| matches!(f.status, FindingStatus::Open | FindingStatus::Actioned))
        .collect();
    assert!(active.len() <= 1);
}
