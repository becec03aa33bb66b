//! Monitor: fetch signals, run detection passes, record findings and open
//! remediation tasks for the actionable ones.
//!
//! The three passes run concurrently and independently. A pass that fails,
//! panics or times out is recorded as skipped and contributes nothing; the
//! others still land.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use crate::config::MonitorConfig;
use crate::detect::{rules, Anomaly};
use crate::remediation::Registry;
use crate::report::{Journal, Window};
use crate::signals::{SignalError, SignalSource};
use crate::storage::findings::{Finding, FindingStatus, FindingStore};
use crate::storage::tasks::TaskQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Pass {
    ErrorPattern,
    Performance,
    LogAnomaly,
}

impl Pass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Pass::ErrorPattern => "error-pattern",
            Pass::Performance => "performance",
            Pass::LogAnomaly => "log-anomaly",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum PassStatus {
    Completed { anomalies: usize },
    Skipped { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PassOutcome {
    pub pass: Pass,
    #[serde(flatten)]
    pub status: PassStatus,
}

/// A finding touched by this run.
#[derive(Debug, Clone, Serialize)]
pub struct DetectedFinding {
    pub finding: Finding,
    pub created: bool,
    pub task_opened: Option<Uuid>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanResult {
    pub findings: Vec<DetectedFinding>,
    pub passes: Vec<PassOutcome>,
    pub tasks_opened: usize,
}

impl ScanResult {
    pub fn skipped_passes(&self) -> Vec<Pass> {
        self.passes
            .iter()
            .filter(|p| matches!(p.status, PassStatus::Skipped { .. }))
            .map(|p| p.pass)
            .collect()
    }

    pub fn created(&self) -> usize {
        self.findings.iter().filter(|f| f.created).count()
    }
}

/// A panicking pass becomes a failed pass instead of unwinding the scan.
async fn isolated<F>(pass: F) -> Result<Vec<Anomaly>, SignalError>
where
    F: Future<Output = Result<Vec<Anomaly>, SignalError>>,
{
    match AssertUnwindSafe(pass).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(SignalError::Panicked(crate::panic_message(panic.as_ref()))),
    }
}

pub struct Monitor {
    source: Arc<dyn SignalSource>,
    findings: FindingStore,
    queue: TaskQueue,
    registry: Registry,
    cfg: MonitorConfig,
}

impl Monitor {
    pub fn new(
        source: Arc<dyn SignalSource>,
        findings: FindingStore,
        queue: TaskQueue,
        registry: Registry,
        cfg: MonitorConfig,
    ) -> Self {
        Self {
            source,
            findings,
            queue,
            registry,
            cfg,
        }
    }

    /// The signal window a run triggered at `now` looks at.
    pub fn window(&self, now: DateTime<Utc>) -> Window {
        Window {
            start: now - self.cfg.window(),
            end: now,
        }
    }

    pub async fn scan(&self, journal: &Journal, now: DateTime<Utc>) -> ScanResult {
        let window = self.window(now);
        let (errors, latency, logs) = tokio::join!(
            isolated(self.error_pass(window)),
            isolated(self.performance_pass(window)),
            isolated(self.log_pass(window)),
        );

        let mut result = ScanResult::default();
        let mut anomalies: Vec<Anomaly> = Vec::new();
        for (pass, outcome) in [
            (Pass::ErrorPattern, errors),
            (Pass::Performance, latency),
            (Pass::LogAnomaly, logs),
        ] {
            let status = match outcome {
                Ok(found) => {
                    let n = found.len();
                    anomalies.extend(found);
                    PassStatus::Completed { anomalies: n }
                }
                Err(e) => {
                    journal.error(
                        "detection pass skipped",
                        Some(json!({
                            "pass": pass.as_str(),
                            "source": self.source.name(),
                            "error": e.to_string(),
                        })),
                    );
                    PassStatus::Skipped { reason: e.to_string() }
                }
            };
            result.passes.push(PassOutcome { pass, status });
        }

        for anomaly in &anomalies {
            if let Some(detected) = self.record(journal, anomaly, now) {
                if detected.task_opened.is_some() {
                    result.tasks_opened += 1;
                }
                result.findings.push(detected);
            }
        }
        result
    }

    async fn error_pass(&self, window: Window) -> Result<Vec<Anomaly>, SignalError> {
        let timeout = self.cfg.signal_timeout();
        let events = tokio::time::timeout(timeout, self.source.recent_errors(window.start, window.end))
            .await
            .map_err(|_| SignalError::Timeout(timeout))??;
        Ok(rules::error_patterns(&events, self.cfg.window_minutes, &self.cfg.error_rate))
    }

    async fn performance_pass(&self, window: Window) -> Result<Vec<Anomaly>, SignalError> {
        let timeout = self.cfg.signal_timeout();
        let samples = tokio::time::timeout(timeout, self.source.recent_latency(window.start, window.end))
            .await
            .map_err(|_| SignalError::Timeout(timeout))??;
        Ok(rules::slow_endpoints(&samples, &self.cfg.latency))
    }

    /// One fetch covers the baseline period and the window; lines before the
    /// window start form the baseline.
    async fn log_pass(&self, window: Window) -> Result<Vec<Anomaly>, SignalError> {
        let timeout = self.cfg.signal_timeout();
        let baseline_start = window
            .start
            .min(window.end - chrono::Duration::hours(self.cfg.logs.baseline_hours as i64));
        let lines = tokio::time::timeout(timeout, self.source.recent_logs(baseline_start, window.end))
            .await
            .map_err(|_| SignalError::Timeout(timeout))??;
        let (baseline, recent): (Vec<_>, Vec<_>) =
            lines.into_iter().partition(|l| l.timestamp < window.start);
        Ok(rules::log_anomalies(&recent, &baseline, &self.cfg.logs))
    }

    fn record(&self, journal: &Journal, anomaly: &Anomaly, now: DateTime<Utc>) -> Option<DetectedFinding> {
        let upserted = match self.findings.upsert(anomaly, journal.run_id(), now) {
            Ok(u) => u,
            Err(e) => {
                journal.error(
                    "failed to record finding",
                    Some(json!({ "signature": anomaly.signature, "error": format!("{e:#}") })),
                );
                return None;
            }
        };
        let mut finding = upserted.finding;
        journal.info(
            if upserted.created { "finding created" } else { "finding updated" },
            Some(json!({
                "finding_id": finding.id,
                "signature": finding.signature,
                "category": finding.category,
                "severity": finding.severity,
                "occurrences": finding.occurrences,
            })),
        );

        let mut task_opened = None;
        if finding.status == FindingStatus::Open && finding.severity >= self.cfg.min_actionable_severity {
            if let Some(kind) = self.registry.kind_for(finding.category) {
                match self.queue.open_for_finding(finding.id, kind, journal.run_id(), now) {
                    Ok(Some(task)) => {
                        journal.info(
                            "remediation task opened",
                            Some(json!({
                                "task_id": task.id,
                                "finding_id": finding.id,
                                "kind": task.kind,
                            })),
                        );
                        finding.status = FindingStatus::Actioned;
                        task_opened = Some(task.id);
                    }
                    Ok(None) => {}
                    Err(e) => journal.error(
                        "failed to open remediation task",
                        Some(json!({ "finding_id": finding.id, "error": format!("{e:#}") })),
                    ),
                }
            }
        }

        Some(DetectedFinding {
            finding,
            created: upserted.created,
            task_opened,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::Category;
    use crate::remediation::ACKNOWLEDGE;
    use crate::signals::{ErrorEvent, LatencySample, LineLevel, LogLine};
    use crate::storage::journal::{JournalStore, LogLevel, LogQuery};
    use crate::storage::testing::temp_pool;

    #[derive(Default)]
    struct Fixed {
        errors: Vec<ErrorEvent>,
        latency: Vec<LatencySample>,
        logs: Vec<LogLine>,
        fail_latency: bool,
        panic_errors: bool,
    }

    #[async_trait::async_trait]
    impl SignalSource for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn recent_errors(&self, since: DateTime<Utc>, until: DateTime<Utc>) -> Result<Vec<ErrorEvent>, SignalError> {
            if self.panic_errors {
                panic!("error backend exploded");
            }
            Ok(self.errors.iter().filter(|e| e.timestamp >= since && e.timestamp <= until).cloned().collect())
        }

        async fn recent_latency(&self, _since: DateTime<Utc>, _until: DateTime<Utc>) -> Result<Vec<LatencySample>, SignalError> {
            if self.fail_latency {
                return Err(SignalError::Storage("metrics store offline".into()));
            }
            Ok(self.latency.clone())
        }

        async fn recent_logs(&self, since: DateTime<Utc>, until: DateTime<Utc>) -> Result<Vec<LogLine>, SignalError> {
            Ok(self.logs.iter().filter(|l| l.timestamp >= since && l.timestamp <= until).cloned().collect())
        }
    }

    fn burst(now: DateTime<Utc>, route: &str, n: usize) -> Vec<ErrorEvent> {
        (0..n)
            .map(|i| ErrorEvent {
                timestamp: now - chrono::Duration::seconds(i as i64 + 1),
                route: route.to_string(),
                status: Some(500),
                message: "upstream reset".to_string(),
            })
            .collect()
    }

    fn monitor(source: Fixed, routed: bool) -> (tempfile::TempDir, Monitor, JournalStore) {
        let (dir, pool) = temp_pool();
        let mut registry = Registry::new();
        registry.register(Arc::new(crate::remediation::Acknowledge)).unwrap();
        if routed {
            registry.route(Category::ErrorPattern, ACKNOWLEDGE);
        }
        let monitor = Monitor::new(
            Arc::new(source),
            FindingStore::new(pool.clone()),
            TaskQueue::new(pool.clone()),
            registry,
            MonitorConfig::default(),
        );
        (dir, monitor, JournalStore::new(pool))
    }

    #[tokio::test]
    async fn test_actionable_finding_opens_one_task() {
        let now = Utc::now();
        let source = Fixed { errors: burst(now, "/x", 50), ..Default::default() };
        let (_dir, monitor, store) = monitor(source, true);

        let journal = Journal::new(store.clone(), "run-1");
        let scan = monitor.scan(&journal, now).await;
        assert_eq!(scan.findings.len(), 1);
        assert!(scan.findings[0].created);
        assert_eq!(scan.findings[0].finding.status, FindingStatus::Actioned);
        assert_eq!(scan.tasks_opened, 1);

        // Re-detection refreshes the same finding without a second task.
        let journal = Journal::new(store, "run-2");
        let again = monitor.scan(&journal, now).await;
        assert_eq!(again.findings.len(), 1);
        assert!(!again.findings[0].created);
        assert_eq!(again.findings[0].finding.id, scan.findings[0].finding.id);
        assert_eq!(again.tasks_opened, 0);
    }

    #[tokio::test]
    async fn test_unrouted_category_stays_open() {
        let now = Utc::now();
        let source = Fixed { errors: burst(now, "/x", 50), ..Default::default() };
        let (_dir, monitor, store) = monitor(source, false);

        let scan = monitor.scan(&Journal::new(store, "run-1"), now).await;
        assert_eq!(scan.findings[0].finding.status, FindingStatus::Open);
        assert_eq!(scan.tasks_opened, 0);
    }

    #[tokio::test]
    async fn test_failed_pass_is_skipped_and_others_continue() {
        let now = Utc::now();
        let source = Fixed {
            errors: burst(now, "/x", 50),
            fail_latency: true,
            ..Default::default()
        };
        let (_dir, monitor, store) = monitor(source, true);

        let scan = monitor.scan(&Journal::new(store.clone(), "run-1"), now).await;
        assert_eq!(scan.skipped_passes(), vec![Pass::Performance]);
        assert_eq!(scan.findings.len(), 1);

        let errors = store
            .logs(&LogQuery { level: Some(LogLevel::Error), ..Default::default() })
            .unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "detection pass skipped");
    }

    #[tokio::test]
    async fn test_panicking_pass_does_not_sink_the_others() {
        let now = Utc::now();
        let source = Fixed {
            latency: (0..5)
                .map(|_| LatencySample { timestamp: now, endpoint: "/y".into(), latency_ms: 6_000.0 })
                .collect(),
            panic_errors: true,
            ..Default::default()
        };
        let (_dir, monitor, store) = monitor(source, true);

        let scan = monitor.scan(&Journal::new(store.clone(), "run-1"), now).await;
        assert_eq!(scan.skipped_passes(), vec![Pass::ErrorPattern]);
        assert_eq!(scan.findings.len(), 1);
        assert_eq!(scan.findings[0].finding.category, Category::Performance);

        let errors = store
            .logs(&LogQuery { level: Some(LogLevel::Error), ..Default::default() })
            .unwrap();
        assert_eq!(errors.len(), 1);
        let context = errors[0].context.as_ref().unwrap();
        assert!(context["error"].as_str().unwrap().contains("error backend exploded"));
    }

    #[tokio::test]
    async fn test_log_baseline_precedes_window() {
        let now = Utc::now();
        let old = now - chrono::Duration::hours(5);
        let source = Fixed {
            logs: vec![
                LogLine { timestamp: old, level: LineLevel::Error, message: "disk quota hit on vol 3".into() },
                LogLine { timestamp: now, level: LineLevel::Error, message: "disk quota hit on vol 7".into() },
                LogLine { timestamp: now, level: LineLevel::Error, message: "renderer crashed".into() },
            ],
            ..Default::default()
        };
        let (_dir, monitor, store) = monitor(source, true);

        let scan = monitor.scan(&Journal::new(store, "run-1"), now).await;
        assert_eq!(scan.findings.len(), 1);
        assert_eq!(scan.findings[0].finding.signature, "log-anomaly:renderer crashed");
        // Info severity is never actioned.
        assert!(scan.findings[0].task_opened.is_none());
    }
}
