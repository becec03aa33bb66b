//! Run journal and executive reports.
//!
//! The [`Journal`] is where failures are intentionally absorbed: every
//! significant step of a run lands here (and in `tracing`), and a failure to
//! write an entry is itself only logged. The [`Reporter`] turns a run's scan
//! and execution results into exactly one [`Report`].

pub mod summarizer;

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use futures::FutureExt;
use serde_json::Value;
use tracing::{error, info, warn};
use uuid::Uuid;

pub use self::summarizer::{HttpSummarizer, ReportDraft, Summarizer, TemplateSummarizer};
use crate::detect::Severity;
use crate::executor::{ExecutionResult, TaskResult};
use crate::monitor::ScanResult;
use crate::storage::journal::{JournalStore, LogLevel, Report};

/// Per-run LogEntry writer, mirrored to `tracing`.
#[derive(Clone)]
pub struct Journal {
    store: JournalStore,
    run_id: String,
}

impl Journal {
    pub fn new(store: JournalStore, run_id: impl Into<String>) -> Self {
        Self {
            store,
            run_id: run_id.into(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn log(&self, level: LogLevel, message: &str, context: Option<Value>) {
        let run_id = self.run_id.as_str();
        match level {
            LogLevel::Info => info!(run_id, "{}", message),
            LogLevel::Warning => warn!(run_id, "{}", message),
            LogLevel::Error => error!(run_id, "{}", message),
            LogLevel::Critical => error!(run_id, critical = true, "{}", message),
        }
        if let Err(e) = self
            .store
            .append(run_id, level, message, context.as_ref(), Utc::now())
        {
            warn!(run_id, error = %e, "failed to persist log entry");
        }
    }

    pub fn info(&self, message: &str, context: Option<Value>) {
        self.log(LogLevel::Info, message, context);
    }

    pub fn warning(&self, message: &str, context: Option<Value>) {
        self.log(LogLevel::Warning, message, context);
    }

    pub fn error(&self, message: &str, context: Option<Value>) {
        self.log(LogLevel::Error, message, context);
    }

    pub fn critical(&self, message: &str, context: Option<Value>) {
        self.log(LogLevel::Critical, message, context);
    }
}

/// The time range a run covered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

pub struct Reporter {
    store: JournalStore,
    summarizer: Arc<dyn Summarizer>,
    timeout: Duration,
}

impl Reporter {
    pub fn new(store: JournalStore, summarizer: Arc<dyn Summarizer>, timeout: Duration) -> Self {
        Self {
            store,
            summarizer,
            timeout,
        }
    }

    /// Build the draft for a run. Pure: the same inputs give the same draft.
    pub fn draft(run_id: &str, window: Window, scan: &ScanResult, exec: &ExecutionResult) -> ReportDraft {
        let mut highlights: Vec<String> = scan
            .findings
            .iter()
            .filter(|f| f.created || f.finding.severity == Severity::Critical)
            .map(|f| format!("{} {} {}", f.finding.severity, f.finding.category, f.finding.signature))
            .collect();
        highlights.sort();

        let mut resolved = Vec::new();
        let mut unresolved = Vec::new();
        for run in &exec.outcomes {
            let label = run.signature.clone().unwrap_or_else(|| run.task_id.to_string());
            match &run.result {
                TaskResult::Succeeded => resolved.push(label),
                TaskResult::Exhausted { .. } => unresolved.push(format!("{label} (retry budget exhausted)")),
                TaskResult::Fatal { .. } => unresolved.push(format!("{label} (remediation failed)")),
                TaskResult::UnknownKind => unresolved.push(format!("{label} (no handler for '{}')", run.kind)),
                TaskResult::Retrying { .. } | TaskResult::NotClaimable | TaskResult::Interrupted { .. } => {}
            }
        }
        resolved.sort();
        unresolved.sort();

        let mut skipped_passes: Vec<String> = scan
            .skipped_passes()
            .into_iter()
            .map(|p| p.as_str().to_string())
            .collect();
        skipped_passes.sort();

        ReportDraft {
            run_id: run_id.to_string(),
            window_start: window.start.to_rfc3339_opts(SecondsFormat::Secs, true),
            window_end: window.end.to_rfc3339_opts(SecondsFormat::Secs, true),
            findings_detected: scan.findings.len() as u32,
            findings_created: scan.findings.iter().filter(|f| f.created).count() as u32,
            findings_resolved: exec.succeeded() as u32,
            tasks_completed: exec.succeeded() as u32,
            tasks_retrying: exec.retrying() as u32,
            tasks_unresolved: exec.unresolved() as u32,
            skipped_passes,
            highlights,
            resolved,
            unresolved,
        }
    }

    /// Produce, persist and return the run's report.
    pub async fn summarize(
        &self,
        journal: &Journal,
        window: Window,
        scan: &ScanResult,
        exec: &ExecutionResult,
    ) -> Result<Report> {
        let draft = Self::draft(journal.run_id(), window, scan, exec);

        let call = AssertUnwindSafe(tokio::time::timeout(self.timeout, self.summarizer.summarize(&draft)));
        let narrative = match call.catch_unwind().await {
            Err(panic) => {
                journal.warning(
                    "summarizer panicked, using template",
                    Some(serde_json::json!({ "panic": crate::panic_message(panic.as_ref()) })),
                );
                TemplateSummarizer::render(&draft)
            }
            Ok(Ok(Ok(text))) if !text.trim().is_empty() => text,
            Ok(Ok(Ok(_))) => {
                journal.warning("summarizer returned an empty narrative, using template", None);
                TemplateSummarizer::render(&draft)
            }
            Ok(Ok(Err(e))) => {
                journal.warning(
                    "summarizer failed, using template",
                    Some(serde_json::json!({ "error": format!("{e:#}") })),
                );
                TemplateSummarizer::render(&draft)
            }
            Ok(Err(_)) => {
                journal.warning(
                    "summarizer timed out, using template",
                    Some(serde_json::json!({ "timeout_secs": self.timeout.as_secs() })),
                );
                TemplateSummarizer::render(&draft)
            }
        };

        let report = Report {
            id: Uuid::new_v4(),
            run_id: draft.run_id.clone(),
            window_start: window.start,
            window_end: window.end,
            tasks_completed: draft.tasks_completed,
            tasks_retrying: draft.tasks_retrying,
            tasks_unresolved: draft.tasks_unresolved,
            findings_detected: draft.findings_detected,
            findings_created: draft.findings_created,
            findings_resolved: draft.findings_resolved,
            narrative,
            generated_at: Utc::now(),
        };
        self.store.insert_report(&report)?;
        journal.info(
            "report generated",
            Some(serde_json::json!({
                "report_id": report.id,
                "tasks_completed": report.tasks_completed,
                "findings_detected": report.findings_detected,
            })),
        );
        Ok(report)
    }
}
