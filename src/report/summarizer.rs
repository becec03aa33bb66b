//! Narrative generation for the executive report.

use std::time::Duration;

use anyhow::{Context, Result};
use askama::Template;
use serde::{Deserialize, Serialize};

/// Everything a summarizer may use. Lists are sorted so the same run always
/// produces the same draft.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportDraft {
    pub run_id: String,
    pub window_start: String,
    pub window_end: String,
    pub findings_detected: u32,
    pub findings_created: u32,
    pub findings_resolved: u32,
    pub tasks_completed: u32,
    pub tasks_retrying: u32,
    pub tasks_unresolved: u32,
    pub skipped_passes: Vec<String>,
    /// Critical or newly created findings, as `severity category signature`.
    pub highlights: Vec<String>,
    pub resolved: Vec<String>,
    pub unresolved: Vec<String>,
}

#[async_trait::async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, draft: &ReportDraft) -> Result<String>;
}

#[derive(Template)]
#[template(
    ext = "txt",
    source = "Run {{ d.run_id }} scanned {{ d.window_start }} to {{ d.window_end }}. \
{% if d.findings_detected == 0 %}No anomalies were detected.\
{% else %}{{ d.findings_detected }} finding(s) detected, {{ d.findings_created }} new.\
{% if !d.highlights.is_empty() %} Notable: {{ d.highlights.join(\"; \") }}.{% endif %}\
{% endif %} \
{% if d.tasks_completed > 0 %}{{ d.tasks_completed }} remediation(s) completed, resolving {{ d.resolved.join(\", \") }}. {% endif %}\
{% if d.tasks_retrying > 0 %}{{ d.tasks_retrying }} remediation(s) will be retried next run. {% endif %}\
{% if d.tasks_unresolved > 0 %}{{ d.tasks_unresolved }} unresolved issue(s) need manual attention: {{ d.unresolved.join(\"; \") }}. {% endif %}\
{% if !d.skipped_passes.is_empty() %}Skipped detection passes: {{ d.skipped_passes.join(\", \") }}.{% endif %}"
)]
struct NarrativeTemplate<'a> {
    d: &'a ReportDraft,
}

/// Deterministic narrative rendered from a template.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateSummarizer;

impl TemplateSummarizer {
    pub fn render(draft: &ReportDraft) -> String {
        match (NarrativeTemplate { d: draft }).render() {
            Ok(text) => text.trim().to_string(),
            Err(e) => {
                tracing::warn!(error = %e, "narrative template failed, using plain summary");
                format!(
                    "Run {}: {} finding(s), {} remediation(s) completed, {} unresolved issue(s).",
                    draft.run_id, draft.findings_detected, draft.tasks_completed, draft.tasks_unresolved
                )
            }
        }
    }
}

#[async_trait::async_trait]
impl Summarizer for TemplateSummarizer {
    async fn summarize(&self, draft: &ReportDraft) -> Result<String> {
        Ok(Self::render(draft))
    }
}

#[derive(Debug, Deserialize)]
struct SummaryResponse {
    narrative: String,
}

/// Delegates the narrative to an external summarization service.
///
/// POSTs the draft as JSON; the service answers `{ "narrative": "..." }`.
pub struct HttpSummarizer {
    client: reqwest::Client,
    url: String,
}

impl HttpSummarizer {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .context("Failed to build summarizer HTTP client")?,
            url: url.into(),
        })
    }
}

#[async_trait::async_trait]
impl Summarizer for HttpSummarizer {
    async fn summarize(&self, draft: &ReportDraft) -> Result<String> {
        let response: SummaryResponse = self
            .client
            .post(&self.url)
            .json(draft)
            .send()
            .await
            .context("summarizer request failed")?
            .error_for_status()
            .context("summarizer returned an error status")?
            .json()
            .await
            .context("summarizer response was not valid JSON")?;
        Ok(response.narrative)
    }
}
