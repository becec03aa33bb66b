//! Signal source backed by an external HTTP service.
//!
//! Expects `GET {base}/errors`, `{base}/latency` and `{base}/logs`, each taking
//! `since` and `until` RFC 3339 query parameters and returning a JSON array.

use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;

use super::{ErrorEvent, LatencySample, LogLine, SignalError, SignalSource};

pub struct HttpSignalSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSignalSource {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, SignalError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn fetch<T: DeserializeOwned>(
        &self,
        path: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<T>, SignalError> {
        let url = format!("{}/{}", self.base_url, path);
        let items = self
            .client
            .get(&url)
            .query(&[
                ("since", since.to_rfc3339_opts(SecondsFormat::Secs, true)),
                ("until", until.to_rfc3339_opts(SecondsFormat::Secs, true)),
            ])
            .send()
            .await?
            .error_for_status()?
            .json::<Vec<T>>()
            .await?;
        tracing::debug!(%url, count = items.len(), "fetched signals");
        Ok(items)
    }
}

#[async_trait::async_trait]
impl SignalSource for HttpSignalSource {
    fn name(&self) -> &str {
        "http"
    }

    async fn recent_errors(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<ErrorEvent>, SignalError> {
        self.fetch("errors", since, until).await
    }

    async fn recent_latency(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<LatencySample>, SignalError> {
        self.fetch("latency", since, until).await
    }

    async fn recent_logs(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<LogLine>, SignalError> {
        self.fetch("logs", since, until).await
    }
}
