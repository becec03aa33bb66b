//! Remediation by HTTP callback: POST the request to a fix endpoint owned by
//! the application and classify the response.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use tracing::debug;

use super::{RemediationHandler, RemediationOutcome, RemediationRequest};

pub struct WebhookHandler {
    kind: String,
    url: String,
    bearer_token: Option<String>,
    client: Client,
}

impl WebhookHandler {
    pub fn new(
        kind: impl Into<String>,
        url: impl Into<String>,
        bearer_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        Ok(Self {
            kind: kind.into(),
            url: url.into(),
            bearer_token,
            client: Client::builder().timeout(timeout).build()?,
        })
    }
}

/// 2xx succeeds; throttling, timeouts and server errors are worth retrying;
/// any other client error means the request itself is wrong.
pub fn classify(status: StatusCode, body: &str) -> RemediationOutcome {
    if status.is_success() {
        let detail = serde_json::from_str(body)
            .unwrap_or_else(|_| serde_json::json!({ "status": status.as_u16(), "body": body }));
        return RemediationOutcome::Success(detail);
    }
    let reason = format!("fix endpoint returned {status}: {}", body.chars().take(200).collect::<String>());
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        RemediationOutcome::Retryable(reason)
    } else {
        RemediationOutcome::Fatal(reason)
    }
}

#[async_trait::async_trait]
impl RemediationHandler for WebhookHandler {
    fn kind(&self) -> &str {
        &self.kind
    }

    async fn remediate(&self, request: &RemediationRequest) -> RemediationOutcome {
        let mut req = self.client.post(&self.url).json(request);
        if let Some(token) = &self.bearer_token {
            req = req.bearer_auth(token);
        }

        let response = match req.send().await {
            Ok(r) => r,
            // Connection refused, DNS, timeouts: the endpoint may come back.
            Err(e) => return RemediationOutcome::Retryable(format!("fix endpoint unreachable: {e}")),
        };
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        debug!(kind = %self.kind, %status, "webhook remediation responded");
        classify(status, &body)
    }
}
