//! Read-only signal sources consumed by the monitor.
//!
//! A source answers three time-windowed queries: recent error events, recent
//! latency samples and recent raw log lines. The agent treats the backing
//! system as a black box; only the shapes below matter.

pub mod http;
pub mod sqlite;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use self::http::HttpSignalSource;
pub use self::sqlite::SqliteSignalSource;

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("signal storage error: {0}")]
    Storage(String),
    #[error("signal request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("signal read timed out after {0:?}")]
    Timeout(Duration),
    #[error("signal pass panicked: {0}")]
    Panicked(String),
}

/// One failed request observed by the application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub timestamp: DateTime<Utc>,
    pub route: String,
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default)]
    pub message: String,
}

/// One observed request latency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencySample {
    pub timestamp: DateTime<Utc>,
    pub endpoint: String,
    pub latency_ms: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineLevel {
    Debug,
    #[default]
    Info,
    #[serde(alias = "warning")]
    Warn,
    Error,
}

impl LineLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LineLevel::Debug => "debug",
            LineLevel::Info => "info",
            LineLevel::Warn => "warn",
            LineLevel::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "debug" | "trace" => LineLevel::Debug,
            "warn" | "warning" => LineLevel::Warn,
            "error" | "fatal" | "critical" => LineLevel::Error,
            _ => LineLevel::Info,
        }
    }
}

/// One free-text system log line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub level: LineLevel,
    pub message: String,
}

/// Time-windowed, read-only access to the application's runtime signals.
#[async_trait::async_trait]
pub trait SignalSource: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    async fn recent_errors(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<ErrorEvent>, SignalError>;

    async fn recent_latency(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<LatencySample>, SignalError>;

    async fn recent_logs(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<LogLine>, SignalError>;
}
