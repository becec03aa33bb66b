//! Anomaly detection rules and the shared finding vocabulary.

pub mod anomaly;
pub mod normalize;
pub mod rules;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("unknown {what}: {value}")]
    UnknownVariant { what: &'static str, value: String },
}

/// What kind of signal produced a finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Category {
    ErrorPattern,
    Performance,
    LogAnomaly,
    Security,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::ErrorPattern => "error-pattern",
            Category::Performance => "performance",
            Category::LogAnomaly => "log-anomaly",
            Category::Security => "security",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = DetectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "error-pattern" => Ok(Category::ErrorPattern),
            "performance" => Ok(Category::Performance),
            "log-anomaly" => Ok(Category::LogAnomaly),
            "security" => Ok(Category::Security),
            other => Err(DetectError::UnknownVariant {
                what: "category",
                value: other.to_string(),
            }),
        }
    }
}

/// Severity levels for detected findings, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = DetectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(Severity::Info),
            "warning" => Ok(Severity::Warning),
            "critical" => Ok(Severity::Critical),
            other => Err(DetectError::UnknownVariant {
                what: "severity",
                value: other.to_string(),
            }),
        }
    }
}

/// A raw anomaly produced by one detection pass, before it is persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Anomaly {
    pub category: Category,
    pub severity: Severity,
    /// Stable deduplication key across runs.
    pub signature: String,
    pub evidence: serde_json::Value,
}
