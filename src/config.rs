//! TOML configuration for the opswarden agent.
//!
//! Layered model: an explicit `--config` path, then the `OPSWARDEN_CONFIG`
//! environment variable, then `/etc/opswarden/opswarden.toml`, then the
//! compiled-in defaults. Every section has sensible defaults so a partial file
//! is valid.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::detect::{Category, Severity};

/// Environment variable naming an alternate config file.
pub const CONFIG_ENV: &str = "OPSWARDEN_CONFIG";
/// Environment variable carrying the trigger/control shared secret.
pub const SECRET_ENV: &str = "OPSWARDEN_SECRET";

const SYSTEM_CONFIG_PATH: &str = "/etc/opswarden/opswarden.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },
    #[error("monitor.error_rate: critical_per_hour ({critical}) must be >= warning_per_hour ({warning})")]
    RateOrder { warning: f64, critical: f64 },
    #[error("schedule.lock_stale_after_secs ({stale}) must exceed schedule.run_timeout_secs ({timeout})")]
    LockStaleness { stale: u64, timeout: u64 },
    #[error("executor.max_attempts must be at least 1")]
    NoAttempts,
    #[error("signals.base_url is required when signals.backend = \"http\"")]
    MissingSignalUrl,
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for the agent process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub agent: ServiceConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub remediation: RemediationConfig,
    #[serde(default)]
    pub reporter: ReporterConfig,
    #[serde(default)]
    pub signals: SignalsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AgentConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded agent configuration");
        Ok(config)
    }

    /// Resolve the configuration: an explicit path must load, the env and
    /// system locations fall back to defaults on error.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let mut config = match explicit {
            Some(path) => Self::load(path)?,
            None => Self::load_or_default(),
        };
        if let Ok(secret) = std::env::var(SECRET_ENV) {
            if !secret.is_empty() {
                config.agent.shared_secret = Some(secret);
            }
        }
        config.validate()?;
        Ok(config)
    }

    /// Try `OPSWARDEN_CONFIG`, then the system path, then defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "OPSWARDEN_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    /// Reject values that would make the agent misbehave at runtime.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.schedule.lock_stale_after_secs == 0 {
            return Err(ConfigError::Zero { field: "schedule.lock_stale_after_secs" });
        }
        if self.schedule.run_timeout_secs == 0 {
            return Err(ConfigError::Zero { field: "schedule.run_timeout_secs" });
        }
        // A live run must never look stale to the next trigger.
        if self.schedule.lock_stale_after_secs <= self.schedule.run_timeout_secs {
            return Err(ConfigError::LockStaleness {
                stale: self.schedule.lock_stale_after_secs,
                timeout: self.schedule.run_timeout_secs,
            });
        }
        if self.monitor.window_minutes == 0 {
            return Err(ConfigError::Zero { field: "monitor.window_minutes" });
        }
        if self.monitor.signal_timeout_secs == 0 {
            return Err(ConfigError::Zero { field: "monitor.signal_timeout_secs" });
        }
        if self.executor.handler_timeout_secs == 0 {
            return Err(ConfigError::Zero { field: "executor.handler_timeout_secs" });
        }
        if self.executor.max_attempts == 0 {
            return Err(ConfigError::NoAttempts);
        }
        let rate = &self.monitor.error_rate;
        if rate.critical_per_hour < rate.warning_per_hour {
            return Err(ConfigError::RateOrder {
                warning: rate.warning_per_hour,
                critical: rate.critical_per_hour,
            });
        }
        if self.signals.backend == SignalBackend::Http && self.signals.base_url.is_none() {
            return Err(ConfigError::MissingSignalUrl);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// Process-level settings: storage, listener and the shared secret.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub db_path: PathBuf,
    pub bind: String,
    /// Secret required by the trigger, control and ingest endpoints.
    pub shared_secret: Option<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/opswarden.db"),
            bind: "0.0.0.0:8080".to_string(),
            shared_secret: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Schedule
// ---------------------------------------------------------------------------

/// Run cadence and run-lock behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Six-field cron expression used by the in-process trigger.
    pub cron: String,
    /// Fire runs from inside `serve` instead of waiting for an external timer.
    pub in_process: bool,
    /// Age after which a held run lock is presumed abandoned.
    pub lock_stale_after_secs: u64,
    /// Upper bound on one Monitor -> Executor -> Reporter pass.
    pub run_timeout_secs: u64,
    pub release_attempts: u32,
    pub release_backoff_ms: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            cron: "0 0 * * * *".to_string(),
            in_process: false,
            lock_stale_after_secs: 2 * 45 * 60,
            run_timeout_secs: 45 * 60,
            release_attempts: 5,
            release_backoff_ms: 200,
        }
    }
}

impl ScheduleConfig {
    pub fn lock_stale_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lock_stale_after_secs as i64)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }
}

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Length of the scan window ending at the trigger time.
    pub window_minutes: u64,
    /// Bound on each signal-source read.
    pub signal_timeout_secs: u64,
    /// Findings at or above this severity are candidates for a Task.
    pub min_actionable_severity: Severity,
    pub error_rate: ErrorRateConfig,
    pub latency: LatencyConfig,
    pub logs: LogAnomalyConfig,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            window_minutes: 60,
            signal_timeout_secs: 30,
            min_actionable_severity: Severity::Warning,
            error_rate: ErrorRateConfig::default(),
            latency: LatencyConfig::default(),
            logs: LogAnomalyConfig::default(),
        }
    }
}

impl MonitorConfig {
    pub fn window(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.window_minutes as i64)
    }

    pub fn signal_timeout(&self) -> Duration {
        Duration::from_secs(self.signal_timeout_secs)
    }
}

/// Error-pattern thresholds, in events per hour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorRateConfig {
    pub warning_per_hour: f64,
    pub critical_per_hour: f64,
}

impl Default for ErrorRateConfig {
    fn default() -> Self {
        Self {
            warning_per_hour: 20.0,
            critical_per_hour: 200.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LatencyConfig {
    pub ceiling_ms: f64,
    pub critical_multiplier: f64,
    pub min_samples: usize,
}

impl Default for LatencyConfig {
    fn default() -> Self {
        Self {
            ceiling_ms: 5_000.0,
            critical_multiplier: 2.0,
            min_samples: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogAnomalyConfig {
    /// Occurrences of one warn/error template that make it anomalous.
    pub repeat_threshold: usize,
    /// How far back to look when deciding whether an error string is novel.
    pub baseline_hours: u64,
    /// Case-insensitive substrings that mark a line as security relevant.
    pub security_keywords: Vec<String>,
}

impl Default for LogAnomalyConfig {
    fn default() -> Self {
        Self {
            repeat_threshold: 10,
            baseline_hours: 24,
            security_keywords: vec![
                "unauthorized".to_string(),
                "permission denied".to_string(),
                "invalid token".to_string(),
                "csrf".to_string(),
                "sql injection".to_string(),
                "brute force".to_string(),
            ],
        }
    }
}

// ---------------------------------------------------------------------------
// Executor / remediation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub max_attempts: u32,
    pub handler_timeout_secs: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            handler_timeout_secs: 60,
        }
    }
}

impl ExecutorConfig {
    pub fn handler_timeout(&self) -> Duration {
        Duration::from_secs(self.handler_timeout_secs)
    }
}

/// Which remediation kind handles which category, plus webhook handlers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RemediationConfig {
    pub routes: BTreeMap<Category, String>,
    pub webhooks: Vec<WebhookConfig>,
}

/// A remediation kind backed by an HTTP endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub kind: String,
    pub url: String,
    #[serde(default)]
    pub bearer_token: Option<String>,
}

// ---------------------------------------------------------------------------
// Reporter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReporterConfig {
    /// External summarization service; the built-in template is used when unset.
    pub summarizer_url: Option<String>,
    pub summarizer_timeout_secs: u64,
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            summarizer_url: None,
            summarizer_timeout_secs: 30,
        }
    }
}

impl ReporterConfig {
    pub fn summarizer_timeout(&self) -> Duration {
        Duration::from_secs(self.summarizer_timeout_secs)
    }
}

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalBackend {
    /// Signal tables in the agent database, fed by the ingest endpoints.
    Sqlite,
    /// An external signal service queried over HTTP.
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalsConfig {
    pub backend: SignalBackend,
    pub base_url: Option<String>,
    /// Ingested signal rows older than this are pruned after each run.
    pub retention_hours: u64,
}

impl Default for SignalsConfig {
    fn default() -> Self {
        Self {
            backend: SignalBackend::Sqlite,
            base_url: None,
            retention_hours: 72,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: LogFormat,
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Text,
            level: "info".to_string(),
        }
    }
}
