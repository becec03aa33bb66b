//! opswarden -- an autonomous operational agent for a single web application.
//!
//! Each run scans the application's runtime signals for anomalies, records
//! deduplicated findings, executes remediation tasks for the actionable ones
//! and writes a technical log plus an executive report. Runs are triggered
//! externally (or by the optional in-process cron trigger) and guarded by a
//! persisted run lock.

pub mod api;
pub mod config;
pub mod detect;
pub mod executor;
pub mod monitor;
pub mod remediation;
pub mod report;
pub mod scheduler;
pub mod signals;
pub mod state;
pub mod storage;

use std::sync::Arc;

use anyhow::{Context, Result};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::{AgentConfig, ConfigError, LogFormat, LoggingConfig, SignalBackend};
use crate::executor::Executor;
use crate::monitor::Monitor;
use crate::remediation::Registry;
use crate::report::{HttpSummarizer, Reporter, Summarizer, TemplateSummarizer};
use crate::scheduler::{CronTrigger, Scheduler};
use crate::signals::{HttpSignalSource, SignalSource, SqliteSignalSource};
use crate::state::SqliteStateStore;
use crate::storage::findings::FindingStore;
use crate::storage::journal::JournalStore;
use crate::storage::tasks::TaskQueue;
use crate::storage::Pool;

/// Install the global tracing subscriber. `RUST_LOG` wins over the
/// configured level.
pub fn init_tracing(cfg: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let installed = match cfg.format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Every long-lived component, wired from configuration.
pub struct Agent {
    pub pool: Pool,
    pub scheduler: Scheduler,
}

impl Agent {
    pub fn build(config: &AgentConfig, pool: Pool) -> Result<Self> {
        let registry = Registry::from_config(&config.remediation, config.executor.handler_timeout())
            .context("invalid remediation configuration")?;
        tracing::info!(kinds = ?registry.kinds(), "remediation registry ready");

        let source: Arc<dyn SignalSource> = match config.signals.backend {
            SignalBackend::Sqlite => Arc::new(SqliteSignalSource::new(pool.clone())),
            SignalBackend::Http => {
                let url = config
                    .signals
                    .base_url
                    .as_deref()
                    .ok_or(ConfigError::MissingSignalUrl)?;
                Arc::new(HttpSignalSource::new(url, config.monitor.signal_timeout())?)
            }
        };

        let summarizer: Arc<dyn Summarizer> = match &config.reporter.summarizer_url {
            Some(url) => Arc::new(HttpSummarizer::new(url.as_str(), config.reporter.summarizer_timeout())?),
            None => Arc::new(TemplateSummarizer),
        };

        let findings = FindingStore::new(pool.clone());
        let queue = TaskQueue::new(pool.clone());
        let journal = JournalStore::new(pool.clone());

        let monitor = Monitor::new(
            source,
            findings.clone(),
            queue.clone(),
            registry.clone(),
            config.monitor.clone(),
        );
        let executor = Executor::new(queue, findings, registry, config.executor.clone());
        let reporter = Reporter::new(journal.clone(), summarizer, config.reporter.summarizer_timeout());

        let scheduler = Scheduler::new(
            Arc::new(SqliteStateStore::new(pool.clone())),
            monitor,
            executor,
            reporter,
            journal,
            config.schedule.clone(),
        )
        .with_signal_retention(
            pool.clone(),
            chrono::Duration::hours(config.signals.retention_hours as i64),
        );

        Ok(Self { pool, scheduler })
    }

    pub fn open(config: &AgentConfig) -> Result<Self> {
        let db_path = config.agent.db_path.to_string_lossy();
        tracing::info!(%db_path, "Initializing database");
        let pool = storage::open_pool(&db_path)?;
        Self::build(config, pool)
    }
}

/// Start the opswarden daemon: status/trigger API and, when configured, the
/// in-process cron trigger.
pub async fn serve(config: AgentConfig) -> Result<()> {
    let agent = Agent::open(&config)?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    if config.schedule.in_process {
        let trigger = CronTrigger::new(&config.schedule.cron)?;
        let scheduler = agent.scheduler.clone();
        tokio::spawn(trigger.run(scheduler, shutdown_rx));
    } else {
        tracing::info!("in-process trigger disabled; expecting external triggers");
    }
    if config.agent.shared_secret.is_none() {
        tracing::warn!("no shared secret configured; trigger, control and ingest routes are disabled");
    }

    let state = api::state::AppState::new(agent.pool, agent.scheduler, config.agent.shared_secret.clone());
    let app = api::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr: std::net::SocketAddr = config.agent.bind.parse()?;
    tracing::info!(%addr, "opswarden listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    Ok(())
}
