use std::path::PathBuf;

use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};

use opswarden::config::AgentConfig;
use opswarden::scheduler::{CronTrigger, RunOutcome};
use opswarden::state::{SqliteStateStore, StateStore};
use opswarden::storage::findings::{FindingStatus, FindingStore};
use opswarden::storage::journal::JournalStore;
use opswarden::storage::tasks::TaskQueue;

#[derive(Parser)]
#[command(
    name = "opswarden",
    about = "Autonomous operational agent: monitor, remediate, report",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (defaults: $OPSWARDEN_CONFIG, /etc/opswarden/opswarden.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the database path from the config file
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (status API + optional in-process trigger)
    Serve {
        /// Bind address
        #[arg(long)]
        bind: Option<String>,
    },

    /// Execute one run now (for cron or systemd timers)
    RunOnce {
        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Show agent state and finding/task counts
    Status {
        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Enable scheduled runs
    Enable,

    /// Disable scheduled runs (takes effect at the next trigger)
    Disable,

    /// List findings
    Findings {
        /// Filter by status: open, actioned, resolved, ignored
        #[arg(long)]
        status: Option<FindingStatus>,

        #[arg(long, default_value = "50")]
        limit: usize,
    },

    /// Show the most recent executive reports
    Reports {
        #[arg(long, default_value = "5")]
        limit: usize,
    },

    /// Preview the in-process trigger's fire times for the next N hours
    DryRun {
        #[arg(long, default_value = "24")]
        hours: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AgentConfig::resolve(cli.config.as_deref())?;
    if let Some(db) = cli.db {
        config.agent.db_path = db;
    }
    opswarden::init_tracing(&config.logging);

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.agent.bind = bind;
            }
            tracing::info!(bind = %config.agent.bind, "Starting opswarden daemon");
            opswarden::serve(config).await?;
        }
        Commands::RunOnce { json } => {
            let agent = opswarden::Agent::open(&config)?;
            let outcome = agent.scheduler.run_once(Utc::now()).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            } else {
                print_outcome(&outcome);
            }
            if matches!(outcome, RunOutcome::Aborted { .. }) {
                std::process::exit(1);
            }
        }
        Commands::Status { json } => {
            let pool = opswarden::storage::open_pool(&config.agent.db_path.to_string_lossy())?;
            let state = SqliteStateStore::new(pool.clone()).load()?;
            let findings = FindingStore::new(pool.clone()).count_by_status()?;
            let tasks = TaskQueue::new(pool).count_by_status()?;
            if json {
                let out = serde_json::json!({ "agent": state, "findings": findings, "tasks": tasks });
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                println!("\n=== opswarden status ===");
                println!("Enabled:      {}", state.enabled);
                match &state.lock {
                    Some(lock) => println!("Run lock:     held by {} since {}", lock.holder, lock.acquired_at),
                    None => println!("Run lock:     free"),
                }
                println!(
                    "Last run:     {} ({})",
                    state.last_run_at.map(|t| t.to_rfc3339()).unwrap_or_else(|| "never".into()),
                    state.last_outcome.as_deref().unwrap_or("-")
                );
                println!("\n{:<12} | Findings", "Status");
                println!("{:-<12}-|-{:-<8}", "", "");
                for (status, n) in &findings {
                    println!("{:<12} | {}", status, n);
                }
                println!("\n{:<12} | Tasks", "Status");
                println!("{:-<12}-|-{:-<8}", "", "");
                for (status, n) in &tasks {
                    println!("{:<12} | {}", status, n);
                }
                println!();
            }
        }
        Commands::Enable => set_enabled(&config, true)?,
        Commands::Disable => set_enabled(&config, false)?,
        Commands::Findings { status, limit } => {
            let pool = opswarden::storage::open_pool(&config.agent.db_path.to_string_lossy())?;
            let findings = FindingStore::new(pool).list(status, limit)?;
            if findings.is_empty() {
                println!("No findings.");
            } else {
                println!("{:<9} | {:<8} | {:<5} | Signature", "Status", "Severity", "Seen");
                println!("{:-<9}-|-{:-<8}-|-{:-<5}-|-{:-<40}", "", "", "", "");
                for f in findings {
                    println!("{:<9} | {:<8} | {:<5} | {}", f.status, f.severity, f.occurrences, f.signature);
                }
            }
        }
        Commands::Reports { limit } => {
            let pool = opswarden::storage::open_pool(&config.agent.db_path.to_string_lossy())?;
            let reports = JournalStore::new(pool).recent_reports(limit)?;
            if reports.is_empty() {
                println!("No reports yet.");
            }
            for r in reports {
                println!("\n=== Run {} ({}) ===", r.run_id, r.generated_at.to_rfc3339());
                println!("{}", r.narrative);
            }
        }
        Commands::DryRun { hours } => {
            let trigger = CronTrigger::new(&config.schedule.cron)?;
            println!("Schedule: {}", trigger.expr());
            for t in trigger.preview(Utc::now(), hours) {
                println!("  {}", t.to_rfc3339());
            }
        }
    }

    Ok(())
}

fn set_enabled(config: &AgentConfig, enabled: bool) -> Result<()> {
    let pool = opswarden::storage::open_pool(&config.agent.db_path.to_string_lossy())?;
    let state = SqliteStateStore::new(pool).set_enabled(enabled, Utc::now())?;
    println!("opswarden {}", if state.enabled { "enabled" } else { "disabled" });
    Ok(())
}

fn print_outcome(outcome: &RunOutcome) {
    match outcome {
        RunOutcome::Disabled => println!("Agent is disabled; nothing to do."),
        RunOutcome::AlreadyRunning { holder, since } => {
            println!("Another run ({holder}) has held the lock since {since}; skipped.")
        }
        RunOutcome::Aborted { run_id, reason } => println!("Run {run_id} aborted: {reason}"),
        RunOutcome::Completed(summary) => {
            println!("\n=== opswarden run {} ===", summary.run_id);
            println!("Findings:   {} ({} new)", summary.findings_detected, summary.findings_created);
            println!("Tasks:      {} opened, {} completed, {} retrying, {} unresolved",
                summary.tasks_opened, summary.tasks_completed, summary.tasks_retrying, summary.tasks_unresolved);
            if let Some(report) = &summary.report {
                println!("\n{}", report.narrative);
            }
            println!();
        }
    }
}
