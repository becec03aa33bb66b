use std::str::FromStr;

use anyhow::Result;
use chrono::{DateTime, Utc};
use cron::Schedule as CronSchedule;
use tokio::sync::watch;
use tracing::{error, info, warn};

use super::Scheduler;

/// In-process trigger: fires `run_once` on a cron schedule.
///
/// Deployments that prefer an external timer (`opswarden run-once` from cron
/// or a systemd timer) leave this off. Either way the run lock makes a second
/// concurrent trigger a no-op.
pub struct CronTrigger {
    expr: String,
    schedule: CronSchedule,
}

impl CronTrigger {
    pub fn new(expr: &str) -> Result<Self> {
        let schedule = CronSchedule::from_str(expr)
            .map_err(|e| anyhow::anyhow!("Invalid cron expression '{}': {}", expr, e))?;
        Ok(Self {
            expr: expr.to_string(),
            schedule,
        })
    }

    pub fn expr(&self) -> &str {
        &self.expr
    }

    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }

    /// Fire times within the next `hours`, for dry-run previews.
    pub fn preview(&self, from: DateTime<Utc>, hours: u64) -> Vec<DateTime<Utc>> {
        let end = from + chrono::Duration::hours(hours as i64);
        self.schedule.after(&from).take_while(|t| *t <= end).collect()
    }

    /// Sleep until each fire time and spawn a run. Returns when `shutdown`
    /// flips to true or the schedule has no further fire times.
    pub async fn run(self, scheduler: Scheduler, mut shutdown: watch::Receiver<bool>) {
        info!(cron = %self.expr, "in-process trigger started");
        loop {
            let now = Utc::now();
            let Some(next) = self.next_after(now) else {
                warn!(cron = %self.expr, "cron schedule has no further fire times, trigger stopped");
                return;
            };
            let wait = (next - now).to_std().unwrap_or_default();

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("in-process trigger stopped");
                        return;
                    }
                    continue;
                }
            }

            // Runs are spawned so a slow run never delays the next tick; the
            // run lock turns overlapping triggers into no-ops.
            let scheduler = scheduler.clone();
            tokio::spawn(async move {
                match scheduler.run_once(Utc::now()).await {
                    Ok(outcome) => info!(outcome = outcome.label(), "scheduled run finished"),
                    Err(e) => error!(error = %e, "scheduled run failed"),
                }
            });
        }
    }
}
