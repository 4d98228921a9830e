//! Maintenance scheduler
//!
//! Cron-like dispatcher driving the health monitor, the 80/20
//! analyze/optimize loop, work-queue rebalancing, stale-lock cleanup, and
//! archival on fixed cadences. One cooperative loop per job kind: a run
//! finishes or times out before the next of the same kind starts, missed
//! ticks are skipped rather than backfilled, and each kind gets at most one
//! catch-up run at startup. A critical health report advances the next
//! optimization immediately.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{watch, Notify};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

use crate::analytics::Analyzer;
use crate::config::CoordinationConfig;
use crate::health::{HealthMonitor, HealthStatus};
use crate::id::IdMinter;
use crate::isolation::IsolationProvider;
use crate::optimizer::Optimizer;
use crate::telemetry::TelemetryEmitter;
use crate::{OperationContext, SwarmError, SwarmResult, SwarmSystem};

/// Scheduled job kinds, one cooperative loop each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Health,
    WorkQueueRebalance,
    Analyze,
    TelemetryArchive,
    WorkArchive,
    StaleLockCleaner,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Health => "health",
            JobKind::WorkQueueRebalance => "work_queue_rebalance",
            JobKind::Analyze => "analyze_8020",
            JobKind::TelemetryArchive => "telemetry_archive",
            JobKind::WorkArchive => "work_archive",
            JobKind::StaleLockCleaner => "stale_lock_cleaner",
        }
    }
}

/// Periodic maintenance driver over the system components.
pub struct Scheduler {
    analyzer: Arc<Analyzer>,
    optimizer: Arc<Optimizer>,
    health: Arc<HealthMonitor>,
    telemetry: Arc<TelemetryEmitter>,
    minter: Arc<IdMinter>,
    config: Arc<CoordinationConfig>,
    isolation: Arc<dyn IsolationProvider>,
    optimize_now: Notify,
}

impl Scheduler {
    pub fn new(system: &SwarmSystem, isolation: Arc<dyn IsolationProvider>) -> Arc<Self> {
        Arc::new(Self {
            analyzer: system.analyzer.clone(),
            optimizer: system.optimizer.clone(),
            health: system.health_monitor.clone(),
            telemetry: system.telemetry.clone(),
            minter: system.minter.clone(),
            config: system.config.clone(),
            isolation,
            optimize_now: Notify::new(),
        })
    }

    fn interval_for(&self, kind: JobKind) -> Duration {
        let schedule = &self.config.schedule;
        match kind {
            JobKind::Health => schedule.health_interval,
            JobKind::WorkQueueRebalance => schedule.rebalance_interval,
            JobKind::Analyze => schedule.analyze_interval,
            JobKind::TelemetryArchive => schedule.telemetry_archive_interval,
            JobKind::StaleLockCleaner => schedule.stale_lock_interval,
            // Daily job, driven by wall clock rather than an interval.
            JobKind::WorkArchive => Duration::from_secs(24 * 3600),
        }
    }

    /// Run all job loops until `shutdown` flips. Jobs of different kinds run
    /// concurrently on the worker pool; store lock discipline serializes
    /// their mutations.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Result<()> {
        info!("scheduler started");
        let mut tasks = Vec::new();

        for kind in [
            JobKind::Health,
            JobKind::WorkQueueRebalance,
            JobKind::Analyze,
            JobKind::TelemetryArchive,
            JobKind::StaleLockCleaner,
        ] {
            let this = self.clone();
            let mut shutdown = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(this.interval_for(kind));
                interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            this.run_job(kind).await;
                        }
                        _ = this.optimize_now.notified(), if kind == JobKind::WorkQueueRebalance => {
                            debug!("advancing work-queue rebalance on critical health");
                            this.run_job(kind).await;
                        }
                        _ = shutdown.changed() => break,
                    }
                }
            }));
        }

        // Daily work archival: one catch-up run at startup, then at the
        // configured local hour.
        {
            let this = self.clone();
            let mut shutdown = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                this.run_job(JobKind::WorkArchive).await;
                loop {
                    let wait = duration_until_hour(this.config.schedule.work_archive_hour);
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {
                            this.run_job(JobKind::WorkArchive).await;
                        }
                        _ = shutdown.changed() => break,
                    }
                }
            }));
        }

        for result in futures::future::join_all(tasks).await {
            let _ = result;
        }
        info!("scheduler stopped");
        Ok(())
    }

    /// Execute one job with root span, timeout, and failure accounting.
    /// Exposed for the CLI's one-shot maintenance commands and tests.
    #[instrument(skip(self), fields(job = kind.as_str()))]
    pub async fn run_job(&self, kind: JobKind) {
        let ctx = OperationContext::root(&self.minter, self.config.force_trace_id.as_deref());
        let mut span = self
            .telemetry
            .start_span(&ctx, &format!("scheduler.{}", kind.as_str()));
        let child_ctx = ctx.child(span.span_id());

        let timeout = self.config.schedule.job_timeout;
        match tokio::time::timeout(timeout, self.execute(kind, &child_ctx)).await {
            Ok(Ok(())) => {
                debug!(job = kind.as_str(), "scheduled job complete");
                span.complete();
            }
            Ok(Err(e)) => {
                self.health.record_job_failure();
                warn!(job = kind.as_str(), error = %e, "scheduled job failed");
                span.fail(&e);
            }
            Err(_) => {
                self.health.record_job_failure();
                // The job observes cancellation at its next subtask boundary.
                child_ctx.cancel.cancel();
                let e = SwarmError::Internal(format!(
                    "job {} timed out after {}s",
                    kind.as_str(),
                    timeout.as_secs()
                ));
                warn!(job = kind.as_str(), timeout_secs = timeout.as_secs(), "scheduled job timed out");
                span.fail(&e);
            }
        }
    }

    async fn execute(&self, kind: JobKind, ctx: &OperationContext) -> SwarmResult<()> {
        match kind {
            JobKind::Health => {
                let report = self.health.run(ctx).await?;
                if report.status == HealthStatus::Critical {
                    self.optimize_now.notify_one();
                }
            }
            JobKind::WorkQueueRebalance => {
                self.optimizer.rebalance_work_queue(ctx).await?;
            }
            JobKind::Analyze => {
                let report = self.analyzer.run(ctx).await?;
                self.optimizer.run(ctx, &report).await?;
            }
            JobKind::TelemetryArchive => {
                self.telemetry.archive(&ctx.cancel)?;
            }
            JobKind::WorkArchive => {
                // Stage the archive in an isolation slot so external tooling
                // can pick it up without touching the primaries.
                let slot = self
                    .isolation
                    .allocate(&format!("work-archive-{}", chrono::Utc::now().format("%Y%m%d")))?;
                let result = self.optimizer.archive_completed_work(ctx).await;
                if let Err(e) = self.isolation.release(&slot.name) {
                    warn!(slot = %slot.name, error = %e, "isolation slot release failed");
                }
                result?;
            }
            JobKind::StaleLockCleaner => {
                self.optimizer.release_stale_locks(ctx).await?;
            }
        }
        Ok(())
    }
}

/// Time until the next local occurrence of `hour:00`.
fn duration_until_hour(hour: u32) -> Duration {
    let now = chrono::Local::now().naive_local();
    let today = now
        .date()
        .and_hms_opt(hour.min(23), 0, 0)
        .unwrap_or_else(|| now.date().and_hms_opt(3, 0, 0).unwrap());
    let next = if now < today {
        today
    } else {
        today + chrono::Duration::days(1)
    };
    (next - now).to_std().unwrap_or(Duration::from_secs(3600))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_daily_run_is_within_a_day() {
        let wait = duration_until_hour(3);
        assert!(wait <= Duration::from_secs(24 * 3600));
        assert!(wait > Duration::ZERO);
    }

    #[test]
    fn job_kinds_have_stable_names() {
        assert_eq!(JobKind::StaleLockCleaner.as_str(), "stale_lock_cleaner");
        assert_eq!(JobKind::Analyze.as_str(), "analyze_8020");
    }
}
