//! Health monitoring
//!
//! Computes a composite 0-100 health score from live store and telemetry
//! snapshots on every cycle, persists a report, and signals the scheduler
//! when the system goes critical so remediation runs immediately. No metric
//! here is synthetic; everything derives from observable state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::config::CoordinationConfig;
use crate::coordination::{Agent, AgentStatus, WorkItem, WorkStatus};
use crate::store::{iso_millis, Collection, Store};
use crate::telemetry::TelemetryEmitter;
use crate::{OperationContext, SwarmResult};

const WEIGHT_COMPLETION: f64 = 0.3;
const WEIGHT_AVAILABILITY: f64 = 0.2;
const WEIGHT_QUEUE: f64 = 0.2;
const WEIGHT_LATENCY: f64 = 0.15;
const WEIGHT_TELEMETRY: f64 = 0.15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Critical => "critical",
        }
    }

    fn from_score(score: u8) -> Self {
        match score {
            70.. => HealthStatus::Healthy,
            50..=69 => HealthStatus::Degraded,
            _ => HealthStatus::Critical,
        }
    }
}

/// Persisted on every monitoring cycle as `health_report_{ts}.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    #[serde(with = "iso_millis")]
    pub generated_at: DateTime<Utc>,
    pub score: u8,
    pub status: HealthStatus,
    pub completion_health: f64,
    pub agent_availability: f64,
    pub queue_pressure: f64,
    pub latency_health: f64,
    pub telemetry_health: f64,
    pub work_total: usize,
    pub work_completed: usize,
    pub work_in_progress: usize,
    pub agents_total: usize,
    pub agents_active: usize,
    pub telemetry_spans: usize,
    pub coordination_latency_ms: f64,
    /// Scheduled-job failures observed since process start.
    pub job_failures: u64,
}

/// Threshold-driven health scorer.
pub struct HealthMonitor {
    store: Arc<Store>,
    telemetry: Arc<TelemetryEmitter>,
    config: Arc<CoordinationConfig>,
    job_failures: AtomicU64,
}

impl HealthMonitor {
    pub fn new(
        store: Arc<Store>,
        telemetry: Arc<TelemetryEmitter>,
        config: Arc<CoordinationConfig>,
    ) -> Self {
        Self {
            store,
            telemetry,
            config,
            job_failures: AtomicU64::new(0),
        }
    }

    /// Called by the scheduler when a job run fails; surfaced in the next
    /// report.
    pub fn record_job_failure(&self) {
        self.job_failures.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("swarmsh_scheduled_job_failures_total", 1);
    }

    /// One monitoring cycle: score, persist, emit.
    #[instrument(skip_all)]
    pub async fn run(&self, ctx: &OperationContext) -> SwarmResult<HealthReport> {
        let mut span = self.telemetry.start_span(ctx, "health.monitor.run");
        match self.collect(ctx).await {
            Ok(report) => {
                metrics::gauge!("swarmsh_health_score", f64::from(report.score));
                span.attr("health.score", report.score.to_string());
                span.attr("health.status", report.status.as_str());
                span.attr("health.job_failures", report.job_failures.to_string());
                span.complete();
                Ok(report)
            }
            Err(e) => {
                span.fail(&e);
                Err(e)
            }
        }
    }

    async fn collect(&self, ctx: &OperationContext) -> SwarmResult<HealthReport> {
        let probe = Instant::now();
        let items = self
            .store
            .read::<WorkItem, _>(Collection::Work, &ctx.cancel, |items| items.to_vec())?;
        let coordination_latency_ms = probe.elapsed().as_secs_f64() * 1000.0;
        let agents = self
            .store
            .read::<Agent, _>(Collection::Agents, &ctx.cancel, |agents| agents.to_vec())?;
        let telemetry_spans = self.telemetry.span_count()?;

        let report = score(
            &items,
            &agents,
            telemetry_spans,
            coordination_latency_ms,
            self.config.max_work_active,
            self.config.max_spans,
            self.job_failures.load(Ordering::Relaxed),
        );

        let path = self.store.write_report(
            &format!("health_report_{}.json", Utc::now().format("%Y%m%d%H%M%S")),
            &report,
        )?;

        if report.status == HealthStatus::Critical {
            warn!(
                score = report.score,
                report = %path.display(),
                "system health critical"
            );
        } else {
            info!(
                score = report.score,
                status = report.status.as_str(),
                report = %path.display(),
                "health cycle complete"
            );
        }
        Ok(report)
    }
}

fn clamp01(v: f64) -> f64 {
    v.clamp(0.0, 1.0)
}

/// Composite score, pure over its inputs. Empty collections score as
/// healthy; pressure only builds from observed state.
pub(crate) fn score(
    items: &[WorkItem],
    agents: &[Agent],
    telemetry_spans: usize,
    coordination_latency_ms: f64,
    target_capacity: usize,
    max_spans: usize,
    job_failures: u64,
) -> HealthReport {
    let work_total = items.len();
    let work_completed = items
        .iter()
        .filter(|w| w.status == WorkStatus::Completed)
        .count();
    let work_in_progress = items
        .iter()
        .filter(|w| matches!(w.status, WorkStatus::Active | WorkStatus::InProgress))
        .count();
    let agents_total = agents.len();
    let agents_active = agents
        .iter()
        .filter(|a| a.status == AgentStatus::Active)
        .count();

    let completion_health = if work_total == 0 {
        1.0
    } else {
        work_completed as f64 / work_total as f64
    };
    let agent_availability = if agents_total == 0 {
        1.0
    } else {
        agents_active as f64 / agents_total as f64
    };
    let queue_pressure = 1.0
        - clamp01(work_in_progress as f64 / target_capacity.max(1) as f64);
    let latency_health = 1.0 - clamp01(coordination_latency_ms / 100.0);
    let telemetry_health = 1.0 - clamp01(telemetry_spans as f64 / max_spans.max(1) as f64);

    let weighted = completion_health * WEIGHT_COMPLETION
        + agent_availability * WEIGHT_AVAILABILITY
        + queue_pressure * WEIGHT_QUEUE
        + latency_health * WEIGHT_LATENCY
        + telemetry_health * WEIGHT_TELEMETRY;
    let score = (weighted * 100.0).round().clamp(0.0, 100.0) as u8;

    HealthReport {
        generated_at: Utc::now(),
        score,
        status: HealthStatus::from_score(score),
        completion_health,
        agent_availability,
        queue_pressure,
        latency_health,
        telemetry_health,
        work_total,
        work_completed,
        work_in_progress,
        agents_total,
        agents_active,
        telemetry_spans,
        coordination_latency_ms,
        job_failures,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::Priority;
    use crate::{AgentId, WorkId};

    fn item(status: WorkStatus) -> WorkItem {
        WorkItem {
            work_id: WorkId(uuid::Uuid::new_v4().simple().to_string()),
            work_type: "feature".to_string(),
            description: String::new(),
            priority: Priority::Medium,
            team: "core".to_string(),
            agent_id: None,
            status,
            progress_percent: 0,
            claimed_at: None,
            updated_at: Utc::now(),
            completed_at: None,
            velocity_points: 0,
            result: None,
            trace_id: "t".repeat(32),
        }
    }

    fn agent(status: AgentStatus) -> Agent {
        Agent {
            agent_id: AgentId(uuid::Uuid::new_v4().simple().to_string()),
            team: "core".to_string(),
            specialization: "general".to_string(),
            capacity_max: 100,
            current_workload: 0,
            status,
            last_heartbeat: Utc::now(),
            performance: Default::default(),
        }
    }

    #[test]
    fn empty_system_scores_healthy() {
        let report = score(&[], &[], 0, 1.0, 100, 10_000, 0);
        assert!(report.score >= 90);
        assert_eq!(report.status, HealthStatus::Healthy);
    }

    #[test]
    fn completed_work_improves_completion_health() {
        let items = vec![item(WorkStatus::Completed), item(WorkStatus::Active)];
        let report = score(&items, &[agent(AgentStatus::Active)], 0, 1.0, 100, 10_000, 0);
        assert!((report.completion_health - 0.5).abs() < 1e-9);
    }

    #[test]
    fn saturated_queue_and_spans_drag_score_down() {
        let items: Vec<WorkItem> = (0..100).map(|_| item(WorkStatus::Active)).collect();
        let report = score(&items, &[agent(AgentStatus::Inactive)], 10_000, 200.0, 100, 10_000, 0);
        assert_eq!(report.queue_pressure, 0.0);
        assert_eq!(report.telemetry_health, 0.0);
        assert_eq!(report.latency_health, 0.0);
        assert_eq!(report.status, HealthStatus::Critical);
    }

    #[test]
    fn status_thresholds() {
        assert_eq!(HealthStatus::from_score(70), HealthStatus::Healthy);
        assert_eq!(HealthStatus::from_score(69), HealthStatus::Degraded);
        assert_eq!(HealthStatus::from_score(50), HealthStatus::Degraded);
        assert_eq!(HealthStatus::from_score(49), HealthStatus::Critical);
    }

    #[test]
    fn telemetry_archival_improves_telemetry_health() {
        let before = score(&[], &[], 12_000, 1.0, 100, 10_000, 0);
        let after = score(&[], &[], 500, 1.0, 100, 10_000, 0);
        assert!(after.telemetry_health > before.telemetry_health);
        assert!(after.score >= before.score);
    }
}
