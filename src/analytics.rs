//! 80/20 analytics engine
//!
//! Extracts observable metrics from shared store snapshots and classifies
//! bottlenecks. The analyzer never mutates coordination state; each rule is
//! a pure function of the snapshot so runs are reproducible. Every run emits
//! one span and persists a metrics report.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::config::{AnalyzerThresholds, CoordinationConfig};
use crate::coordination::{Agent, WorkItem, WorkStatus};
use crate::id::IdMinter;
use crate::store::{iso_millis, Collection, Store};
use crate::telemetry::TelemetryEmitter;
use crate::{OperationContext, SwarmResult};

/// Bottleneck classes the optimizer knows how to act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BottleneckKind {
    AgentOverutilization,
    AgentUnderutilization,
    TeamLoadImbalance,
    PriorityInflation,
    WorkFragmentation,
    CoordinationLatency,
    TelemetryBloat,
    StaleLocks,
}

impl BottleneckKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BottleneckKind::AgentOverutilization => "agent_overutilization",
            BottleneckKind::AgentUnderutilization => "agent_underutilization",
            BottleneckKind::TeamLoadImbalance => "team_load_imbalance",
            BottleneckKind::PriorityInflation => "priority_inflation",
            BottleneckKind::WorkFragmentation => "work_fragmentation",
            BottleneckKind::CoordinationLatency => "coordination_latency",
            BottleneckKind::TelemetryBloat => "telemetry_bloat",
            BottleneckKind::StaleLocks => "stale_locks",
        }
    }
}

/// Severity, ordered so `High > Medium > Low` for ranking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bottleneck {
    pub kind: BottleneckKind,
    pub severity: Severity,
}

/// Output of one analyzer run. All values are computed from live snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisReport {
    #[serde(with = "iso_millis")]
    pub generated_at: DateTime<Utc>,
    pub work_per_agent: f64,
    pub active_work: usize,
    pub completion_rate: f64,
    pub team_load: BTreeMap<String, usize>,
    pub team_load_variance: f64,
    pub team_load_imbalance_ratio: f64,
    pub priority_distribution: BTreeMap<String, usize>,
    pub priority_inflation_ratio: f64,
    pub work_type_fragmentation_ratio: f64,
    pub coordination_latency_ms: f64,
    pub telemetry_volume: usize,
    pub stale_claims: usize,
    /// Ordered worst-first.
    pub bottlenecks: Vec<Bottleneck>,
}

/// Snapshot-driven bottleneck classifier.
pub struct Analyzer {
    store: Arc<Store>,
    telemetry: Arc<TelemetryEmitter>,
    minter: Arc<IdMinter>,
    config: Arc<CoordinationConfig>,
}

impl Analyzer {
    pub fn new(
        store: Arc<Store>,
        telemetry: Arc<TelemetryEmitter>,
        minter: Arc<IdMinter>,
        config: Arc<CoordinationConfig>,
    ) -> Self {
        Self {
            store,
            telemetry,
            minter,
            config,
        }
    }

    /// Run one analysis cycle over shared snapshots.
    #[instrument(skip_all)]
    pub async fn run(&self, ctx: &OperationContext) -> SwarmResult<AnalysisReport> {
        let mut span = self.telemetry.start_span(ctx, "8020.analyzer.run");
        match self.collect(ctx).await {
            Ok(report) => {
                span.attr("analysis.active_work", report.active_work.to_string());
                span.attr("analysis.bottlenecks", report.bottlenecks.len().to_string());
                span.attr(
                    "analysis.telemetry_volume",
                    report.telemetry_volume.to_string(),
                );
                span.complete();
                Ok(report)
            }
            Err(e) => {
                span.fail(&e);
                Err(e)
            }
        }
    }

    async fn collect(&self, ctx: &OperationContext) -> SwarmResult<AnalysisReport> {
        // Coordination latency: a benign locked no-op read plus an ID mint
        // round trip, the cheapest full pass through the store's lock path.
        let probe = Instant::now();
        let _ = self
            .store
            .read::<WorkItem, _>(Collection::Work, &ctx.cancel, |items| items.len())?;
        let _ = self.minter.mint("probe");
        let coordination_latency_ms = probe.elapsed().as_secs_f64() * 1000.0;

        let items = self
            .store
            .read::<WorkItem, _>(Collection::Work, &ctx.cancel, |items| items.to_vec())?;
        let agents = self
            .store
            .read::<Agent, _>(Collection::Agents, &ctx.cancel, |agents| agents.to_vec())?;
        let telemetry_volume = self.telemetry.span_count()?;

        let mut report = compute_metrics(
            &items,
            &agents,
            Utc::now(),
            coordination_latency_ms,
            telemetry_volume,
            self.config.stale_work_ttl,
        );
        report.bottlenecks = classify(&report, &self.config.analyzer);

        let path = self.store.write_report(
            &format!("metrics_{}.json", Utc::now().format("%Y%m%d%H%M%S")),
            &report,
        )?;

        info!(
            active_work = report.active_work,
            work_per_agent = report.work_per_agent,
            bottlenecks = report.bottlenecks.len(),
            report = %path.display(),
            "analysis cycle complete"
        );
        Ok(report)
    }
}

/// Metrics extraction, pure over its inputs.
pub(crate) fn compute_metrics(
    items: &[WorkItem],
    agents: &[Agent],
    now: DateTime<Utc>,
    coordination_latency_ms: f64,
    telemetry_volume: usize,
    stale_ttl: std::time::Duration,
) -> AnalysisReport {
    let total = items.len();
    let active: Vec<&WorkItem> = items
        .iter()
        .filter(|w| matches!(w.status, WorkStatus::Active | WorkStatus::InProgress))
        .collect();
    let completed = items
        .iter()
        .filter(|w| w.status == WorkStatus::Completed)
        .count();

    let mut team_load: BTreeMap<String, usize> = BTreeMap::new();
    for item in &active {
        *team_load.entry(item.team.clone()).or_insert(0) += 1;
    }
    let (team_load_variance, team_load_imbalance_ratio) = load_spread(&team_load);

    let mut priority_distribution: BTreeMap<String, usize> = BTreeMap::new();
    for item in items {
        *priority_distribution
            .entry(item.priority.as_str().to_string())
            .or_insert(0) += 1;
    }
    let inflated = priority_distribution.get("high").copied().unwrap_or(0)
        + priority_distribution.get("critical").copied().unwrap_or(0);
    let priority_inflation_ratio = if total == 0 {
        0.0
    } else {
        inflated as f64 / total as f64
    };

    let distinct_types = items
        .iter()
        .map(|w| w.work_type.as_str())
        .collect::<std::collections::BTreeSet<_>>()
        .len();
    let work_type_fragmentation_ratio = if total == 0 {
        0.0
    } else {
        distinct_types as f64 / total as f64
    };

    let stale_cutoff = now - chrono::Duration::from_std(stale_ttl).unwrap_or_else(|_| chrono::Duration::zero());
    let stale_claims = active
        .iter()
        .filter(|w| w.updated_at < stale_cutoff)
        .count();

    let work_per_agent = if agents.is_empty() {
        0.0
    } else {
        active.len() as f64 / agents.len() as f64
    };

    AnalysisReport {
        generated_at: now,
        work_per_agent,
        active_work: active.len(),
        completion_rate: if total == 0 {
            0.0
        } else {
            completed as f64 / total as f64
        },
        team_load,
        team_load_variance,
        team_load_imbalance_ratio,
        priority_distribution,
        priority_inflation_ratio,
        work_type_fragmentation_ratio,
        coordination_latency_ms,
        telemetry_volume,
        stale_claims,
        bottlenecks: Vec::new(),
    }
}

fn load_spread(team_load: &BTreeMap<String, usize>) -> (f64, f64) {
    if team_load.is_empty() {
        return (0.0, 0.0);
    }
    let counts: Vec<f64> = team_load.values().map(|&c| c as f64).collect();
    let mean = counts.iter().sum::<f64>() / counts.len() as f64;
    let variance = counts.iter().map(|c| (c - mean).powi(2)).sum::<f64>() / counts.len() as f64;
    let max = counts.iter().cloned().fold(0.0f64, f64::max);
    let ratio = if mean > 0.0 { max / mean } else { 0.0 };
    (variance, ratio)
}

/// 80/20 rule set: each rule reads the report, emits at most one bottleneck.
/// Result is ordered worst-first.
pub(crate) fn classify(report: &AnalysisReport, thresholds: &AnalyzerThresholds) -> Vec<Bottleneck> {
    let mut found = Vec::new();

    if report.work_per_agent > thresholds.agent_overutilization {
        found.push(Bottleneck {
            kind: BottleneckKind::AgentOverutilization,
            severity: Severity::High,
        });
    } else if report.active_work > 0 && report.work_per_agent < thresholds.agent_underutilization {
        found.push(Bottleneck {
            kind: BottleneckKind::AgentUnderutilization,
            severity: Severity::Medium,
        });
    }

    if report.team_load_imbalance_ratio > thresholds.team_imbalance_high {
        found.push(Bottleneck {
            kind: BottleneckKind::TeamLoadImbalance,
            severity: Severity::High,
        });
    } else if report.team_load_imbalance_ratio > thresholds.team_imbalance_medium {
        found.push(Bottleneck {
            kind: BottleneckKind::TeamLoadImbalance,
            severity: Severity::Medium,
        });
    }

    if report.priority_inflation_ratio > thresholds.priority_inflation {
        found.push(Bottleneck {
            kind: BottleneckKind::PriorityInflation,
            severity: Severity::Medium,
        });
    }

    if report.work_type_fragmentation_ratio > thresholds.work_fragmentation {
        found.push(Bottleneck {
            kind: BottleneckKind::WorkFragmentation,
            severity: Severity::Low,
        });
    }

    if report.coordination_latency_ms > thresholds.coordination_latency_ms {
        found.push(Bottleneck {
            kind: BottleneckKind::CoordinationLatency,
            severity: Severity::Medium,
        });
    }

    if report.telemetry_volume > thresholds.telemetry_bloat_spans {
        found.push(Bottleneck {
            kind: BottleneckKind::TelemetryBloat,
            severity: Severity::High,
        });
    }

    if report.stale_claims > 0 {
        found.push(Bottleneck {
            kind: BottleneckKind::StaleLocks,
            severity: if report.stale_claims > 5 {
                Severity::High
            } else {
                Severity::Medium
            },
        });
    }

    found.sort_by(|a, b| b.severity.cmp(&a.severity));
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::Priority;
    use crate::{AgentId, WorkId};
    use std::time::Duration;

    fn item(team: &str, status: WorkStatus, priority: Priority, work_type: &str) -> WorkItem {
        WorkItem {
            work_id: WorkId(format!("work_{}_{}", team, uuid::Uuid::new_v4().simple())),
            work_type: work_type.to_string(),
            description: String::new(),
            priority,
            team: team.to_string(),
            agent_id: Some(AgentId("agent_1_test".into())),
            status,
            progress_percent: 0,
            claimed_at: Some(Utc::now()),
            updated_at: Utc::now(),
            completed_at: None,
            velocity_points: 0,
            result: None,
            trace_id: "t".repeat(32),
        }
    }

    fn agent(id: &str) -> Agent {
        Agent {
            agent_id: AgentId(id.to_string()),
            team: "core".to_string(),
            specialization: "general".to_string(),
            capacity_max: 100,
            current_workload: 0,
            status: crate::coordination::AgentStatus::Active,
            last_heartbeat: Utc::now(),
            performance: Default::default(),
        }
    }

    fn thresholds() -> AnalyzerThresholds {
        AnalyzerThresholds::default()
    }

    #[test]
    fn overutilization_flagged_above_two_items_per_agent() {
        let items: Vec<WorkItem> = (0..5)
            .map(|_| item("a", WorkStatus::Active, Priority::Medium, "feature"))
            .collect();
        let agents = vec![agent("agent_1"), agent("agent_2")];
        let report = compute_metrics(&items, &agents, Utc::now(), 1.0, 0, Duration::from_secs(3600));
        assert!(report.work_per_agent > 2.0);

        let bottlenecks = classify(&report, &thresholds());
        assert!(bottlenecks
            .iter()
            .any(|b| b.kind == BottleneckKind::AgentOverutilization && b.severity == Severity::High));
    }

    #[test]
    fn team_imbalance_severity_tiers() {
        let mut report = compute_metrics(&[], &[], Utc::now(), 1.0, 0, Duration::from_secs(1));
        report.team_load_imbalance_ratio = 2.5;
        let medium = classify(&report, &thresholds());
        assert!(medium
            .iter()
            .any(|b| b.kind == BottleneckKind::TeamLoadImbalance && b.severity == Severity::Medium));

        report.team_load_imbalance_ratio = 3.5;
        let high = classify(&report, &thresholds());
        assert!(high
            .iter()
            .any(|b| b.kind == BottleneckKind::TeamLoadImbalance && b.severity == Severity::High));
    }

    #[test]
    fn telemetry_bloat_above_max_spans() {
        let mut report = compute_metrics(&[], &[], Utc::now(), 1.0, 10_001, Duration::from_secs(1));
        report.telemetry_volume = 10_001;
        let bottlenecks = classify(&report, &thresholds());
        assert!(bottlenecks
            .iter()
            .any(|b| b.kind == BottleneckKind::TelemetryBloat && b.severity == Severity::High));
    }

    #[test]
    fn stale_claims_counted_against_ttl() {
        let mut stale = item("a", WorkStatus::Active, Priority::Low, "bug");
        stale.updated_at = Utc::now() - chrono::Duration::hours(25);
        let fresh = item("a", WorkStatus::Active, Priority::Low, "bug");
        let report = compute_metrics(
            &[stale, fresh],
            &[agent("agent_1")],
            Utc::now(),
            1.0,
            0,
            Duration::from_secs(24 * 3600),
        );
        assert_eq!(report.stale_claims, 1);
        let bottlenecks = classify(&report, &thresholds());
        assert!(bottlenecks
            .iter()
            .any(|b| b.kind == BottleneckKind::StaleLocks && b.severity == Severity::Medium));
    }

    #[test]
    fn bottlenecks_ordered_worst_first() {
        let mut report = compute_metrics(&[], &[], Utc::now(), 60.0, 20_000, Duration::from_secs(1));
        report.coordination_latency_ms = 60.0;
        report.telemetry_volume = 20_000;
        let bottlenecks = classify(&report, &thresholds());
        assert!(bottlenecks.len() >= 2);
        for pair in bottlenecks.windows(2) {
            assert!(pair[0].severity >= pair[1].severity);
        }
        assert_eq!(bottlenecks[0].severity, Severity::High);
    }

    #[test]
    fn priority_inflation_ratio_counts_high_and_critical() {
        let items = vec![
            item("a", WorkStatus::Active, Priority::High, "feature"),
            item("a", WorkStatus::Active, Priority::Critical, "feature"),
            item("a", WorkStatus::Active, Priority::Low, "feature"),
        ];
        let report = compute_metrics(
            &items,
            &[agent("agent_1")],
            Utc::now(),
            1.0,
            0,
            Duration::from_secs(3600),
        );
        assert!((report.priority_inflation_ratio - 2.0 / 3.0).abs() < 1e-9);
        let bottlenecks = classify(&report, &thresholds());
        assert!(bottlenecks
            .iter()
            .any(|b| b.kind == BottleneckKind::PriorityInflation));
    }

    #[test]
    fn empty_system_produces_no_bottlenecks() {
        let report = compute_metrics(&[], &[], Utc::now(), 1.0, 0, Duration::from_secs(1));
        // Latency of 1ms is under threshold, nothing else to flag.
        assert!(classify(&report, &thresholds()).is_empty());
    }
}
