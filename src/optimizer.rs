//! 80/20 optimizer
//!
//! Applies targeted, low-risk mutations that restore balance: agent and team
//! load rebalancing, stale-lock release, telemetry compaction, and terminal
//! work archival. Each mutation runs in a single exclusive store transaction,
//! is preceded by a backup of the touched collections, and emits one audit
//! span per applied change with before/after counts.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::ai_integration::IntelligenceAdvisor;
use crate::analytics::{AnalysisReport, Bottleneck, BottleneckKind, Severity};
use crate::config::CoordinationConfig;
use crate::coordination::{Agent, AgentStatus, WorkItem, WorkStatus};
use crate::store::{Collection, Store};
use crate::telemetry::TelemetryEmitter;
use crate::{OperationContext, SwarmResult};

/// One balance-restoring mutation, as audited.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppliedChange {
    pub action: String,
    pub subject: String,
    pub detail: String,
    pub before: u64,
    pub after: u64,
}

/// Result of one optimization cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationOutcome {
    pub targeted: Vec<Bottleneck>,
    pub applied: Vec<AppliedChange>,
}

/// Severity weight for 80/20 ranking.
fn severity_weight(severity: Severity) -> f64 {
    match severity {
        Severity::High => 3.0,
        Severity::Medium => 2.0,
        Severity::Low => 1.0,
    }
}

/// Relative mutation cost; ranking picks the top bottlenecks by
/// severity x inverse-cost.
fn action_cost(kind: BottleneckKind) -> f64 {
    match kind {
        BottleneckKind::AgentOverutilization | BottleneckKind::AgentUnderutilization => 1.0,
        BottleneckKind::StaleLocks => 1.0,
        BottleneckKind::TelemetryBloat => 1.0,
        BottleneckKind::TeamLoadImbalance => 1.5,
        BottleneckKind::WorkFragmentation => 3.0,
        BottleneckKind::PriorityInflation => 3.0,
        // No direct mutation; remediation is everything else getting cheaper.
        BottleneckKind::CoordinationLatency => 4.0,
    }
}

/// Balance-restoring mutation engine.
pub struct Optimizer {
    store: Arc<Store>,
    telemetry: Arc<TelemetryEmitter>,
    advisor: Arc<IntelligenceAdvisor>,
    config: Arc<CoordinationConfig>,
}

impl Optimizer {
    pub fn new(
        store: Arc<Store>,
        telemetry: Arc<TelemetryEmitter>,
        advisor: Arc<IntelligenceAdvisor>,
        config: Arc<CoordinationConfig>,
    ) -> Self {
        Self {
            store,
            telemetry,
            advisor,
            config,
        }
    }

    /// One full optimization cycle: rank the report's bottlenecks by
    /// severity x inverse-cost, back up the primaries, and apply mutations
    /// for the top two.
    #[instrument(skip_all)]
    pub async fn run(
        &self,
        ctx: &OperationContext,
        report: &AnalysisReport,
    ) -> SwarmResult<OptimizationOutcome> {
        let mut span = self.telemetry.start_span(ctx, "8020.optimizer.run");

        let mut ranked: Vec<Bottleneck> = report.bottlenecks.clone();
        ranked.sort_by(|a, b| {
            let score_a = severity_weight(a.severity) / action_cost(a.kind);
            let score_b = severity_weight(b.severity) / action_cost(b.kind);
            score_b.partial_cmp(&score_a).unwrap_or(std::cmp::Ordering::Equal)
        });
        let targeted: Vec<Bottleneck> = ranked.into_iter().take(2).collect();

        span.attr("optimizer.targeted", targeted.len().to_string());
        if targeted.is_empty() {
            span.complete();
            return Ok(OptimizationOutcome {
                targeted,
                applied: Vec::new(),
            });
        }

        // Advice is recorded for the audit trail; the mutation plan never
        // depends on it.
        if let Some(recommendation) = self.advisor.recommend(report).await {
            span.attr("advisor.action", &recommendation.action);
            span.attr(
                "advisor.confidence",
                format!("{:.2}", recommendation.confidence),
            );
        }

        let child_ctx = ctx.child(span.span_id());
        match self.apply(&child_ctx, report, &targeted).await {
            Ok(applied) => {
                span.attr("optimizer.applied", applied.len().to_string());
                span.complete();
                info!(
                    targeted = targeted.len(),
                    applied = applied.len(),
                    "optimization cycle complete"
                );
                Ok(OptimizationOutcome { targeted, applied })
            }
            Err(e) => {
                span.fail(&e);
                Err(e)
            }
        }
    }

    async fn apply(
        &self,
        ctx: &OperationContext,
        report: &AnalysisReport,
        targeted: &[Bottleneck],
    ) -> SwarmResult<Vec<AppliedChange>> {
        self.store.backup_collection(Collection::Work)?;
        self.store.backup_collection(Collection::Agents)?;

        let mut applied = Vec::new();
        for bottleneck in targeted {
            ctx.cancel.check()?;
            let changes = match bottleneck.kind {
                BottleneckKind::AgentOverutilization
                | BottleneckKind::AgentUnderutilization => {
                    self.rebalance_agent_load(ctx).await?
                }
                BottleneckKind::TeamLoadImbalance => {
                    self.rebalance_team_load(ctx, report.team_load_variance)
                        .await?
                }
                BottleneckKind::StaleLocks => self.release_stale_locks(ctx).await?,
                BottleneckKind::TelemetryBloat => self.compact_telemetry(ctx).await?,
                BottleneckKind::WorkFragmentation | BottleneckKind::PriorityInflation => {
                    // Reported for operators; no safe automated mutation.
                    debug!(kind = bottleneck.kind.as_str(), "bottleneck surfaced without mutation");
                    Vec::new()
                }
                BottleneckKind::CoordinationLatency => {
                    self.archive_completed_work(ctx).await?
                }
            };
            applied.extend(changes);
        }
        Ok(applied)
    }

    /// Scheduled work-queue rebalance: agent load then team load, one
    /// transaction each, with a collection backup up front.
    #[instrument(skip_all)]
    pub async fn rebalance_work_queue(
        &self,
        ctx: &OperationContext,
    ) -> SwarmResult<Vec<AppliedChange>> {
        self.store.backup_collection(Collection::Work)?;
        self.store.backup_collection(Collection::Agents)?;

        let mut applied = self.rebalance_agent_load(ctx).await?;
        applied.extend(
            self.rebalance_team_load(ctx, self.config.optimizer.team_variance_threshold + 1.0)
                .await?,
        );
        Ok(applied)
    }

    /// Move work from the most-loaded agent (above `max_agent_load`) to the
    /// least-loaded one (below `min_agent_load`), earliest claim first, at
    /// most `moves_per_cycle` moves. Recomputes workloads from the work
    /// collection while it is at it.
    async fn rebalance_agent_load(
        &self,
        ctx: &OperationContext,
    ) -> SwarmResult<Vec<AppliedChange>> {
        let limits = self.config.optimizer.clone();
        let changes = self.store.update_pair::<WorkItem, Agent, _>(
            Collection::Work,
            Collection::Agents,
            &ctx.cancel,
            |items, agents| {
                let mut applied = Vec::new();
                for _ in 0..limits.moves_per_cycle {
                    let counts = assigned_counts(items, agents);
                    let Some((most, most_n)) = counts
                        .iter()
                        .max_by_key(|(_, n)| *n)
                        .map(|(a, n)| (a.clone(), *n))
                    else {
                        break;
                    };
                    let Some((least, least_n)) = counts
                        .iter()
                        .min_by_key(|(_, n)| *n)
                        .map(|(a, n)| (a.clone(), *n))
                    else {
                        break;
                    };
                    if most_n <= limits.max_agent_load || least_n >= limits.min_agent_load {
                        break;
                    }

                    let candidate = items
                        .iter_mut()
                        .filter(|w| {
                            !w.status.is_terminal()
                                && w.agent_id.as_ref().map(|a| a.as_str()) == Some(most.as_str())
                        })
                        .min_by_key(|w| w.claimed_at);
                    let Some(item) = candidate else { break };

                    item.agent_id = Some(crate::AgentId(least.clone()));
                    item.updated_at = Utc::now();
                    let moved = item.work_id.0.clone();

                    for agent in agents.iter_mut() {
                        if agent.agent_id.as_str() == most {
                            agent.current_workload = agent.current_workload.saturating_sub(1);
                        } else if agent.agent_id.as_str() == least {
                            agent.current_workload += 1;
                        }
                    }

                    applied.push(AppliedChange {
                        action: "agent_load_rebalance".to_string(),
                        subject: moved,
                        detail: format!("{most} -> {least}"),
                        before: most_n as u64,
                        after: (most_n - 1) as u64,
                    });
                }
                Ok(applied)
            },
        )?;

        for change in &changes {
            let mut span = self.telemetry.start_span(ctx, "optimizer.agent_load_rebalance");
            span.attr("bottleneck.kind", "agent_overutilization");
            span.attr("work.id", &change.subject);
            span.attr("rebalance.move", &change.detail);
            span.attr("load.before", change.before.to_string());
            span.attr("load.after", change.after.to_string());
            span.complete();
        }
        Ok(changes)
    }

    /// Move one work item from the most-loaded team to the least-loaded one
    /// when the load variance is above threshold.
    async fn rebalance_team_load(
        &self,
        ctx: &OperationContext,
        observed_variance: f64,
    ) -> SwarmResult<Vec<AppliedChange>> {
        if observed_variance <= self.config.optimizer.team_variance_threshold {
            return Ok(Vec::new());
        }
        let limits = self.config.optimizer.clone();
        let changes = self.store.update::<WorkItem, _>(
            Collection::Work,
            &ctx.cancel,
            |items| {
                let mut applied = Vec::new();
                for _ in 0..limits.moves_per_cycle {
                    let mut team_load: BTreeMap<String, usize> = BTreeMap::new();
                    for item in items.iter().filter(|w| !w.status.is_terminal()) {
                        *team_load.entry(item.team.clone()).or_insert(0) += 1;
                    }
                    if team_load.len() < 2 {
                        break;
                    }
                    let (most_team, most_n) = team_load
                        .iter()
                        .max_by_key(|(_, n)| *n)
                        .map(|(t, n)| (t.clone(), *n))
                        .unwrap();
                    let (least_team, least_n) = team_load
                        .iter()
                        .min_by_key(|(_, n)| *n)
                        .map(|(t, n)| (t.clone(), *n))
                        .unwrap();
                    if most_n <= least_n + 1 {
                        break;
                    }

                    let candidate = items
                        .iter_mut()
                        .filter(|w| !w.status.is_terminal() && w.team == most_team)
                        .min_by_key(|w| w.claimed_at);
                    let Some(item) = candidate else { break };
                    item.team = least_team.clone();
                    item.updated_at = Utc::now();

                    applied.push(AppliedChange {
                        action: "team_load_rebalance".to_string(),
                        subject: item.work_id.0.clone(),
                        detail: format!("{most_team} -> {least_team}"),
                        before: most_n as u64,
                        after: (most_n - 1) as u64,
                    });
                }
                Ok(applied)
            },
        )?;

        for change in &changes {
            let mut span = self.telemetry.start_span(ctx, "optimizer.team_load_rebalance");
            span.attr("bottleneck.kind", "team_load_imbalance");
            span.attr("work.id", &change.subject);
            span.attr("rebalance.move", &change.detail);
            span.attr("load.before", change.before.to_string());
            span.attr("load.after", change.after.to_string());
            span.complete();
        }
        Ok(changes)
    }

    /// Release claims whose last update is older than the stale TTL and mark
    /// agents with equally old heartbeats inactive.
    #[instrument(skip_all)]
    pub async fn release_stale_locks(
        &self,
        ctx: &OperationContext,
    ) -> SwarmResult<Vec<AppliedChange>> {
        let ttl = self.config.stale_work_ttl;
        let cutoff = Utc::now() - chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero());

        self.store.backup_collection(Collection::Work)?;
        let changes = self.store.update_pair::<WorkItem, Agent, _>(
            Collection::Work,
            Collection::Agents,
            &ctx.cancel,
            |items, agents| {
                let mut applied = Vec::new();
                for item in items.iter_mut() {
                    if !matches!(item.status, WorkStatus::Active | WorkStatus::InProgress) {
                        continue;
                    }
                    if item.updated_at >= cutoff {
                        continue;
                    }
                    let previous_owner = item.agent_id.take();
                    let from = item.status;
                    item.status = WorkStatus::Pending;
                    item.updated_at = Utc::now();
                    if let Some(owner) = &previous_owner {
                        if let Some(agent) = agents.iter_mut().find(|a| a.agent_id == *owner) {
                            agent.current_workload = agent.current_workload.saturating_sub(1);
                        }
                    }
                    applied.push(AppliedChange {
                        action: "stale_lock_release".to_string(),
                        subject: item.work_id.0.clone(),
                        detail: format!(
                            "{} ({})",
                            from.as_str(),
                            previous_owner
                                .map(|a| a.0)
                                .unwrap_or_else(|| "unassigned".to_string())
                        ),
                        before: 1,
                        after: 0,
                    });
                }

                for agent in agents.iter_mut() {
                    if agent.status == AgentStatus::Active && agent.last_heartbeat < cutoff {
                        agent.status = AgentStatus::Inactive;
                        applied.push(AppliedChange {
                            action: "stale_agent_deactivation".to_string(),
                            subject: agent.agent_id.0.clone(),
                            detail: "active -> inactive".to_string(),
                            before: 1,
                            after: 0,
                        });
                    }
                }
                Ok(applied)
            },
        )?;

        for change in &changes {
            let operation = match change.action.as_str() {
                "stale_lock_release" => "optimizer.stale_lock_release",
                _ => "optimizer.stale_agent_deactivation",
            };
            let mut span = self.telemetry.start_span(ctx, operation);
            span.attr("bottleneck.kind", "stale_locks");
            span.attr("subject", &change.subject);
            span.attr("detail", &change.detail);
            span.complete();
        }
        if !changes.is_empty() {
            info!(released = changes.len(), "stale lock cleanup applied");
        }
        Ok(changes)
    }

    /// Delegate span-log compaction to the telemetry archival routine.
    async fn compact_telemetry(&self, ctx: &OperationContext) -> SwarmResult<Vec<AppliedChange>> {
        let before = self.telemetry.span_count()?;
        let outcome = self.telemetry.archive(&ctx.cancel)?;
        if outcome.archived == 0 {
            return Ok(Vec::new());
        }
        let change = AppliedChange {
            action: "telemetry_compaction".to_string(),
            subject: outcome
                .archive_path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("archive")
                .to_string(),
            detail: format!("archived {} spans", outcome.archived),
            before: before as u64,
            after: outcome.retained as u64,
        };
        let mut span = self.telemetry.start_span(ctx, "optimizer.telemetry_compaction");
        span.attr("bottleneck.kind", "telemetry_bloat");
        span.attr("spans.before", change.before.to_string());
        span.attr("spans.after", change.after.to_string());
        span.complete();
        Ok(vec![change])
    }

    /// Move terminal work items older than the archive window into
    /// `archives/completed_{date}.json`, keeping the primary collection
    /// lean. Archive contents are merged by work ID so a crash between the
    /// archive write and the primary rewrite cannot lose or duplicate
    /// history.
    #[instrument(skip_all)]
    pub async fn archive_completed_work(
        &self,
        ctx: &OperationContext,
    ) -> SwarmResult<Vec<AppliedChange>> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.work_archive_after).unwrap_or_else(|_| chrono::Duration::zero());

        let candidates: Vec<WorkItem> = self
            .store
            .read::<WorkItem, _>(Collection::Work, &ctx.cancel, |items| {
                items
                    .iter()
                    .filter(|w| {
                        w.status.is_terminal()
                            && w.completed_at.map(|t| t < cutoff).unwrap_or(false)
                    })
                    .cloned()
                    .collect()
            })?;
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let archive_path = self
            .store
            .archives_dir()
            .join(format!("completed_{}.json", Utc::now().format("%Y%m%d")));
        let mut archived: Vec<WorkItem> = match std::fs::read(&archive_path) {
            Ok(raw) => serde_json::from_slice(&raw).unwrap_or_default(),
            Err(_) => Vec::new(),
        };
        for item in &candidates {
            if !archived.iter().any(|a| a.work_id == item.work_id) {
                archived.push(item.clone());
            }
        }
        let payload = serde_json::to_vec_pretty(&archived)
            .map_err(|e| crate::SwarmError::Internal(format!("serialize archive: {e}")))?;
        std::fs::write(&archive_path, payload)?;

        let before = self
            .store
            .update::<WorkItem, _>(Collection::Work, &ctx.cancel, |items| {
                let before = items.len();
                items.retain(|w| !candidates.iter().any(|c| c.work_id == w.work_id));
                Ok(before)
            })?;

        let change = AppliedChange {
            action: "work_archival".to_string(),
            subject: archive_path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("archive")
                .to_string(),
            detail: format!("archived {} terminal items", candidates.len()),
            before: before as u64,
            after: (before - candidates.len()) as u64,
        };
        let mut span = self.telemetry.start_span(ctx, "optimizer.work_archival");
        span.attr("work.archived", candidates.len().to_string());
        span.attr("work.remaining", change.after.to_string());
        span.complete();

        info!(
            archived = candidates.len(),
            archive = %archive_path.display(),
            "terminal work archived"
        );
        Ok(vec![change])
    }
}

/// Active item counts per registered agent, work collection as the source
/// of truth.
fn assigned_counts(items: &[WorkItem], agents: &[Agent]) -> Vec<(String, usize)> {
    let mut counts: Vec<(String, usize)> = agents
        .iter()
        .filter(|a| a.status != AgentStatus::Draining)
        .map(|a| (a.agent_id.0.clone(), 0usize))
        .collect();
    for item in items
        .iter()
        .filter(|w| matches!(w.status, WorkStatus::Active | WorkStatus::InProgress))
    {
        if let Some(owner) = &item.agent_id {
            if let Some(entry) = counts.iter_mut().find(|(id, _)| id == owner.as_str()) {
                entry.1 += 1;
            }
        }
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::Priority;
    use crate::{AgentId, WorkId};

    fn agent(id: &str, workload: u32) -> Agent {
        Agent {
            agent_id: AgentId(id.to_string()),
            team: "core".to_string(),
            specialization: "general".to_string(),
            capacity_max: 100,
            current_workload: workload,
            status: AgentStatus::Active,
            last_heartbeat: Utc::now(),
            performance: Default::default(),
        }
    }

    fn active_item(id: &str, owner: &str) -> WorkItem {
        WorkItem {
            work_id: WorkId(id.to_string()),
            work_type: "feature".to_string(),
            description: String::new(),
            priority: Priority::Medium,
            team: "core".to_string(),
            agent_id: Some(AgentId(owner.to_string())),
            status: WorkStatus::Active,
            progress_percent: 0,
            claimed_at: Some(Utc::now()),
            updated_at: Utc::now(),
            completed_at: None,
            velocity_points: 0,
            result: None,
            trace_id: "t".repeat(32),
        }
    }

    #[test]
    fn assigned_counts_recomputes_from_work_collection() {
        let agents = vec![agent("a1", 99), agent("a2", 0)];
        let items = vec![
            active_item("w1", "a1"),
            active_item("w2", "a1"),
            active_item("w3", "a2"),
        ];
        let counts = assigned_counts(&items, &agents);
        assert_eq!(counts, vec![("a1".to_string(), 2), ("a2".to_string(), 1)]);
    }

    #[test]
    fn ranking_prefers_high_severity_cheap_actions() {
        let stale = Bottleneck {
            kind: BottleneckKind::StaleLocks,
            severity: Severity::Medium,
        };
        let fragmentation = Bottleneck {
            kind: BottleneckKind::WorkFragmentation,
            severity: Severity::Low,
        };
        let score_stale = severity_weight(stale.severity) / action_cost(stale.kind);
        let score_frag = severity_weight(fragmentation.severity) / action_cost(fragmentation.kind);
        assert!(score_stale > score_frag);
    }
}
