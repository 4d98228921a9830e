//! Coordination engine with atomic work claiming
//!
//! Implements the claim/progress/complete/register state machine over the
//! file-backed store. Every operation is a locked read-modify-write with a
//! wait timeout, emits exactly one telemetry span, and appends an audit
//! record to the coordination log. Retryable failures (lock timeout, lost
//! race) are retried with backoff while preserving the caller's trace ID.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::config::CoordinationConfig;
use crate::id::IdMinter;
use crate::store::{iso_millis, iso_millis_opt, Collection, Store};
use crate::telemetry::TelemetryEmitter;
use crate::{AgentId, OperationContext, SwarmError, SwarmResult, WorkId};

/// Work priority levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = SwarmError;

    fn from_str(s: &str) -> SwarmResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "medium" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            other => Err(SwarmError::Validation {
                field: "priority".to_string(),
                reason: format!("unknown priority {other:?}"),
            }),
        }
    }
}

/// Work item lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    Pending,
    Active,
    InProgress,
    Completed,
    Failed,
}

impl WorkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkStatus::Pending => "pending",
            WorkStatus::Active => "active",
            WorkStatus::InProgress => "in_progress",
            WorkStatus::Completed => "completed",
            WorkStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkStatus::Completed | WorkStatus::Failed)
    }

    /// Legal transitions of the work state machine. `release` edges
    /// (back to pending) are optimizer-only and enforced at the call sites.
    pub fn can_transition_to(&self, to: WorkStatus) -> bool {
        use WorkStatus::*;
        match (self, to) {
            (Pending, Active) => true,
            (Active, InProgress | Completed | Failed | Pending) => true,
            (InProgress, InProgress | Completed | Failed | Pending) => true,
            // Progress updates may keep the claim in `active`.
            (Active, Active) => true,
            _ => false,
        }
    }
}

impl std::str::FromStr for WorkStatus {
    type Err = SwarmError;

    fn from_str(s: &str) -> SwarmResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(WorkStatus::Pending),
            "active" => Ok(WorkStatus::Active),
            "in_progress" => Ok(WorkStatus::InProgress),
            "completed" => Ok(WorkStatus::Completed),
            "failed" => Ok(WorkStatus::Failed),
            other => Err(SwarmError::Validation {
                field: "status".to_string(),
                reason: format!("unknown status {other:?}"),
            }),
        }
    }
}

/// A unit of coordinated work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub work_id: WorkId,
    pub work_type: String,
    pub description: String,
    pub priority: Priority,
    pub team: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub agent_id: Option<AgentId>,
    pub status: WorkStatus,
    pub progress_percent: u8,
    #[serde(
        with = "iso_millis_opt",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub claimed_at: Option<DateTime<Utc>>,
    #[serde(with = "iso_millis")]
    pub updated_at: DateTime<Utc>,
    #[serde(
        with = "iso_millis_opt",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub velocity_points: u32,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub result: Option<String>,
    /// Trace under which the item was claimed, for correlation.
    pub trace_id: String,
}

/// Registered worker status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Active,
    Inactive,
    Draining,
}

/// A registered worker identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub agent_id: AgentId,
    pub team: String,
    pub specialization: String,
    pub capacity_max: u32,
    pub current_workload: u32,
    pub status: AgentStatus,
    #[serde(with = "iso_millis")]
    pub last_heartbeat: DateTime<Utc>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub performance: BTreeMap<String, u64>,
}

/// Append-only audit record for every coordination transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationLogEntry {
    pub trace_id: String,
    pub span_id: String,
    pub actor: String,
    pub action: String,
    pub target: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub from_state: Option<String>,
    pub to_state: String,
    #[serde(with = "iso_millis")]
    pub at: DateTime<Utc>,
}

/// Compact fast-path record appended on every successful claim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FastClaimRecord {
    pub work_id: WorkId,
    pub agent_id: AgentId,
    pub work_type: String,
    pub team: String,
    pub claimed_at_ns: u64,
    pub trace_id: String,
}

/// Read-only aggregation served by the `dashboard` command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardSnapshot {
    pub agents_total: usize,
    pub agents_active: usize,
    pub work_total: usize,
    pub work_pending: usize,
    pub work_active: usize,
    pub work_completed: usize,
    pub work_failed: usize,
    pub team_load: BTreeMap<String, usize>,
    pub work_conflicts: u64,
    pub telemetry_spans: usize,
}

/// The claim/progress/complete/register state machine over the store.
pub struct CoordinationEngine {
    store: Arc<Store>,
    telemetry: Arc<TelemetryEmitter>,
    minter: Arc<IdMinter>,
    config: Arc<CoordinationConfig>,
    work_conflicts: AtomicU64,
}

impl CoordinationEngine {
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
            work_conflicts: AtomicU64::new(0),
        }
    }

    /// Lock-timeout and lost-race events observed by this engine.
    pub fn work_conflicts(&self) -> u64 {
        self.work_conflicts.load(Ordering::Relaxed)
    }

    /// Retry a store mutation on retryable errors with exponential backoff,
    /// preserving the original trace. Every retryable event bumps the
    /// conflict counter, surfaced or not.
    async fn with_retries<T>(
        &self,
        ctx: &OperationContext,
        mut f: impl FnMut() -> SwarmResult<T>,
    ) -> SwarmResult<T> {
        let mut attempt: u32 = 0;
        loop {
            ctx.cancel.check()?;
            match f() {
                Err(e) if e.is_retryable() => {
                    self.work_conflicts.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("swarmsh_work_conflicts_total", 1);
                    if attempt >= self.config.max_retries {
                        return Err(e);
                    }
                    let backoff = self.config.retry_backoff * 2u32.saturating_pow(attempt);
                    warn!(
                        trace_id = %ctx.trace_id,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "retrying coordination mutation"
                    );
                    attempt += 1;
                    tokio::time::sleep(backoff).await;
                }
                other => return other,
            }
        }
    }

    fn append_audit(
        &self,
        ctx: &OperationContext,
        span_id: &str,
        action: &str,
        target: &str,
        from_state: Option<&str>,
        to_state: &str,
    ) {
        let entry = CoordinationLogEntry {
            trace_id: ctx.trace_id.clone(),
            span_id: span_id.to_string(),
            actor: ctx
                .agent_id
                .as_ref()
                .map(|a| a.0.clone())
                .unwrap_or_else(|| "system".to_string()),
            action: action.to_string(),
            target: target.to_string(),
            from_state: from_state.map(str::to_string),
            to_state: to_state.to_string(),
            at: Utc::now(),
        };
        // Audit failures are logged, never fatal to the primary operation.
        let result = self
            .store
            .update::<CoordinationLogEntry, _>(Collection::Log, &ctx.cancel, |entries| {
                entries.push(entry.clone());
                Ok(())
            });
        if let Err(e) = result {
            warn!(error = %e, action, target, "coordination log append failed");
        }
    }

    /// Register a worker identity.
    #[instrument(skip_all, fields(agent_id = %agent_id, team = %team))]
    pub async fn register(
        &self,
        ctx: &OperationContext,
        agent_id: AgentId,
        team: &str,
        capacity: u32,
        specialization: &str,
    ) -> SwarmResult<Agent> {
        let mut span = self.telemetry.start_span(ctx, "coordination.register");
        span.attr("agent.id", agent_id.as_str());
        span.attr("agent.team", team);

        let result = self
            .with_retries(ctx, || {
                if capacity == 0 {
                    return Err(SwarmError::Validation {
                        field: "capacity".to_string(),
                        reason: "capacity must be positive".to_string(),
                    });
                }
                let agent = Agent {
                    agent_id: agent_id.clone(),
                    team: team.to_string(),
                    specialization: specialization.to_string(),
                    capacity_max: capacity,
                    current_workload: 0,
                    status: AgentStatus::Active,
                    last_heartbeat: Utc::now(),
                    performance: BTreeMap::new(),
                };
                self.store
                    .update::<Agent, _>(Collection::Agents, &ctx.cancel, |agents| {
                        if agents.iter().any(|a| a.agent_id == agent.agent_id) {
                            return Err(SwarmError::DuplicateAgent {
                                agent_id: agent.agent_id.0.clone(),
                            });
                        }
                        agents.push(agent.clone());
                        Ok(agent.clone())
                    })
            })
            .await;

        match result {
            Ok(agent) => {
                metrics::counter!("swarmsh_agent_registrations_total", 1);
                self.append_audit(ctx, span.span_id(), "register", agent.agent_id.as_str(), None, "active");
                info!(agent_id = %agent.agent_id, team = %agent.team, "agent registered");
                span.complete();
                Ok(agent)
            }
            Err(e) => {
                span.fail(&e);
                Err(e)
            }
        }
    }

    /// Atomically create and claim a new work item for the calling agent.
    /// The item starts in `active`, assigned to the ambient agent.
    #[instrument(skip_all, fields(work_type = %work_type, team = %team))]
    pub async fn claim(
        &self,
        ctx: &OperationContext,
        work_type: &str,
        description: &str,
        priority: Priority,
        team: &str,
    ) -> SwarmResult<WorkItem> {
        let mut span = self.telemetry.start_span(ctx, "coordination.claim");
        span.attr("work.type", work_type);
        span.attr("work.priority", priority.as_str());
        span.attr("work.team", team);

        let caller = match ctx.agent_id.clone() {
            Some(agent_id) => agent_id,
            None => {
                let e = SwarmError::NoAgentContext;
                span.fail(&e);
                return Err(e);
            }
        };
        span.attr("agent.id", caller.as_str());

        let work_id = self.minter.mint_work_id();
        let trace_id = ctx.trace_id.clone();
        let result = self
            .with_retries(ctx, || {
                let caller = caller.clone();
                let work_id = work_id.clone();
                let trace_id = trace_id.clone();
                self.store.update_pair::<WorkItem, Agent, _>(
                    Collection::Work,
                    Collection::Agents,
                    &ctx.cancel,
                    |items, agents| {
                        let agent = agents
                            .iter_mut()
                            .find(|a| a.agent_id == caller)
                            .ok_or_else(|| SwarmError::NotFound {
                                kind: "agent",
                                id: caller.0.clone(),
                            })?;
                        if agent.current_workload >= agent.capacity_max {
                            return Err(SwarmError::AgentAtCapacity {
                                agent_id: agent.agent_id.0.clone(),
                                current: agent.current_workload,
                                max: agent.capacity_max,
                            });
                        }
                        let now = Utc::now();
                        let item = WorkItem {
                            work_id: work_id.clone(),
                            work_type: work_type.to_string(),
                            description: description.to_string(),
                            priority,
                            team: team.to_string(),
                            agent_id: Some(caller.clone()),
                            status: WorkStatus::Active,
                            progress_percent: 0,
                            claimed_at: Some(now),
                            updated_at: now,
                            completed_at: None,
                            velocity_points: 0,
                            result: None,
                            trace_id,
                        };
                        agent.current_workload += 1;
                        agent.last_heartbeat = now;
                        items.push(item.clone());
                        Ok(item)
                    },
                )
            })
            .await;

        match result {
            Ok(item) => {
                let fast = FastClaimRecord {
                    work_id: item.work_id.clone(),
                    agent_id: caller.clone(),
                    work_type: item.work_type.clone(),
                    team: item.team.clone(),
                    claimed_at_ns: IdMinter::wall_nanos(),
                    trace_id: ctx.trace_id.clone(),
                };
                if let Err(e) =
                    self.store
                        .append_jsonl(&self.store.fast_claims_path(), &fast, &ctx.cancel)
                {
                    warn!(error = %e, "fast-path claim append failed");
                }
                metrics::counter!("swarmsh_work_items_claimed_total", 1);
                self.append_audit(ctx, span.span_id(), "claim", item.work_id.as_str(), Some("pending"), "active");
                info!(work_id = %item.work_id, agent_id = %caller, "work claimed");
                span.attr("work.id", item.work_id.as_str());
                span.complete();
                Ok(item)
            }
            Err(e) => {
                span.attr("work.conflicts", self.work_conflicts().to_string());
                span.fail(&e);
                Err(e)
            }
        }
    }

    /// Update progress on an owned work item. Defaults the status to
    /// `in_progress` when the caller does not supply one.
    #[instrument(skip_all, fields(work_id = %work_id, percent = percent))]
    pub async fn progress(
        &self,
        ctx: &OperationContext,
        work_id: &WorkId,
        percent: u8,
        status: Option<WorkStatus>,
    ) -> SwarmResult<WorkItem> {
        let mut span = self.telemetry.start_span(ctx, "coordination.progress");
        span.attr("work.id", work_id.as_str());
        span.attr("work.progress_percent", percent.to_string());

        let result = self
            .with_retries(ctx, || {
                if percent > 100 {
                    return Err(SwarmError::Validation {
                        field: "percent".to_string(),
                        reason: format!("{percent} outside 0-100"),
                    });
                }
                let caller = ctx.agent_id.clone().ok_or(SwarmError::NoAgentContext)?;
                let target = status.unwrap_or(WorkStatus::InProgress);
                self.store
                    .update::<WorkItem, _>(Collection::Work, &ctx.cancel, |items| {
                        let item = items
                            .iter_mut()
                            .find(|w| w.work_id == *work_id)
                            .ok_or_else(|| SwarmError::NotFound {
                                kind: "work item",
                                id: work_id.0.clone(),
                            })?;
                        if item.agent_id.as_ref() != Some(&caller) {
                            return Err(SwarmError::OwnershipViolation {
                                agent_id: caller.0.clone(),
                                work_id: item.work_id.0.clone(),
                            });
                        }
                        if !item.status.can_transition_to(target) || target.is_terminal() {
                            return Err(SwarmError::InvalidTransition {
                                work_id: item.work_id.0.clone(),
                                from: item.status.as_str().to_string(),
                                to: target.as_str().to_string(),
                            });
                        }
                        item.status = target;
                        item.progress_percent = percent;
                        item.updated_at = Utc::now();
                        Ok(item.clone())
                    })
            })
            .await;

        match result {
            Ok(item) => {
                self.append_audit(
                    ctx,
                    span.span_id(),
                    "progress",
                    item.work_id.as_str(),
                    None,
                    item.status.as_str(),
                );
                debug!(work_id = %item.work_id, percent, "progress recorded");
                span.complete();
                Ok(item)
            }
            Err(e) => {
                span.fail(&e);
                Err(e)
            }
        }
    }

    /// Terminal transition for an owned work item.
    ///
    /// The result string `"failed"` marks the item failed; anything else
    /// completes it. Completing an already-completed item with identical
    /// result and velocity is an idempotent no-op success.
    #[instrument(skip_all, fields(work_id = %work_id, velocity_points = velocity_points))]
    pub async fn complete(
        &self,
        ctx: &OperationContext,
        work_id: &WorkId,
        result: Option<String>,
        velocity_points: u32,
    ) -> SwarmResult<WorkItem> {
        let mut span = self.telemetry.start_span(ctx, "coordination.complete");
        span.attr("work.id", work_id.as_str());
        span.attr("work.velocity_points", velocity_points.to_string());

        let outcome = self
            .with_retries(ctx, || {
                let caller = ctx.agent_id.clone().ok_or(SwarmError::NoAgentContext)?;
                let result = result.clone();
                let terminal = if result.as_deref() == Some("failed") {
                    WorkStatus::Failed
                } else {
                    WorkStatus::Completed
                };
                self.store.update_pair::<WorkItem, Agent, _>(
                    Collection::Work,
                    Collection::Agents,
                    &ctx.cancel,
                    |items, agents| {
                        let item = items
                            .iter_mut()
                            .find(|w| w.work_id == *work_id)
                            .ok_or_else(|| SwarmError::NotFound {
                                kind: "work item",
                                id: work_id.0.clone(),
                            })?;
                        if item.status.is_terminal() {
                            // Idempotent completion: identical args are a
                            // no-op success, anything else is rejected.
                            if item.status == terminal
                                && item.result == result
                                && item.velocity_points == velocity_points
                            {
                                return Ok(item.clone());
                            }
                            return Err(SwarmError::AlreadyTerminal {
                                work_id: item.work_id.0.clone(),
                            });
                        }
                        if item.agent_id.as_ref() != Some(&caller) {
                            return Err(SwarmError::OwnershipViolation {
                                agent_id: caller.0.clone(),
                                work_id: item.work_id.0.clone(),
                            });
                        }
                        if !item.status.can_transition_to(terminal) {
                            return Err(SwarmError::InvalidTransition {
                                work_id: item.work_id.0.clone(),
                                from: item.status.as_str().to_string(),
                                to: terminal.as_str().to_string(),
                            });
                        }
                        let now = Utc::now();
                        item.status = terminal;
                        if terminal == WorkStatus::Completed {
                            item.progress_percent = 100;
                        }
                        item.velocity_points = velocity_points;
                        item.result = result.clone();
                        item.updated_at = now;
                        item.completed_at = Some(now);

                        if let Some(agent) = agents.iter_mut().find(|a| a.agent_id == caller) {
                            agent.current_workload = agent.current_workload.saturating_sub(1);
                            agent.last_heartbeat = now;
                            *agent
                                .performance
                                .entry("work_completed".to_string())
                                .or_insert(0) += 1;
                            *agent
                                .performance
                                .entry("velocity_points".to_string())
                                .or_insert(0) += u64::from(velocity_points);
                        }
                        Ok(item.clone())
                    },
                )
            })
            .await;

        match outcome {
            Ok(item) => {
                metrics::counter!("swarmsh_work_items_completed_total", 1);
                self.append_audit(
                    ctx,
                    span.span_id(),
                    "complete",
                    item.work_id.as_str(),
                    None,
                    item.status.as_str(),
                );
                info!(work_id = %item.work_id, status = item.status.as_str(), "work completed");
                span.attr("work.status", item.status.as_str());
                span.complete();
                Ok(item)
            }
            Err(e) => {
                span.fail(&e);
                Err(e)
            }
        }
    }

    /// Return a claimed item to the pending pool, clearing its assignment.
    /// Rebalancing/stale-lock path; no ownership check.
    #[instrument(skip_all, fields(work_id = %work_id))]
    pub async fn release(
        &self,
        ctx: &OperationContext,
        work_id: &WorkId,
    ) -> SwarmResult<WorkItem> {
        let mut span = self.telemetry.start_span(ctx, "coordination.release");
        span.attr("work.id", work_id.as_str());

        let result = self
            .with_retries(ctx, || {
                self.store.update_pair::<WorkItem, Agent, _>(
                    Collection::Work,
                    Collection::Agents,
                    &ctx.cancel,
                    |items, agents| {
                        let item = items
                            .iter_mut()
                            .find(|w| w.work_id == *work_id)
                            .ok_or_else(|| SwarmError::NotFound {
                                kind: "work item",
                                id: work_id.0.clone(),
                            })?;
                        if item.status.is_terminal() {
                            return Err(SwarmError::AlreadyTerminal {
                                work_id: item.work_id.0.clone(),
                            });
                        }
                        let previous_owner = item.agent_id.take();
                        item.status = WorkStatus::Pending;
                        item.updated_at = Utc::now();
                        if let Some(owner) = previous_owner {
                            if let Some(agent) = agents.iter_mut().find(|a| a.agent_id == owner) {
                                agent.current_workload = agent.current_workload.saturating_sub(1);
                            }
                        }
                        Ok(item.clone())
                    },
                )
            })
            .await;

        match result {
            Ok(item) => {
                self.append_audit(ctx, span.span_id(), "release", item.work_id.as_str(), None, "pending");
                info!(work_id = %item.work_id, "work released to pending pool");
                span.complete();
                Ok(item)
            }
            Err(e) => {
                span.fail(&e);
                Err(e)
            }
        }
    }

    /// Hand a pending item to a specific agent. Losing a race for the same
    /// item surfaces as a store conflict after internal retries.
    #[instrument(skip_all, fields(work_id = %work_id, new_agent = %new_agent_id))]
    pub async fn reassign(
        &self,
        ctx: &OperationContext,
        work_id: &WorkId,
        new_agent_id: &AgentId,
    ) -> SwarmResult<WorkItem> {
        let mut span = self.telemetry.start_span(ctx, "coordination.reassign");
        span.attr("work.id", work_id.as_str());
        span.attr("agent.id", new_agent_id.as_str());

        let result = self
            .with_retries(ctx, || {
                self.store.update_pair::<WorkItem, Agent, _>(
                    Collection::Work,
                    Collection::Agents,
                    &ctx.cancel,
                    |items, agents| {
                        let item = items
                            .iter_mut()
                            .find(|w| w.work_id == *work_id)
                            .ok_or_else(|| SwarmError::NotFound {
                                kind: "work item",
                                id: work_id.0.clone(),
                            })?;
                        if item.status.is_terminal() {
                            return Err(SwarmError::AlreadyTerminal {
                                work_id: item.work_id.0.clone(),
                            });
                        }
                        if item.status != WorkStatus::Pending {
                            // Someone else won the claim race.
                            return Err(SwarmError::StoreConflict {
                                collection: Collection::Work.name().to_string(),
                            });
                        }
                        let agent = agents
                            .iter_mut()
                            .find(|a| a.agent_id == *new_agent_id)
                            .ok_or_else(|| SwarmError::NotFound {
                                kind: "agent",
                                id: new_agent_id.0.clone(),
                            })?;
                        if agent.current_workload >= agent.capacity_max {
                            return Err(SwarmError::AgentAtCapacity {
                                agent_id: agent.agent_id.0.clone(),
                                current: agent.current_workload,
                                max: agent.capacity_max,
                            });
                        }
                        let now = Utc::now();
                        item.agent_id = Some(agent.agent_id.clone());
                        item.status = WorkStatus::Active;
                        item.claimed_at = Some(now);
                        item.updated_at = now;
                        agent.current_workload += 1;
                        Ok(item.clone())
                    },
                )
            })
            .await;

        match result {
            Ok(item) => {
                self.append_audit(
                    ctx,
                    span.span_id(),
                    "reassign",
                    item.work_id.as_str(),
                    Some("pending"),
                    "active",
                );
                span.complete();
                Ok(item)
            }
            Err(e) => {
                span.attr("work.conflicts", self.work_conflicts().to_string());
                span.fail(&e);
                Err(e)
            }
        }
    }

    /// Refresh a worker's liveness timestamp.
    #[instrument(skip_all, fields(agent_id = %agent_id))]
    pub async fn heartbeat(
        &self,
        ctx: &OperationContext,
        agent_id: &AgentId,
    ) -> SwarmResult<Agent> {
        self.with_retries(ctx, || {
            self.store
                .update::<Agent, _>(Collection::Agents, &ctx.cancel, |agents| {
                    let agent = agents
                        .iter_mut()
                        .find(|a| a.agent_id == *agent_id)
                        .ok_or_else(|| SwarmError::NotFound {
                            kind: "agent",
                            id: agent_id.0.clone(),
                        })?;
                    agent.last_heartbeat = Utc::now();
                    agent.status = AgentStatus::Active;
                    Ok(agent.clone())
                })
        })
        .await
    }

    /// Read-only aggregation across collections; shared locks, taken in the
    /// work -> agents order.
    #[instrument(skip_all)]
    pub async fn dashboard(&self, ctx: &OperationContext) -> SwarmResult<DashboardSnapshot> {
        let items = self
            .store
            .read::<WorkItem, _>(Collection::Work, &ctx.cancel, |items| items.to_vec())?;
        let agents = self
            .store
            .read::<Agent, _>(Collection::Agents, &ctx.cancel, |agents| agents.to_vec())?;

        let mut team_load = BTreeMap::new();
        for item in items.iter().filter(|w| !w.status.is_terminal()) {
            *team_load.entry(item.team.clone()).or_insert(0) += 1;
        }

        Ok(DashboardSnapshot {
            agents_total: agents.len(),
            agents_active: agents
                .iter()
                .filter(|a| a.status == AgentStatus::Active)
                .count(),
            work_total: items.len(),
            work_pending: items
                .iter()
                .filter(|w| w.status == WorkStatus::Pending)
                .count(),
            work_active: items
                .iter()
                .filter(|w| matches!(w.status, WorkStatus::Active | WorkStatus::InProgress))
                .count(),
            work_completed: items
                .iter()
                .filter(|w| w.status == WorkStatus::Completed)
                .count(),
            work_failed: items
                .iter()
                .filter(|w| w.status == WorkStatus::Failed)
                .count(),
            team_load,
            work_conflicts: self.work_conflicts(),
            telemetry_spans: self.telemetry.span_count()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_admit_no_transitions() {
        for terminal in [WorkStatus::Completed, WorkStatus::Failed] {
            for target in [
                WorkStatus::Pending,
                WorkStatus::Active,
                WorkStatus::InProgress,
                WorkStatus::Completed,
                WorkStatus::Failed,
            ] {
                assert!(!terminal.can_transition_to(target));
            }
        }
    }

    #[test]
    fn claim_edge_is_pending_to_active() {
        assert!(WorkStatus::Pending.can_transition_to(WorkStatus::Active));
        assert!(!WorkStatus::Pending.can_transition_to(WorkStatus::Completed));
        assert!(!WorkStatus::Pending.can_transition_to(WorkStatus::InProgress));
    }

    #[test]
    fn release_edges_return_to_pending() {
        assert!(WorkStatus::Active.can_transition_to(WorkStatus::Pending));
        assert!(WorkStatus::InProgress.can_transition_to(WorkStatus::Pending));
    }

    #[test]
    fn priority_parsing_rejects_unknown() {
        assert_eq!("critical".parse::<Priority>().unwrap(), Priority::Critical);
        assert!("urgent".parse::<Priority>().is_err());
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&WorkStatus::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
    }
}
