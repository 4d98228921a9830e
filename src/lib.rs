//! SwarmSH coordination substrate
//!
//! Atomic work claiming over shared file-backed state with nanosecond-precision
//! IDs, end-to-end trace correlation, and periodic 80/20 optimization loops.
//! A single long-running coordinator owns the store; short-lived CLI
//! invocations interoperate through the same advisory file locks.

pub mod ai_integration;
pub mod analytics;
pub mod config;
pub mod coordination;
pub mod health;
pub mod id;
pub mod isolation;
pub mod optimizer;
pub mod scheduler;
pub mod store;
pub mod telemetry;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::ai_integration::IntelligenceAdvisor;
use crate::analytics::Analyzer;
use crate::config::CoordinationConfig;
use crate::coordination::CoordinationEngine;
use crate::health::HealthMonitor;
use crate::id::IdMinter;
use crate::optimizer::Optimizer;
use crate::store::Store;
use crate::telemetry::{TelemetryEmitter, TelemetryManager};

/// Unique agent identity, minted with nanosecond precision.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub String);

/// Unique work item identity, minted with nanosecond precision.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkId(pub String);

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for WorkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AgentId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl WorkId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Result alias for coordination operations.
pub type SwarmResult<T> = std::result::Result<T, SwarmError>;

/// Error taxonomy for the coordination core.
///
/// Retryable kinds (`LockTimeout`, `StoreConflict`) are retried internally by
/// the engine before surfacing. `StoreCorruption` halts writes for the
/// affected collection. Telemetry and advisor failures never abort a primary
/// operation.
#[derive(Error, Debug, Clone)]
pub enum SwarmError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("illegal transition on {work_id}: {from} -> {to}")]
    InvalidTransition {
        work_id: String,
        from: String,
        to: String,
    },

    #[error("work item {work_id} is terminal and immutable")]
    AlreadyTerminal { work_id: String },

    #[error("agent {agent_id} does not own work item {work_id}")]
    OwnershipViolation { agent_id: String, work_id: String },

    #[error("agent {agent_id} at capacity ({current}/{max})")]
    AgentAtCapacity {
        agent_id: String,
        current: u32,
        max: u32,
    },

    #[error("agent already registered: {agent_id}")]
    DuplicateAgent { agent_id: String },

    #[error("claim requires an agent context")]
    NoAgentContext,

    #[error("timed out acquiring {collection} lock after {waited_ms}ms")]
    LockTimeout { collection: String, waited_ms: u64 },

    #[error("lost update race on {collection}")]
    StoreConflict { collection: String },

    #[error("store corruption in {collection}: {detail}; refusing writes, restore from backups/")]
    StoreCorruption { collection: String, detail: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("telemetry emission failed: {0}")]
    TelemetryEmission(String),

    #[error("intelligence advisor unavailable: {0}")]
    AdvisorUnavailable(String),

    #[error("io failure: {0}")]
    Io(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl SwarmError {
    /// Whether the engine may transparently retry the failed operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SwarmError::LockTimeout { .. } | SwarmError::StoreConflict { .. }
        )
    }

    /// Stable attribute value for `error.kind` on error spans.
    pub fn kind(&self) -> &'static str {
        match self {
            SwarmError::Validation { .. } => "validation",
            SwarmError::NotFound { .. } => "not_found",
            SwarmError::InvalidTransition { .. } => "invalid_transition",
            SwarmError::AlreadyTerminal { .. } => "already_terminal",
            SwarmError::OwnershipViolation { .. } => "ownership_violation",
            SwarmError::AgentAtCapacity { .. } => "capacity_exceeded",
            SwarmError::DuplicateAgent { .. } => "duplicate_agent",
            SwarmError::NoAgentContext => "no_agent_context",
            SwarmError::LockTimeout { .. } => "lock_timeout",
            SwarmError::StoreConflict { .. } => "store_conflict",
            SwarmError::StoreCorruption { .. } => "store_corruption",
            SwarmError::Cancelled => "cancelled",
            SwarmError::TelemetryEmission(_) => "telemetry_emission",
            SwarmError::AdvisorUnavailable(_) => "advisor_unavailable",
            SwarmError::Io(_) => "io",
            SwarmError::Internal(_) => "internal",
        }
    }

    /// Process exit code for the CLI surface.
    ///
    /// 0 success, 1 validation, 2 not found, 3 state-machine violation,
    /// 4 lock timeout, 5 store corruption, >=64 internal.
    pub fn exit_code(&self) -> i32 {
        match self {
            SwarmError::Validation { .. }
            | SwarmError::DuplicateAgent { .. }
            | SwarmError::AgentAtCapacity { .. }
            | SwarmError::NoAgentContext => 1,
            SwarmError::NotFound { .. } => 2,
            SwarmError::InvalidTransition { .. }
            | SwarmError::AlreadyTerminal { .. }
            | SwarmError::OwnershipViolation { .. } => 3,
            SwarmError::LockTimeout { .. } | SwarmError::StoreConflict { .. } => 4,
            SwarmError::StoreCorruption { .. } => 5,
            _ => 64,
        }
    }
}

impl From<std::io::Error> for SwarmError {
    fn from(err: std::io::Error) -> Self {
        SwarmError::Io(err.to_string())
    }
}

/// Cooperative cancellation signal carried by every externally triggered
/// operation. Pending lock acquisitions observe it; in-flight store writes
/// always run to completion to keep the on-disk state consistent.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> SwarmResult<()> {
        if self.is_cancelled() {
            Err(SwarmError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Ambient context threaded through every coordination operation.
///
/// The trace ID is established once at the process boundary and reused by all
/// child spans; retries preserve it.
#[derive(Debug, Clone)]
pub struct OperationContext {
    pub trace_id: String,
    pub parent_span_id: Option<String>,
    pub agent_id: Option<AgentId>,
    pub cancel: CancelToken,
}

impl OperationContext {
    /// Root context for a new invocation. `forced_trace_id` comes from
    /// `FORCE_TRACE_ID` at the process boundary and wins over minting.
    pub fn root(minter: &IdMinter, forced_trace_id: Option<&str>) -> Self {
        let trace_id = match forced_trace_id {
            Some(t) if !t.is_empty() => t.to_string(),
            _ => minter.trace_id(),
        };
        Self {
            trace_id,
            parent_span_id: None,
            agent_id: None,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_agent(mut self, agent_id: AgentId) -> Self {
        self.agent_id = Some(agent_id);
        self
    }

    /// Child context for a sub-operation; the caller's span becomes the
    /// child's parent.
    pub fn child(&self, parent_span_id: &str) -> Self {
        Self {
            trace_id: self.trace_id.clone(),
            parent_span_id: Some(parent_span_id.to_string()),
            agent_id: self.agent_id.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

/// Fully wired coordination system.
///
/// Owns the store, telemetry pipeline, engine, and the 80/20 loop components.
/// The scheduler drives the periodic pieces; binaries construct one of these
/// and either serve commands (CLI) or run the scheduler (coordinator).
pub struct SwarmSystem {
    pub config: Arc<CoordinationConfig>,
    pub minter: Arc<IdMinter>,
    pub store: Arc<Store>,
    pub telemetry: Arc<TelemetryEmitter>,
    pub telemetry_manager: TelemetryManager,
    pub engine: Arc<CoordinationEngine>,
    pub analyzer: Arc<Analyzer>,
    pub optimizer: Arc<Optimizer>,
    pub health_monitor: Arc<HealthMonitor>,
    pub advisor: Arc<IntelligenceAdvisor>,
}

impl SwarmSystem {
    pub async fn new(config: CoordinationConfig) -> Result<Self> {
        let config = Arc::new(config);
        let telemetry_manager = TelemetryManager::with_config(config.telemetry.clone()).await?;
        let minter = Arc::new(IdMinter::new());
        let store = Arc::new(Store::open(&config)?);
        let telemetry = Arc::new(TelemetryEmitter::new(
            store.clone(),
            minter.clone(),
            config.clone(),
        ));
        let advisor = Arc::new(IntelligenceAdvisor::from_config(&config).await);
        let engine = Arc::new(CoordinationEngine::new(
            store.clone(),
            telemetry.clone(),
            minter.clone(),
            config.clone(),
        ));
        let analyzer = Arc::new(Analyzer::new(
            store.clone(),
            telemetry.clone(),
            minter.clone(),
            config.clone(),
        ));
        let optimizer = Arc::new(Optimizer::new(
            store.clone(),
            telemetry.clone(),
            advisor.clone(),
            config.clone(),
        ));
        let health_monitor = Arc::new(HealthMonitor::new(
            store.clone(),
            telemetry.clone(),
            config.clone(),
        ));

        Ok(Self {
            config,
            minter,
            store,
            telemetry,
            telemetry_manager,
            engine,
            analyzer,
            optimizer,
            health_monitor,
            advisor,
        })
    }

    /// Root operation context for this process, honoring `FORCE_TRACE_ID`.
    pub fn root_context(&self) -> OperationContext {
        OperationContext::root(&self.minter, self.config.force_trace_id.as_deref())
    }

    pub async fn start(&self) -> Result<()> {
        self.telemetry_manager.start().await?;
        info!(
            coordination_dir = %self.config.coordination_dir.display(),
            service = %self.config.telemetry.service_name,
            "swarm system started"
        );
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        self.telemetry_manager.stop().await?;
        info!("swarm system stopped");
        Ok(())
    }
}
