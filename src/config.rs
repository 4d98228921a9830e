//! Immutable process configuration
//!
//! All environment is read once at startup; nothing reads env vars after
//! construction. Tests build configs directly against temp directories.

use std::path::PathBuf;
use std::time::Duration;

use crate::telemetry::TelemetryConfig;

/// Analyzer classification thresholds, overridable in code.
#[derive(Debug, Clone)]
pub struct AnalyzerThresholds {
    pub agent_overutilization: f64,
    pub agent_underutilization: f64,
    pub team_imbalance_high: f64,
    pub team_imbalance_medium: f64,
    pub priority_inflation: f64,
    pub work_fragmentation: f64,
    pub coordination_latency_ms: f64,
    pub telemetry_bloat_spans: usize,
}

impl Default for AnalyzerThresholds {
    fn default() -> Self {
        Self {
            agent_overutilization: 2.0,
            agent_underutilization: 0.5,
            team_imbalance_high: 3.0,
            team_imbalance_medium: 2.0,
            priority_inflation: 0.6,
            work_fragmentation: 0.3,
            coordination_latency_ms: 50.0,
            telemetry_bloat_spans: 10_000,
        }
    }
}

/// Optimizer mutation limits.
#[derive(Debug, Clone)]
pub struct OptimizerLimits {
    /// Agents holding more than this many items are overloaded.
    pub max_agent_load: usize,
    /// Agents holding fewer than this many items are underutilized.
    pub min_agent_load: usize,
    /// Work item moves applied per optimization cycle.
    pub moves_per_cycle: usize,
    /// Team load variance above which team rebalance runs.
    pub team_variance_threshold: f64,
}

impl Default for OptimizerLimits {
    fn default() -> Self {
        Self {
            max_agent_load: 4,
            min_agent_load: 2,
            moves_per_cycle: 1,
            team_variance_threshold: 2.0,
        }
    }
}

/// Scheduler cadences. Aggressive mode tightens the health cycle.
#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    pub health_interval: Duration,
    pub rebalance_interval: Duration,
    pub analyze_interval: Duration,
    pub telemetry_archive_interval: Duration,
    pub stale_lock_interval: Duration,
    /// Local hour (0-23) for the daily work archival run.
    pub work_archive_hour: u32,
    pub job_timeout: Duration,
}

impl ScheduleConfig {
    fn standard() -> Self {
        Self {
            health_interval: Duration::from_secs(2 * 3600),
            rebalance_interval: Duration::from_secs(3600),
            analyze_interval: Duration::from_secs(6 * 3600),
            telemetry_archive_interval: Duration::from_secs(4 * 3600),
            stale_lock_interval: Duration::from_secs(30 * 60),
            work_archive_hour: 3,
            job_timeout: Duration::from_secs(10 * 60),
        }
    }

    fn aggressive() -> Self {
        Self {
            health_interval: Duration::from_secs(15 * 60),
            ..Self::standard()
        }
    }
}

/// Root configuration for a coordination process.
#[derive(Debug, Clone)]
pub struct CoordinationConfig {
    /// State root; collections, logs, backups and archives live here.
    pub coordination_dir: PathBuf,
    pub lock_timeout: Duration,
    pub max_retries: u32,
    pub retry_backoff: Duration,
    /// Span log line count that triggers archival.
    pub max_spans: usize,
    /// Spans kept in the primary log after archival.
    pub span_retain: usize,
    /// Target in-progress capacity for queue pressure scoring.
    pub max_work_active: usize,
    /// Fast-path claim log entries retained.
    pub max_fast_path: usize,
    pub stale_work_ttl: Duration,
    /// Terminal work items older than this are archived.
    pub work_archive_after: Duration,
    pub default_agent_capacity: u32,
    pub force_trace_id: Option<String>,
    pub ollama_endpoint: Option<String>,
    pub advisor_deadline: Duration,
    pub analyzer: AnalyzerThresholds,
    pub optimizer: OptimizerLimits,
    pub schedule: ScheduleConfig,
    pub telemetry: TelemetryConfig,
}

impl CoordinationConfig {
    /// Configuration with stock defaults rooted at `coordination_dir`.
    pub fn new(coordination_dir: impl Into<PathBuf>) -> Self {
        Self {
            coordination_dir: coordination_dir.into(),
            lock_timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_backoff: Duration::from_millis(50),
            max_spans: 10_000,
            span_retain: 500,
            max_work_active: 100,
            max_fast_path: 1000,
            stale_work_ttl: Duration::from_secs(24 * 3600),
            work_archive_after: Duration::from_secs(7 * 24 * 3600),
            default_agent_capacity: 100,
            force_trace_id: None,
            ollama_endpoint: None,
            advisor_deadline: Duration::from_secs(30),
            analyzer: AnalyzerThresholds::default(),
            optimizer: OptimizerLimits::default(),
            schedule: ScheduleConfig::standard(),
            telemetry: TelemetryConfig::default(),
        }
    }

    /// Build from environment, falling back to defaults for anything unset
    /// or unparseable.
    pub fn from_env() -> Self {
        let dir = std::env::var("COORDINATION_DIR")
            .unwrap_or_else(|_| "./coordination".to_string());
        let mut config = Self::new(dir);

        if let Some(secs) = env_u64("LOCK_TIMEOUT_SECONDS") {
            config.lock_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = env_u64("MAX_SPANS") {
            config.max_spans = n as usize;
        }
        if let Some(n) = env_u64("MAX_WORK_ACTIVE") {
            config.max_work_active = n as usize;
        }
        if let Some(n) = env_u64("MAX_FAST_PATH") {
            config.max_fast_path = n as usize;
        }
        if let Some(hours) = env_u64("STALE_WORK_TTL_HOURS") {
            config.stale_work_ttl = Duration::from_secs(hours * 3600);
        }
        config.force_trace_id = std::env::var("FORCE_TRACE_ID").ok().filter(|s| !s.is_empty());
        config.ollama_endpoint = std::env::var("OLLAMA_ENDPOINT").ok().filter(|s| !s.is_empty());

        if std::env::var("SWARMSH_AGGRESSIVE_MONITORING").map(|v| v == "true").unwrap_or(false) {
            config.schedule = ScheduleConfig::aggressive();
        }

        config.telemetry = TelemetryConfig::default();
        config
    }

    /// Aggressive-monitoring variant used by benchmarks and soak tests.
    pub fn aggressive(mut self) -> Self {
        self.schedule = ScheduleConfig::aggressive();
        self.stale_work_ttl = Duration::from_secs(3600);
        self
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
