//! Health reporting and scheduler dispatch tests

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tempfile::TempDir;
use tokio::sync::watch;

use swarmsh_core::config::CoordinationConfig;
use swarmsh_core::coordination::Priority;
use swarmsh_core::health::HealthStatus;
use swarmsh_core::isolation::LocalIsolation;
use swarmsh_core::scheduler::{JobKind, Scheduler};
use swarmsh_core::telemetry::TelemetryMode;
use swarmsh_core::{AgentId, SwarmSystem};

async fn system() -> (TempDir, SwarmSystem) {
    let dir = TempDir::new().unwrap();
    let mut config = CoordinationConfig::new(dir.path());
    config.telemetry.mode = TelemetryMode::Disabled;
    config.retry_backoff = Duration::from_millis(5);
    let system = SwarmSystem::new(config).await.unwrap();
    (dir, system)
}

#[tokio::test]
async fn health_report_is_persisted_with_live_metrics() -> Result<()> {
    let (dir, system) = system().await;
    let ctx = system.root_context();

    let agent = AgentId("agent_h".to_string());
    system
        .engine
        .register(&ctx, agent.clone(), "team_x", 10, "general")
        .await?;
    let agent_ctx = system.root_context().with_agent(agent);
    let item = system
        .engine
        .claim(&agent_ctx, "feature", "tracked", Priority::Medium, "team_x")
        .await?;
    system
        .engine
        .complete(&agent_ctx, &item.work_id, Some("ok".to_string()), 2)
        .await?;

    let report = system.health_monitor.run(&ctx).await?;
    assert_eq!(report.work_total, 1);
    assert_eq!(report.work_completed, 1);
    assert_eq!(report.agents_total, 1);
    assert_eq!(report.agents_active, 1);
    assert!((report.completion_health - 1.0).abs() < 1e-9);
    assert_eq!(report.status, HealthStatus::Healthy);

    // A report file landed under the coordination root.
    let report_files = std::fs::read_dir(dir.path())?
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.file_name()
                .to_string_lossy()
                .starts_with("health_report_")
        })
        .count();
    assert_eq!(report_files, 1);
    Ok(())
}

#[tokio::test]
async fn job_failures_surface_in_the_next_report() -> Result<()> {
    let (dir, system) = system().await;
    let isolation = Arc::new(LocalIsolation::new(dir.path()));
    let scheduler = Scheduler::new(&system, isolation);

    // Corrupt the work collection so analysis fails.
    std::fs::write(dir.path().join("work_claims.json"), b"{broken")?;
    scheduler.run_job(JobKind::Analyze).await;

    std::fs::remove_file(dir.path().join("work_claims.json"))?;
    let report = system.health_monitor.run(&system.root_context()).await?;
    assert_eq!(report.job_failures, 1);
    Ok(())
}

#[tokio::test]
async fn scheduled_jobs_emit_scheduler_spans() -> Result<()> {
    let (dir, system) = system().await;
    let isolation = Arc::new(LocalIsolation::new(dir.path()));
    let scheduler = Scheduler::new(&system, isolation);

    scheduler.run_job(JobKind::Health).await;
    scheduler.run_job(JobKind::StaleLockCleaner).await;

    let spans = system.telemetry.read_spans()?;
    assert!(spans.iter().any(|s| s.operation_name == "scheduler.health"));
    assert!(spans
        .iter()
        .any(|s| s.operation_name == "scheduler.stale_lock_cleaner"));

    // The job's inner span is a child of the scheduler span.
    let scheduler_span = spans
        .iter()
        .find(|s| s.operation_name == "scheduler.health")
        .unwrap();
    let inner = spans
        .iter()
        .find(|s| s.operation_name == "health.monitor.run")
        .unwrap();
    assert_eq!(inner.trace_id, scheduler_span.trace_id);
    assert_eq!(
        inner.parent_span_id.as_deref(),
        Some(scheduler_span.span_id.as_str())
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scheduler_loops_run_and_shut_down_cleanly() -> Result<()> {
    let dir = TempDir::new().unwrap();

    // Tight cadences so every interval kind gets its startup catch-up run.
    let mut config = CoordinationConfig::new(dir.path());
    config.telemetry.mode = TelemetryMode::Disabled;
    config.schedule.health_interval = Duration::from_millis(50);
    config.schedule.rebalance_interval = Duration::from_millis(50);
    config.schedule.analyze_interval = Duration::from_millis(50);
    config.schedule.telemetry_archive_interval = Duration::from_millis(50);
    config.schedule.stale_lock_interval = Duration::from_millis(50);
    let system = SwarmSystem::new(config).await?;

    let isolation = Arc::new(LocalIsolation::new(dir.path()));
    let scheduler = Scheduler::new(&system, isolation);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(scheduler.run(shutdown_rx));

    tokio::time::sleep(Duration::from_millis(300)).await;
    shutdown_tx.send(true)?;
    tokio::time::timeout(Duration::from_secs(5), task).await???;

    let spans = system.telemetry.read_spans()?;
    for operation in [
        "scheduler.health",
        "scheduler.work_queue_rebalance",
        "scheduler.analyze_8020",
        "scheduler.telemetry_archive",
        "scheduler.stale_lock_cleaner",
        "scheduler.work_archive",
    ] {
        assert!(
            spans.iter().any(|s| s.operation_name == operation),
            "missing {operation} span"
        );
    }
    Ok(())
}
