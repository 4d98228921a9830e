//! Cross-process lock behavior under contention
//!
//! Holds the advisory locks the way an external CLI process would and
//! verifies timeout bounds, conflict accounting, and corruption refusal.

use std::time::{Duration, Instant};

use anyhow::Result;
use fs2::FileExt;
use tempfile::TempDir;

use swarmsh_core::config::CoordinationConfig;
use swarmsh_core::coordination::Priority;
use swarmsh_core::telemetry::TelemetryMode;
use swarmsh_core::{AgentId, SwarmError, SwarmSystem};

async fn system(lock_timeout: Duration, max_retries: u32) -> (TempDir, SwarmSystem) {
    let dir = TempDir::new().unwrap();
    let mut config = CoordinationConfig::new(dir.path());
    config.telemetry.mode = TelemetryMode::Disabled;
    config.lock_timeout = lock_timeout;
    config.max_retries = max_retries;
    config.retry_backoff = Duration::from_millis(5);
    let system = SwarmSystem::new(config).await.unwrap();
    (dir, system)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn claim_times_out_while_foreign_process_holds_lock() -> Result<()> {
    let lock_timeout = Duration::from_secs(1);
    let (dir, system) = system(lock_timeout, 0).await;

    let ctx = system.root_context();
    let a1 = AgentId("agent_lock".to_string());
    system
        .engine
        .register(&ctx, a1.clone(), "team_x", 10, "general")
        .await?;

    // Simulate another process holding the work lock past the timeout.
    let lock_path = dir.path().join("work_claims.lock");
    let hold = Duration::from_secs(2);
    let holder = std::thread::spawn(move || {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(lock_path)
            .unwrap();
        file.lock_exclusive().unwrap();
        std::thread::sleep(hold);
        fs2::FileExt::unlock(&file).unwrap();
    });
    // Give the holder a head start.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let agent_ctx = system.root_context().with_agent(a1);
    let started = Instant::now();
    let err = system
        .engine
        .claim(&agent_ctx, "feature", "contended", Priority::Low, "team_x")
        .await
        .unwrap_err();
    let waited = started.elapsed();

    assert!(matches!(err, SwarmError::LockTimeout { .. }));
    assert_eq!(err.exit_code(), 4);
    // Returned within lock_timeout plus slack, not after the holder let go.
    assert!(waited >= lock_timeout);
    assert!(waited < lock_timeout + Duration::from_millis(900));
    assert_eq!(system.engine.work_conflicts(), 1);

    holder.join().unwrap();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn retries_preserve_trace_and_eventually_succeed() -> Result<()> {
    let (dir, system) = system(Duration::from_millis(400), 3).await;

    let ctx = system.root_context();
    let a1 = AgentId("agent_retry".to_string());
    system
        .engine
        .register(&ctx, a1.clone(), "team_x", 10, "general")
        .await?;

    // Hold the lock briefly; the engine's retry loop should win afterwards.
    let lock_path = dir.path().join("work_claims.lock");
    let holder = std::thread::spawn(move || {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(lock_path)
            .unwrap();
        file.lock_exclusive().unwrap();
        std::thread::sleep(Duration::from_millis(600));
        fs2::FileExt::unlock(&file).unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let agent_ctx = system.root_context().with_agent(a1);
    let item = system
        .engine
        .claim(&agent_ctx, "feature", "retried", Priority::Low, "team_x")
        .await?;
    // Retries kept the original trace.
    assert_eq!(item.trace_id, agent_ctx.trace_id);
    assert!(system.engine.work_conflicts() >= 1);

    holder.join().unwrap();
    Ok(())
}

#[tokio::test]
async fn corrupt_collection_surfaces_store_corruption() -> Result<()> {
    let (dir, system) = system(Duration::from_secs(1), 0).await;
    let ctx = system.root_context();
    let a1 = AgentId("agent_corrupt".to_string());
    system
        .engine
        .register(&ctx, a1.clone(), "team_x", 10, "general")
        .await?;

    std::fs::write(dir.path().join("work_claims.json"), b"{definitely not json")?;

    let agent_ctx = system.root_context().with_agent(a1);
    let err = system
        .engine
        .claim(&agent_ctx, "feature", "doomed", Priority::Low, "team_x")
        .await
        .unwrap_err();
    assert!(matches!(err, SwarmError::StoreCorruption { .. }));
    assert_eq!(err.exit_code(), 5);
    // The remediation hint names the backups directory.
    assert!(err.to_string().contains("backups/"));

    // The corrupted primary was not silently reinitialized.
    let raw = std::fs::read(dir.path().join("work_claims.json"))?;
    assert_eq!(raw, b"{definitely not json");
    Ok(())
}

#[tokio::test]
async fn cancellation_aborts_pending_operations() -> Result<()> {
    let (_dir, system) = system(Duration::from_secs(5), 3).await;
    let ctx = system.root_context();
    let a1 = AgentId("agent_cancel".to_string());
    system
        .engine
        .register(&ctx, a1.clone(), "team_x", 10, "general")
        .await?;

    let agent_ctx = system.root_context().with_agent(a1);
    agent_ctx.cancel.cancel();
    let err = system
        .engine
        .claim(&agent_ctx, "feature", "cancelled", Priority::Low, "team_x")
        .await
        .unwrap_err();
    assert!(matches!(err, SwarmError::Cancelled));
    Ok(())
}
