//! Telemetry archival and health interaction tests
//!
//! Seeds an oversized span log, archives it, and verifies retention,
//! history preservation, and the resulting health improvement.

use anyhow::Result;
use tempfile::TempDir;

use swarmsh_core::config::CoordinationConfig;
use swarmsh_core::telemetry::TelemetryMode;
use swarmsh_core::{CancelToken, SwarmSystem};

async fn system(max_spans: usize, retain: usize) -> (TempDir, SwarmSystem) {
    let dir = TempDir::new().unwrap();
    let mut config = CoordinationConfig::new(dir.path());
    config.telemetry.mode = TelemetryMode::Disabled;
    config.max_spans = max_spans;
    config.span_retain = retain;
    let system = SwarmSystem::new(config).await.unwrap();
    (dir, system)
}

#[tokio::test]
async fn archival_retains_newest_and_preserves_history() -> Result<()> {
    let (_dir, system) = system(10_000, 500).await;

    // Seed the span log past the limit.
    let ctx = system.root_context();
    for n in 0..12_000u32 {
        let mut span = system.telemetry.start_span(&ctx, "coordination.claim");
        span.attr("seq", n.to_string());
        span.complete();
    }
    assert_eq!(system.telemetry.span_count()?, 12_000);

    // The monitoring run appends its own span to the log.
    let health_before = system.health_monitor.run(&ctx).await?;
    let total = system.telemetry.span_count()?;
    assert_eq!(total, 12_001);

    let outcome = system.telemetry.archive(&CancelToken::new())?;
    assert_eq!(outcome.archived, total - 500);
    assert_eq!(outcome.retained, 500);
    assert_eq!(system.telemetry.span_count()?, 500);

    // Archived plus current equals everything ever emitted.
    assert_eq!(
        system.store.jsonl_len(&outcome.archive_path)? + system.telemetry.span_count()?,
        total
    );

    // The newest records survived in the primary.
    let spans = system.telemetry.read_spans()?;
    let last_claim = spans
        .iter()
        .rev()
        .find(|s| s.operation_name == "coordination.claim")
        .unwrap();
    assert_eq!(last_claim.attributes.get("seq").unwrap(), "11999");

    let health_after = system.health_monitor.run(&ctx).await?;
    assert!(health_after.telemetry_health > health_before.telemetry_health);
    assert!(health_after.score >= health_before.score);
    Ok(())
}

#[tokio::test]
async fn archival_below_retention_is_a_no_op() -> Result<()> {
    let (_dir, system) = system(10_000, 500).await;
    let ctx = system.root_context();
    for _ in 0..100 {
        system.telemetry.start_span(&ctx, "coordination.claim").complete();
    }

    let outcome = system.telemetry.archive(&CancelToken::new())?;
    assert_eq!(outcome.archived, 0);
    assert_eq!(system.telemetry.span_count()?, 100);
    Ok(())
}

#[tokio::test]
async fn span_emission_failure_does_not_abort_operations() -> Result<()> {
    let (dir, system) = system(10_000, 500).await;

    // Make the span log unappendable by replacing it with a directory.
    std::fs::create_dir(dir.path().join("telemetry_spans.jsonl"))?;

    let ctx = system.root_context();
    let agent = swarmsh_core::AgentId("agent_t".to_string());
    system
        .engine
        .register(&ctx, agent.clone(), "team_x", 10, "general")
        .await?;

    let agent_ctx = system.root_context().with_agent(agent);
    let item = system
        .engine
        .claim(
            &agent_ctx,
            "feature",
            "telemetry loss tolerated",
            swarmsh_core::coordination::Priority::Low,
            "team_x",
        )
        .await?;
    assert_eq!(item.status, swarmsh_core::coordination::WorkStatus::Active);
    assert!(system.telemetry.emission_failures() > 0);
    Ok(())
}
