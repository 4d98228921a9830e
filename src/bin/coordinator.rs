//! SwarmSH coordinator
//!
//! The long-running process that owns the maintenance scheduler. CLI
//! invocations from other processes keep working against the same store
//! through the shared advisory file locks.

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

use swarmsh_core::config::CoordinationConfig;
use swarmsh_core::isolation::LocalIsolation;
use swarmsh_core::scheduler::Scheduler;
use swarmsh_core::SwarmSystem;

#[derive(Parser)]
#[command(name = "swarmsh-coordinator")]
#[command(about = "SwarmSH coordination daemon - scheduled health, analysis and rebalancing")]
#[command(version)]
struct Cli {
    /// Tighten the health cycle to 15 minutes
    #[arg(long)]
    aggressive: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = CoordinationConfig::from_env();
    if cli.aggressive {
        config = config.aggressive();
    }

    let system = SwarmSystem::new(config).await?;
    system.start().await?;
    info!(
        coordination_dir = %system.config.coordination_dir.display(),
        aggressive = cli.aggressive,
        "coordinator starting"
    );

    let isolation = Arc::new(LocalIsolation::new(&system.config.coordination_dir));
    let scheduler = Scheduler::new(&system, isolation);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler_task = tokio::spawn(scheduler.run(shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
    let _ = scheduler_task.await;

    system.stop().await?;
    info!("coordinator stopped");
    Ok(())
}
