//! SwarmSH CLI
//!
//! Short-lived coordination commands sharing the store with the long-running
//! coordinator through the same advisory file locks. Every invocation
//! establishes a root span whose trace ID (overridable via `FORCE_TRACE_ID`)
//! is reused by all child spans, and exits with the mapped error code.

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::{info, warn};

use swarmsh_core::config::CoordinationConfig;
use swarmsh_core::coordination::{Priority, WorkStatus};
use swarmsh_core::{AgentId, SwarmError, SwarmSystem, WorkId};

#[derive(Parser)]
#[command(name = "swarmsh")]
#[command(about = "SwarmSH - file-backed agent coordination with end-to-end tracing")]
#[command(version)]
struct Cli {
    /// Emit machine-readable JSON on stdout
    #[arg(long, global = true)]
    json: bool,

    /// Acting agent ID for claim/progress/complete (falls back to AGENT_ID)
    #[arg(long, global = true)]
    agent_id: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Register a worker identity
    Register {
        agent_id: String,
        #[arg(default_value_t = 100)]
        capacity: u32,
        #[arg(default_value = "active")]
        status: String,
        #[arg(default_value = "general")]
        specialization: String,
        /// Coordination team the agent joins
        #[arg(long, default_value = "autonomous_team")]
        team: String,
    },

    /// Atomically create and claim a work item for the acting agent
    Claim {
        work_type: String,
        description: String,
        #[arg(default_value = "medium")]
        priority: String,
        #[arg(default_value = "autonomous_team")]
        team: String,
    },

    /// Update progress on an owned work item
    Progress {
        work_id: String,
        percent: u8,
        /// Optional explicit status (active | in_progress)
        status: Option<String>,
    },

    /// Complete (or fail) an owned work item
    Complete {
        work_id: String,
        result: Option<String>,
        #[arg(default_value_t = 0)]
        velocity_points: u32,
    },

    /// Read-only system aggregation
    Dashboard,

    /// Run the 80/20 analyzer once
    Analyze,

    /// Run one full analyze + optimize cycle
    Optimize,

    /// Run the health monitor once
    Health,

    /// Mint a nanosecond-precision ID for external tooling
    GenerateId {
        #[arg(default_value = "op")]
        prefix: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => {}
        Err(err) => {
            let (code, kind) = match err.downcast_ref::<SwarmError>() {
                Some(swarm_err) => (swarm_err.exit_code(), swarm_err.kind()),
                None => (64, "internal"),
            };
            eprintln!(
                "{}",
                json!({ "error": kind, "message": err.to_string() })
            );
            std::process::exit(code);
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = CoordinationConfig::from_env();
    let system = SwarmSystem::new(config).await?;
    system.start().await?;

    let acting_agent = cli
        .agent_id
        .clone()
        .or_else(|| std::env::var("AGENT_ID").ok())
        .map(AgentId);
    let mut ctx = system.root_context();
    if let Some(agent) = acting_agent {
        ctx = ctx.with_agent(agent);
    }

    let command_name = command_name(&cli.command);
    let mut root = system
        .telemetry
        .start_span(&ctx, &format!("cli.{command_name}"));
    let op_ctx = ctx.child(root.span_id());

    let output = match cli.command {
        Commands::Register {
            agent_id,
            capacity,
            status,
            specialization,
            team,
        } => {
            if !matches!(status.as_str(), "active" | "inactive" | "draining") {
                return Err(SwarmError::Validation {
                    field: "status".to_string(),
                    reason: format!("unknown agent status {status:?}"),
                }
                .into());
            }
            if status != "active" {
                warn!(status = %status, "registration always starts agents active; status ignored");
            }
            let agent = system
                .engine
                .register(&op_ctx, AgentId(agent_id), &team, capacity, &specialization)
                .await?;
            if cli.json {
                serde_json::to_value(&agent)?
            } else {
                json!({ "registered": agent.agent_id, "team": agent.team })
            }
        }

        Commands::Claim {
            work_type,
            description,
            priority,
            team,
        } => {
            let priority: Priority = priority.parse::<Priority>()?;
            let item = system
                .engine
                .claim(&op_ctx, &work_type, &description, priority, &team)
                .await?;
            if cli.json {
                serde_json::to_value(&item)?
            } else {
                json!({ "claimed": item.work_id, "status": item.status.as_str(), "trace_id": item.trace_id })
            }
        }

        Commands::Progress {
            work_id,
            percent,
            status,
        } => {
            let status = status
                .map(|s| s.parse::<WorkStatus>())
                .transpose()?;
            let item = system
                .engine
                .progress(&op_ctx, &WorkId(work_id), percent, status)
                .await?;
            json!({
                "work_id": item.work_id,
                "progress_percent": item.progress_percent,
                "status": item.status.as_str()
            })
        }

        Commands::Complete {
            work_id,
            result,
            velocity_points,
        } => {
            let item = system
                .engine
                .complete(&op_ctx, &WorkId(work_id), result, velocity_points)
                .await?;
            json!({
                "work_id": item.work_id,
                "status": item.status.as_str(),
                "velocity_points": item.velocity_points
            })
        }

        Commands::Dashboard => {
            let snapshot = system.engine.dashboard(&op_ctx).await?;
            serde_json::to_value(&snapshot)?
        }

        Commands::Analyze => {
            let report = system.analyzer.run(&op_ctx).await?;
            serde_json::to_value(&report)?
        }

        Commands::Optimize => {
            let report = system.analyzer.run(&op_ctx).await?;
            let outcome = system.optimizer.run(&op_ctx, &report).await?;
            serde_json::to_value(&outcome)?
        }

        Commands::Health => {
            let report = system.health_monitor.run(&op_ctx).await?;
            serde_json::to_value(&report)?
        }

        Commands::GenerateId { prefix } => {
            json!({ "id": system.minter.mint(&prefix) })
        }
    };

    root.attr("cli.command", command_name);
    root.complete();

    println!("{output}");
    info!(command = command_name, "command complete");
    system.stop().await?;
    Ok(())
}

fn command_name(command: &Commands) -> &'static str {
    match command {
        Commands::Register { .. } => "register",
        Commands::Claim { .. } => "claim",
        Commands::Progress { .. } => "progress",
        Commands::Complete { .. } => "complete",
        Commands::Dashboard => "dashboard",
        Commands::Analyze => "analyze",
        Commands::Optimize => "optimize",
        Commands::Health => "health",
        Commands::GenerateId { .. } => "generate-id",
    }
}
