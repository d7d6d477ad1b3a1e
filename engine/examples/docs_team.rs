//! Example running a two-agent team to completion
//!
//! This example shows how to:
//! - Declare a team with a handoff rule
//! - Supply a fixed plan instead of a model-backed planner
//! - Drive a task session and watch orchestration events
//!
//! Everything runs locally in a temporary data directory.

use async_trait::async_trait;
use sdk::{Agent, AgentContext, EngineError, Message};
use std::sync::Arc;
use tempfile::TempDir;
use troupe_engine::{
    conductor::{Orchestrator, StaticPlanner},
    config::Config,
    message_bus::{EventType, MessageBus},
    plan::{Phase, Plan, PlanTask},
    session::TaskSession,
    storage::open_task_storage,
    team::TeamDefinition,
};

const TEAM: &str = r#"
name = "docs"
default_agent = "writer"

[[agents]]
name = "writer"
role = "author"

[[agents]]
name = "reviewer"
role = "editor"

[[handoffs]]
from = "writer"
to = "reviewer"
condition = "when the draft is complete"
"#;

struct Scripted {
    name: &'static str,
    reply: &'static str,
}

#[async_trait]
impl Agent for Scripted {
    fn name(&self) -> &str {
        self.name
    }

    async fn generate_response(
        &self,
        _messages: &[Message],
        context: &AgentContext,
    ) -> Result<String, EngineError> {
        Ok(format!("{} ({})", self.reply, context.task_id))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== Docs Team Example ===\n");

    let temp_dir = TempDir::new()?;
    let config = Config::from_toml_str(&format!(
        "[core]\ndata_dir = \"{}\"\n",
        temp_dir.path().display()
    ))?;
    println!("✓ Data directory: {}", config.core.data_dir.display());

    let team = TeamDefinition::from_toml_str(TEAM)?;
    println!("✓ Team '{}' with {} agents", team.name, team.agents.len());

    let plan = Plan::new("Getting started guide").with_phase(
        Phase::new("draft", "Drafting")
            .with_task(PlanTask::new("outline", "Outline the guide"))
            .with_task(PlanTask::new("write", "Write the guide").depends_on(["outline"])),
    );

    let agents: Vec<Arc<dyn Agent>> = vec![
        Arc::new(Scripted {
            name: "writer",
            reply: "Draft complete",
        }),
        Arc::new(Scripted {
            name: "reviewer",
            reply: "Looks good",
        }),
    ];

    let bus = MessageBus::new();
    let mut events = bus.subscribe(EventType::All).await;

    let orchestrator = Orchestrator::from_team(&team, agents, Arc::new(StaticPlanner::new(plan)?))?
        .with_config(&config.orchestrator)
        .with_max_handoffs(2)
        .with_bus(bus);

    let storage = open_task_storage(&config, "guide").await?;
    let mut session = TaskSession::open("guide", Arc::new(orchestrator), storage).await?;
    session
        .submit(Message::user("Write a getting started guide"))
        .await?;

    let summary = session.run(config.orchestrator.max_steps).await?;

    println!("\nEvents:");
    while let Ok(event) = events.try_recv() {
        println!("  {}", serde_json::to_string(&event)?);
    }

    println!("\nConversation:");
    for message in session.messages() {
        println!("  [{}] {}", message.role, message.content);
    }

    if let Some(plan) = session.plan() {
        println!("\n{}", plan.outline());
    }
    println!(
        "✓ Finished in {} steps ({}ms)",
        summary.steps, summary.duration_ms
    );

    Ok(())
}
