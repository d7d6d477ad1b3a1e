//! Plan generation
//!
//! The orchestrator asks a [`PlanGenerator`] for a plan the first time a
//! session steps without one. [`BrainPlanner`] prompts a language model with
//! the goal and the agent roster and parses the JSON plan out of its reply;
//! [`StaticPlanner`] hands out a plan supplied up front.

use async_trait::async_trait;
use sdk::errors::EngineError;
use sdk::types::Message;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::plan::{Phase, Plan, PlanTask};
use crate::team::AgentDescriptor;

/// Produces the initial plan for a session
#[async_trait]
pub trait PlanGenerator: Send + Sync {
    async fn generate_plan(
        &self,
        goal: &str,
        messages: &[Message],
        agents: &[AgentDescriptor],
    ) -> Result<Plan, EngineError>;
}

/// Opaque text completion, typically a model client
#[async_trait]
pub trait Brain: Send + Sync {
    async fn complete(&self, messages: &[Message]) -> Result<String, EngineError>;
}

/// Hands out a copy of a fixed plan with a fresh id
pub struct StaticPlanner {
    plan: Plan,
}

impl StaticPlanner {
    pub fn new(plan: Plan) -> Result<Self, EngineError> {
        plan.validate()?;
        Ok(Self { plan })
    }
}

#[async_trait]
impl PlanGenerator for StaticPlanner {
    async fn generate_plan(
        &self,
        _goal: &str,
        _messages: &[Message],
        _agents: &[AgentDescriptor],
    ) -> Result<Plan, EngineError> {
        let mut plan = self.plan.clone();
        plan.id = uuid::Uuid::new_v4().to_string();
        plan.update_progress();
        Ok(plan)
    }
}

/// Intermediate deserialization types for model JSON output
#[derive(Debug, Deserialize)]
struct RawPlan {
    name: Option<String>,
    #[serde(default)]
    phases: Vec<RawPhase>,
}

#[derive(Debug, Deserialize)]
struct RawPhase {
    id: Option<String>,
    name: Option<String>,
    description: Option<String>,
    #[serde(default)]
    tasks: Vec<RawTask>,
}

#[derive(Debug, Deserialize)]
struct RawTask {
    id: Option<String>,
    description: String,
    assigned_to: Option<String>,
    deliverable: Option<String>,
    #[serde(default)]
    success_criteria: Vec<String>,
    #[serde(default)]
    dependencies: Vec<String>,
}

/// Model-backed planner
pub struct BrainPlanner {
    brain: Arc<dyn Brain>,
    default_agent: Option<String>,
}

impl BrainPlanner {
    pub fn new(brain: Arc<dyn Brain>) -> Self {
        Self {
            brain,
            default_agent: None,
        }
    }

    /// Agent assigned to tasks of the fallback plan
    pub fn with_default_agent(mut self, agent: impl Into<String>) -> Self {
        self.default_agent = Some(agent.into());
        self
    }

    fn system_prompt(agents: &[AgentDescriptor]) -> String {
        let mut prompt = String::from(
            "You are the planner of a team of agents. Break the user's goal into phases \
             of concrete tasks and assign each task to one agent.\n\
             Output ONLY a JSON object of the form:\n\
             {\"name\": string, \"phases\": [{\"id\": string, \"name\": string, \"tasks\": \
             [{\"id\": string, \"description\": string, \"assigned_to\": string, \
             \"deliverable\": string, \"success_criteria\": [string], \
             \"dependencies\": [task id]}]}]}\n\
             Dependencies may only name tasks defined in the same plan.\n\nAgents:\n",
        );
        for agent in agents {
            if agent.role.is_empty() {
                prompt.push_str(&format!("- {}: {}\n", agent.name, agent.description));
            } else {
                prompt.push_str(&format!(
                    "- {} ({}): {}\n",
                    agent.name, agent.role, agent.description
                ));
            }
        }
        prompt
    }

    /// Parse model output into a plan, tolerating prose around the JSON
    fn parse_plan(
        &self,
        content: &str,
        goal: &str,
        agents: &[AgentDescriptor],
    ) -> Result<Plan, EngineError> {
        let trimmed = content.trim();
        let json_str = match (trimmed.find('{'), trimmed.rfind('}')) {
            (Some(start), Some(end)) if start < end => &trimmed[start..=end],
            _ => trimmed,
        };

        let raw: RawPlan = serde_json::from_str(json_str)
            .map_err(|e| EngineError::InvalidPlan(format!("Failed to parse plan JSON: {}", e)))?;

        let known: HashSet<&str> = agents.iter().map(|a| a.name.as_str()).collect();
        let mut plan = Plan::new(raw.name.unwrap_or_else(|| goal.to_string()));
        let mut task_number = 0;

        for (i, raw_phase) in raw.phases.into_iter().enumerate() {
            let phase_id = raw_phase.id.unwrap_or_else(|| format!("phase_{}", i + 1));
            let phase_name = raw_phase.name.unwrap_or_else(|| phase_id.clone());
            let mut phase = Phase::new(phase_id, phase_name);
            phase.description = raw_phase.description;

            for raw_task in raw_phase.tasks {
                task_number += 1;
                let id = raw_task
                    .id
                    .unwrap_or_else(|| format!("task_{}", task_number));
                let mut task = PlanTask::new(id, raw_task.description)
                    .depends_on(raw_task.dependencies);
                task.success_criteria = raw_task.success_criteria;
                task.deliverable = raw_task.deliverable;

                match raw_task.assigned_to {
                    Some(agent) if known.contains(agent.as_str()) => {
                        task.assigned_to = Some(agent);
                    }
                    Some(agent) => {
                        warn!(
                            "Planner assigned {} to unknown agent '{}', using default",
                            task.id, agent
                        );
                    }
                    None => {}
                }
                phase.tasks.push(task);
            }
            plan.phases.push(phase);
        }

        if plan.tasks().next().is_none() {
            return Err(EngineError::InvalidPlan("Plan has no tasks".to_string()));
        }
        plan.validate()?;
        plan.update_progress();
        Ok(plan)
    }

    /// Sequential analyse, execute, review plan used when the model reply is unusable
    pub fn default_plan(&self, goal: &str) -> Plan {
        let assign = |task: PlanTask| match &self.default_agent {
            Some(agent) => task.assigned_to(agent.clone()),
            None => task,
        };

        let mut plan = Plan::new(goal).with_phase(
            Phase::new("main", "Main")
                .with_task(assign(
                    PlanTask::new("task_1", format!("Analyse how to achieve: {}", goal))
                        .with_deliverable("Understanding of the required work"),
                ))
                .with_task(assign(
                    PlanTask::new("task_2", "Carry out the work")
                        .depends_on(["task_1"])
                        .with_deliverable("The requested result"),
                ))
                .with_task(assign(
                    PlanTask::new("task_3", "Review the result against the goal")
                        .depends_on(["task_2"])
                        .with_criterion("The goal is met"),
                )),
        );
        plan.update_progress();
        plan
    }
}

#[async_trait]
impl PlanGenerator for BrainPlanner {
    async fn generate_plan(
        &self,
        goal: &str,
        messages: &[Message],
        agents: &[AgentDescriptor],
    ) -> Result<Plan, EngineError> {
        let mut prompt = vec![Message::system(Self::system_prompt(agents))];
        prompt.extend(
            messages
                .iter()
                .filter(|m| m.role != sdk::types::MessageRole::System)
                .cloned(),
        );
        if prompt.len() == 1 {
            prompt.push(Message::user(goal));
        }

        let reply = self
            .brain
            .complete(&prompt)
            .await
            .map_err(|e| EngineError::PlanGeneration(e.to_string()))?;

        match self.parse_plan(&reply, goal, agents) {
            Ok(plan) => {
                debug!("Generated plan '{}' with {} tasks", plan.name, plan.progress.total_tasks);
                Ok(plan)
            }
            Err(e) => {
                warn!("Unusable plan from model ({}), using default plan", e);
                Ok(self.default_plan(goal))
            }
        }
    }
}
