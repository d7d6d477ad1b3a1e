//! Orchestrator step engine
//!
//! Each call to [`Orchestrator::step`] advances one session's plan by at most
//! one unit of work:
//!
//! 1. no plan yet: generate one, persist it
//! 2. plan complete: report completion
//! 3. no actionable task: report a stall
//! 4. otherwise: run the next actionable task (document order) on its agent,
//!    record the outcome, persist, and evaluate handoffs
//!
//! Agent failures and timeouts are task-local: the task is marked failed and
//! the step still succeeds. Plan generation, persistence and invalid plan
//! transitions are fatal and returned as errors.
//!
//! The orchestrator holds no per-session state. The session owns the plan and
//! passes it in; every plan mutation goes through the few methods here that
//! also keep the derived progress current.

use sdk::agent::{Agent, AgentContext};
use sdk::errors::EngineError;
use sdk::types::{Message, MessageRole};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::context::{truncate, ContextAssembler};
use super::handoff::{HandoffContext, HandoffEvaluator};
use super::planner::PlanGenerator;
use crate::config::OrchestratorConfig;
use crate::message_bus::{Event, MessageBus};
use crate::plan::{Plan, PlanTask, TaskStatus, HANDOFF_TASK_PREFIX};
use crate::storage::{artifact_names, TaskStorage};
use crate::team::{AgentRegistry, TeamDefinition};

/// Longest result stored in a task note
pub const MAX_RESULT_NOTE: usize = 2_000;

/// What a single step did
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StepOutcome {
    PlanCreated {
        plan_name: String,
        total_tasks: usize,
    },
    TaskCompleted {
        task_id: String,
        agent: String,
        result: String,
        handoff: Option<String>,
    },
    TaskFailed {
        task_id: String,
        agent: String,
        error: String,
    },
    /// Plan incomplete but nothing can run
    Stalled { blocked_tasks: usize },
    Completed,
}

impl StepOutcome {
    /// No further step can change the plan
    pub fn is_terminal(&self) -> bool {
        matches!(self, StepOutcome::Completed | StepOutcome::Stalled { .. })
    }
}

impl fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepOutcome::PlanCreated {
                plan_name,
                total_tasks,
            } => write!(f, "Created plan '{}' with {} tasks", plan_name, total_tasks),
            StepOutcome::TaskCompleted {
                task_id,
                agent,
                result,
                handoff,
            } => {
                write!(f, "Task {} completed by {}: {}", task_id, agent, result)?;
                if let Some(target) = handoff {
                    write!(f, " (handed off to {})", target)?;
                }
                Ok(())
            }
            StepOutcome::TaskFailed {
                task_id,
                agent,
                error,
            } => write!(f, "Task {} failed on {}: {}", task_id, agent, error),
            StepOutcome::Stalled { blocked_tasks } => write!(
                f,
                "No actionable tasks remain; {} tasks cannot proceed",
                blocked_tasks
            ),
            StepOutcome::Completed => write!(f, "All tasks completed"),
        }
    }
}

/// The session goal: the first user message
pub fn goal_from(messages: &[Message]) -> Option<&str> {
    messages
        .iter()
        .find(|m| m.role == MessageRole::User)
        .map(|m| m.content.as_str())
}

pub struct Orchestrator {
    agents: AgentRegistry,
    planner: Arc<dyn PlanGenerator>,
    evaluator: HandoffEvaluator,
    assembler: ContextAssembler,
    default_agent: String,
    agent_timeout: Option<Duration>,
    max_handoffs: usize,
    bus: Option<MessageBus>,
}

impl Orchestrator {
    /// `default_agent` runs every task without an assignee and must be registered
    pub fn new(
        agents: AgentRegistry,
        planner: Arc<dyn PlanGenerator>,
        default_agent: impl Into<String>,
    ) -> Result<Self, EngineError> {
        let default_agent = default_agent.into();
        if !agents.contains(&default_agent) {
            return Err(EngineError::AgentNotFound(default_agent));
        }
        let defaults = OrchestratorConfig::default();
        Ok(Self {
            agents,
            planner,
            evaluator: HandoffEvaluator::empty(),
            assembler: ContextAssembler::default(),
            default_agent,
            agent_timeout: defaults.agent_timeout(),
            max_handoffs: defaults.max_handoffs,
            bus: None,
        })
    }

    /// Wire a validated team: registry, default agent and handoff rules
    pub fn from_team(
        team: &TeamDefinition,
        implementations: Vec<Arc<dyn Agent>>,
        planner: Arc<dyn PlanGenerator>,
    ) -> Result<Self, EngineError> {
        team.validate()?;
        let default_agent = team
            .default_agent_name()
            .ok_or_else(|| EngineError::InvalidTeam("Team declares no agents".to_string()))?
            .to_string();
        let registry = AgentRegistry::from_team(team, implementations)?;
        let evaluator = team.build_evaluator()?;
        Ok(Self::new(registry, planner, default_agent)?.with_evaluator(evaluator))
    }

    pub fn with_evaluator(mut self, evaluator: HandoffEvaluator) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn with_assembler(mut self, assembler: ContextAssembler) -> Self {
        self.assembler = assembler;
        self
    }

    pub fn with_config(mut self, config: &OrchestratorConfig) -> Self {
        self.agent_timeout = config.agent_timeout();
        self.max_handoffs = config.max_handoffs;
        self
    }

    pub fn with_timeout(mut self, agent_timeout: Option<Duration>) -> Self {
        self.agent_timeout = agent_timeout;
        self
    }

    pub fn with_max_handoffs(mut self, max_handoffs: usize) -> Self {
        self.max_handoffs = max_handoffs;
        self
    }

    pub fn with_bus(mut self, bus: MessageBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn evaluator_mut(&mut self) -> &mut HandoffEvaluator {
        &mut self.evaluator
    }

    pub fn agents(&self) -> &AgentRegistry {
        &self.agents
    }

    pub fn default_agent(&self) -> &str {
        &self.default_agent
    }

    /// Advance the session's plan by one step
    pub async fn step(
        &self,
        plan: &mut Option<Plan>,
        messages: &[Message],
        storage: &dyn TaskStorage,
    ) -> Result<StepOutcome, EngineError> {
        let session_id = storage.task_id();

        let Some(current) = plan.as_mut() else {
            let created = self.create_plan(messages, storage).await?;
            let outcome = StepOutcome::PlanCreated {
                plan_name: created.name.clone(),
                total_tasks: created.progress.total_tasks,
            };
            *plan = Some(created);
            return Ok(outcome);
        };

        if current.is_complete() {
            debug!(session = session_id, "Plan already complete");
            return Ok(StepOutcome::Completed);
        }

        let Some(task) = current.get_next_actionable_task().cloned() else {
            let blocked_tasks = current
                .tasks()
                .filter(|t| !t.status.is_terminal())
                .count();
            warn!(
                session = session_id,
                blocked = blocked_tasks,
                "Plan stalled: no actionable task"
            );
            return Ok(StepOutcome::Stalled { blocked_tasks });
        };

        self.run_task(current, task, messages, storage).await
    }

    /// Return tasks left in progress by an interrupted step to the queue
    ///
    /// A step that is cancelled mid-dispatch leaves its task persisted as
    /// in progress, which nothing would ever pick up again. Returns the ids
    /// of the requeued tasks; the plan is stored only when something moved.
    pub async fn requeue_interrupted(
        &self,
        plan: &mut Plan,
        storage: &dyn TaskStorage,
    ) -> Result<Vec<String>, EngineError> {
        let interrupted: Vec<String> = plan
            .tasks()
            .filter(|t| t.status == TaskStatus::InProgress)
            .map(|t| t.id.clone())
            .collect();
        if interrupted.is_empty() {
            return Ok(interrupted);
        }

        for task_id in &interrupted {
            self.mark_status(plan, task_id, TaskStatus::Pending)?;
            plan.add_task_note(task_id, "Interrupted before completion, requeued")?;
            warn!(
                session = storage.task_id(),
                task = %task_id,
                "Requeued interrupted task"
            );
        }
        storage.store_plan(plan).await?;
        Ok(interrupted)
    }

    async fn create_plan(
        &self,
        messages: &[Message],
        storage: &dyn TaskStorage,
    ) -> Result<Plan, EngineError> {
        let goal = goal_from(messages).ok_or_else(|| {
            EngineError::PlanGeneration("No user message to derive a goal from".to_string())
        })?;

        let mut plan = self
            .planner
            .generate_plan(goal, messages, &self.agents.descriptors())
            .await?;
        plan.validate()?;
        plan.update_progress();
        storage.store_plan(&plan).await?;

        info!(
            session = storage.task_id(),
            plan = %plan.id,
            tasks = plan.progress.total_tasks,
            "Created plan '{}'",
            plan.name
        );
        self.emit(Event::PlanCreated {
            session_id: storage.task_id().to_string(),
            plan_id: plan.id.clone(),
            total_tasks: plan.progress.total_tasks,
        })
        .await;
        Ok(plan)
    }

    async fn run_task(
        &self,
        plan: &mut Plan,
        task: PlanTask,
        messages: &[Message],
        storage: &dyn TaskStorage,
    ) -> Result<StepOutcome, EngineError> {
        let session_id = storage.task_id().to_string();
        let agent_name = task
            .assigned_to
            .clone()
            .unwrap_or_else(|| self.default_agent.clone());
        let goal = goal_from(messages).unwrap_or(&plan.name).to_string();

        self.mark_status(plan, &task.id, TaskStatus::InProgress)?;
        storage.store_plan(plan).await?;
        info!(session = %session_id, task = %task.id, agent = %agent_name, "Dispatching task");
        self.emit(Event::TaskStarted {
            session_id: session_id.clone(),
            task_id: task.id.clone(),
            agent: agent_name.clone(),
        })
        .await;

        let taskspace_files = artifact_names(storage).await;
        let result = match self.agents.get(&agent_name) {
            Some(agent) => {
                let prompt = self.assembler.assemble(plan, &task, &goal, messages);
                let context = AgentContext {
                    session_id: session_id.clone(),
                    task_id: task.id.clone(),
                    task_description: task.description.clone(),
                    goal: goal.clone(),
                    taskspace_files,
                };
                self.dispatch(agent.as_ref(), &prompt, &context).await
            }
            None => Err(EngineError::AgentNotFound(agent_name.clone())),
        };

        match result {
            Ok(output) => {
                self.record_success(plan, &task, &agent_name, &output)?;
                storage.store_plan(plan).await?;
                info!(session = %session_id, task = %task.id, "Task completed");
                self.emit(Event::TaskCompleted {
                    session_id: session_id.clone(),
                    task_id: task.id.clone(),
                    agent: agent_name.clone(),
                    result: truncate(&output, MAX_RESULT_NOTE),
                })
                .await;

                // The agent may have written artifacts during the task
                let handoff_context = HandoffContext {
                    current_agent: agent_name.clone(),
                    task_result: output.clone(),
                    goal,
                    conversation: messages.to_vec(),
                    taskspace_files: artifact_names(storage).await,
                };
                let handoff = self
                    .handle_handoff(plan, &task, &handoff_context, storage)
                    .await?;

                if plan.is_complete() {
                    info!(session = %session_id, "Plan completed");
                    self.emit(Event::PlanCompleted {
                        session_id,
                        plan_id: plan.id.clone(),
                    })
                    .await;
                }

                Ok(StepOutcome::TaskCompleted {
                    task_id: task.id,
                    agent: agent_name,
                    result: output,
                    handoff,
                })
            }
            Err(e) => {
                error!(session = %session_id, task = %task.id, agent = %agent_name, "Task failed: {}", e);
                self.mark_status(plan, &task.id, TaskStatus::Failed)?;
                plan.add_task_note(&task.id, format!("Failed: {}", e))?;
                storage.store_plan(plan).await?;
                self.emit(Event::TaskFailed {
                    session_id,
                    task_id: task.id.clone(),
                    agent: agent_name.clone(),
                    error: e.to_string(),
                })
                .await;

                Ok(StepOutcome::TaskFailed {
                    task_id: task.id,
                    agent: agent_name,
                    error: e.to_string(),
                })
            }
        }
    }

    async fn dispatch(
        &self,
        agent: &dyn Agent,
        messages: &[Message],
        context: &AgentContext,
    ) -> Result<String, EngineError> {
        let call = agent.generate_response(messages, context);
        match self.agent_timeout {
            Some(limit) => match timeout(limit, call).await {
                Ok(result) => result,
                Err(_) => Err(EngineError::AgentTimeout {
                    agent: agent.name().to_string(),
                    secs: limit.as_secs(),
                }),
            },
            None => call.await,
        }
    }

    /// Inject a handoff task when a rule (or fallback) picks another agent
    async fn handle_handoff(
        &self,
        plan: &mut Plan,
        source: &PlanTask,
        context: &HandoffContext,
        storage: &dyn TaskStorage,
    ) -> Result<Option<String>, EngineError> {
        let target = match self.evaluator.evaluate_handoffs(context).await {
            Some(target) => target,
            None => match self.evaluator.get_fallback_agent(&context.current_agent) {
                Some(fallback) => fallback.to_string(),
                None => return Ok(None),
            },
        };

        if target == context.current_agent {
            debug!("Ignoring handoff from {} to itself", target);
            return Ok(None);
        }
        let injected = plan.count_tasks_with_prefix(HANDOFF_TASK_PREFIX);
        if injected >= self.max_handoffs {
            warn!(
                session = storage.task_id(),
                "Handoff limit ({}) reached, not routing to {}",
                self.max_handoffs,
                target
            );
            return Ok(None);
        }

        let mut number = injected + 1;
        let mut id = format!("{}{}", HANDOFF_TASK_PREFIX, number);
        while plan.task(&id).is_some() {
            number += 1;
            id = format!("{}{}", HANDOFF_TASK_PREFIX, number);
        }

        let handoff_task = PlanTask::new(
            id.clone(),
            format!("Continue '{}' handed off from {}", source.description, context.current_agent),
        )
        .assigned_to(target.clone())
        .with_note(format!(
            "Previous result from {}: {}",
            context.current_agent,
            truncate(&context.task_result, MAX_RESULT_NOTE)
        ));

        let phase_id = plan.phase_of(&source.id).map(str::to_string);
        self.inject_task(plan, phase_id.as_deref(), handoff_task)?;
        storage.store_plan(plan).await?;

        info!(
            session = storage.task_id(),
            task = %id,
            "Handoff {} -> {}",
            context.current_agent,
            target
        );
        self.emit(Event::HandoffTriggered {
            session_id: storage.task_id().to_string(),
            from_agent: context.current_agent.clone(),
            to_agent: target.clone(),
            task_id: id,
        })
        .await;
        Ok(Some(target))
    }

    fn mark_status(
        &self,
        plan: &mut Plan,
        task_id: &str,
        status: TaskStatus,
    ) -> Result<(), EngineError> {
        plan.set_task_status(task_id, status)?;
        plan.update_progress();
        Ok(())
    }

    fn record_success(
        &self,
        plan: &mut Plan,
        task: &PlanTask,
        agent: &str,
        output: &str,
    ) -> Result<(), EngineError> {
        plan.set_task_status(&task.id, TaskStatus::Completed)?;
        plan.add_task_note(&task.id, format!("Result: {}", truncate(output, MAX_RESULT_NOTE)))?;
        debug!("Recorded result of {} from {}", task.id, agent);
        plan.update_progress();
        Ok(())
    }

    fn inject_task(
        &self,
        plan: &mut Plan,
        phase_id: Option<&str>,
        task: PlanTask,
    ) -> Result<(), EngineError> {
        plan.insert_task(phase_id, task)?;
        plan.update_progress();
        Ok(())
    }

    async fn emit(&self, event: Event) {
        if let Some(bus) = &self.bus {
            bus.publish(event).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conductor::handoff::{HandoffCondition, HandoffRule};
    use crate::conductor::planner::StaticPlanner;
    use crate::plan::{Phase, PlanStatus};
    use crate::storage::{FileSystemStorage, StorageResult};
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct Scripted {
        name: &'static str,
        reply: Result<&'static str, &'static str>,
    }

    #[async_trait]
    impl Agent for Scripted {
        fn name(&self) -> &str {
            self.name
        }
        async fn generate_response(
            &self,
            _messages: &[Message],
            _context: &AgentContext,
        ) -> Result<String, EngineError> {
            self.reply
                .map(str::to_string)
                .map_err(|e| EngineError::agent_failed(self.name, e))
        }
    }

    struct Slow;

    #[async_trait]
    impl Agent for Slow {
        fn name(&self) -> &str {
            "slow"
        }
        async fn generate_response(
            &self,
            _messages: &[Message],
            _context: &AgentContext,
        ) -> Result<String, EngineError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok("late".to_string())
        }
    }

    fn registry(agents: Vec<Arc<dyn Agent>>) -> AgentRegistry {
        let mut registry = AgentRegistry::new();
        for agent in agents {
            registry.register(agent);
        }
        registry
    }

    fn three_tasks() -> Plan {
        Plan::new("three").with_phase(
            Phase::new("p1", "Work")
                .with_task(PlanTask::new("t1", "first"))
                .with_task(PlanTask::new("t2", "second"))
                .with_task(PlanTask::new("t3", "third")),
        )
    }

    fn orchestrator(plan: Plan, agents: Vec<Arc<dyn Agent>>, default: &str) -> Orchestrator {
        Orchestrator::new(
            registry(agents),
            Arc::new(StaticPlanner::new(plan).unwrap()),
            default,
        )
        .unwrap()
    }

    fn ok_agent(name: &'static str, reply: &'static str) -> Arc<dyn Agent> {
        Arc::new(Scripted {
            name,
            reply: Ok(reply),
        })
    }

    #[tokio::test]
    async fn test_first_step_creates_and_persists_plan() {
        let dir = TempDir::new().unwrap();
        let storage = FileSystemStorage::new(dir.path(), "s1").unwrap();
        let orch = orchestrator(three_tasks(), vec![ok_agent("worker", "ok")], "worker");

        let mut plan = None;
        let outcome = orch
            .step(&mut plan, &[Message::user("do things")], &storage)
            .await
            .unwrap();

        assert_eq!(
            outcome,
            StepOutcome::PlanCreated {
                plan_name: "three".into(),
                total_tasks: 3
            }
        );
        let stored = storage.get_plan().await.unwrap().unwrap();
        assert_eq!(stored.id, plan.as_ref().unwrap().id);
        assert_eq!(stored.progress.total_tasks, 3);
    }

    #[tokio::test]
    async fn test_no_goal_is_fatal() {
        let dir = TempDir::new().unwrap();
        let storage = FileSystemStorage::new(dir.path(), "s1").unwrap();
        let orch = orchestrator(three_tasks(), vec![ok_agent("worker", "ok")], "worker");

        let err = orch.step(&mut None, &[], &storage).await.unwrap_err();
        assert!(matches!(err, EngineError::PlanGeneration(_)));
    }

    #[tokio::test]
    async fn test_document_order_and_progress() {
        let dir = TempDir::new().unwrap();
        let storage = FileSystemStorage::new(dir.path(), "s1").unwrap();
        let orch = orchestrator(three_tasks(), vec![ok_agent("worker", "ok")], "worker");
        let messages = [Message::user("go")];

        let mut plan = None;
        orch.step(&mut plan, &messages, &storage).await.unwrap();
        let outcome = orch.step(&mut plan, &messages, &storage).await.unwrap();

        assert!(matches!(outcome, StepOutcome::TaskCompleted { ref task_id, .. } if task_id == "t1"));
        let current = plan.as_ref().unwrap();
        assert_eq!(current.overall_status, PlanStatus::InProgress);
        assert_eq!(current.progress.percentage_complete, 33.3);
        assert_eq!(current.task("t1").unwrap().notes, vec!["Result: ok".to_string()]);

        orch.step(&mut plan, &messages, &storage).await.unwrap();
        orch.step(&mut plan, &messages, &storage).await.unwrap();
        assert!(plan.as_ref().unwrap().is_complete());
        assert_eq!(
            orch.step(&mut plan, &messages, &storage).await.unwrap(),
            StepOutcome::Completed
        );
    }

    #[tokio::test]
    async fn test_agent_failure_is_task_local() {
        let dir = TempDir::new().unwrap();
        let storage = FileSystemStorage::new(dir.path(), "s1").unwrap();
        let plan_def = Plan::new("deps").with_phase(
            Phase::new("p1", "Work")
                .with_task(PlanTask::new("a", "breaks"))
                .with_task(PlanTask::new("b", "after a").depends_on(["a"])),
        );
        let orch = orchestrator(
            plan_def,
            vec![Arc::new(Scripted {
                name: "worker",
                reply: Err("model offline"),
            })],
            "worker",
        );
        let messages = [Message::user("go")];

        let mut plan = None;
        orch.step(&mut plan, &messages, &storage).await.unwrap();
        let outcome = orch.step(&mut plan, &messages, &storage).await.unwrap();

        assert!(matches!(outcome, StepOutcome::TaskFailed { ref task_id, .. } if task_id == "a"));
        let stored = storage.get_plan().await.unwrap().unwrap();
        assert_eq!(stored.overall_status, PlanStatus::Failed);
        assert!(stored.task("a").unwrap().notes[0].starts_with("Failed:"));

        // b can never run
        assert_eq!(
            orch.step(&mut plan, &messages, &storage).await.unwrap(),
            StepOutcome::Stalled { blocked_tasks: 1 }
        );
    }

    #[tokio::test]
    async fn test_unknown_agent_fails_task() {
        let dir = TempDir::new().unwrap();
        let storage = FileSystemStorage::new(dir.path(), "s1").unwrap();
        let plan_def = Plan::new("p").with_phase(
            Phase::new("p1", "Work").with_task(PlanTask::new("t1", "x").assigned_to("ghost")),
        );
        let orch = orchestrator(plan_def, vec![ok_agent("worker", "ok")], "worker");
        let messages = [Message::user("go")];

        let mut plan = None;
        orch.step(&mut plan, &messages, &storage).await.unwrap();
        match orch.step(&mut plan, &messages, &storage).await.unwrap() {
            StepOutcome::TaskFailed { agent, error, .. } => {
                assert_eq!(agent, "ghost");
                assert!(error.contains("ghost"));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let dir = TempDir::new().unwrap();
        let storage = FileSystemStorage::new(dir.path(), "s1").unwrap();
        let plan_def = Plan::new("p")
            .with_phase(Phase::new("p1", "Work").with_task(PlanTask::new("t1", "x")));
        let orch = orchestrator(plan_def, vec![Arc::new(Slow)], "slow")
            .with_timeout(Some(Duration::from_millis(20)));
        let messages = [Message::user("go")];

        let mut plan = None;
        orch.step(&mut plan, &messages, &storage).await.unwrap();
        let outcome = orch.step(&mut plan, &messages, &storage).await.unwrap();
        assert!(matches!(outcome, StepOutcome::TaskFailed { .. }));
        assert_eq!(
            plan.unwrap().task("t1").unwrap().status,
            TaskStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_handoff_injects_task_into_source_phase() {
        let dir = TempDir::new().unwrap();
        let storage = FileSystemStorage::new(dir.path(), "s1").unwrap();
        let plan_def = Plan::new("docs")
            .with_phase(
                Phase::new("draft", "Draft")
                    .with_task(PlanTask::new("write", "write it").assigned_to("writer")),
            )
            .with_phase(
                Phase::new("ship", "Ship")
                    .with_task(PlanTask::new("publish", "publish").assigned_to("writer")),
            );
        let evaluator = HandoffEvaluator::new(
            vec![HandoffRule::new(
                "writer",
                "reviewer",
                HandoffCondition::NaturalLanguage("when the draft is complete".into()),
            )],
            ["writer", "reviewer"],
        )
        .unwrap();
        let orch = orchestrator(
            plan_def,
            vec![
                ok_agent("writer", "Draft complete."),
                ok_agent("reviewer", "Looks good"),
            ],
            "writer",
        )
        .with_evaluator(evaluator);
        let messages = [Message::user("write docs")];

        let mut plan = None;
        orch.step(&mut plan, &messages, &storage).await.unwrap();
        let outcome = orch.step(&mut plan, &messages, &storage).await.unwrap();
        assert!(matches!(
            outcome,
            StepOutcome::TaskCompleted { handoff: Some(ref to), .. } if to == "reviewer"
        ));

        let current = plan.as_ref().unwrap();
        let draft_ids: Vec<&str> = current.phases[0].tasks.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(draft_ids, vec!["write", "handoff_1"]);
        let injected = current.task("handoff_1").unwrap();
        assert_eq!(injected.assigned_to.as_deref(), Some("reviewer"));
        assert!(injected.dependencies.is_empty());
        assert!(injected.notes[0].contains("Draft complete."));

        // The handoff task is actionable before the later phase
        let outcome = orch.step(&mut plan, &messages, &storage).await.unwrap();
        assert!(matches!(outcome, StepOutcome::TaskCompleted { ref task_id, .. } if task_id == "handoff_1"));
    }

    #[tokio::test]
    async fn test_handoff_limit() {
        let dir = TempDir::new().unwrap();
        let storage = FileSystemStorage::new(dir.path(), "s1").unwrap();
        let plan_def = Plan::new("ping-pong").with_phase(
            Phase::new("p", "P").with_task(PlanTask::new("t1", "start").assigned_to("a")),
        );
        let rules = vec![
            HandoffRule::new("a", "b", HandoffCondition::Contains("done".into())),
            HandoffRule::new("b", "a", HandoffCondition::Contains("done".into())),
        ];
        let orch = orchestrator(
            plan_def,
            vec![ok_agent("a", "done"), ok_agent("b", "done")],
            "a",
        )
        .with_evaluator(HandoffEvaluator::new(rules, ["a", "b"]).unwrap())
        .with_max_handoffs(2);
        let messages = [Message::user("go")];

        let mut plan = None;
        for _ in 0..10 {
            let outcome = orch.step(&mut plan, &messages, &storage).await.unwrap();
            if outcome.is_terminal() {
                break;
            }
        }

        let current = plan.unwrap();
        assert_eq!(current.count_tasks_with_prefix(HANDOFF_TASK_PREFIX), 2);
        assert!(current.is_complete());
    }

    #[tokio::test]
    async fn test_fallback_used_when_no_rule_matches() {
        let dir = TempDir::new().unwrap();
        let storage = FileSystemStorage::new(dir.path(), "s1").unwrap();
        let plan_def = Plan::new("p").with_phase(
            Phase::new("p", "P").with_task(PlanTask::new("t1", "x").assigned_to("a")),
        );
        let mut orch = orchestrator(
            plan_def,
            vec![ok_agent("a", "whatever"), ok_agent("b", "ok")],
            "a",
        )
        .with_evaluator(HandoffEvaluator::new(Vec::new(), ["a", "b"]).unwrap());
        orch.evaluator_mut().register_fallback("a", "b").unwrap();

        let messages = [Message::user("go")];
        let mut plan = None;
        orch.step(&mut plan, &messages, &storage).await.unwrap();
        let outcome = orch.step(&mut plan, &messages, &storage).await.unwrap();
        assert!(matches!(outcome, StepOutcome::TaskCompleted { handoff: Some(_), .. }));
    }

    /// Writes a draft into the taskspace while working
    struct Drafter {
        storage: Arc<FileSystemStorage>,
    }

    #[async_trait]
    impl Agent for Drafter {
        fn name(&self) -> &str {
            "writer"
        }
        async fn generate_response(
            &self,
            _messages: &[Message],
            _context: &AgentContext,
        ) -> Result<String, EngineError> {
            self.storage
                .store_artifact(crate::storage::ArtifactWrite::new("draft.md", "# Draft"))
                .await?;
            Ok("written".to_string())
        }
    }

    /// Answers yes once a draft exists in the taskspace
    struct DraftExists;

    #[async_trait]
    impl crate::conductor::handoff::ConditionClassifier for DraftExists {
        async fn classify(
            &self,
            _question: &str,
            context: &HandoffContext,
        ) -> Result<bool, EngineError> {
            Ok(context.taskspace_files.iter().any(|f| f == "draft.md"))
        }
    }

    #[tokio::test]
    async fn test_handoff_sees_artifacts_written_during_task() {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(FileSystemStorage::new(dir.path(), "s1").unwrap());
        let plan_def = Plan::new("docs").with_phase(
            Phase::new("p", "P").with_task(PlanTask::new("t1", "draft").assigned_to("writer")),
        );
        let evaluator = HandoffEvaluator::new(
            vec![HandoffRule::new(
                "writer",
                "reviewer",
                HandoffCondition::Classifier("Is there a draft to review?".into()),
            )],
            ["writer", "reviewer"],
        )
        .unwrap()
        .with_classifier(Arc::new(DraftExists));
        let drafter: Arc<dyn Agent> = Arc::new(Drafter {
            storage: storage.clone(),
        });
        let orch = orchestrator(
            plan_def,
            vec![drafter, ok_agent("reviewer", "ok")],
            "writer",
        )
        .with_evaluator(evaluator);
        let messages = [Message::user("draft it")];

        let mut plan = None;
        orch.step(&mut plan, &messages, storage.as_ref()).await.unwrap();
        let outcome = orch.step(&mut plan, &messages, storage.as_ref()).await.unwrap();
        assert!(matches!(
            outcome,
            StepOutcome::TaskCompleted { handoff: Some(ref to), .. } if to == "reviewer"
        ));
    }

    #[tokio::test]
    async fn test_requeue_interrupted_tasks() {
        let dir = TempDir::new().unwrap();
        let storage = FileSystemStorage::new(dir.path(), "s1").unwrap();
        let orch = orchestrator(three_tasks(), vec![ok_agent("worker", "ok")], "worker");

        let mut plan = three_tasks();
        plan.set_task_status("t1", TaskStatus::Completed).unwrap();
        plan.set_task_status("t2", TaskStatus::InProgress).unwrap();
        plan.update_progress();

        let requeued = orch.requeue_interrupted(&mut plan, &storage).await.unwrap();
        assert_eq!(requeued, vec!["t2".to_string()]);
        let t2 = plan.task("t2").unwrap();
        assert_eq!(t2.status, TaskStatus::Pending);
        assert!(t2.notes[0].contains("Interrupted"));
        assert_eq!(plan.progress.in_progress_tasks, 0);
        assert_eq!(plan.get_next_actionable_task().unwrap().id, "t2");

        let stored = storage.get_plan().await.unwrap().unwrap();
        assert_eq!(stored.task("t2").unwrap().status, TaskStatus::Pending);

        // Nothing to do the second time around
        assert!(orch.requeue_interrupted(&mut plan, &storage).await.unwrap().is_empty());
    }

    /// Storage whose plan writes always fail
    struct ReadOnly(FileSystemStorage);

    #[async_trait]
    impl TaskStorage for ReadOnly {
        fn task_id(&self) -> &str {
            self.0.task_id()
        }
        async fn store_plan(&self, _plan: &Plan) -> StorageResult<()> {
            Err(crate::storage::StorageError::Io("read-only".into()))
        }
        async fn get_plan(&self) -> StorageResult<Option<Plan>> {
            self.0.get_plan().await
        }
        async fn store_artifact(
            &self,
            a: crate::storage::ArtifactWrite,
        ) -> StorageResult<crate::storage::ArtifactInfo> {
            self.0.store_artifact(a).await
        }
        async fn get_artifact(&self, n: &str, v: Option<u32>) -> StorageResult<Option<String>> {
            self.0.get_artifact(n, v).await
        }
        async fn list_artifacts(&self) -> StorageResult<Vec<crate::storage::ArtifactInfo>> {
            self.0.list_artifacts().await
        }
        async fn store_message(&self, m: &Message) -> StorageResult<()> {
            self.0.store_message(m).await
        }
        async fn get_conversation_history(&self, l: Option<usize>) -> StorageResult<Vec<Message>> {
            self.0.get_conversation_history(l).await
        }
        async fn scan_tree(&self) -> StorageResult<crate::storage::TreeScan> {
            self.0.scan_tree().await
        }
        async fn list_directory(
            &self,
            p: &str,
        ) -> StorageResult<crate::storage::DirectoryListing> {
            self.0.list_directory(p).await
        }
    }

    #[tokio::test]
    async fn test_persistence_failure_is_fatal() {
        let dir = TempDir::new().unwrap();
        let storage = ReadOnly(FileSystemStorage::new(dir.path(), "s1").unwrap());
        let orch = orchestrator(three_tasks(), vec![ok_agent("worker", "ok")], "worker");

        let err = orch
            .step(&mut None, &[Message::user("go")], &storage)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Storage(_)));
    }

    #[test]
    fn test_default_agent_must_exist() {
        let result = Orchestrator::new(
            registry(vec![ok_agent("worker", "ok")]),
            Arc::new(StaticPlanner::new(three_tasks()).unwrap()),
            "nobody",
        );
        assert!(matches!(result, Err(EngineError::AgentNotFound(_))));
    }

    #[test]
    fn test_outcome_display() {
        let outcome = StepOutcome::TaskCompleted {
            task_id: "t1".into(),
            agent: "writer".into(),
            result: "done".into(),
            handoff: Some("reviewer".into()),
        };
        assert_eq!(
            outcome.to_string(),
            "Task t1 completed by writer: done (handed off to reviewer)"
        );
        assert_eq!(StepOutcome::Completed.to_string(), "All tasks completed");
    }
}
