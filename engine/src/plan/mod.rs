//! Plan Model
//!
//! A `Plan` is the authoritative execution guide for one task/session: an
//! ordered list of phases, each holding ordered plan tasks with dependency
//! edges. Derived state (phase status, overall status, progress) is only
//! refreshed by `Plan::update_progress`, which callers must invoke after
//! every task mutation.

use chrono::{DateTime, Utc};
use sdk::errors::EngineError;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Current plan document schema version
pub const SCHEMA_VERSION: u32 = 1;

/// Id prefix marking tasks injected by the handoff evaluator
pub const HANDOFF_TASK_PREFIX: &str = "handoff_";

/// Overall status of a plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    #[default]
    NotStarted,
    InProgress,
    Completed,
    Failed,
}

/// Derived status of a phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
}

/// Status of a single plan task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
    Blocked,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Blocked => "blocked",
        }
    }

    /// Completed and failed tasks never move again
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanStatus::NotStarted => write!(f, "not_started"),
            PlanStatus::InProgress => write!(f, "in_progress"),
            PlanStatus::Completed => write!(f, "completed"),
            PlanStatus::Failed => write!(f, "failed"),
        }
    }
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhaseStatus::Pending => write!(f, "pending"),
            PhaseStatus::InProgress => write!(f, "in_progress"),
            PhaseStatus::Completed => write!(f, "completed"),
        }
    }
}

/// Aggregated progress snapshot, recomputed by `Plan::update_progress`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub total_tasks: usize,
    pub completed_tasks: usize,
    pub in_progress_tasks: usize,
    pub percentage_complete: f64,
}

impl Progress {
    fn percentage(completed: usize, total: usize) -> f64 {
        if total == 0 {
            return 0.0;
        }
        (completed as f64 / total as f64 * 1000.0).round() / 10.0
    }
}

/// One assignable unit of work inside a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanTask {
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deliverable: Option<String>,
    #[serde(default)]
    pub success_criteria: Vec<String>,
    #[serde(default)]
    pub notes: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl PlanTask {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            description: description.into(),
            status: TaskStatus::Pending,
            assigned_to: None,
            deliverable: None,
            success_criteria: Vec::new(),
            notes: Vec::new(),
            dependencies: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn assigned_to(mut self, agent: impl Into<String>) -> Self {
        self.assigned_to = Some(agent.into());
        self
    }

    pub fn depends_on<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn with_deliverable(mut self, deliverable: impl Into<String>) -> Self {
        self.deliverable = Some(deliverable.into());
        self
    }

    pub fn with_criterion(mut self, criterion: impl Into<String>) -> Self {
        self.success_criteria.push(criterion.into());
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }

    pub fn is_handoff(&self) -> bool {
        self.id.starts_with(HANDOFF_TASK_PREFIX)
    }
}

/// Named stage of work grouping related tasks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub status: PhaseStatus,
    #[serde(default)]
    pub tasks: Vec<PlanTask>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Phase {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            status: PhaseStatus::Pending,
            tasks: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_task(mut self, task: PlanTask) -> Self {
        self.tasks.push(task);
        self
    }

    fn derive_status(&self) -> PhaseStatus {
        if !self.tasks.is_empty()
            && self
                .tasks
                .iter()
                .all(|t| t.status == TaskStatus::Completed)
        {
            PhaseStatus::Completed
        } else if self
            .tasks
            .iter()
            .any(|t| matches!(t.status, TaskStatus::InProgress | TaskStatus::Completed))
        {
            PhaseStatus::InProgress
        } else {
            PhaseStatus::Pending
        }
    }
}

fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

/// Versioned, hierarchical task list for one task/session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub last_updated: DateTime<Utc>,
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_error: Option<String>,
    pub name: String,
    #[serde(default)]
    pub phases: Vec<Phase>,
    #[serde(default)]
    pub overall_status: PlanStatus,
    #[serde(default)]
    pub progress: Progress,
}

impl Plan {
    /// Create an empty plan with a fresh id
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: now,
            last_updated: now,
            schema_version: SCHEMA_VERSION,
            load_error: None,
            name: name.into(),
            phases: Vec::new(),
            overall_status: PlanStatus::NotStarted,
            progress: Progress::default(),
        }
    }

    pub fn with_phase(mut self, phase: Phase) -> Self {
        self.phases.push(phase);
        self
    }

    /// Parse and validate a plan document, refreshing its derived state
    pub fn from_json(json: &str) -> Result<Self, EngineError> {
        let mut plan: Plan = serde_json::from_str(json)
            .map_err(|e| EngineError::InvalidPlan(format!("Failed to parse plan: {}", e)))?;
        plan.validate()?;
        plan.update_progress();
        Ok(plan)
    }

    /// Reject plans whose task ids are empty or collide
    ///
    /// Dependencies on unknown ids are accepted: such tasks are simply never
    /// actionable.
    pub fn validate(&self) -> Result<(), EngineError> {
        let mut seen = HashSet::new();
        for task in self.tasks() {
            if task.id.trim().is_empty() {
                return Err(EngineError::InvalidPlan(format!(
                    "Task '{}' has an empty id",
                    task.description
                )));
            }
            if !seen.insert(task.id.as_str()) {
                return Err(EngineError::InvalidPlan(format!(
                    "Duplicate task id '{}'",
                    task.id
                )));
            }
        }
        Ok(())
    }

    /// All tasks in document order
    pub fn tasks(&self) -> impl Iterator<Item = &PlanTask> {
        self.phases.iter().flat_map(|p| p.tasks.iter())
    }

    pub fn task(&self, id: &str) -> Option<&PlanTask> {
        self.tasks().find(|t| t.id == id)
    }

    fn task_mut(&mut self, id: &str) -> Option<&mut PlanTask> {
        self.phases
            .iter_mut()
            .flat_map(|p| p.tasks.iter_mut())
            .find(|t| t.id == id)
    }

    /// Id of the phase holding the given task
    pub fn phase_of(&self, task_id: &str) -> Option<&str> {
        self.phases
            .iter()
            .find(|p| p.tasks.iter().any(|t| t.id == task_id))
            .map(|p| p.id.as_str())
    }

    /// Recompute progress, phase statuses and overall status
    pub fn update_progress(&mut self) {
        let mut total = 0;
        let mut completed = 0;
        let mut in_progress = 0;
        let mut failed = 0;

        for phase in &mut self.phases {
            phase.status = phase.derive_status();
            for task in &phase.tasks {
                total += 1;
                match task.status {
                    TaskStatus::Completed => completed += 1,
                    TaskStatus::InProgress => in_progress += 1,
                    TaskStatus::Failed => failed += 1,
                    TaskStatus::Pending | TaskStatus::Blocked => {}
                }
            }
        }

        self.progress = Progress {
            total_tasks: total,
            completed_tasks: completed,
            in_progress_tasks: in_progress,
            percentage_complete: Progress::percentage(completed, total),
        };

        self.overall_status = if failed > 0 {
            PlanStatus::Failed
        } else if total > 0 && completed == total {
            PlanStatus::Completed
        } else if completed > 0 || in_progress > 0 {
            PlanStatus::InProgress
        } else {
            PlanStatus::NotStarted
        };

        self.last_updated = Utc::now();
    }

    /// First pending task, in document order, whose dependencies are all completed
    pub fn get_next_actionable_task(&self) -> Option<&PlanTask> {
        let statuses: HashMap<&str, TaskStatus> =
            self.tasks().map(|t| (t.id.as_str(), t.status)).collect();

        self.tasks().find(|task| {
            task.status == TaskStatus::Pending
                && task.dependencies.iter().all(|dep| {
                    statuses.get(dep.as_str()) == Some(&TaskStatus::Completed)
                })
        })
    }

    pub fn is_complete(&self) -> bool {
        self.overall_status == PlanStatus::Completed
    }

    pub fn has_failed_tasks(&self) -> bool {
        self.tasks().any(|t| t.status == TaskStatus::Failed)
    }

    /// Transition a task, refusing to move it out of a terminal status
    ///
    /// Returns the previous status. Derived state is not refreshed.
    pub fn set_task_status(
        &mut self,
        task_id: &str,
        status: TaskStatus,
    ) -> Result<TaskStatus, EngineError> {
        let task = self
            .task_mut(task_id)
            .ok_or_else(|| EngineError::TaskNotFound(task_id.to_string()))?;

        let previous = task.status;
        if previous == status {
            return Ok(previous);
        }
        if previous.is_terminal() {
            return Err(EngineError::InvalidTransition {
                task_id: task_id.to_string(),
                from: previous.to_string(),
                to: status.to_string(),
            });
        }

        task.status = status;
        task.updated_at = Utc::now();
        Ok(previous)
    }

    pub fn add_task_note(&mut self, task_id: &str, note: impl Into<String>) -> Result<(), EngineError> {
        let task = self
            .task_mut(task_id)
            .ok_or_else(|| EngineError::TaskNotFound(task_id.to_string()))?;
        task.notes.push(note.into());
        task.updated_at = Utc::now();
        Ok(())
    }

    /// Append a task to the given phase (or the last phase)
    ///
    /// A plan without phases gets a "Handoffs" phase created for it.
    pub fn insert_task(&mut self, phase_id: Option<&str>, task: PlanTask) -> Result<(), EngineError> {
        if self.task(&task.id).is_some() {
            return Err(EngineError::InvalidPlan(format!(
                "Duplicate task id '{}'",
                task.id
            )));
        }

        if self.phases.is_empty() {
            self.phases.push(Phase::new("handoffs", "Handoffs"));
        }

        let index = phase_id
            .and_then(|id| self.phases.iter().position(|p| p.id == id))
            .unwrap_or(self.phases.len() - 1);

        self.phases[index].tasks.push(task);
        Ok(())
    }

    pub fn count_tasks_with_prefix(&self, prefix: &str) -> usize {
        self.tasks().filter(|t| t.id.starts_with(prefix)).count()
    }

    /// Compact text rendering used in prompts and the CLI
    pub fn outline(&self) -> String {
        let mut out = format!(
            "Plan: {} [{}] {}/{} tasks ({:.1}%)\n",
            self.name,
            self.overall_status,
            self.progress.completed_tasks,
            self.progress.total_tasks,
            self.progress.percentage_complete
        );
        for phase in &self.phases {
            out.push_str(&format!("## {} [{}]\n", phase.name, phase.status));
            for task in &phase.tasks {
                let agent = task.assigned_to.as_deref().unwrap_or("-");
                out.push_str(&format!(
                    "- [{}] {} ({}): {}\n",
                    task.status, task.id, agent, task.description
                ));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_task_plan() -> Plan {
        let mut plan = Plan::new("test").with_phase(
            Phase::new("p1", "Work")
                .with_task(PlanTask::new("t1", "first"))
                .with_task(PlanTask::new("t2", "second"))
                .with_task(PlanTask::new("t3", "third")),
        );
        plan.update_progress();
        plan
    }

    #[test]
    fn test_document_order_selection() {
        let mut plan = three_task_plan();
        assert_eq!(plan.get_next_actionable_task().unwrap().id, "t1");
        assert_eq!(plan.overall_status, PlanStatus::NotStarted);

        plan.set_task_status("t1", TaskStatus::Completed).unwrap();
        plan.update_progress();

        assert_eq!(plan.overall_status, PlanStatus::InProgress);
        assert_eq!(plan.progress.percentage_complete, 33.3);
        assert_eq!(plan.progress.completed_tasks, 1);
        assert_eq!(plan.get_next_actionable_task().unwrap().id, "t2");
    }

    #[test]
    fn test_dependency_gating() {
        let mut plan = Plan::new("deps").with_phase(
            Phase::new("p1", "Work")
                .with_task(PlanTask::new("b", "needs a").depends_on(["a"]))
                .with_task(PlanTask::new("a", "root")),
        );
        plan.update_progress();

        assert_eq!(plan.get_next_actionable_task().unwrap().id, "a");

        plan.set_task_status("a", TaskStatus::InProgress).unwrap();
        assert!(plan.get_next_actionable_task().is_none());

        plan.set_task_status("a", TaskStatus::Completed).unwrap();
        assert_eq!(plan.get_next_actionable_task().unwrap().id, "b");
    }

    #[test]
    fn test_unknown_dependency_blocks_forever() {
        let plan = Plan::new("bad").with_phase(
            Phase::new("p1", "Work").with_task(PlanTask::new("t1", "x").depends_on(["ghost"])),
        );
        assert!(plan.validate().is_ok());
        assert!(plan.get_next_actionable_task().is_none());
    }

    #[test]
    fn test_failed_dependency_is_not_satisfied() {
        let mut plan = Plan::new("f").with_phase(
            Phase::new("p1", "Work")
                .with_task(PlanTask::new("a", "root"))
                .with_task(PlanTask::new("b", "child").depends_on(["a"])),
        );
        plan.set_task_status("a", TaskStatus::Failed).unwrap();
        plan.update_progress();

        assert!(plan.get_next_actionable_task().is_none());
        assert!(plan.has_failed_tasks());
        assert_eq!(plan.overall_status, PlanStatus::Failed);
    }

    #[test]
    fn test_status_derivation() {
        let mut plan = Plan::new("s")
            .with_phase(
                Phase::new("p1", "One")
                    .with_task(PlanTask::new("a", "a"))
                    .with_task(PlanTask::new("b", "b")),
            )
            .with_phase(Phase::new("p2", "Two").with_task(PlanTask::new("c", "c")));

        plan.update_progress();
        assert!(plan.phases.iter().all(|p| p.status == PhaseStatus::Pending));

        plan.set_task_status("a", TaskStatus::Completed).unwrap();
        plan.set_task_status("b", TaskStatus::Completed).unwrap();
        plan.set_task_status("c", TaskStatus::InProgress).unwrap();
        plan.update_progress();

        assert_eq!(plan.phases[0].status, PhaseStatus::Completed);
        assert_eq!(plan.phases[1].status, PhaseStatus::InProgress);
        assert_eq!(plan.progress.in_progress_tasks, 1);
        assert!(!plan.is_complete());

        plan.set_task_status("c", TaskStatus::Completed).unwrap();
        plan.update_progress();
        assert!(plan.is_complete());
        assert_eq!(plan.progress.percentage_complete, 100.0);
    }

    #[test]
    fn test_empty_plan_is_not_complete() {
        let mut plan = Plan::new("empty").with_phase(Phase::new("p1", "Nothing"));
        plan.update_progress();

        assert_eq!(plan.overall_status, PlanStatus::NotStarted);
        assert_eq!(plan.phases[0].status, PhaseStatus::Pending);
        assert_eq!(plan.progress.percentage_complete, 0.0);
        assert!(!plan.is_complete());
    }

    #[test]
    fn test_update_progress_idempotent() {
        let mut plan = three_task_plan();
        plan.set_task_status("t1", TaskStatus::InProgress).unwrap();
        plan.update_progress();
        let first = (plan.progress.clone(), plan.overall_status);
        let phases: Vec<_> = plan.phases.iter().map(|p| p.status).collect();

        plan.update_progress();
        assert_eq!(first, (plan.progress.clone(), plan.overall_status));
        assert_eq!(phases, plan.phases.iter().map(|p| p.status).collect::<Vec<_>>());
    }

    #[test]
    fn test_terminal_status_is_sticky() {
        let mut plan = three_task_plan();
        plan.set_task_status("t1", TaskStatus::Completed).unwrap();
        let err = plan.set_task_status("t1", TaskStatus::Pending).unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));

        plan.set_task_status("t2", TaskStatus::Failed).unwrap();
        assert!(plan.set_task_status("t2", TaskStatus::InProgress).is_err());

        // Re-asserting the same status is a no-op
        assert_eq!(
            plan.set_task_status("t1", TaskStatus::Completed).unwrap(),
            TaskStatus::Completed
        );
    }

    #[test]
    fn test_unknown_task_mutation() {
        let mut plan = three_task_plan();
        assert!(matches!(
            plan.set_task_status("nope", TaskStatus::Completed),
            Err(EngineError::TaskNotFound(_))
        ));
        assert!(plan.add_task_note("nope", "x").is_err());
    }

    #[test]
    fn test_insert_task() {
        let mut plan = three_task_plan();
        plan.insert_task(Some("p1"), PlanTask::new("handoff_1", "review"))
            .unwrap();
        assert_eq!(plan.phases[0].tasks.last().unwrap().id, "handoff_1");
        assert!(plan.task("handoff_1").unwrap().is_handoff());
        assert_eq!(plan.count_tasks_with_prefix(HANDOFF_TASK_PREFIX), 1);

        let err = plan
            .insert_task(None, PlanTask::new("t1", "dup"))
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidPlan(_)));

        let mut empty = Plan::new("e");
        empty.insert_task(None, PlanTask::new("x", "x")).unwrap();
        assert_eq!(empty.phases[0].id, "handoffs");
    }

    #[test]
    fn test_validate_rejects_duplicates() {
        let plan = Plan::new("dup").with_phase(
            Phase::new("p1", "Work")
                .with_task(PlanTask::new("t1", "a"))
                .with_task(PlanTask::new("t1", "b")),
        );
        assert!(matches!(plan.validate(), Err(EngineError::InvalidPlan(_))));
    }

    #[test]
    fn test_from_json_fills_defaults() {
        let json = r#"{
            "id": "plan-1",
            "name": "Report",
            "phases": [{
                "id": "research",
                "name": "Research",
                "tasks": [
                    {"id": "t1", "description": "collect sources", "assigned_to": "researcher"},
                    {"id": "t2", "description": "write", "dependencies": ["t1"], "status": "completed"}
                ]
            }]
        }"#;

        let plan = Plan::from_json(json).unwrap();
        assert_eq!(plan.schema_version, SCHEMA_VERSION);
        assert_eq!(plan.progress.total_tasks, 2);
        assert_eq!(plan.progress.completed_tasks, 1);
        assert_eq!(plan.overall_status, PlanStatus::InProgress);
        assert_eq!(plan.task("t1").unwrap().status, TaskStatus::Pending);

        assert!(matches!(
            Plan::from_json("{ nope"),
            Err(EngineError::InvalidPlan(_))
        ));
    }

    #[test]
    fn test_json_field_names() {
        let plan = three_task_plan();
        let value = serde_json::to_value(&plan).unwrap();
        assert_eq!(value["overall_status"], "not_started");
        assert_eq!(value["progress"]["total_tasks"], 3);
        assert_eq!(value["phases"][0]["tasks"][0]["status"], "pending");
        assert!(value.get("load_error").is_none());
    }

    #[test]
    fn test_outline() {
        let plan = three_task_plan();
        let outline = plan.outline();
        assert!(outline.contains("Plan: test [not_started] 0/3 tasks"));
        assert!(outline.contains("- [pending] t2 (-): second"));
    }
}
