//! End-to-end orchestration: a team file, a model-backed planner, cached
//! storage and the event bus driven through task sessions.

use async_trait::async_trait;
use sdk::agent::{Agent, AgentContext};
use sdk::errors::EngineError;
use sdk::types::Message;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use troupe_engine::cache::{CacheBackend, MemoryCache};
use troupe_engine::conductor::{Brain, BrainPlanner, Orchestrator, StepOutcome};
use troupe_engine::config::Config;
use troupe_engine::message_bus::{EventType, MessageBus};
use troupe_engine::plan::{PlanStatus, TaskStatus};
use troupe_engine::session::{run_sessions, TaskSession};
use troupe_engine::storage::{open_task_storage, open_task_storage_with_cache, ArtifactWrite};
use troupe_engine::team::TeamDefinition;

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
priority = 1

[[handoffs]]
from = "reviewer"
to = "writer"
condition = { kind = "contains", text = "changes requested" }
"#;

const PLAN_REPLY: &str = r#"Here is the plan:
{
  "name": "Write the guide",
  "phases": [
    {
      "id": "draft",
      "name": "Drafting",
      "tasks": [
        {"id": "outline", "description": "Outline the guide", "assigned_to": "writer"},
        {"id": "write", "description": "Write the guide", "assigned_to": "writer",
         "dependencies": ["outline"]}
      ]
    }
  ]
}"#;

struct CannedBrain;

#[async_trait]
impl Brain for CannedBrain {
    async fn complete(&self, _messages: &[Message]) -> Result<String, EngineError> {
        Ok(PLAN_REPLY.to_string())
    }
}

/// Replies per task id and records the taskspace it was shown
struct Writer {
    seen_files: Mutex<Vec<Vec<String>>>,
}

#[async_trait]
impl Agent for Writer {
    fn name(&self) -> &str {
        "writer"
    }

    async fn generate_response(
        &self,
        _messages: &[Message],
        context: &AgentContext,
    ) -> Result<String, EngineError> {
        if let Ok(mut seen) = self.seen_files.lock() {
            seen.push(context.taskspace_files.clone());
        }
        match context.task_id.as_str() {
            "outline" => Ok("Outline ready: intro, usage, faq".to_string()),
            _ => Ok("Draft complete.".to_string()),
        }
    }
}

struct Reviewer;

#[async_trait]
impl Agent for Reviewer {
    fn name(&self) -> &str {
        "reviewer"
    }

    async fn generate_response(
        &self,
        messages: &[Message],
        _context: &AgentContext,
    ) -> Result<String, EngineError> {
        // The previous agent's result reaches the reviewer through the prompt
        let prompt = &messages[0].content;
        if prompt.contains("Draft complete.") {
            Ok("Approved".to_string())
        } else {
            Err(EngineError::agent_failed("reviewer", "nothing to review"))
        }
    }
}

fn config(dir: &TempDir) -> Config {
    Config::from_toml_str(&format!(
        "[core]\ndata_dir = \"{}\"\n\n[orchestrator]\nmax_handoffs = 4\n",
        dir.path().display()
    ))
    .unwrap()
}

fn orchestrator(config: &Config, writer: Arc<Writer>, bus: Option<MessageBus>) -> Arc<Orchestrator> {
    let team = TeamDefinition::from_toml_str(TEAM).unwrap();
    let planner = Arc::new(BrainPlanner::new(Arc::new(CannedBrain)).with_default_agent("writer"));
    let agents: Vec<Arc<dyn Agent>> = vec![writer, Arc::new(Reviewer)];

    let mut orchestrator = Orchestrator::from_team(&team, agents, planner)
        .unwrap()
        .with_config(&config.orchestrator);
    if let Some(bus) = bus {
        orchestrator = orchestrator.with_bus(bus);
    }
    Arc::new(orchestrator)
}

fn writer() -> Arc<Writer> {
    Arc::new(Writer {
        seen_files: Mutex::new(Vec::new()),
    })
}

#[tokio::test]
async fn test_team_session_runs_to_completion_with_handoff() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    let bus = MessageBus::new();
    let mut events = bus.subscribe(EventType::All).await;
    let writer = writer();
    let orchestrator = orchestrator(&config, writer.clone(), Some(bus));

    let storage = open_task_storage(&config, "guide").await.unwrap();
    storage
        .store_artifact(ArtifactWrite::new("brief.md", "Audience: new users"))
        .await
        .unwrap();

    let mut session = TaskSession::open("guide", orchestrator, storage)
        .await
        .unwrap();
    session
        .submit(Message::user("Write a getting started guide"))
        .await
        .unwrap();

    let summary = session.run(config.orchestrator.max_steps).await.unwrap();

    // create, outline, write, handoff_1, completed
    assert_eq!(summary.steps, 5);
    assert_eq!(summary.status, Some(PlanStatus::Completed));
    assert_eq!(summary.last_outcome, Some(StepOutcome::Completed));

    let plan = session.plan().unwrap();
    assert_eq!(plan.name, "Write the guide");
    let ids: Vec<&str> = plan.tasks().map(|t| t.id.as_str()).collect();
    assert_eq!(ids, vec!["outline", "write", "handoff_1"]);
    let handoff = plan.task("handoff_1").unwrap();
    assert_eq!(handoff.assigned_to.as_deref(), Some("reviewer"));
    assert_eq!(handoff.status, TaskStatus::Completed);
    assert_eq!(plan.progress.percentage_complete, 100.0);

    // Agents saw the taskspace
    let seen = writer.seen_files.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert!(seen.iter().all(|files| files == &vec!["brief.md".to_string()]));
    drop(seen);

    // The persisted plan matches the session's copy
    let stored = session.storage().get_plan().await.unwrap().unwrap();
    assert_eq!(stored.overall_status, PlanStatus::Completed);
    assert_eq!(stored.progress.total_tasks, 3);

    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.session_id(), "guide");
        kinds.push(event.event_type());
    }
    assert_eq!(
        kinds,
        vec![
            EventType::PlanCreated,
            EventType::TaskStarted,
            EventType::TaskCompleted,
            EventType::TaskStarted,
            EventType::TaskCompleted,
            EventType::HandoffTriggered,
            EventType::TaskStarted,
            EventType::TaskCompleted,
            EventType::PlanCompleted,
        ]
    );
}

#[tokio::test]
async fn test_artifact_versions_through_cached_storage() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    let storage = open_task_storage(&config, "report").await.unwrap();

    storage
        .store_artifact(ArtifactWrite::new("report.md", "v1 content"))
        .await
        .unwrap();
    // Warm the cache before the second write
    assert_eq!(
        storage.get_artifact("report.md", None).await.unwrap().as_deref(),
        Some("v1 content")
    );
    assert_eq!(storage.list_artifacts().await.unwrap().len(), 1);

    storage
        .store_artifact(ArtifactWrite::new("report.md", "v2 content"))
        .await
        .unwrap();

    assert_eq!(
        storage.get_artifact("report.md", None).await.unwrap().as_deref(),
        Some("v2 content")
    );
    assert_eq!(
        storage.get_artifact("report.md", Some(1)).await.unwrap().as_deref(),
        Some("v1 content")
    );
    let artifacts = storage.list_artifacts().await.unwrap();
    assert_eq!(artifacts.len(), 1);
    assert_eq!(artifacts[0].name, "report.md");
    assert_eq!(artifacts[0].version, 2);

    let summary = storage.get_project_summary().await.unwrap();
    assert_eq!(summary.artifact_count, 1);
    assert_eq!(summary.task_id, "report");
}

#[tokio::test]
async fn test_sessions_share_a_cache_backend() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    let cache: Arc<dyn CacheBackend> = Arc::new(MemoryCache::new(100));
    let orchestrator = orchestrator(&config, writer(), None);

    let mut sessions = Vec::new();
    for id in ["alpha", "beta", "gamma"] {
        let storage = open_task_storage_with_cache(&config, id, cache.clone()).unwrap();
        let mut session = TaskSession::open(id, orchestrator.clone(), storage)
            .await
            .unwrap();
        session.submit(Message::user(format!("guide {}", id))).await.unwrap();
        sessions.push(session);
    }

    let results = run_sessions(
        sessions,
        config.orchestrator.max_concurrent_sessions,
        config.orchestrator.max_steps,
    )
    .await;

    for (session, result) in &results {
        let summary = result.as_ref().unwrap();
        assert_eq!(summary.session_id, session.id());
        assert_eq!(summary.status, Some(PlanStatus::Completed));

        // Each session reads back its own plan through the shared cache
        let plan = session.storage().get_plan().await.unwrap().unwrap();
        assert_eq!(plan.id, session.plan().unwrap().id);
    }
    assert!(cache.get("alpha:plan").await.is_some() || cache.get("beta:plan").await.is_some());
}

#[tokio::test]
async fn test_invalid_team_is_fatal() {
    let broken = TEAM.replace("to = \"reviewer\"", "to = \"ghost\"");
    let result = TeamDefinition::from_toml_str(&broken);
    assert!(matches!(result, Err(EngineError::InvalidTeam(_))));
}
