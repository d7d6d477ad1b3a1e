//! Task sessions
//!
//! A [`TaskSession`] is one end-to-end run against one plan. It exclusively
//! owns the plan and the conversation for its task id, holds the storage
//! handle for the taskspace, and drives a shared [`Orchestrator`] either one
//! step at a time or to completion.
//!
//! Independent sessions can be driven concurrently with [`run_sessions`];
//! a single session is never stepped concurrently with itself.

use futures::stream::{self, StreamExt};
use sdk::errors::EngineError;
use sdk::types::Message;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::conductor::{Orchestrator, StepOutcome};
use crate::plan::{Plan, PlanStatus, Progress};
use crate::storage::TaskStorage;

/// How a `run` ended
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub session_id: String,
    pub steps: usize,
    pub status: Option<PlanStatus>,
    pub progress: Option<Progress>,
    pub last_outcome: Option<StepOutcome>,
    /// Stopped by the step bound rather than completion or a stall
    pub step_limit_reached: bool,
    pub duration_ms: i64,
}

pub struct TaskSession {
    id: String,
    orchestrator: Arc<Orchestrator>,
    storage: Arc<dyn TaskStorage>,
    plan: Option<Plan>,
    messages: Vec<Message>,
    /// Plan read failure seen while no plan was known
    load_error: Option<String>,
}

impl TaskSession {
    /// Resume (or start) the session stored under `id`
    ///
    /// A plan that cannot be read is treated as absent; the error is kept
    /// and written into the next plan this session creates. Tasks a previous
    /// run left in progress are requeued.
    pub async fn open(
        id: impl Into<String>,
        orchestrator: Arc<Orchestrator>,
        storage: Arc<dyn TaskStorage>,
    ) -> Result<Self, EngineError> {
        let id = id.into();
        if storage.task_id() != id {
            return Err(EngineError::Storage(format!(
                "Storage handle for '{}' opened for session '{}'",
                storage.task_id(),
                id
            )));
        }

        let (mut plan, load_error) = match storage.get_plan().await {
            Ok(plan) => (plan, None),
            Err(e) => {
                warn!(session = %id, "Could not read plan, starting without one: {}", e);
                (None, Some(e.to_string()))
            }
        };
        if let Some(plan) = plan.as_mut() {
            orchestrator
                .requeue_interrupted(plan, storage.as_ref())
                .await?;
        }
        let messages = storage.get_conversation_history(None).await?;

        info!(
            session = %id,
            resumed = plan.is_some(),
            messages = messages.len(),
            "Opened session"
        );

        Ok(Self {
            id,
            orchestrator,
            storage,
            plan,
            messages,
            load_error,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn plan(&self) -> Option<&Plan> {
        self.plan.as_ref()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn storage(&self) -> &Arc<dyn TaskStorage> {
        &self.storage
    }

    /// Append a message to the conversation and persist it
    pub async fn submit(&mut self, message: Message) -> Result<(), EngineError> {
        self.storage.store_message(&message).await?;
        self.messages.push(message);
        Ok(())
    }

    /// Run one orchestrator step and record its response
    pub async fn step(&mut self) -> Result<StepOutcome, EngineError> {
        let had_plan = self.plan.is_some();
        let outcome = self
            .orchestrator
            .step(&mut self.plan, &self.messages, self.storage.as_ref())
            .await?;

        if !had_plan {
            if let (Some(plan), Some(error)) = (self.plan.as_mut(), self.load_error.take()) {
                plan.load_error = Some(error);
                self.storage.store_plan(plan).await?;
            }
        }

        let reply = Message::assistant(outcome.to_string());
        self.storage.store_message(&reply).await?;
        self.messages.push(reply);
        Ok(outcome)
    }

    /// Step until the plan completes, stalls, or `max_steps` is spent
    pub async fn run(&mut self, max_steps: usize) -> Result<RunSummary, EngineError> {
        let start = Instant::now();
        let mut steps = 0;
        let mut last_outcome = None;

        while steps < max_steps {
            let outcome = self.step().await?;
            steps += 1;
            debug!(session = %self.id, step = steps, "{}", outcome);

            let terminal = outcome.is_terminal();
            last_outcome = Some(outcome);
            if terminal {
                break;
            }
        }

        let step_limit_reached = !last_outcome
            .as_ref()
            .map(StepOutcome::is_terminal)
            .unwrap_or(false);
        if step_limit_reached {
            warn!(session = %self.id, "Stopped after {} steps", max_steps);
        }

        let summary = RunSummary {
            session_id: self.id.clone(),
            steps,
            status: self.plan.as_ref().map(|p| p.overall_status),
            progress: self.plan.as_ref().map(|p| p.progress.clone()),
            last_outcome,
            step_limit_reached,
            duration_ms: start.elapsed().as_millis() as i64,
        };
        info!(
            session = %self.id,
            steps = summary.steps,
            "Run finished in {}ms",
            summary.duration_ms
        );
        Ok(summary)
    }

    /// Re-read the plan from storage
    ///
    /// Once a plan is known, a failed or empty read is a hard error.
    pub async fn reload_plan(&mut self) -> Result<Option<&Plan>, EngineError> {
        match self.storage.get_plan().await {
            Ok(Some(plan)) => self.plan = Some(plan),
            Ok(None) if self.plan.is_some() => {
                return Err(EngineError::NotFound(format!(
                    "Plan for session '{}' disappeared from storage",
                    self.id
                )));
            }
            Ok(None) => {}
            Err(e) if self.plan.is_some() => return Err(e.into()),
            Err(e) => {
                warn!(session = %self.id, "Could not read plan: {}", e);
                self.load_error = Some(e.to_string());
            }
        }
        Ok(self.plan.as_ref())
    }
}

/// Run independent sessions with at most `max_concurrency` in flight
///
/// Results come back in input order.
pub async fn run_sessions(
    sessions: Vec<TaskSession>,
    max_concurrency: usize,
    max_steps: usize,
) -> Vec<(TaskSession, Result<RunSummary, EngineError>)> {
    stream::iter(sessions.into_iter().map(|mut session| async move {
        let result = session.run(max_steps).await;
        (session, result)
    }))
    .buffered(max_concurrency.max(1))
    .collect()
    .await
}
