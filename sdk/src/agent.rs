//! Agent invocation contract
//!
//! An agent is anything that can turn a list of messages into a result. Tool
//! use, streaming and model selection are internal to the implementation; the
//! engine only sees `generate_response`.

use crate::errors::EngineError;
use crate::types::Message;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Context handed to an agent alongside its messages
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentContext {
    /// Task/session the dispatch belongs to
    pub session_id: String,

    /// Plan item being worked on
    pub task_id: String,

    /// Description of the plan item
    pub task_description: String,

    /// Overarching goal of the session
    pub goal: String,

    /// Artifact names currently in the taskspace
    #[serde(default)]
    pub taskspace_files: Vec<String>,
}

/// Trait that all agents must implement
#[async_trait]
pub trait Agent: Send + Sync {
    /// Unique agent name, referenced by plans and handoff rules
    fn name(&self) -> &str;

    /// One-line description used when planning
    fn description(&self) -> &str {
        ""
    }

    /// Produce a result for the given messages
    ///
    /// Returning an error marks the current task failed; it is never retried
    /// by the engine.
    async fn generate_response(
        &self,
        messages: &[Message],
        context: &AgentContext,
    ) -> Result<String, EngineError>;
}
