//! Error types and handling
//!
//! This module provides the error types used throughout the Troupe engine.
//! All errors implement the `TroupeErrorExt` trait which provides user-friendly
//! hints and indicates whether errors are recoverable.
//!
//! # Error Categories
//!
//! - **Configuration**: malformed config, team or plan definitions. Raised at
//!   load time and fatal to starting a session.
//! - **Agent**: dispatch failures and timeouts. Task-local: the orchestrator
//!   converts them into a failed task.
//! - **Storage**: backing store I/O and serialization failures.
//! - **Plan state**: unknown task ids and illegal status transitions.

use thiserror::Error;

/// Trait for Troupe error extensions
///
/// Provides additional context for errors, including user-friendly hints and
/// recoverability information. All engine errors implement this trait.
pub trait TroupeErrorExt {
    /// Returns a user-friendly hint for the error
    ///
    /// The hint is safe to display to end users and never echoes the raw
    /// error payload.
    fn user_hint(&self) -> &str;

    /// Returns whether the error is recoverable
    ///
    /// Recoverable errors can be retried or worked around. Non-recoverable
    /// errors require fixing a definition file or the environment.
    fn is_recoverable(&self) -> bool;
}

/// Main engine error type
///
/// # Examples
///
/// ```
/// use sdk::errors::{EngineError, TroupeErrorExt};
///
/// let error = EngineError::AgentTimeout { agent: "writer".into(), secs: 30 };
/// println!("Hint: {}", error.user_hint());
/// assert!(error.is_recoverable());
///
/// let fatal = EngineError::InvalidTeam("no agents".into());
/// assert!(!fatal.is_recoverable());
/// ```
#[derive(Debug, Error)]
pub enum EngineError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    #[error("Invalid team definition: {0}")]
    InvalidTeam(String),

    // Agent errors
    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Agent '{agent}' failed: {message}")]
    AgentFailed { agent: String, message: String },

    #[error("Agent '{agent}' timed out after {secs}s")]
    AgentTimeout { agent: String, secs: u64 },

    #[error("Plan generation failed: {0}")]
    PlanGeneration(String),

    // Plan state errors
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Invalid status transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: String,
        from: String,
        to: String,
    },

    // Storage errors
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Shorthand for an agent-side failure
    pub fn agent_failed(agent: impl Into<String>, message: impl Into<String>) -> Self {
        Self::AgentFailed {
            agent: agent.into(),
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl TroupeErrorExt for EngineError {
    fn user_hint(&self) -> &str {
        match self {
            // Configuration errors
            Self::Config(_) => "Check your config.toml file for errors",
            Self::InvalidPlan(_) => "The plan definition is malformed. Check task ids",
            Self::InvalidTeam(_) => "Check the team definition file for errors",

            // Agent errors
            Self::AgentNotFound(_) => "The task is assigned to an agent that is not registered",
            Self::AgentFailed { .. } => "The agent could not complete the task",
            Self::AgentTimeout { .. } => "The agent took too long to respond. Try again",
            Self::PlanGeneration(_) => "Could not produce a plan for this goal",

            // Plan state errors
            Self::TaskNotFound(_) => "The requested task does not exist in the plan",
            Self::InvalidTransition { .. } => "Finished tasks cannot be restarted",

            // Storage errors
            Self::Storage(_) => "Storage operation failed. Check the data directory",
            Self::NotFound(_) => "The requested item does not exist",
            Self::Serialization(_) => "Stored data could not be read. It may be corrupted",

            // Generic IO error
            Self::Io(_) => "File system operation failed",
        }
    }

    fn is_recoverable(&self) -> bool {
        match self {
            // Non-recoverable errors
            Self::Config(_)
            | Self::InvalidPlan(_)
            | Self::InvalidTeam(_)
            | Self::InvalidTransition { .. } => false,

            // All other errors are potentially recoverable
            _ => true,
        }
    }
}
