//! Troupe SDK
//!
//! Shared contracts between the Troupe engine and the agents it drives.
//! Agent implementations depend only on this crate.

/// Agent invocation trait and dispatch context
pub mod agent;

/// Error types and handling
pub mod errors;

/// Conversation message types
pub mod types;

// Re-export commonly used types
pub use agent::{Agent, AgentContext};
pub use errors::{EngineError, TroupeErrorExt};
pub use types::{Message, MessageRole};
