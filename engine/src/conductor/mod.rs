//! Conductor System
//!
//! Orchestrates planning, context assembly, agent dispatch and handoffs.

pub mod context;
pub mod handoff;
pub mod orchestrator;
pub mod planner;

pub use context::ContextAssembler;
pub use handoff::{
    ConditionClassifier, HandoffCondition, HandoffContext, HandoffEvaluator, HandoffRule,
};
pub use orchestrator::{Orchestrator, StepOutcome};
pub use planner::{Brain, BrainPlanner, PlanGenerator, StaticPlanner};
