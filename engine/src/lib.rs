//! Troupe Engine Library
//!
//! This library provides the core functionality of the Troupe engine:
//! plan tracking, cached task storage, handoff evaluation and the
//! orchestrator step loop. It is used by both the main binary and
//! integration tests.

/// Configuration management module
pub mod config;

/// Plan model: phases, tasks, dependencies and progress
pub mod plan;

/// Pluggable cache backends
pub mod cache;

/// Per-task persistence of plans, conversations and artifacts
pub mod storage;

/// Message bus for orchestration events
pub mod message_bus;

/// Team definitions and the agent registry
pub mod team;

/// Conductor orchestration module
pub mod conductor;

/// Task/session lifecycle
pub mod session;

/// Telemetry and Observability
pub mod telemetry;

/// CLI interface module
pub mod cli;

/// Command handlers module
pub mod handlers;
