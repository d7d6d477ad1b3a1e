//! Team definitions
//!
//! A team is declared in TOML:
//!
//! ```toml
//! name = "docs"
//! default_agent = "writer"
//!
//! [[agents]]
//! name = "writer"
//! role = "author"
//! description = "Drafts documents"
//!
//! [[agents]]
//! name = "reviewer"
//!
//! [[handoffs]]
//! from = "writer"
//! to = "reviewer"
//! condition = "when the draft is complete"
//! priority = 1
//! ```
//!
//! Definitions are validated at load time; any problem is an
//! `EngineError::InvalidTeam` and prevents a session from starting.
//! [`AgentRegistry`] binds the declared names to live [`Agent`]
//! implementations.

use sdk::agent::Agent;
use sdk::errors::EngineError;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use crate::conductor::handoff::{
    compile_condition_regex, HandoffCondition, HandoffEvaluator, HandoffRule,
};

/// One declared team member
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub name: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub description: String,
}

/// Team document: members plus the handoff rules between them
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_agent: Option<String>,
    #[serde(default)]
    pub agents: Vec<AgentDefinition>,
    #[serde(default)]
    pub handoffs: Vec<HandoffRule>,
}

impl TeamDefinition {
    pub fn load_from_path(path: &Path) -> Result<Self, EngineError> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            EngineError::InvalidTeam(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&contents)
    }

    /// Parse and validate a team document
    pub fn from_toml_str(contents: &str) -> Result<Self, EngineError> {
        let team: TeamDefinition = toml::from_str(contents)
            .map_err(|e| EngineError::InvalidTeam(format!("Failed to parse team: {}", e)))?;
        team.validate()?;
        Ok(team)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.agents.is_empty() {
            return Err(EngineError::InvalidTeam(format!(
                "Team '{}' declares no agents",
                self.name
            )));
        }

        let mut names = HashSet::new();
        for agent in &self.agents {
            if agent.name.trim().is_empty() {
                return Err(EngineError::InvalidTeam(
                    "Agent with an empty name".to_string(),
                ));
            }
            if !names.insert(agent.name.as_str()) {
                return Err(EngineError::InvalidTeam(format!(
                    "Duplicate agent '{}'",
                    agent.name
                )));
            }
        }

        if let Some(default) = &self.default_agent {
            if !names.contains(default.as_str()) {
                return Err(EngineError::InvalidTeam(format!(
                    "Default agent '{}' is not a team member",
                    default
                )));
            }
        }

        for rule in &self.handoffs {
            for endpoint in [&rule.from, &rule.to] {
                if !names.contains(endpoint.as_str()) {
                    return Err(EngineError::InvalidTeam(format!(
                        "Handoff {} -> {} names unknown agent '{}'",
                        rule.from, rule.to, endpoint
                    )));
                }
            }
            if let HandoffCondition::Regex(pattern) = &rule.condition {
                compile_condition_regex(pattern)?;
            }
        }

        Ok(())
    }

    pub fn agent_names(&self) -> Vec<&str> {
        self.agents.iter().map(|a| a.name.as_str()).collect()
    }

    /// Explicit default agent, else the first declared one
    pub fn default_agent_name(&self) -> Option<&str> {
        self.default_agent
            .as_deref()
            .or_else(|| self.agents.first().map(|a| a.name.as_str()))
    }

    pub fn build_evaluator(&self) -> Result<HandoffEvaluator, EngineError> {
        HandoffEvaluator::new(self.handoffs.clone(), self.agent_names())
    }
}

/// Roster entry exposed to plan generation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentDescriptor {
    pub name: String,
    pub role: String,
    pub description: String,
}

struct RegisteredAgent {
    agent: Arc<dyn Agent>,
    descriptor: AgentDescriptor,
}

/// Live agents by name, in registration order
#[derive(Default)]
pub struct AgentRegistry {
    agents: HashMap<String, RegisteredAgent>,
    order: Vec<String>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent under its own name, replacing any previous one
    pub fn register(&mut self, agent: Arc<dyn Agent>) {
        let descriptor = AgentDescriptor {
            name: agent.name().to_string(),
            role: String::new(),
            description: agent.description().to_string(),
        };
        self.insert(agent, descriptor);
    }

    /// Bind every team member to an implementation with the same name
    pub fn from_team(
        team: &TeamDefinition,
        implementations: Vec<Arc<dyn Agent>>,
    ) -> Result<Self, EngineError> {
        let mut by_name: HashMap<String, Arc<dyn Agent>> = implementations
            .into_iter()
            .map(|agent| (agent.name().to_string(), agent))
            .collect();

        let mut registry = Self::new();
        for definition in &team.agents {
            let agent = by_name
                .remove(&definition.name)
                .ok_or_else(|| EngineError::AgentNotFound(definition.name.clone()))?;
            let description = if definition.description.is_empty() {
                agent.description().to_string()
            } else {
                definition.description.clone()
            };
            registry.insert(
                agent,
                AgentDescriptor {
                    name: definition.name.clone(),
                    role: definition.role.clone(),
                    description,
                },
            );
        }
        Ok(registry)
    }

    fn insert(&mut self, agent: Arc<dyn Agent>, descriptor: AgentDescriptor) {
        let name = descriptor.name.clone();
        if !self.agents.contains_key(&name) {
            self.order.push(name.clone());
        }
        self.agents
            .insert(name, RegisteredAgent { agent, descriptor });
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Agent>> {
        self.agents.get(name).map(|r| r.agent.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.agents.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.order.clone()
    }

    pub fn descriptors(&self) -> Vec<AgentDescriptor> {
        self.order
            .iter()
            .filter_map(|name| self.agents.get(name))
            .map(|r| r.descriptor.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}
