//! Configuration management
//!
//! This module handles loading, validation, and management of the Troupe configuration.
//! Configuration is stored in TOML format at ~/.troupe/config.toml.
//!
//! # Configuration Sections
//!
//! - **core**: Log level, data directory
//! - **cache**: Cache backend selection, capacity and TTLs
//! - **orchestrator**: Dispatch timeout and execution bounds
//!
//! # Path Expansion
//!
//! The configuration system automatically:
//! - Expands ~ to the user's home directory
//! - Creates the data directory if it doesn't exist
//! - Places the shared cache file under the data directory unless configured
//!
//! # Examples
//!
//! ```no_run
//! use troupe_engine::config::Config;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load_or_create()?;
//!
//! println!("Data dir: {:?}", config.core.data_dir);
//! println!("Cache backend: {:?}", config.cache.backend);
//! # Ok(())
//! # }
//! ```

use sdk::errors::EngineError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Core engine settings
    pub core: CoreConfig,

    /// Cache layer settings
    #[serde(default)]
    pub cache: CacheConfig,

    /// Orchestrator settings
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
}

/// Core engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Data directory path (supports ~ expansion); task storage lives under it
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Which cache backend fronts the storage layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackendKind {
    /// Caching disabled
    None,
    /// Bounded in-process LRU
    #[default]
    Memory,
    /// SQLite file shared between processes
    Shared,
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub backend: CacheBackendKind,

    /// Maximum number of entries
    #[serde(default = "default_cache_max_size")]
    pub max_size: usize,

    /// TTL for artifact, listing and history entries (seconds)
    #[serde(default = "default_cache_ttl")]
    pub default_ttl_secs: u64,

    /// TTL for plan entries (seconds); plans change on every step
    #[serde(default = "default_plan_ttl")]
    pub plan_ttl_secs: u64,

    /// Database file for the shared backend (supports ~ expansion)
    #[serde(default)]
    pub shared_path: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackendKind::default(),
            max_size: default_cache_max_size(),
            default_ttl_secs: default_cache_ttl(),
            plan_ttl_secs: default_plan_ttl(),
            shared_path: PathBuf::new(),
        }
    }
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn plan_ttl(&self) -> Duration {
        Duration::from_secs(self.plan_ttl_secs)
    }
}

/// Orchestrator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Per-dispatch timeout in seconds (0 disables)
    #[serde(default = "default_agent_timeout")]
    pub agent_timeout_secs: u64,

    /// Upper bound on steps for run-to-completion
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,

    /// Upper bound on handoff tasks injected into one plan
    #[serde(default = "default_max_handoffs")]
    pub max_handoffs: usize,

    /// Concurrency bound when running several sessions at once
    #[serde(default = "default_max_concurrent_sessions")]
    pub max_concurrent_sessions: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            agent_timeout_secs: default_agent_timeout(),
            max_steps: default_max_steps(),
            max_handoffs: default_max_handoffs(),
            max_concurrent_sessions: default_max_concurrent_sessions(),
        }
    }
}

impl OrchestratorConfig {
    pub fn agent_timeout(&self) -> Option<Duration> {
        (self.agent_timeout_secs > 0).then(|| Duration::from_secs(self.agent_timeout_secs))
    }
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("~/.troupe")
}

fn default_cache_max_size() -> usize {
    1000
}

fn default_cache_ttl() -> u64 {
    300
}

fn default_plan_ttl() -> u64 {
    5
}

fn default_agent_timeout() -> u64 {
    300
}

fn default_max_steps() -> usize {
    100
}

fn default_max_handoffs() -> usize {
    10
}

fn default_max_concurrent_sessions() -> usize {
    4
}

impl Config {
    /// Load configuration from the default location (~/.troupe/config.toml)
    ///
    /// If the configuration file doesn't exist, creates a default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Configuration file cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    pub fn load_or_create() -> Result<Self, EngineError> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load_from_path(&config_path)
        } else {
            Self::create_default(&config_path)
        }
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self, EngineError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("Failed to read config file: {}", e)))?;

        Self::from_toml_str(&contents)
    }

    /// Parse, validate and process configuration text
    pub fn from_toml_str(contents: &str) -> Result<Self, EngineError> {
        let mut config: Config = toml::from_str(contents)
            .map_err(|e| EngineError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate_and_process()?;

        Ok(config)
    }

    /// Create default configuration and save to path
    fn create_default(path: &Path) -> Result<Self, EngineError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                EngineError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let mut config = Self::default_config();

        // Serialize before processing so the file keeps the portable ~ paths
        let toml_string = toml::to_string_pretty(&config)
            .map_err(|e| EngineError::Config(format!("Failed to serialize config: {}", e)))?;

        fs::write(path, toml_string)
            .map_err(|e| EngineError::Config(format!("Failed to write config file: {}", e)))?;

        config.validate_and_process()?;

        Ok(config)
    }

    /// Get the default configuration file path (~/.troupe/config.toml)
    fn default_config_path() -> Result<PathBuf, EngineError> {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(".troupe").join("config.toml"))
    }

    /// Create a default configuration
    pub fn default_config() -> Self {
        Self {
            core: CoreConfig {
                log_level: default_log_level(),
                data_dir: default_data_dir(),
            },
            cache: CacheConfig::default(),
            orchestrator: OrchestratorConfig::default(),
        }
    }

    /// Root directory for per-task storage
    pub fn tasks_dir(&self) -> PathBuf {
        self.core.data_dir.join("tasks")
    }

    /// Validate and process configuration
    ///
    /// This method:
    /// - Validates enumerated and numeric fields
    /// - Expands ~ in paths
    /// - Creates the data directory if it doesn't exist
    fn validate_and_process(&mut self) -> Result<(), EngineError> {
        let valid_log_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_log_levels.contains(&self.core.log_level.as_str()) {
            return Err(EngineError::Config(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.core.log_level,
                valid_log_levels.join(", ")
            )));
        }

        if self.cache.max_size == 0 {
            return Err(EngineError::Config(
                "cache.max_size must be greater than 0".to_string(),
            ));
        }
        if self.cache.plan_ttl_secs == 0 || self.cache.default_ttl_secs == 0 {
            return Err(EngineError::Config(
                "cache TTLs must be greater than 0".to_string(),
            ));
        }

        if self.orchestrator.max_steps == 0 {
            return Err(EngineError::Config(
                "orchestrator.max_steps must be greater than 0".to_string(),
            ));
        }
        if self.orchestrator.max_concurrent_sessions == 0 {
            return Err(EngineError::Config(
                "orchestrator.max_concurrent_sessions must be greater than 0".to_string(),
            ));
        }

        self.core.data_dir = expand_path(&self.core.data_dir)?;
        if !self.core.data_dir.exists() {
            fs::create_dir_all(&self.core.data_dir).map_err(|e| {
                EngineError::Config(format!("Failed to create data directory: {}", e))
            })?;
        }

        self.cache.shared_path = if self.cache.shared_path.as_os_str().is_empty() {
            self.core.data_dir.join("cache.db")
        } else {
            expand_path(&self.cache.shared_path)?
        };

        Ok(())
    }
}

/// Expand ~ in path to user's home directory
fn expand_path(path: &Path) -> Result<PathBuf, EngineError> {
    let path_str = path
        .to_str()
        .ok_or_else(|| EngineError::Config("Invalid UTF-8 in path".to_string()))?;

    if let Some(rest) = path_str.strip_prefix("~/") {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(rest))
    } else if path_str == "~" {
        dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))
    } else {
        Ok(path.to_path_buf())
    }
}
