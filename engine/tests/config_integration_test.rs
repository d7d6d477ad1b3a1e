//! Integration tests for configuration management
//!
//! These tests verify that the Config struct can be properly loaded,
//! validated, and processed with path expansion and defaults.

use sdk::errors::EngineError;
use std::time::Duration;
use tempfile::TempDir;
use troupe_engine::config::{CacheBackendKind, Config};

fn config_text(data_dir: &std::path::Path, extra: &str) -> String {
    format!(
        "[core]\nlog_level = \"debug\"\ndata_dir = \"{}\"\n{}",
        data_dir.display(),
        extra
    )
}

#[test]
fn test_full_config_parsing() {
    let dir = TempDir::new().unwrap();
    let data_dir = dir.path().join("data");
    let toml_content = config_text(
        &data_dir,
        r#"
[cache]
backend = "shared"
max_size = 50
default_ttl_secs = 60
plan_ttl_secs = 2
shared_path = "/tmp/troupe-test-cache.db"

[orchestrator]
agent_timeout_secs = 0
max_steps = 25
max_handoffs = 3
max_concurrent_sessions = 2
"#,
    );

    let config = Config::from_toml_str(&toml_content).expect("Failed to parse config");

    assert_eq!(config.core.log_level, "debug");
    assert!(data_dir.exists(), "data dir should be created");
    assert_eq!(config.tasks_dir(), data_dir.join("tasks"));

    assert_eq!(config.cache.backend, CacheBackendKind::Shared);
    assert_eq!(config.cache.max_size, 50);
    assert_eq!(config.cache.default_ttl(), Duration::from_secs(60));
    assert_eq!(config.cache.plan_ttl(), Duration::from_secs(2));
    assert_eq!(
        config.cache.shared_path,
        std::path::PathBuf::from("/tmp/troupe-test-cache.db")
    );

    assert!(config.orchestrator.agent_timeout().is_none());
    assert_eq!(config.orchestrator.max_steps, 25);
    assert_eq!(config.orchestrator.max_handoffs, 3);
    assert_eq!(config.orchestrator.max_concurrent_sessions, 2);
}

#[test]
fn test_minimal_config_with_defaults() {
    let dir = TempDir::new().unwrap();
    let config = Config::from_toml_str(&config_text(dir.path(), "")).unwrap();

    assert_eq!(config.cache.backend, CacheBackendKind::Memory);
    assert_eq!(config.cache.max_size, 1000);
    assert_eq!(config.cache.plan_ttl(), Duration::from_secs(5));
    assert_eq!(config.cache.shared_path, dir.path().join("cache.db"));
    assert_eq!(
        config.orchestrator.agent_timeout(),
        Some(Duration::from_secs(300))
    );
    assert_eq!(config.orchestrator.max_steps, 100);
}

#[test]
fn test_invalid_values_rejected() {
    let dir = TempDir::new().unwrap();
    let cases = [
        "[cache]\nmax_size = 0\n",
        "[cache]\nplan_ttl_secs = 0\n",
        "[orchestrator]\nmax_steps = 0\n",
        "[orchestrator]\nmax_concurrent_sessions = 0\n",
        "[cache]\nbackend = \"redis\"\n",
    ];

    for extra in cases {
        let result = Config::from_toml_str(&config_text(dir.path(), extra));
        assert!(
            matches!(result, Err(EngineError::Config(_))),
            "expected config error for {:?}",
            extra
        );
    }

    let bad_level = "[core]\nlog_level = \"loud\"\n";
    assert!(matches!(
        Config::from_toml_str(bad_level),
        Err(EngineError::Config(msg)) if msg.contains("Invalid log level")
    ));
}

#[test]
fn test_load_from_path() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, config_text(&dir.path().join("data"), "")).unwrap();

    let config = Config::load_from_path(&path).unwrap();
    assert_eq!(config.core.data_dir, dir.path().join("data"));

    let missing = Config::load_from_path(&dir.path().join("nope.toml"));
    assert!(matches!(missing, Err(EngineError::Config(_))));
}
