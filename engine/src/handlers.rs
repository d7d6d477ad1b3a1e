//! Command handlers for CLI operations
//!
//! This module implements the handlers for all CLI commands:
//! - validate-team: Load and validate a team definition
//! - plan show / plan next: Inspect a session's plan
//! - artifacts list / artifacts get: Inspect versioned artifacts
//! - history: Show a session's conversation
//! - summary: Aggregate taskspace statistics
//! - ls: List a directory inside the taskspace

use anyhow::{Context, Result};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;

use crate::config::Config;
use crate::storage::{open_task_storage, TaskStorage};
use crate::team::TeamDefinition;

/// Output format for command results
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output for machine consumption
    Json,
}

async fn open_storage(config: &Config, task_id: &str) -> Result<Arc<dyn TaskStorage>> {
    open_task_storage(config, task_id)
        .await
        .with_context(|| format!("Failed to open storage for task {}", task_id))
}

/// Validate a team definition file
pub async fn handle_validate_team(path: &Path, format: OutputFormat) -> Result<()> {
    let team = TeamDefinition::load_from_path(path)
        .with_context(|| format!("Team definition {} is invalid", path.display()))?;

    match format {
        OutputFormat::Text => {
            println!("✓ Team '{}' is valid", team.name);
            println!("  Agents: {}", team.agent_names().join(", "));
            if let Some(default) = team.default_agent_name() {
                println!("  Default agent: {}", default);
            }
            println!("  Handoff rules: {}", team.handoffs.len());
            for rule in &team.handoffs {
                println!(
                    "    {} -> {} [{}] {} (priority {})",
                    rule.from,
                    rule.to,
                    rule.condition.kind(),
                    rule.condition.text(),
                    rule.priority
                );
            }
        }
        OutputFormat::Json => {
            let output = json!({
                "valid": true,
                "team": team,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }
    Ok(())
}

/// Show the full plan for a session
pub async fn handle_plan_show(task_id: &str, config: &Config, format: OutputFormat) -> Result<()> {
    let storage = open_storage(config, task_id).await?;
    let plan = storage
        .get_plan()
        .await
        .context("Failed to read plan")?;

    match (plan, format) {
        (None, OutputFormat::Text) => println!("No plan stored for task {}", task_id),
        (None, OutputFormat::Json) => {
            println!("{}", serde_json::to_string_pretty(&json!({ "plan": null }))?)
        }
        (Some(plan), OutputFormat::Text) => {
            print!("{}", plan.outline());
            if let Some(error) = &plan.load_error {
                println!();
                println!("Note: a previous plan could not be loaded: {}", error);
            }
        }
        (Some(plan), OutputFormat::Json) => {
            println!("{}", serde_json::to_string_pretty(&json!({ "plan": plan }))?)
        }
    }
    Ok(())
}

/// Show the next actionable task of a session's plan
pub async fn handle_plan_next(task_id: &str, config: &Config, format: OutputFormat) -> Result<()> {
    let storage = open_storage(config, task_id).await?;
    let plan = storage
        .get_plan()
        .await
        .context("Failed to read plan")?
        .ok_or_else(|| anyhow::anyhow!("No plan stored for task {}", task_id))?;
    let next = plan.get_next_actionable_task();

    match format {
        OutputFormat::Text => match next {
            Some(task) => {
                println!("Next task: {}", task.id);
                println!("  Description: {}", task.description);
                println!(
                    "  Agent: {}",
                    task.assigned_to.as_deref().unwrap_or("(default)")
                );
                if !task.dependencies.is_empty() {
                    println!("  Depends on: {}", task.dependencies.join(", "));
                }
            }
            None if plan.is_complete() => println!("All tasks completed"),
            None => println!("No actionable task ({} status)", plan.overall_status),
        },
        OutputFormat::Json => {
            let output = json!({
                "task": next,
                "overall_status": plan.overall_status,
                "progress": plan.progress,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }
    Ok(())
}

/// List the latest version of every artifact
pub async fn handle_artifacts_list(
    task_id: &str,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let storage = open_storage(config, task_id).await?;
    let artifacts = storage
        .list_artifacts()
        .await
        .context("Failed to list artifacts")?;

    match format {
        OutputFormat::Text => {
            if artifacts.is_empty() {
                println!("No artifacts for task {}", task_id);
                return Ok(());
            }
            println!("Artifacts ({}):", artifacts.len());
            for artifact in &artifacts {
                println!(
                    "  {} v{} ({} bytes, {})",
                    artifact.name, artifact.version, artifact.size, artifact.content_type
                );
                if let Some(message) = &artifact.commit_message {
                    println!("    {}", message);
                }
                println!(
                    "    Updated: {}",
                    artifact.updated_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
        OutputFormat::Json => {
            let output = json!({
                "artifacts": artifacts,
                "count": artifacts.len(),
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }
    Ok(())
}

/// Print an artifact's content
pub async fn handle_artifacts_get(
    task_id: &str,
    name: &str,
    version: Option<u32>,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let storage = open_storage(config, task_id).await?;
    let content = storage
        .get_artifact(name, version)
        .await
        .with_context(|| format!("Failed to read artifact {}", name))?
        .ok_or_else(|| match version {
            Some(v) => anyhow::anyhow!("Artifact not found: {} (version {})", name, v),
            None => anyhow::anyhow!("Artifact not found: {}", name),
        })?;

    match format {
        OutputFormat::Text => println!("{}", content),
        OutputFormat::Json => {
            let output = json!({
                "name": name,
                "version": version,
                "content": content,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }
    Ok(())
}

/// Show conversation history
pub async fn handle_history(
    task_id: &str,
    limit: Option<usize>,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let storage = open_storage(config, task_id).await?;
    let messages = storage
        .get_conversation_history(limit)
        .await
        .context("Failed to fetch conversation history")?;

    match format {
        OutputFormat::Text => {
            if messages.is_empty() {
                println!("No messages for task {}", task_id);
                return Ok(());
            }
            for message in &messages {
                match &message.name {
                    Some(name) => println!("[{}:{}] {}", message.role, name, message.content),
                    None => println!("[{}] {}", message.role, message.content),
                }
            }
        }
        OutputFormat::Json => {
            let output = json!({
                "messages": messages,
                "count": messages.len(),
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }
    Ok(())
}

/// Summarize the taskspace
pub async fn handle_summary(task_id: &str, config: &Config, format: OutputFormat) -> Result<()> {
    let storage = open_storage(config, task_id).await?;
    let summary = storage
        .get_project_summary()
        .await
        .context("Failed to summarize taskspace")?;
    let plan = storage.get_plan().await.ok().flatten();

    match format {
        OutputFormat::Text => {
            println!("Task {}", summary.task_id);
            println!("  Files: {}", summary.total_files);
            println!("  Size: {} bytes", summary.total_size);
            println!("  Artifacts: {}", summary.artifact_count);
            if !summary.directories.is_empty() {
                println!("  Directories: {}", summary.directories.join(", "));
            }
            if let Some(plan) = plan {
                println!(
                    "  Plan: {} [{}] {:.1}% complete",
                    plan.name, plan.overall_status, plan.progress.percentage_complete
                );
            }
        }
        OutputFormat::Json => {
            let output = json!({
                "summary": summary,
                "plan_status": plan.as_ref().map(|p| p.overall_status),
                "progress": plan.as_ref().map(|p| &p.progress),
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }
    Ok(())
}

/// List a taskspace directory
pub async fn handle_ls(
    task_id: &str,
    path: &str,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let storage = open_storage(config, task_id).await?;
    let listing = storage
        .list_directory(path)
        .await
        .with_context(|| format!("Failed to list {}", path))?;

    match format {
        OutputFormat::Text => {
            for directory in &listing.directories {
                println!("{}/", directory);
            }
            for file in &listing.files {
                println!("{}", file);
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&listing)?);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheBackendKind;
    use crate::plan::{Phase, Plan, PlanTask};
    use crate::storage::ArtifactWrite;
    use sdk::types::Message;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> Config {
        let mut config = Config::default_config();
        config.core.data_dir = dir.path().to_path_buf();
        config.cache.backend = CacheBackendKind::None;
        config
    }

    async fn seed(config: &Config) {
        let storage = open_task_storage(config, "s1").await.unwrap();
        let mut plan = Plan::new("seeded")
            .with_phase(Phase::new("p1", "Work").with_task(PlanTask::new("t1", "first")));
        plan.update_progress();
        storage.store_plan(&plan).await.unwrap();
        storage
            .store_artifact(ArtifactWrite::new("notes.md", "hello"))
            .await
            .unwrap();
        storage.store_message(&Message::user("hi")).await.unwrap();
    }

    #[tokio::test]
    async fn test_handlers_on_seeded_task() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        seed(&config).await;

        for format in [OutputFormat::Text, OutputFormat::Json] {
            handle_plan_show("s1", &config, format).await.unwrap();
            handle_plan_next("s1", &config, format).await.unwrap();
            handle_artifacts_list("s1", &config, format).await.unwrap();
            handle_artifacts_get("s1", "notes.md", None, &config, format)
                .await
                .unwrap();
            handle_history("s1", Some(5), &config, format).await.unwrap();
            handle_summary("s1", &config, format).await.unwrap();
            handle_ls("s1", ".", &config, format).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_missing_things_are_errors() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        seed(&config).await;

        assert!(handle_plan_next("empty", &config, OutputFormat::Text)
            .await
            .is_err());
        assert!(
            handle_artifacts_get("s1", "notes.md", Some(9), &config, OutputFormat::Text)
                .await
                .is_err()
        );
        assert!(handle_ls("s1", "../escape", &config, OutputFormat::Text)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_validate_team_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("team.toml");
        std::fs::write(&path, "name = \"t\"\n[[agents]]\nname = \"solo\"\n").unwrap();
        handle_validate_team(&path, OutputFormat::Text).await.unwrap();

        std::fs::write(&path, "name = \"t\"\n").unwrap();
        assert!(handle_validate_team(&path, OutputFormat::Json).await.is_err());
    }
}
