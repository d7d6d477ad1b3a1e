// Troupe multi-agent orchestration engine
// Main entry point for the troupe binary

use clap::Parser;
use troupe_engine::cli::{ArtifactAction, Cli, Command, PlanAction};
use troupe_engine::config::Config;
use troupe_engine::handlers::{
    handle_artifacts_get, handle_artifacts_list, handle_history, handle_ls, handle_plan_next,
    handle_plan_show, handle_summary, handle_validate_team, OutputFormat,
};
use troupe_engine::telemetry::init_telemetry_with_level;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Determine output format
    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };

    // Team validation needs no configuration
    if let Command::ValidateTeam { file } = &cli.command {
        init_telemetry_with_level(cli.log.as_deref().unwrap_or("warn"));
        return handle_validate_team(file, format).await;
    }

    // Load configuration (or use custom path if provided)
    let config = if let Some(config_path) = &cli.config {
        Config::load_from_path(config_path)?
    } else {
        Config::load_or_create()?
    };

    // --log wins over the configured level; RUST_LOG wins over both
    init_telemetry_with_level(cli.log.as_deref().unwrap_or(&config.core.log_level));

    let version = env!("CARGO_PKG_VERSION");
    let commit = env!("GIT_COMMIT_HASH");
    let timestamp = env!("BUILD_TIMESTAMP");
    tracing::debug!("Troupe v{} ({} - {})", version, commit, timestamp);

    match cli.command {
        Command::ValidateTeam { .. } => Ok(()),

        Command::Plan { action } => match action {
            PlanAction::Show { task } => {
                tracing::info!("Showing plan for {}", task);
                handle_plan_show(&task, &config, format).await
            }
            PlanAction::Next { task } => handle_plan_next(&task, &config, format).await,
        },

        Command::Artifacts { action } => match action {
            ArtifactAction::List { task } => handle_artifacts_list(&task, &config, format).await,
            ArtifactAction::Get {
                task,
                name,
                version,
            } => handle_artifacts_get(&task, &name, version, &config, format).await,
        },

        Command::History { task, limit } => {
            tracing::info!("Showing history for {}", task);
            handle_history(&task, limit, &config, format).await
        }

        Command::Summary { task } => handle_summary(&task, &config, format).await,

        Command::Ls { task, path } => handle_ls(&task, &path, &config, format).await,
    }
}
