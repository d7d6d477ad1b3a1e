//! CLI interface for Troupe
//!
//! This module provides the command-line interface using clap's derive API.
//! The commands inspect persisted task/session state: plans, artifacts,
//! conversation history and the taskspace tree. Team definitions can be
//! validated before a session is started.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Troupe multi-agent orchestration engine
///
/// Inspects the plans, artifacts and conversations that orchestration
/// sessions persist under the data directory.
#[derive(Parser, Debug)]
#[command(name = "troupe")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, value_name = "LEVEL")]
    pub log: Option<String>,

    /// Specify alternate configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Validate a team definition file
    ValidateTeam {
        /// Path to the team TOML file
        file: PathBuf,
    },

    /// Inspect a session's plan
    Plan {
        #[command(subcommand)]
        action: PlanAction,
    },

    /// Inspect a session's artifacts
    Artifacts {
        #[command(subcommand)]
        action: ArtifactAction,
    },

    /// Show a session's conversation history
    History {
        /// Task/session id
        #[arg(short, long)]
        task: String,

        /// Number of messages to show (default: all)
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Summarize a session's taskspace
    Summary {
        /// Task/session id
        #[arg(short, long)]
        task: String,
    },

    /// List a directory inside a session's taskspace
    Ls {
        /// Task/session id
        #[arg(short, long)]
        task: String,

        /// Path relative to the taskspace root
        #[arg(default_value = ".")]
        path: String,
    },
}

/// Plan inspection actions
#[derive(Subcommand, Debug)]
pub enum PlanAction {
    /// Show the full plan with progress
    Show {
        /// Task/session id
        #[arg(short, long)]
        task: String,
    },

    /// Show the next actionable task
    Next {
        /// Task/session id
        #[arg(short, long)]
        task: String,
    },
}

/// Artifact inspection actions
#[derive(Subcommand, Debug)]
pub enum ArtifactAction {
    /// List the latest version of every artifact
    List {
        /// Task/session id
        #[arg(short, long)]
        task: String,
    },

    /// Print an artifact's content
    Get {
        /// Task/session id
        #[arg(short, long)]
        task: String,

        /// Artifact name
        name: String,

        /// Version to read (default: latest)
        #[arg(short, long)]
        version: Option<u32>,
    },
}
