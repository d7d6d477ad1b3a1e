//! Project/Task Storage
//!
//! Uniform persistence API for one task/session: the plan document, an
//! append-only conversation log and a versioned artifact set. Every call
//! returns a [`StorageResult`]; ordinary I/O and decoding failures come back
//! as [`StorageError`] values, never as panics, so orchestration code can
//! decide how to degrade.
//!
//! [`FileSystemStorage`] is the backing store. [`CachedStorage`] decorates any
//! `TaskStorage` with a [`CacheBackend`](crate::cache::CacheBackend),
//! invalidating the affected keys on every write.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sdk::errors::EngineError;
use sdk::types::Message;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

pub mod cached;
pub mod filesystem;

pub use cached::CachedStorage;
pub use filesystem::FileSystemStorage;

use crate::cache::{build_cache, CacheBackend};
use crate::config::Config;
use crate::plan::Plan;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Errors surfaced by storage operations
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        StorageError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

impl From<StorageError> for EngineError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound(path) => EngineError::NotFound(path),
            StorageError::Serialization(msg) => EngineError::Serialization(msg),
            other => EngineError::Storage(other.to_string()),
        }
    }
}

/// A new artifact version to be written
#[derive(Debug, Clone)]
pub struct ArtifactWrite {
    pub name: String,
    pub content: String,
    pub content_type: String,
    pub metadata: BTreeMap<String, Value>,
    pub commit_message: Option<String>,
}

impl ArtifactWrite {
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
            content_type: "text/plain".to_string(),
            metadata: BTreeMap::new(),
            commit_message: None,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_commit_message(mut self, message: impl Into<String>) -> Self {
        self.commit_message = Some(message.into());
        self
    }
}

/// Metadata record for one artifact version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactInfo {
    pub name: String,
    pub version: u32,
    pub size: u64,
    pub content_type: String,
    /// blake3 hash of the content, hex encoded
    pub content_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_message: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Entries directly under one taskspace directory
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DirectoryListing {
    pub path: String,
    pub directories: Vec<String>,
    pub files: Vec<String>,
}

/// Result of walking the whole taskspace
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TreeScan {
    pub total_files: usize,
    pub total_size: u64,
    /// Every directory below the task root, relative, sorted
    pub directories: Vec<String>,
}

/// Aggregate view of a taskspace
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectSummary {
    pub task_id: String,
    pub total_files: usize,
    pub total_size: u64,
    pub artifact_count: usize,
    pub directories: Vec<String>,
}

/// Persistence contract for one task/session
#[async_trait]
pub trait TaskStorage: Send + Sync {
    /// Task/session id this handle is scoped to
    fn task_id(&self) -> &str;

    async fn store_plan(&self, plan: &Plan) -> StorageResult<()>;

    /// `None` if no plan has ever been stored
    async fn get_plan(&self) -> StorageResult<Option<Plan>>;

    /// Write a new version of a named artifact
    async fn store_artifact(&self, artifact: ArtifactWrite) -> StorageResult<ArtifactInfo>;

    /// Latest (or the given) version's content, `None` if absent
    async fn get_artifact(&self, name: &str, version: Option<u32>)
        -> StorageResult<Option<String>>;

    /// Latest version of every artifact, sorted by name
    async fn list_artifacts(&self) -> StorageResult<Vec<ArtifactInfo>>;

    async fn store_message(&self, message: &Message) -> StorageResult<()>;

    /// The most recent `limit` messages (all if `None`), oldest first
    async fn get_conversation_history(&self, limit: Option<usize>)
        -> StorageResult<Vec<Message>>;

    async fn scan_tree(&self) -> StorageResult<TreeScan>;

    /// Fails with `NotFound` when `path` does not exist
    async fn list_directory(&self, path: &str) -> StorageResult<DirectoryListing>;

    async fn get_project_summary(&self) -> StorageResult<ProjectSummary> {
        let artifacts = self.list_artifacts().await?;
        let scan = self.scan_tree().await?;
        Ok(ProjectSummary {
            task_id: self.task_id().to_string(),
            total_files: scan.total_files,
            total_size: scan.total_size,
            artifact_count: artifacts.len(),
            directories: scan.directories,
        })
    }
}

/// Names of the artifacts currently in a taskspace
///
/// A listing failure yields an empty list.
pub async fn artifact_names(storage: &dyn TaskStorage) -> Vec<String> {
    match storage.list_artifacts().await {
        Ok(artifacts) => artifacts.into_iter().map(|a| a.name).collect(),
        Err(e) => {
            tracing::warn!(
                "Could not list artifacts for {}: {}",
                storage.task_id(),
                e
            );
            Vec::new()
        }
    }
}

/// Open the configured storage stack for a task/session
pub async fn open_task_storage(
    config: &Config,
    task_id: &str,
) -> StorageResult<Arc<dyn TaskStorage>> {
    let cache = build_cache(&config.cache).await;
    open_task_storage_with_cache(config, task_id, cache)
}

/// Open storage for a task/session using an existing cache backend
///
/// Used when several sessions deliberately share one backend.
pub fn open_task_storage_with_cache(
    config: &Config,
    task_id: &str,
    cache: Arc<dyn CacheBackend>,
) -> StorageResult<Arc<dyn TaskStorage>> {
    let backing = FileSystemStorage::new(config.tasks_dir(), task_id)?;
    Ok(Arc::new(CachedStorage::new(
        backing,
        cache,
        config.cache.plan_ttl(),
        config.cache.default_ttl(),
    )))
}
