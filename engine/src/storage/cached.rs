//! Read-through cache in front of a [`TaskStorage`]
//!
//! Keys are namespaced by task id so that unrelated sessions can share one
//! backend:
//!
//! ```text
//! <task>:plan
//! <task>:artifacts
//! <task>:artifact:<name>:<version|latest>
//! <task>:history:gen
//! <task>:history:<gen>:<limit|all>
//! ```
//!
//! Every write goes to the inner store first and then deletes the keys it
//! could have made stale. History views are keyed by a generation token kept
//! in the cache itself, so an append through any handle orphans every view
//! cached before it. Cache failures never fail an operation.

use async_trait::async_trait;
use sdk::types::Message;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    ArtifactInfo, ArtifactWrite, DirectoryListing, StorageResult, TaskStorage, TreeScan,
};
use crate::cache::CacheBackend;
use crate::plan::Plan;

/// Storage decorator adding a cache backend
pub struct CachedStorage<S> {
    inner: S,
    cache: Arc<dyn CacheBackend>,
    plan_ttl: Duration,
    ttl: Duration,
}

impl<S: TaskStorage> CachedStorage<S> {
    pub fn new(inner: S, cache: Arc<dyn CacheBackend>, plan_ttl: Duration, ttl: Duration) -> Self {
        Self {
            inner,
            cache,
            plan_ttl,
            ttl,
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn plan_key(&self) -> String {
        format!("{}:plan", self.inner.task_id())
    }

    fn artifacts_key(&self) -> String {
        format!("{}:artifacts", self.inner.task_id())
    }

    fn artifact_key(&self, name: &str, version: Option<u32>) -> String {
        match version {
            Some(v) => format!("{}:artifact:{}:{}", self.inner.task_id(), name, v),
            None => format!("{}:artifact:{}:latest", self.inner.task_id(), name),
        }
    }

    fn history_gen_key(&self) -> String {
        format!("{}:history:gen", self.inner.task_id())
    }

    fn history_key(&self, generation: &str, limit: Option<usize>) -> String {
        match limit {
            Some(n) => format!("{}:history:{}:{}", self.inner.task_id(), generation, n),
            None => format!("{}:history:{}:all", self.inner.task_id(), generation),
        }
    }

    /// Current history generation, starting a fresh one when none is cached.
    ///
    /// Tokens are never reused, so a lost or expired generation can only
    /// cause misses.
    async fn history_generation(&self) -> String {
        let key = self.history_gen_key();
        if let Some(generation) = self.cached::<String>(&key).await {
            return generation;
        }
        self.bump_history_generation().await
    }

    async fn bump_history_generation(&self) -> String {
        let generation = Uuid::new_v4().simple().to_string();
        self.remember(&self.history_gen_key(), &generation, self.ttl)
            .await;
        generation
    }

    async fn cached<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.cache.get(key).await?;
        match serde_json::from_value(value) {
            Ok(decoded) => {
                debug!("Cache hit: {}", key);
                Some(decoded)
            }
            Err(e) => {
                warn!("Dropping undecodable cache entry {}: {}", key, e);
                self.cache.delete(key).await;
                None
            }
        }
    }

    async fn remember<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        match serde_json::to_value(value) {
            Ok(v) => self.cache.set(key, v, Some(ttl)).await,
            Err(e) => warn!("Not caching {}: {}", key, e),
        }
    }
}

#[async_trait]
impl<S: TaskStorage> TaskStorage for CachedStorage<S> {
    fn task_id(&self) -> &str {
        self.inner.task_id()
    }

    async fn store_plan(&self, plan: &Plan) -> StorageResult<()> {
        let result = self.inner.store_plan(plan).await;
        self.cache.delete(&self.plan_key()).await;
        result
    }

    async fn get_plan(&self) -> StorageResult<Option<Plan>> {
        let key = self.plan_key();
        if let Some(plan) = self.cached::<Plan>(&key).await {
            return Ok(Some(plan));
        }

        let plan = self.inner.get_plan().await?;
        if let Some(plan) = &plan {
            self.remember(&key, plan, self.plan_ttl).await;
        }
        Ok(plan)
    }

    async fn store_artifact(&self, artifact: ArtifactWrite) -> StorageResult<ArtifactInfo> {
        let name = artifact.name.clone();
        let result = self.inner.store_artifact(artifact).await;
        self.cache.delete(&self.artifacts_key()).await;
        self.cache.delete(&self.artifact_key(&name, None)).await;
        result
    }

    async fn get_artifact(
        &self,
        name: &str,
        version: Option<u32>,
    ) -> StorageResult<Option<String>> {
        let key = self.artifact_key(name, version);
        if let Some(content) = self.cached::<String>(&key).await {
            return Ok(Some(content));
        }

        let content = self.inner.get_artifact(name, version).await?;
        if let Some(content) = &content {
            self.remember(&key, content, self.ttl).await;
        }
        Ok(content)
    }

    async fn list_artifacts(&self) -> StorageResult<Vec<ArtifactInfo>> {
        let key = self.artifacts_key();
        if let Some(list) = self.cached::<Vec<ArtifactInfo>>(&key).await {
            return Ok(list);
        }

        let list = self.inner.list_artifacts().await?;
        self.remember(&key, &list, self.ttl).await;
        Ok(list)
    }

    async fn store_message(&self, message: &Message) -> StorageResult<()> {
        let result = self.inner.store_message(message).await;
        self.bump_history_generation().await;
        result
    }

    async fn get_conversation_history(
        &self,
        limit: Option<usize>,
    ) -> StorageResult<Vec<Message>> {
        let generation = self.history_generation().await;
        let key = self.history_key(&generation, limit);
        if let Some(history) = self.cached::<Vec<Message>>(&key).await {
            return Ok(history);
        }

        let history = self.inner.get_conversation_history(limit).await?;
        self.remember(&key, &history, self.ttl).await;
        Ok(history)
    }

    async fn scan_tree(&self) -> StorageResult<TreeScan> {
        self.inner.scan_tree().await
    }

    async fn list_directory(&self, path: &str) -> StorageResult<DirectoryListing> {
        self.inner.list_directory(path).await
    }
}
