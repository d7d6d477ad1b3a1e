//! Filesystem-backed task storage
//!
//! Layout under `<root>/<task_id>/`:
//!
//! ```text
//! plan.json                  current plan document
//! messages.jsonl             conversation log, one JSON message per line
//! artifacts/<name>_<v>       content of version v of an artifact
//! artifacts/<name>_<v>.meta.json
//! ```

use async_trait::async_trait;
use chrono::Utc;
use sdk::types::Message;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{
    ArtifactInfo, ArtifactWrite, DirectoryListing, StorageError, StorageResult, TaskStorage,
    TreeScan,
};
use crate::plan::Plan;

const PLAN_FILE: &str = "plan.json";
const MESSAGES_FILE: &str = "messages.jsonl";
const ARTIFACTS_DIR: &str = "artifacts";
const META_SUFFIX: &str = ".meta.json";

/// Task storage rooted at one directory per task
#[derive(Debug)]
pub struct FileSystemStorage {
    task_id: String,
    root: PathBuf,
    /// Serializes version allocation and log appends
    write_lock: Mutex<()>,
}

impl FileSystemStorage {
    /// Storage for `task_id` under `base_dir`; nothing is created until the first write
    pub fn new(base_dir: impl Into<PathBuf>, task_id: &str) -> StorageResult<Self> {
        validate_segment(task_id)?;
        let root = base_dir.into().join(task_id);
        Ok(Self {
            task_id: task_id.to_string(),
            root,
            write_lock: Mutex::new(()),
        })
    }

    /// Directory holding this task's files
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn plan_path(&self) -> PathBuf {
        self.root.join(PLAN_FILE)
    }

    fn messages_path(&self) -> PathBuf {
        self.root.join(MESSAGES_FILE)
    }

    fn artifacts_dir(&self) -> PathBuf {
        self.root.join(ARTIFACTS_DIR)
    }

    fn content_path(&self, name: &str, version: u32) -> PathBuf {
        self.artifacts_dir().join(format!("{}_{}", name, version))
    }

    fn meta_path(&self, name: &str, version: u32) -> PathBuf {
        self.artifacts_dir()
            .join(format!("{}_{}{}", name, version, META_SUFFIX))
    }

    /// Every readable metadata record; unreadable ones are skipped
    async fn read_all_meta(&self) -> StorageResult<Vec<ArtifactInfo>> {
        let mut entries = match fs::read_dir(self.artifacts_dir()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name().to_string_lossy().to_string();
            if !file_name.ends_with(META_SUFFIX) {
                continue;
            }
            let raw = match fs::read_to_string(entry.path()).await {
                Ok(raw) => raw,
                Err(e) => {
                    warn!("Skipping unreadable artifact metadata {}: {}", file_name, e);
                    continue;
                }
            };
            match serde_json::from_str::<ArtifactInfo>(&raw) {
                Ok(info) => records.push(info),
                Err(e) => warn!("Skipping corrupt artifact metadata {}: {}", file_name, e),
            }
        }
        Ok(records)
    }

    async fn latest_version(&self, name: &str) -> StorageResult<Option<ArtifactInfo>> {
        Ok(self
            .read_all_meta()
            .await?
            .into_iter()
            .filter(|info| info.name == name)
            .max_by_key(|info| info.version))
    }

    /// Resolve a relative taskspace path, refusing anything that leaves the root
    fn resolve(&self, path: &str) -> StorageResult<PathBuf> {
        let relative = Path::new(path);
        let mut resolved = self.root.clone();
        for component in relative.components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(StorageError::InvalidPath(path.to_string()));
                }
            }
        }
        Ok(resolved)
    }
}

/// Reject names that could address anything outside their directory
fn validate_segment(name: &str) -> StorageResult<()> {
    let invalid = name.trim().is_empty()
        || name == "."
        || name.contains("..")
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0');
    if invalid {
        return Err(StorageError::InvalidPath(name.to_string()));
    }
    Ok(())
}

fn validate_artifact_name(name: &str) -> StorageResult<()> {
    validate_segment(name)?;
    if name.ends_with(META_SUFFIX) {
        return Err(StorageError::InvalidPath(name.to_string()));
    }
    Ok(())
}

#[async_trait]
impl TaskStorage for FileSystemStorage {
    fn task_id(&self) -> &str {
        &self.task_id
    }

    async fn store_plan(&self, plan: &Plan) -> StorageResult<()> {
        fs::create_dir_all(&self.root).await?;
        let bytes = serde_json::to_vec_pretty(plan)?;

        // Write-then-rename so readers never see a torn document
        let tmp = self.root.join(format!("{}.tmp", PLAN_FILE));
        fs::write(&tmp, &bytes).await?;
        fs::rename(&tmp, self.plan_path()).await?;

        debug!("Stored plan for {} ({} bytes)", self.task_id, bytes.len());
        Ok(())
    }

    async fn get_plan(&self) -> StorageResult<Option<Plan>> {
        let raw = match fs::read_to_string(self.plan_path()).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let plan = serde_json::from_str(&raw)?;
        Ok(Some(plan))
    }

    async fn store_artifact(&self, artifact: ArtifactWrite) -> StorageResult<ArtifactInfo> {
        validate_artifact_name(&artifact.name)?;

        let _guard = self.write_lock.lock().await;
        fs::create_dir_all(self.artifacts_dir()).await?;

        let previous = self.latest_version(&artifact.name).await?;
        let version = previous.as_ref().map(|p| p.version + 1).unwrap_or(1);
        let now = Utc::now();

        let info = ArtifactInfo {
            name: artifact.name.clone(),
            version,
            size: artifact.content.len() as u64,
            content_type: artifact.content_type,
            content_hash: blake3::hash(artifact.content.as_bytes()).to_hex().to_string(),
            commit_message: artifact.commit_message,
            metadata: artifact.metadata,
            created_at: previous.map(|p| p.created_at).unwrap_or(now),
            updated_at: now,
        };

        fs::write(self.content_path(&info.name, version), artifact.content.as_bytes()).await?;
        fs::write(
            self.meta_path(&info.name, version),
            serde_json::to_vec_pretty(&info)?,
        )
        .await?;

        info!(
            "Stored artifact {} v{} for {} ({} bytes)",
            info.name, version, self.task_id, info.size
        );
        Ok(info)
    }

    async fn get_artifact(
        &self,
        name: &str,
        version: Option<u32>,
    ) -> StorageResult<Option<String>> {
        validate_artifact_name(name)?;

        let version = match version {
            Some(v) => v,
            None => match self.latest_version(name).await? {
                Some(info) => info.version,
                None => return Ok(None),
            },
        };

        match fs::read_to_string(self.content_path(name, version)).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_artifacts(&self) -> StorageResult<Vec<ArtifactInfo>> {
        let mut latest: BTreeMap<String, ArtifactInfo> = BTreeMap::new();
        for info in self.read_all_meta().await? {
            match latest.get(&info.name) {
                Some(existing) if existing.version >= info.version => {}
                _ => {
                    latest.insert(info.name.clone(), info);
                }
            }
        }
        Ok(latest.into_values().collect())
    }

    async fn store_message(&self, message: &Message) -> StorageResult<()> {
        let mut line = serde_json::to_string(message)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        fs::create_dir_all(&self.root).await?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.messages_path())
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn get_conversation_history(
        &self,
        limit: Option<usize>,
    ) -> StorageResult<Vec<Message>> {
        let raw = match fs::read_to_string(self.messages_path()).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut messages = Vec::new();
        for (index, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Message>(line) {
                Ok(message) => messages.push(message),
                Err(e) => warn!(
                    "Skipping corrupt message on line {} for {}: {}",
                    index + 1,
                    self.task_id,
                    e
                ),
            }
        }

        if let Some(limit) = limit {
            let skip = messages.len().saturating_sub(limit);
            messages.drain(..skip);
        }
        Ok(messages)
    }

    async fn scan_tree(&self) -> StorageResult<TreeScan> {
        let mut scan = TreeScan::default();
        if !fs::try_exists(&self.root).await? {
            return Ok(scan);
        }

        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    let path = entry.path();
                    if let Ok(relative) = path.strip_prefix(&self.root) {
                        scan.directories.push(relative.to_string_lossy().to_string());
                    }
                    pending.push(path);
                } else if file_type.is_file() {
                    scan.total_files += 1;
                    scan.total_size += entry.metadata().await.map(|m| m.len()).unwrap_or(0);
                }
            }
        }

        scan.directories.sort();
        Ok(scan)
    }

    async fn list_directory(&self, path: &str) -> StorageResult<DirectoryListing> {
        let target = self.resolve(path)?;

        match fs::metadata(&target).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => return Err(StorageError::NotFound(path.to_string())),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StorageError::NotFound(path.to_string()));
            }
            Err(e) => return Err(e.into()),
        }

        let mut entries = fs::read_dir(&target).await?;

        let mut listing = DirectoryListing {
            path: path.to_string(),
            ..DirectoryListing::default()
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if entry.file_type().await?.is_dir() {
                listing.directories.push(name);
            } else {
                listing.files.push(name);
            }
        }

        listing.directories.sort();
        listing.files.sort();
        Ok(listing)
    }
}
