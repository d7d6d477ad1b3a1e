//! Cache Backend Abstraction
//!
//! Pluggable key/value caches placed in front of the storage layer. Every
//! backend satisfies the same contract:
//!
//! - a missing key is `None`, never an error
//! - TTL expiry is checked lazily on read; an expired entry is a miss and is
//!   removed at that point
//! - internal failures are logged and degrade to a miss (fail open), since
//!   the backing store is always the source of truth
//!
//! Backends:
//! - [`NoopCache`]: caching disabled, every read misses
//! - [`MemoryCache`]: bounded in-process LRU
//! - [`SharedCache`]: SQLite table that several processes can share

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub mod memory;
pub mod noop;
pub mod shared;

pub use memory::MemoryCache;
pub use noop::NoopCache;
pub use shared::SharedCache;

use crate::config::{CacheBackendKind, CacheConfig};

/// Key/value cache contract shared by all backends
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &'static str;

    /// Fetch a live entry
    async fn get(&self, key: &str) -> Option<Value>;

    /// Insert or replace an entry; `None` TTL means no expiry
    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>);

    /// Remove an entry if present
    async fn delete(&self, key: &str);

    /// Remove every entry
    async fn clear(&self);
}

/// Build the backend selected by configuration
///
/// A shared backend that cannot be opened falls back to the in-memory one.
pub async fn build_cache(config: &CacheConfig) -> Arc<dyn CacheBackend> {
    match config.backend {
        CacheBackendKind::None => Arc::new(NoopCache),
        CacheBackendKind::Memory => Arc::new(MemoryCache::new(config.max_size)),
        CacheBackendKind::Shared => {
            match SharedCache::open(&config.shared_path, config.max_size).await {
                Ok(cache) => {
                    info!("Using shared cache at {}", config.shared_path.display());
                    Arc::new(cache)
                }
                Err(e) => {
                    warn!(
                        "Shared cache unavailable ({}), falling back to memory cache",
                        e
                    );
                    Arc::new(MemoryCache::new(config.max_size))
                }
            }
        }
    }
}
