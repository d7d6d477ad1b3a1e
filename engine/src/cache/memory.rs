use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::CacheBackend;

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
    /// Recency stamp; also the key of this entry in `Inner::order`
    stamp: u64,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    /// Recency stamp -> key, oldest first
    order: BTreeMap<u64, String>,
    clock: u64,
}

impl Inner {
    fn next_stamp(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn remove(&mut self, key: &str) {
        if let Some(entry) = self.entries.remove(key) {
            self.order.remove(&entry.stamp);
        }
    }

    fn evict_oldest(&mut self) {
        if let Some((_, key)) = self.order.pop_first() {
            debug!("Evicting least recently used cache entry: {}", key);
            self.entries.remove(&key);
        }
    }
}

/// In-process cache with a maximum entry count and LRU eviction
///
/// Reads promote an entry; inserting a new key into a full cache evicts the
/// entry that was least recently read or written.
#[derive(Clone)]
pub struct MemoryCache {
    max_size: usize,
    inner: Arc<Mutex<Inner>>,
}

impl MemoryCache {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size: max_size.max(1),
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Number of stored entries, including expired ones not yet read
    pub fn len(&self) -> usize {
        self.inner.lock().map(|i| i.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Option<Value> {
        let Ok(mut inner) = self.inner.lock() else {
            warn!("Memory cache lock poisoned, treating read as miss");
            return None;
        };

        let (old_stamp, expired) = {
            let entry = inner.entries.get(key)?;
            let expired = entry
                .expires_at
                .map(|at| Instant::now() >= at)
                .unwrap_or(false);
            (entry.stamp, expired)
        };

        if expired {
            inner.remove(key);
            return None;
        }

        let stamp = inner.next_stamp();
        inner.order.remove(&old_stamp);
        inner.order.insert(stamp, key.to_string());

        let entry = inner.entries.get_mut(key)?;
        entry.stamp = stamp;
        Some(entry.value.clone())
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) {
        let Ok(mut inner) = self.inner.lock() else {
            warn!("Memory cache lock poisoned, dropping write for {}", key);
            return;
        };

        inner.remove(key);
        while inner.entries.len() >= self.max_size {
            inner.evict_oldest();
        }

        let stamp = inner.next_stamp();
        inner.order.insert(stamp, key.to_string());
        inner.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: ttl.map(|d| Instant::now() + d),
                stamp,
            },
        );
    }

    async fn delete(&self, key: &str) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.remove(key);
        } else {
            warn!("Memory cache lock poisoned, cannot delete {}", key);
        }
    }

    async fn clear(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.entries.clear();
            inner.order.clear();
        } else {
            warn!("Memory cache lock poisoned, cannot clear");
        }
    }
}
