//! Shared cache backend
//!
//! Stores entries in a SQLite table so that several processes (or several
//! unrelated task/sessions) can share one cache file. Keys must be namespaced
//! by the caller. Coherence across processes is last-writer-wins; there is no
//! cross-process invalidation beyond what each write does to the table.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{ConnectOptions, Row};
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::CacheBackend;

/// SQLite-backed cache shared between processes
#[derive(Clone)]
pub struct SharedCache {
    pool: SqlitePool,
    max_size: usize,
    /// Last recency stamp handed out by this handle
    clock: Arc<AtomicI64>,
}

impl SharedCache {
    /// Open (or create) the cache database at `path`
    pub async fn open(path: &Path, max_size: usize) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create cache directory")?;
        }

        let connection_string = format!("sqlite:{}", path.display());
        let options = SqliteConnectOptions::from_str(&connection_string)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .disable_statement_logging();

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("Failed to connect to shared cache")?;

        sqlx::raw_sql(include_str!("../../migrations/001_cache.sql"))
            .execute(&pool)
            .await
            .context("Failed to execute migration 001_cache.sql")?;

        debug!("Shared cache ready at {}", path.display());

        Ok(Self {
            pool,
            max_size: max_size.max(1),
            clock: Arc::new(AtomicI64::new(0)),
        })
    }

    /// Strictly increasing recency stamp, close to wall-clock microseconds
    fn next_stamp(&self) -> i64 {
        let now = Utc::now().timestamp_micros();
        let mut prev = self.clock.load(Ordering::Relaxed);
        loop {
            let next = now.max(prev + 1);
            match self
                .clock
                .compare_exchange_weak(prev, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }

    async fn evict_overflow(&self) -> Result<()> {
        let count: i64 = sqlx::query("SELECT COUNT(*) AS n FROM cache_entries")
            .fetch_one(&self.pool)
            .await?
            .try_get("n")?;

        let overflow = count - self.max_size as i64;
        if overflow > 0 {
            debug!("Evicting {} least recently used shared cache entries", overflow);
            sqlx::query(
                "DELETE FROM cache_entries WHERE key IN \
                 (SELECT key FROM cache_entries ORDER BY last_access ASC LIMIT ?)",
            )
            .bind(overflow)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn try_get(&self, key: &str) -> Result<Option<Value>> {
        let row = sqlx::query("SELECT value, expires_at FROM cache_entries WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let expires_at: Option<i64> = row.try_get("expires_at")?;
        if expires_at.is_some_and(|at| Utc::now().timestamp_millis() >= at) {
            self.try_delete(key).await?;
            return Ok(None);
        }

        let raw: String = row.try_get("value")?;
        let value = match serde_json::from_str(&raw) {
            Ok(v) => v,
            Err(e) => {
                warn!("Discarding undecodable shared cache entry {}: {}", key, e);
                self.try_delete(key).await?;
                return Ok(None);
            }
        };

        sqlx::query("UPDATE cache_entries SET last_access = ? WHERE key = ?")
            .bind(self.next_stamp())
            .bind(key)
            .execute(&self.pool)
            .await?;

        Ok(Some(value))
    }

    async fn try_set(&self, key: &str, value: &Value, ttl: Option<Duration>) -> Result<()> {
        let expires_at =
            ttl.map(|d| Utc::now().timestamp_millis() + d.as_millis().min(i64::MAX as u128) as i64);

        sqlx::query(
            "INSERT INTO cache_entries (key, value, expires_at, last_access) VALUES (?, ?, ?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, \
             expires_at = excluded.expires_at, last_access = excluded.last_access",
        )
        .bind(key)
        .bind(serde_json::to_string(value)?)
        .bind(expires_at)
        .bind(self.next_stamp())
        .execute(&self.pool)
        .await?;

        self.evict_overflow().await
    }

    async fn try_delete(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM cache_entries WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl CacheBackend for SharedCache {
    fn name(&self) -> &'static str {
        "shared"
    }

    async fn get(&self, key: &str) -> Option<Value> {
        match self.try_get(key).await {
            Ok(v) => v,
            Err(e) => {
                warn!("Shared cache read failed for {}: {}", key, e);
                None
            }
        }
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) {
        if let Err(e) = self.try_set(key, &value, ttl).await {
            warn!("Shared cache write failed for {}: {}", key, e);
        }
    }

    async fn delete(&self, key: &str) {
        if let Err(e) = self.try_delete(key).await {
            warn!("Shared cache delete failed for {}: {}", key, e);
        }
    }

    async fn clear(&self) {
        if let Err(e) = sqlx::query("DELETE FROM cache_entries")
            .execute(&self.pool)
            .await
        {
            warn!("Shared cache clear failed: {}", e);
        }
    }
}
