//! Redis-backed distributed cache backend.
//!
//! Values live under their cache key; because Redis has no efficient
//! wildcard delete, every `set` also records the key in a per-tag set
//! (`{tag}:idx`) so `delete_by_tag` can sweep a model's entries. Value
//! and index are written in one MULTI/EXEC pipeline, index first, so a
//! connection drop cannot leave a cached value invisible to tag sweeps.
//! The index is given an expiry no shorter than its entries
//! (`EXPIRE .. GT`) so it cannot under-live them and cause invalidation
//! misses.
//!
//! All store I/O happens outside any in-process lock. Connection and
//! command failures map to `BackendError::Unavailable`; a tag sweep
//! interrupted mid-way reports `PartialInvalidation` and leaves the TTL
//! backstop to bound staleness.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::Pool;
use redis::AsyncCommands;
use stratum_core::{CacheKey, ModelTag};

use crate::error::BackendError;
use crate::traits::{BackendKind, BackendStats, CacheBackend};

/// Keys deleted per DEL during a tag sweep.
const SWEEP_CHUNK: usize = 128;

/// SCAN page size for pattern deletes and clears.
const SCAN_COUNT: usize = 100;

pub struct RedisBackend {
    pool: Pool,
    namespace: String,
    hits: AtomicU64,
    misses: AtomicU64,
    /// Writes observed by this process; the shared store may hold more.
    local_size: AtomicUsize,
}

impl std::fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBackend")
            .field("namespace", &self.namespace)
            .finish()
    }
}

impl RedisBackend {
    pub fn new(pool: Pool, namespace: impl Into<String>) -> Self {
        Self {
            pool,
            namespace: namespace.into(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            local_size: AtomicUsize::new(0),
        }
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection, BackendError> {
        self.pool.get().await.map_err(BackendError::unavailable)
    }

    fn index_key(tag: &ModelTag) -> String {
        format!("{}:idx", tag.as_str())
    }

    /// Recover the tag from a key's `namespace:model` prefix.
    fn index_key_of(key: &CacheKey) -> Option<String> {
        let mut segments = key.as_str().splitn(3, ':');
        let namespace = segments.next()?;
        let model = segments.next()?;
        segments.next()?;
        Some(format!("{namespace}:{model}:idx"))
    }

    fn decrement_local_size(&self, by: usize) {
        let mut current = self.local_size.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_sub(by);
            match self.local_size.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }

    /// Cursor-scan every key matching `pattern` and delete in batches.
    async fn scan_and_delete(
        &self,
        pattern: &str,
        skip_indices: bool,
    ) -> Result<u64, BackendError> {
        let mut conn = self.conn().await?;
        let mut cursor: u64 = 0;
        let mut deleted = 0u64;

        loop {
            let (next_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await
                .map_err(BackendError::unavailable)?;

            let keys: Vec<String> = if skip_indices {
                keys.into_iter().filter(|k| !k.ends_with(":idx")).collect()
            } else {
                keys
            };

            if !keys.is_empty() {
                let removed: u64 = conn
                    .del(keys)
                    .await
                    .map_err(BackendError::unavailable)?;
                deleted += removed;
            }

            cursor = next_cursor;
            if cursor == 0 {
                break;
            }
        }

        self.decrement_local_size(deleted as usize);
        Ok(deleted)
    }
}

#[async_trait]
impl CacheBackend for RedisBackend {
    async fn get(&self, key: &CacheKey) -> Result<Option<Arc<Vec<u8>>>, BackendError> {
        let mut conn = self.conn().await?;
        let data: Option<Vec<u8>> = conn
            .get(key.as_str())
            .await
            .map_err(BackendError::unavailable)?;

        match data {
            Some(bytes) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(key = %key, "cache hit (distributed)");
                Ok(Some(Arc::new(bytes)))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    async fn set(
        &self,
        key: &CacheKey,
        value: Vec<u8>,
        tag: &ModelTag,
        ttl: Option<Duration>,
    ) -> Result<(), BackendError> {
        let mut conn = self.conn().await?;
        let index = Self::index_key(tag);

        // One atomic pipeline, index before value: a dangling index
        // member is a harmless no-op DEL on the next sweep, but a value
        // missing from the index would dodge tag invalidation for as
        // long as it lives.
        let mut pipe = redis::pipe();
        pipe.atomic();
        match ttl {
            Some(ttl) => {
                let secs = ttl.as_secs().max(1);
                pipe.sadd(&index, key.as_str()).ignore();
                // GT only ever extends the index deadline, so it cannot
                // under-live entries written with longer TTLs.
                pipe.cmd("EXPIRE")
                    .arg(&index)
                    .arg(secs as i64)
                    .arg("GT")
                    .ignore();
                pipe.set_ex(key.as_str(), value, secs).ignore();
            }
            None => {
                pipe.sadd(&index, key.as_str()).ignore();
                pipe.persist(&index).ignore();
                pipe.set(key.as_str(), value).ignore();
            }
        }
        let _: () = pipe
            .query_async(&mut conn)
            .await
            .map_err(BackendError::unavailable)?;

        self.local_size.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> Result<bool, BackendError> {
        let mut conn = self.conn().await?;
        let removed: i64 = conn
            .del(key.as_str())
            .await
            .map_err(BackendError::unavailable)?;

        if let Some(index) = Self::index_key_of(key) {
            if let Err(e) = conn.srem::<_, _, ()>(&index, key.as_str()).await {
                tracing::warn!(key = %key, error = %e, "failed to prune tag index");
            }
        }

        if removed > 0 {
            self.decrement_local_size(1);
        }
        Ok(removed > 0)
    }

    async fn delete_by_tag(&self, tag: &ModelTag) -> Result<u64, BackendError> {
        let mut conn = self.conn().await?;
        let index = Self::index_key(tag);

        let members: Vec<String> = conn
            .smembers(&index)
            .await
            .map_err(BackendError::unavailable)?;
        if members.is_empty() {
            return Ok(0);
        }

        let mut deleted = 0u64;
        for chunk in members.chunks(SWEEP_CHUNK) {
            let removed: u64 = match conn.del(chunk.to_vec()).await {
                Ok(n) => n,
                Err(e) => {
                    self.decrement_local_size(deleted as usize);
                    return Err(BackendError::PartialInvalidation {
                        tag: tag.as_str().to_string(),
                        deleted,
                        reason: e.to_string(),
                    });
                }
            };
            deleted += removed;
        }

        // Losing the index after every member is gone is harmless; the
        // next sweep reads an empty set.
        if let Err(e) = conn.del::<_, ()>(&index).await {
            tracing::warn!(tag = %tag, error = %e, "failed to clear tag index");
        }

        self.decrement_local_size(deleted as usize);
        Ok(deleted)
    }

    async fn delete_matching(&self, pattern: &str) -> Result<u64, BackendError> {
        self.scan_and_delete(pattern, true).await
    }

    async fn clear(&self) -> Result<(), BackendError> {
        let pattern = format!("{}:*", self.namespace);
        let deleted = self.scan_and_delete(&pattern, false).await?;
        self.local_size.store(0, Ordering::Relaxed);
        tracing::debug!(deleted, "cleared distributed cache namespace");
        Ok(())
    }

    fn stats(&self) -> BackendStats {
        BackendStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            // The shared store evicts on its own policy; not visible here.
            evictions: 0,
            size: self.local_size.load(Ordering::Relaxed),
        }
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Distributed
    }
}
