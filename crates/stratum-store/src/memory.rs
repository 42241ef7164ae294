//! Bounded in-process cache backend.
//!
//! The keyspace is partitioned into shards, each guarded by its own lock,
//! so `get`/`set` on unrelated keys never contend. LRU order is per
//! shard: every access stamps the entry with a tick from one
//! process-wide counter, each shard is bounded to its share of
//! `max_entries`, and a shard over its share evicts its own
//! least-recently-ticked entry. The shard count is clamped so every
//! shard holds a meaningful share; small caches collapse to one shard
//! and a single global LRU order. TTL is lazy: expiry is checked on
//! `get`, and the expired entry is removed from both the shard and the
//! tag index on the spot.
//!
//! Lock discipline: the tag-index lock may be held while acquiring shard
//! locks, never the reverse. `get` releases its shard lock before
//! touching the tag index.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use stratum_core::{CacheKey, ModelTag};

use crate::error::BackendError;
use crate::traits::{BackendKind, BackendStats, CacheBackend};

const DEFAULT_SHARDS: usize = 16;

/// Minimum capacity share per shard; caches smaller than this collapse
/// to fewer shards so LRU order stays meaningful.
const MIN_ENTRIES_PER_SHARD: usize = 64;

struct StoredEntry {
    data: Arc<Vec<u8>>,
    tag: String,
    expires_at: Option<Instant>,
    last_access: u64,
}

impl StoredEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| now >= deadline)
    }
}

#[derive(Default)]
struct Shard {
    entries: HashMap<String, StoredEntry>,
}

/// Bounded, LRU-evicting, TTL-aware in-memory backend.
pub struct InMemoryBackend {
    shards: Box<[Mutex<Shard>]>,
    /// Reverse index `tag -> keys` for bulk invalidation. Single lock;
    /// tag operations are far rarer than key operations.
    tags: Mutex<HashMap<String, HashSet<String>>>,
    max_entries: usize,
    clock: AtomicU64,
    size: AtomicUsize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl std::fmt::Debug for InMemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryBackend")
            .field("max_entries", &self.max_entries)
            .field("shards", &self.shards.len())
            .field("size", &self.size.load(Ordering::Relaxed))
            .finish()
    }
}

// A poisoned lock only means another thread panicked mid-operation;
// cache state is reconstructible, so recover the guard instead of
// propagating the panic.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl InMemoryBackend {
    /// Create a backend bounded by `max_entries` with the default shard
    /// count.
    pub fn new(max_entries: usize) -> Self {
        Self::with_shards(max_entries, DEFAULT_SHARDS)
    }

    /// Create a backend with an explicit shard count. The count is
    /// clamped so each shard is bounded by at least
    /// `MIN_ENTRIES_PER_SHARD` entries; small caches use one shard.
    pub fn with_shards(max_entries: usize, shards: usize) -> Self {
        let shard_count = shards.clamp(1, (max_entries / MIN_ENTRIES_PER_SHARD).max(1));
        let shards = (0..shard_count)
            .map(|_| Mutex::new(Shard::default()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            shards,
            tags: Mutex::new(HashMap::new()),
            max_entries,
            clock: AtomicU64::new(0),
            size: AtomicUsize::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    pub fn len(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn shard_for(&self, key: &str) -> &Mutex<Shard> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let index = (hasher.finish() as usize) % self.shards.len();
        &self.shards[index]
    }

    fn next_tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    /// Each shard's share of the capacity bound.
    fn shard_quota(&self) -> usize {
        self.max_entries / self.shards.len()
    }

    /// Evict this shard's least-recently-ticked entries until it fits
    /// its quota. Touches no other shard, so `set`s elsewhere proceed
    /// unblocked.
    ///
    /// Caller must hold the tag lock so eviction and tag maintenance
    /// stay consistent.
    fn evict_within_shard(
        &self,
        shard: &mut Shard,
        tags: &mut HashMap<String, HashSet<String>>,
    ) {
        let quota = self.shard_quota();
        while shard.entries.len() > quota {
            let victim = shard
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_access)
                .map(|(key, _)| key.clone());
            let Some(key) = victim else {
                break;
            };

            if let Some(entry) = shard.entries.remove(&key) {
                self.size.fetch_sub(1, Ordering::Relaxed);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                remove_from_tag_index(tags, &entry.tag, &key);
                tracing::debug!(key = %key, "evicted least-recently-used entry");
            }
        }
    }
}

fn remove_from_tag_index(tags: &mut HashMap<String, HashSet<String>>, tag: &str, key: &str) {
    if let Some(keys) = tags.get_mut(tag) {
        keys.remove(key);
        if keys.is_empty() {
            tags.remove(tag);
        }
    }
}

fn glob_to_regex(pattern: &str) -> Result<regex::Regex, BackendError> {
    let escaped = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    regex::Regex::new(&format!("^{escaped}$"))
        .map_err(|e| BackendError::invalid_pattern(pattern, e))
}

#[async_trait]
impl CacheBackend for InMemoryBackend {
    async fn get(&self, key: &CacheKey) -> Result<Option<Arc<Vec<u8>>>, BackendError> {
        let now = Instant::now();
        let mut shard = lock(self.shard_for(key.as_str()));

        let expired = matches!(
            shard.entries.get(key.as_str()),
            Some(entry) if entry.is_expired(now)
        );
        if expired {
            let removed = shard.entries.remove(key.as_str());
            drop(shard);
            self.size.fetch_sub(1, Ordering::Relaxed);
            self.misses.fetch_add(1, Ordering::Relaxed);
            // Prune the tag index too, or a read-heavy model that is
            // never written would accumulate orphaned index entries.
            // Safe ordering: the shard lock is already released.
            if let Some(entry) = removed {
                let mut tags = lock(&self.tags);
                remove_from_tag_index(&mut tags, &entry.tag, key.as_str());
            }
            return Ok(None);
        }

        match shard.entries.get_mut(key.as_str()) {
            Some(entry) => {
                entry.last_access = self.next_tick();
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(Arc::clone(&entry.data)))
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
        let entry = StoredEntry {
            data: Arc::new(value),
            tag: tag.as_str().to_string(),
            expires_at: ttl.map(|t| Instant::now() + t),
            last_access: self.next_tick(),
        };

        let mut tags = lock(&self.tags);
        tags.entry(tag.as_str().to_string())
            .or_default()
            .insert(key.as_str().to_string());

        {
            let mut shard = lock(self.shard_for(key.as_str()));
            let previous = shard.entries.insert(key.as_str().to_string(), entry);
            if let Some(previous) = previous {
                if previous.tag != tag.as_str() {
                    remove_from_tag_index(&mut tags, &previous.tag, key.as_str());
                }
            } else {
                self.size.fetch_add(1, Ordering::Relaxed);
            }
            self.evict_within_shard(&mut shard, &mut tags);
        }

        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> Result<bool, BackendError> {
        let mut tags = lock(&self.tags);
        let removed = lock(self.shard_for(key.as_str()))
            .entries
            .remove(key.as_str());

        match removed {
            Some(entry) => {
                self.size.fetch_sub(1, Ordering::Relaxed);
                remove_from_tag_index(&mut tags, &entry.tag, key.as_str());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_by_tag(&self, tag: &ModelTag) -> Result<u64, BackendError> {
        let mut tags = lock(&self.tags);
        let Some(keys) = tags.remove(tag.as_str()) else {
            return Ok(0);
        };

        let mut removed = 0u64;
        for key in keys {
            let existed = lock(self.shard_for(&key)).entries.remove(&key).is_some();
            if existed {
                self.size.fetch_sub(1, Ordering::Relaxed);
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn delete_matching(&self, pattern: &str) -> Result<u64, BackendError> {
        let matcher = glob_to_regex(pattern)?;
        let mut tags = lock(&self.tags);
        let mut removed = 0u64;

        for shard in self.shards.iter() {
            let mut guard = lock(shard);
            let matching: Vec<String> = guard
                .entries
                .keys()
                .filter(|k| matcher.is_match(k))
                .cloned()
                .collect();
            for key in matching {
                if let Some(entry) = guard.entries.remove(&key) {
                    self.size.fetch_sub(1, Ordering::Relaxed);
                    remove_from_tag_index(&mut tags, &entry.tag, &key);
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    async fn clear(&self) -> Result<(), BackendError> {
        let mut tags = lock(&self.tags);
        tags.clear();
        for shard in self.shards.iter() {
            lock(shard).entries.clear();
        }
        self.size.store(0, Ordering::Relaxed);
        Ok(())
    }

    fn stats(&self) -> BackendStats {
        BackendStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            size: self.size.load(Ordering::Relaxed),
        }
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratum_core::{KeyCodec, OperationKind};

    fn codec() -> KeyCodec {
        KeyCodec::new("test")
    }

    fn key_for(model: &str, n: u64) -> CacheKey {
        codec()
            .encode(model, OperationKind::FindMany, None, &[], Some(n), None)
            .unwrap()
    }

    fn tag_for(model: &str) -> ModelTag {
        codec().tag_for(model)
    }

    #[tokio::test]
    async fn test_set_and_get() {
        let backend = InMemoryBackend::new(10);
        let key = key_for("User", 1);

        backend
            .set(&key, b"payload".to_vec(), &tag_for("User"), None)
            .await
            .unwrap();

        let value = backend.get(&key).await.unwrap().expect("cached value");
        assert_eq!(&**value, b"payload");

        let stats = backend.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.size, 1);
    }

    #[tokio::test]
    async fn test_miss_records_counter() {
        let backend = InMemoryBackend::new(10);
        assert!(backend.get(&key_for("User", 1)).await.unwrap().is_none());
        assert_eq!(backend.stats().misses, 1);
    }

    #[tokio::test]
    async fn test_lru_eviction_at_capacity() {
        let backend = InMemoryBackend::new(3);
        let tag = tag_for("User");

        for n in 0..4 {
            backend
                .set(&key_for("User", n), vec![n as u8], &tag, None)
                .await
                .unwrap();
        }

        // Oldest entry is gone, newest three remain.
        assert!(backend.get(&key_for("User", 0)).await.unwrap().is_none());
        for n in 1..4 {
            assert!(backend.get(&key_for("User", n)).await.unwrap().is_some());
        }
        assert_eq!(backend.stats().evictions, 1);
        assert_eq!(backend.len(), 3);
    }

    #[tokio::test]
    async fn test_lru_respects_access_order() {
        // maxEntries=2: insert k1, k2, touch k1, insert k3 -> k2 evicted.
        let backend = InMemoryBackend::new(2);
        let tag = tag_for("User");
        let (k1, k2, k3) = (key_for("User", 1), key_for("User", 2), key_for("User", 3));

        backend.set(&k1, b"1".to_vec(), &tag, None).await.unwrap();
        backend.set(&k2, b"2".to_vec(), &tag, None).await.unwrap();
        assert!(backend.get(&k1).await.unwrap().is_some());
        backend.set(&k3, b"3".to_vec(), &tag, None).await.unwrap();

        assert!(backend.get(&k1).await.unwrap().is_some());
        assert!(backend.get(&k2).await.unwrap().is_none());
        assert!(backend.get(&k3).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_replacing_key_does_not_grow_size() {
        let backend = InMemoryBackend::new(2);
        let tag = tag_for("User");
        let key = key_for("User", 1);

        backend.set(&key, b"a".to_vec(), &tag, None).await.unwrap();
        backend.set(&key, b"b".to_vec(), &tag, None).await.unwrap();

        assert_eq!(backend.len(), 1);
        let value = backend.get(&key).await.unwrap().unwrap();
        assert_eq!(&**value, b"b");
    }

    #[tokio::test]
    async fn test_ttl_expiry_is_lazy() {
        let backend = InMemoryBackend::new(10);
        let tag = tag_for("User");
        let key = key_for("User", 1);

        backend
            .set(
                &key,
                b"v".to_vec(),
                &tag,
                Some(Duration::from_millis(50)),
            )
            .await
            .unwrap();

        assert!(backend.get(&key).await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(backend.get(&key).await.unwrap().is_none());
        assert_eq!(backend.len(), 0);
    }

    #[tokio::test]
    async fn test_expired_get_prunes_tag_index() {
        let backend = InMemoryBackend::new(10);
        let key = key_for("User", 1);

        backend
            .set(
                &key,
                b"v".to_vec(),
                &tag_for("User"),
                Some(Duration::from_millis(20)),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(backend.get(&key).await.unwrap().is_none());
        assert_eq!(backend.len(), 0);

        // No orphaned index entry survives the lazy expiry.
        assert!(lock(&backend.tags).is_empty());
    }

    #[test]
    fn test_small_caches_collapse_to_one_shard() {
        let backend = InMemoryBackend::with_shards(2, 16);
        assert_eq!(backend.shards.len(), 1);

        let backend = InMemoryBackend::with_shards(1024, 16);
        assert_eq!(backend.shards.len(), 16);
    }

    #[tokio::test]
    async fn test_capacity_bound_holds_across_shards() {
        let backend = InMemoryBackend::with_shards(128, 2);
        let tag = tag_for("User");

        for n in 0..300 {
            backend
                .set(&key_for("User", n), vec![n as u8], &tag, None)
                .await
                .unwrap();
        }

        assert!(backend.len() <= 128);
        assert!(backend.stats().evictions >= 172);
    }

    #[tokio::test]
    async fn test_delete_by_tag_is_idempotent() {
        let backend = InMemoryBackend::new(10);
        let tag = tag_for("User");

        for n in 0..3 {
            backend
                .set(&key_for("User", n), vec![n as u8], &tag, None)
                .await
                .unwrap();
        }

        assert_eq!(backend.delete_by_tag(&tag).await.unwrap(), 3);
        assert_eq!(backend.delete_by_tag(&tag).await.unwrap(), 0);
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn test_delete_by_tag_leaves_other_models() {
        let backend = InMemoryBackend::new(10);

        backend
            .set(&key_for("User", 1), b"u".to_vec(), &tag_for("User"), None)
            .await
            .unwrap();
        backend
            .set(&key_for("Order", 1), b"o".to_vec(), &tag_for("Order"), None)
            .await
            .unwrap();

        assert_eq!(backend.delete_by_tag(&tag_for("User")).await.unwrap(), 1);
        assert!(backend.get(&key_for("Order", 1)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_delete_single_key() {
        let backend = InMemoryBackend::new(10);
        let key = key_for("User", 1);

        backend
            .set(&key, b"v".to_vec(), &tag_for("User"), None)
            .await
            .unwrap();

        assert!(backend.delete(&key).await.unwrap());
        assert!(!backend.delete(&key).await.unwrap());
        assert_eq!(backend.delete_by_tag(&tag_for("User")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_delete_matching_pattern() {
        let backend = InMemoryBackend::new(10);
        let c = codec();
        let tag = tag_for("User");

        let list = c
            .encode("User", OperationKind::FindMany, None, &[], None, None)
            .unwrap();
        let count = c
            .encode("User", OperationKind::Count, None, &[], None, None)
            .unwrap();

        backend.set(&list, b"l".to_vec(), &tag, None).await.unwrap();
        backend.set(&count, b"c".to_vec(), &tag, None).await.unwrap();

        let removed = backend.delete_matching("test:User:count:*").await.unwrap();
        assert_eq!(removed, 1);
        assert!(backend.get(&list).await.unwrap().is_some());
        assert!(backend.get(&count).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_matching_rejects_bad_pattern() {
        // '*' is the only wildcard; other regex metacharacters are
        // escaped, so arbitrary input cannot produce a compile error,
        // but an empty pattern simply matches nothing.
        let backend = InMemoryBackend::new(10);
        assert_eq!(backend.delete_matching("").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_clear() {
        let backend = InMemoryBackend::new(10);
        let tag = tag_for("User");

        for n in 0..5 {
            backend
                .set(&key_for("User", n), vec![n as u8], &tag, None)
                .await
                .unwrap();
        }

        backend.clear().await.unwrap();
        assert!(backend.is_empty());
        assert_eq!(backend.delete_by_tag(&tag).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_set_and_get() {
        let backend = Arc::new(InMemoryBackend::new(128));
        let mut handles = Vec::new();

        for worker in 0..8u64 {
            let backend = Arc::clone(&backend);
            handles.push(tokio::spawn(async move {
                let tag = tag_for("User");
                for n in 0..32 {
                    let key = key_for("User", worker * 100 + n);
                    backend
                        .set(&key, vec![worker as u8], &tag, None)
                        .await
                        .unwrap();
                    assert!(backend.get(&key).await.unwrap().is_some());
                }
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }
        assert!(backend.len() <= 128);
        assert!(backend.stats().evictions >= 128);
    }
}
