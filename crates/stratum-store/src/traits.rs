//! The backend contract every cache store must implement.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use stratum_core::{CacheKey, ModelTag};

use crate::error::BackendError;

/// Which backend implementation is active. Exposed as the readiness
/// signal for operational dashboards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Memory,
    Distributed,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Distributed => "distributed",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time backend counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BackendStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub size: usize,
}

/// Storage contract shared by the in-memory and distributed backends.
///
/// All operations must be safe for concurrent invocation; `get`/`set`
/// must not block on unrelated keys. Implementations own their internal
/// maps and indices exclusively — no other component mutates cache state
/// directly.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Look up a value. Expired entries count as misses.
    async fn get(&self, key: &CacheKey) -> Result<Option<Arc<Vec<u8>>>, BackendError>;

    /// Store a value under `key`, associating it with `tag` for bulk
    /// invalidation. `ttl = None` means no expiry.
    async fn set(
        &self,
        key: &CacheKey,
        value: Vec<u8>,
        tag: &ModelTag,
        ttl: Option<Duration>,
    ) -> Result<(), BackendError>;

    /// Remove a single entry. Returns whether it existed.
    async fn delete(&self, key: &CacheKey) -> Result<bool, BackendError>;

    /// Remove every entry associated with `tag`. Idempotent: an empty
    /// tag is a no-op returning 0.
    async fn delete_by_tag(&self, tag: &ModelTag) -> Result<u64, BackendError>;

    /// Remove every entry whose key matches `pattern` (`*` wildcard).
    async fn delete_matching(&self, pattern: &str) -> Result<u64, BackendError>;

    /// Drop everything this backend holds for its namespace.
    async fn clear(&self) -> Result<(), BackendError>;

    /// Counter snapshot.
    fn stats(&self) -> BackendStats;

    /// Which implementation this is.
    fn kind(&self) -> BackendKind;
}

/// Shared handle to a backend; lifetime = process lifetime, injected at
/// construction.
pub type DynBackend = Arc<dyn CacheBackend>;

#[cfg(test)]
mod tests {
    use super::*;

    // Compile-time test that CacheBackend is object-safe
    fn _assert_backend_object_safe(_: &dyn CacheBackend) {}

    #[test]
    fn test_backend_kind_names() {
        assert_eq!(BackendKind::Memory.as_str(), "memory");
        assert_eq!(BackendKind::Distributed.to_string(), "distributed");
    }
}
