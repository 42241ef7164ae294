//! Startup backend selection.
//!
//! Selection happens once at construction and never re-evaluates per
//! call, so transient store errors cannot flap the cache between
//! backends mid-flight. Selection never fails: when the distributed
//! store is unreachable the cache degrades to the in-process backend
//! and the system stays usable.

use std::sync::Arc;
use std::time::Duration;

use stratum_core::{BackendChoice, CacheConfig};

use crate::distributed::RedisBackend;
use crate::memory::InMemoryBackend;
use crate::traits::{BackendKind, DynBackend};

/// Result of backend selection.
#[derive(Clone)]
pub struct BackendHandle {
    pub kind: BackendKind,
    /// False when a distributed backend was requested but the probe
    /// failed and the in-memory fallback was chosen.
    pub healthy: bool,
    pub backend: DynBackend,
}

impl std::fmt::Debug for BackendHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendHandle")
            .field("kind", &self.kind)
            .field("healthy", &self.healthy)
            .finish()
    }
}

pub struct BackendSelector;

impl BackendSelector {
    /// Choose a backend for `config`.
    ///
    /// - `backend = "memory"` always yields the in-memory backend.
    /// - `backend = "auto"` or `"distributed"` probes the store URL
    ///   under the configured timeout; probe failure (timeout, refused
    ///   connection, missing URL, bad URL) falls back to memory with a
    ///   single informational event.
    pub async fn select(config: &CacheConfig) -> BackendHandle {
        if config.backend == BackendChoice::Memory {
            tracing::info!("cache backend: memory (forced by configuration)");
            return Self::memory_handle(config, true);
        }

        let Some(url) = config.distributed_url.as_deref() else {
            match config.backend {
                BackendChoice::Distributed => tracing::warn!(
                    "distributed cache backend requested without distributed_url, using memory"
                ),
                _ => tracing::info!("no distributed_url configured, cache backend: memory"),
            }
            return Self::memory_handle(config, config.backend != BackendChoice::Distributed);
        };

        match Self::probe(url, config).await {
            Ok(pool) => {
                tracing::info!(url = %url, "cache backend: distributed");
                BackendHandle {
                    kind: BackendKind::Distributed,
                    healthy: true,
                    backend: Arc::new(RedisBackend::new(pool, config.namespace.clone())),
                }
            }
            Err(reason) => {
                tracing::warn!(
                    url = %url,
                    reason = %reason,
                    "distributed store unreachable, falling back to in-memory cache"
                );
                Self::memory_handle(config, config.backend != BackendChoice::Distributed)
            }
        }
    }

    /// Bounded-time health probe: build a pool and check out one
    /// connection.
    async fn probe(url: &str, config: &CacheConfig) -> Result<deadpool_redis::Pool, String> {
        let timeout = config.probe_timeout();

        let mut redis_config = deadpool_redis::Config::from_url(url);
        let mut pool_config = deadpool_redis::PoolConfig::new(config.pool_size);
        pool_config.timeouts.wait = Some(timeout);
        pool_config.timeouts.create = Some(timeout);
        pool_config.timeouts.recycle = Some(timeout);
        redis_config.pool = Some(pool_config);

        let pool = redis_config
            .create_pool(Some(deadpool_redis::Runtime::Tokio1))
            .map_err(|e| format!("failed to create pool: {e}"))?;

        match tokio::time::timeout(timeout, pool.get()).await {
            Ok(Ok(_conn)) => Ok(pool),
            Ok(Err(e)) => Err(format!("connection failed: {e}")),
            Err(_) => Err(format!("health probe timed out after {timeout:?}")),
        }
    }

    fn memory_handle(config: &CacheConfig, healthy: bool) -> BackendHandle {
        BackendHandle {
            kind: BackendKind::Memory,
            healthy,
            backend: Arc::new(InMemoryBackend::with_shards(
                config.max_entries,
                config.shards,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::CacheBackend as _;

    fn probe_config() -> CacheConfig {
        CacheConfig {
            probe_timeout_ms: 250,
            ..CacheConfig::default()
        }
    }

    #[tokio::test]
    async fn test_forced_memory() {
        let config = CacheConfig {
            backend: BackendChoice::Memory,
            distributed_url: Some("redis://127.0.0.1:1".into()),
            ..probe_config()
        };
        let handle = BackendSelector::select(&config).await;
        assert_eq!(handle.kind, BackendKind::Memory);
        assert!(handle.healthy);
    }

    #[tokio::test]
    async fn test_auto_without_url_uses_memory() {
        let config = CacheConfig {
            backend: BackendChoice::Auto,
            distributed_url: None,
            ..probe_config()
        };
        let handle = BackendSelector::select(&config).await;
        assert_eq!(handle.kind, BackendKind::Memory);
        assert!(handle.healthy);
    }

    #[tokio::test]
    async fn test_distributed_unreachable_falls_back() {
        let config = CacheConfig {
            backend: BackendChoice::Distributed,
            distributed_url: Some("redis://127.0.0.1:1".into()),
            ..probe_config()
        };
        let handle = BackendSelector::select(&config).await;
        assert_eq!(handle.kind, BackendKind::Memory);
        assert!(!handle.healthy);

        // The fallback backend is fully usable.
        let key = stratum_core::KeyCodec::new("app")
            .encode(
                "User",
                stratum_core::OperationKind::Count,
                None,
                &[],
                None,
                None,
            )
            .unwrap();
        assert!(handle.backend.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_bad_url_falls_back() {
        let config = CacheConfig {
            backend: BackendChoice::Auto,
            distributed_url: Some("not-a-url".into()),
            ..probe_config()
        };
        let handle = BackendSelector::select(&config).await;
        assert_eq!(handle.kind, BackendKind::Memory);
    }
}
