//! The cache layer facade.
//!
//! One constructed object wiring codec, backend, query manager,
//! invalidation router and schema assurance together. Callers hold a
//! `CacheLayer` per runtime instance; nothing here is process-global,
//! so two instances with different namespaces coexist on one shared
//! store without seeing each other's entries.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use stratum_core::{
    CacheConfig, CoreError, KeyCodec, MetricsRecorder, MetricsSnapshot, OperationKind, SortField,
};
use stratum_store::{BackendHandle, BackendKind, BackendSelector, CacheBackend, DynBackend};

use crate::error::{CacheError, SourceError};
use crate::invalidation::InvalidationRouter;
use crate::manager::QueryCacheManager;
use crate::schema::SchemaAssuranceCache;

pub struct CacheLayer {
    enabled: bool,
    ttl: Option<Duration>,
    codec: KeyCodec,
    backend: DynBackend,
    kind: BackendKind,
    healthy: bool,
    manager: QueryCacheManager,
    router: InvalidationRouter,
    schema: SchemaAssuranceCache,
    metrics: Arc<MetricsRecorder>,
}

impl CacheLayer {
    /// Validate `config`, select a backend and assemble the layer.
    ///
    /// Never fails on store unreachability (that degrades to the
    /// in-memory backend); only invalid configuration is an error.
    pub async fn connect(config: &CacheConfig) -> Result<Self, CoreError> {
        config.validate().map_err(CoreError::configuration)?;
        let handle = BackendSelector::select(config).await;
        Ok(Self::from_handle(config, handle))
    }

    /// Assemble the layer around an already-selected backend.
    pub fn from_handle(config: &CacheConfig, handle: BackendHandle) -> Self {
        let codec = KeyCodec::new(&config.namespace);
        let metrics = Arc::new(MetricsRecorder::new());
        let backend = Arc::clone(&handle.backend);

        Self {
            enabled: config.enabled,
            ttl: config.ttl(),
            codec: codec.clone(),
            backend: Arc::clone(&backend),
            kind: handle.kind,
            healthy: handle.healthy,
            manager: QueryCacheManager::new(Arc::clone(&backend), Arc::clone(&metrics)),
            router: InvalidationRouter::new(backend, codec, Arc::clone(&metrics)),
            schema: SchemaAssuranceCache::new(
                config.schema_ttl(),
                config.schema_cache_validation,
            ),
            metrics,
        }
    }

    /// Serve a read through the cache, or compute it directly when the
    /// layer is disabled or the query is uncacheable.
    ///
    /// An uncacheable query (filter that cannot be canonicalized) is
    /// not an error: the read runs against the source and its result is
    /// simply never stored.
    #[allow(clippy::too_many_arguments)]
    pub async fn cached_read<F, Fut>(
        &self,
        model: &str,
        operation: OperationKind,
        filter: Option<&Value>,
        sort: &[SortField],
        limit: Option<u64>,
        offset: Option<u64>,
        compute: F,
    ) -> Result<Arc<Value>, CacheError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value, SourceError>> + Send + 'static,
    {
        if !self.enabled {
            return match compute().await {
                Ok(value) => Ok(Arc::new(value)),
                Err(e) => Err(CacheError::source(e)),
            };
        }

        let key = match self
            .codec
            .encode(model, operation, filter, sort, limit, offset)
        {
            Ok(key) => key,
            Err(e) => {
                tracing::debug!(model = %model, error = %e, "uncacheable query, bypassing cache");
                return match compute().await {
                    Ok(value) => Ok(Arc::new(value)),
                    Err(e) => Err(CacheError::source(e)),
                };
            }
        };

        let tag = self.codec.tag_for(model);
        self.manager
            .get_or_compute(&key, &tag, self.ttl, compute)
            .await
    }

    /// Invalidate after a successful write. Returns entries removed.
    pub async fn invalidate_after_write(&self, model: &str, operation: OperationKind) -> u64 {
        if !self.enabled {
            return 0;
        }
        self.router.after_write(model, operation).await
    }

    /// Purge every cached read for `model`, regardless of operation.
    pub async fn invalidate_model(&self, model: &str) -> u64 {
        if !self.enabled {
            return 0;
        }
        self.router.invalidate_model(model).await
    }

    /// Purge keys matching a glob pattern, interpreted relative to this
    /// layer's namespace ("User:*" matches only this namespace's
    /// entries).
    pub async fn invalidate_key_pattern(&self, pattern: &str) -> Result<u64, CacheError> {
        if !self.enabled {
            return Ok(0);
        }
        let scoped = format!("{}:{pattern}", self.codec.namespace());
        let removed = self.backend.delete_matching(&scoped).await?;
        if removed > 0 {
            self.metrics.record_invalidation();
        }
        tracing::debug!(pattern = %scoped, removed, "pattern invalidation");
        Ok(removed)
    }

    /// Drop everything in this layer's namespace, both tiers.
    pub async fn clear(&self) -> Result<(), CacheError> {
        self.schema.invalidate_all();
        if self.enabled {
            self.backend.clear().await?;
        }
        Ok(())
    }

    pub fn schema(&self) -> &SchemaAssuranceCache {
        &self.schema
    }

    /// Counter snapshot; evictions come from the backend that
    /// performed them.
    pub fn metrics(&self) -> MetricsSnapshot {
        let mut snapshot = self.metrics.snapshot();
        snapshot.evictions = self.backend.stats().evictions;
        snapshot
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.kind
    }

    /// False when a distributed backend was requested but the layer is
    /// running on the in-memory fallback.
    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn in_flight(&self) -> usize {
        self.manager.in_flight()
    }
}

impl std::fmt::Debug for CacheLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheLayer")
            .field("enabled", &self.enabled)
            .field("kind", &self.kind)
            .field("healthy", &self.healthy)
            .finish()
    }
}
