//! Write-driven invalidation routing.
//!
//! A single-row change can flip the truth of any cached list or count
//! for that model, and deciding which cached predicates a row satisfies
//! would require re-executing the filter. So every write kind maps to
//! full-model invalidation: the whole tag is purged, trading some hit
//! rate for correctness.

use std::sync::Arc;

use stratum_core::{KeyCodec, MetricsRecorder, OperationKind};
use stratum_store::{BackendError, CacheBackend, DynBackend};

/// How much cached state a write operation invalidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationScope {
    /// Purge every cached read for the model.
    FullModel,
    /// No invalidation (reads).
    None,
}

/// Static operation-kind -> scope table.
pub fn scope_for(kind: OperationKind) -> InvalidationScope {
    match kind {
        OperationKind::Create
        | OperationKind::CreateMany
        | OperationKind::Update
        | OperationKind::UpdateMany
        | OperationKind::Upsert
        | OperationKind::Delete
        | OperationKind::DeleteMany => InvalidationScope::FullModel,
        OperationKind::FindUnique
        | OperationKind::FindMany
        | OperationKind::Count
        | OperationKind::Aggregate => InvalidationScope::None,
    }
}

pub struct InvalidationRouter {
    backend: DynBackend,
    codec: KeyCodec,
    metrics: Arc<MetricsRecorder>,
}

impl InvalidationRouter {
    pub fn new(backend: DynBackend, codec: KeyCodec, metrics: Arc<MetricsRecorder>) -> Self {
        Self {
            backend,
            codec,
            metrics,
        }
    }

    /// Invalidate after a write has succeeded. Returns the number of
    /// entries removed; idempotent (0 when the model has nothing
    /// cached). Backend failures are logged and dropped — a failed
    /// purge must never fail the write that triggered it, and the TTL
    /// backstop bounds the resulting staleness.
    pub async fn after_write(&self, model: &str, kind: OperationKind) -> u64 {
        match scope_for(kind) {
            InvalidationScope::None => 0,
            InvalidationScope::FullModel => self.invalidate_model(model).await,
        }
    }

    /// Purge every cached read for `model`.
    pub async fn invalidate_model(&self, model: &str) -> u64 {
        let tag = self.codec.tag_for(model);
        match self.backend.delete_by_tag(&tag).await {
            Ok(removed) => {
                self.metrics.record_invalidation();
                tracing::debug!(tag = %tag, removed, "invalidated model cache");
                removed
            }
            Err(BackendError::PartialInvalidation {
                tag,
                deleted,
                reason,
            }) => {
                self.metrics.record_invalidation();
                tracing::warn!(
                    tag = %tag,
                    deleted,
                    reason = %reason,
                    "partial invalidation, TTL bounds remaining staleness"
                );
                deleted
            }
            Err(e) => {
                tracing::warn!(
                    tag = %tag,
                    error = %e,
                    "invalidation failed, relying on TTL backstop"
                );
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratum_store::InMemoryBackend;

    fn setup() -> (InvalidationRouter, DynBackend, KeyCodec) {
        let backend: DynBackend = Arc::new(InMemoryBackend::new(64));
        let codec = KeyCodec::new("test");
        let router = InvalidationRouter::new(
            Arc::clone(&backend),
            codec.clone(),
            Arc::new(MetricsRecorder::new()),
        );
        (router, backend, codec)
    }

    #[test]
    fn test_scope_table() {
        assert_eq!(scope_for(OperationKind::Create), InvalidationScope::FullModel);
        assert_eq!(
            scope_for(OperationKind::CreateMany),
            InvalidationScope::FullModel
        );
        assert_eq!(scope_for(OperationKind::Update), InvalidationScope::FullModel);
        assert_eq!(scope_for(OperationKind::Upsert), InvalidationScope::FullModel);
        assert_eq!(
            scope_for(OperationKind::DeleteMany),
            InvalidationScope::FullModel
        );
        assert_eq!(scope_for(OperationKind::FindMany), InvalidationScope::None);
        assert_eq!(scope_for(OperationKind::Count), InvalidationScope::None);
    }

    #[tokio::test]
    async fn test_write_purges_model_reads_only() {
        let (router, backend, codec) = setup();

        let user_key = codec
            .encode("User", OperationKind::FindMany, None, &[], None, None)
            .unwrap();
        let order_key = codec
            .encode("Order", OperationKind::FindMany, None, &[], None, None)
            .unwrap();

        backend
            .set(&user_key, b"u".to_vec(), &codec.tag_for("User"), None)
            .await
            .unwrap();
        backend
            .set(&order_key, b"o".to_vec(), &codec.tag_for("Order"), None)
            .await
            .unwrap();

        let removed = router.after_write("User", OperationKind::Update).await;
        assert_eq!(removed, 1);
        assert!(backend.get(&user_key).await.unwrap().is_none());
        assert!(backend.get(&order_key).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_reads_do_not_invalidate() {
        let (router, backend, codec) = setup();
        let key = codec
            .encode("User", OperationKind::FindMany, None, &[], None, None)
            .unwrap();
        backend
            .set(&key, b"u".to_vec(), &codec.tag_for("User"), None)
            .await
            .unwrap();

        assert_eq!(router.after_write("User", OperationKind::FindMany).await, 0);
        assert!(backend.get(&key).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_idempotent_invalidation() {
        let (router, backend, codec) = setup();
        let key = codec
            .encode("User", OperationKind::FindMany, None, &[], None, None)
            .unwrap();
        backend
            .set(&key, b"u".to_vec(), &codec.tag_for("User"), None)
            .await
            .unwrap();

        assert_eq!(router.invalidate_model("User").await, 1);
        assert_eq!(router.invalidate_model("User").await, 0);
    }
}
