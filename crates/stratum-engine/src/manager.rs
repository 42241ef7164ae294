//! Get-or-compute orchestration with single-flight miss coalescing.
//!
//! Concurrent misses on the same key elect one leader; everyone else
//! subscribes to the leader's broadcast instead of issuing a duplicate
//! fetch. The leader runs inside a spawned task, so a caller abandoning
//! its request (upstream timeout) never cancels the in-flight fetch —
//! it completes and populates the cache for the remaining waiters.
//!
//! Failures are never cached: a failed compute releases the flight and
//! propagates the same error to every waiter.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::Value;
use stratum_core::{CacheKey, MetricsRecorder, ModelTag};
use stratum_store::{CacheBackend, DynBackend};
use tokio::sync::broadcast;

use crate::error::{CacheError, SourceError};

type FlightResult = Result<Arc<Value>, CacheError>;

pub struct QueryCacheManager {
    backend: DynBackend,
    metrics: Arc<MetricsRecorder>,
    flights: Arc<DashMap<String, broadcast::Sender<FlightResult>>>,
}

impl QueryCacheManager {
    pub fn new(backend: DynBackend, metrics: Arc<MetricsRecorder>) -> Self {
        Self {
            backend,
            metrics,
            flights: Arc::new(DashMap::new()),
        }
    }

    /// Return the cached value for `key`, or compute, store and return
    /// it.
    ///
    /// Backend `get` failures degrade to a miss and the read proceeds to
    /// the source of truth; `set` failures are logged and dropped. The
    /// error of a failed `compute` reaches every coalesced waiter.
    pub async fn get_or_compute<F, Fut>(
        &self,
        key: &CacheKey,
        tag: &ModelTag,
        ttl: Option<Duration>,
        compute: F,
    ) -> Result<Arc<Value>, CacheError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value, SourceError>> + Send + 'static,
    {
        match self.backend.get(key).await {
            Ok(Some(bytes)) => match serde_json::from_slice::<Value>(&bytes) {
                Ok(value) => {
                    self.metrics.record_hit();
                    return Ok(Arc::new(value));
                }
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "dropping undecodable cache entry");
                    if let Err(e) = self.backend.delete(key).await {
                        tracing::debug!(key = %key, error = %e, "cleanup delete failed");
                    }
                }
            },
            Ok(None) => {}
            Err(e) => {
                tracing::debug!(key = %key, error = %e, "backend get failed, treating as miss");
            }
        }
        self.metrics.record_miss();

        // Subscribe under the map shard guard so the leader's
        // remove-then-send cannot slip between lookup and subscription.
        let mut receiver = match self.flights.entry(key.as_str().to_string()) {
            Entry::Occupied(entry) => entry.get().subscribe(),
            Entry::Vacant(entry) => {
                let (sender, receiver) = broadcast::channel(1);
                entry.insert(sender.clone());
                self.spawn_leader(key.clone(), tag.clone(), ttl, compute, sender);
                receiver
            }
        };

        match receiver.recv().await {
            Ok(result) => result,
            Err(_) => Err(CacheError::FlightAborted),
        }
    }

    fn spawn_leader<F, Fut>(
        &self,
        key: CacheKey,
        tag: ModelTag,
        ttl: Option<Duration>,
        compute: F,
        sender: broadcast::Sender<FlightResult>,
    ) where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value, SourceError>> + Send + 'static,
    {
        let backend = Arc::clone(&self.backend);
        let flights = Arc::clone(&self.flights);

        tokio::spawn(async move {
            let result: FlightResult = match compute().await {
                Ok(value) => {
                    match serde_json::to_vec(&value) {
                        Ok(bytes) => {
                            if let Err(e) = backend.set(&key, bytes, &tag, ttl).await {
                                tracing::warn!(key = %key, error = %e, "cache set failed");
                            }
                        }
                        Err(e) => {
                            tracing::warn!(
                                key = %key,
                                error = %e,
                                "computed value not serializable, skipping store"
                            );
                        }
                    }
                    Ok(Arc::new(value))
                }
                Err(e) => {
                    tracing::debug!(key = %key, error = %e, "compute failed, nothing cached");
                    Err(CacheError::source(e))
                }
            };

            // Remove the flight before broadcasting: callers arriving
            // after this point find the value in the backend (or start
            // a fresh flight) instead of a closed channel.
            flights.remove(key.as_str());
            let _ = sender.send(result);
        });
    }

    /// Number of in-flight computations, for introspection.
    pub fn in_flight(&self) -> usize {
        self.flights.len()
    }
}
