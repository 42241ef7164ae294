//! Schema assurance cache (tier 1).
//!
//! Tracks whether a model's physical schema has been verified or created
//! for a given connection identity, so the DDL round-trip happens once
//! per (model, connection) pair instead of on every operation. The state
//! machine is Unverified -> Verified -> Unverified (explicit invalidation
//! by the migration collaborator, or TTL expiry when configured).
//!
//! Concurrent first-callers are coalesced with the same single-flight
//! pattern as the query manager, so two tasks can never race to create
//! the same schema twice.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use time::OffsetDateTime;
use tokio::sync::broadcast;

use crate::error::{CacheError, SourceError};

/// Proof that a (model, connection) pair was verified.
#[derive(Debug, Clone)]
pub struct SchemaAssuranceRecord {
    pub model: String,
    pub connection_identity: String,
    pub verified_at: OffsetDateTime,
    pub checksum: Option<String>,
    verified_instant: Instant,
}

impl SchemaAssuranceRecord {
    fn new(model: &str, connection_identity: &str, checksum: Option<String>) -> Self {
        Self {
            model: model.to_string(),
            connection_identity: connection_identity.to_string(),
            verified_at: OffsetDateTime::now_utc(),
            checksum,
            verified_instant: Instant::now(),
        }
    }

    fn is_expired(&self, ttl: Option<Duration>) -> bool {
        ttl.is_some_and(|ttl| self.verified_instant.elapsed() >= ttl)
    }
}

pub struct SchemaAssuranceCache {
    records: Arc<DashMap<String, SchemaAssuranceRecord>>,
    flights: Arc<DashMap<String, broadcast::Sender<Result<(), CacheError>>>>,
    ttl: Option<Duration>,
    /// When false, every operation re-verifies (memoization off).
    enabled: bool,
}

fn pair_key(model: &str, connection_identity: &str) -> String {
    format!("{model}@{connection_identity}")
}

impl SchemaAssuranceCache {
    pub fn new(ttl: Option<Duration>, enabled: bool) -> Self {
        Self {
            records: Arc::new(DashMap::new()),
            flights: Arc::new(DashMap::new()),
            ttl,
            enabled,
        }
    }

    /// Whether the pair currently holds a live verification record.
    pub fn is_verified(&self, model: &str, connection_identity: &str) -> bool {
        if !self.enabled {
            return false;
        }
        let key = pair_key(model, connection_identity);
        match self.records.get(&key) {
            Some(record) if record.is_expired(self.ttl) => {
                drop(record);
                self.records.remove(&key);
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    pub fn mark_verified(&self, model: &str, connection_identity: &str) {
        self.mark_verified_with_checksum(model, connection_identity, None);
    }

    pub fn mark_verified_with_checksum(
        &self,
        model: &str,
        connection_identity: &str,
        checksum: Option<String>,
    ) {
        if !self.enabled {
            return;
        }
        self.records.insert(
            pair_key(model, connection_identity),
            SchemaAssuranceRecord::new(model, connection_identity, checksum),
        );
    }

    /// The live record for a pair, if any.
    pub fn record(&self, model: &str, connection_identity: &str) -> Option<SchemaAssuranceRecord> {
        let key = pair_key(model, connection_identity);
        self.records
            .get(&key)
            .filter(|r| !r.is_expired(self.ttl))
            .map(|r| r.clone())
    }

    /// Drop the record for one pair (schema drift detected, migration
    /// applied). Returns whether a record existed.
    pub fn invalidate(&self, model: &str, connection_identity: &str) -> bool {
        self.records
            .remove(&pair_key(model, connection_identity))
            .is_some()
    }

    pub fn invalidate_all(&self) {
        self.records.clear();
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Run `verify` unless the pair is already verified, coalescing
    /// concurrent callers onto one in-flight verification.
    ///
    /// `verify` returns an optional schema checksum recorded alongside
    /// the verification. Its failure leaves the pair Unverified and
    /// reaches every waiter; the verification itself runs in a spawned
    /// task, so an abandoned caller cannot cancel it mid-DDL.
    pub async fn ensure_verified<F, Fut>(
        &self,
        model: &str,
        connection_identity: &str,
        verify: F,
    ) -> Result<(), CacheError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<String>, SourceError>> + Send + 'static,
    {
        if !self.enabled {
            return match verify().await {
                Ok(_) => Ok(()),
                Err(e) => Err(CacheError::source(e)),
            };
        }

        if self.is_verified(model, connection_identity) {
            return Ok(());
        }

        let key = pair_key(model, connection_identity);
        let mut receiver = match self.flights.entry(key.clone()) {
            Entry::Occupied(entry) => entry.get().subscribe(),
            Entry::Vacant(entry) => {
                let (sender, receiver) = broadcast::channel(1);
                entry.insert(sender.clone());

                let records = Arc::clone(&self.records);
                let flights = Arc::clone(&self.flights);
                let model = model.to_string();
                let connection_identity = connection_identity.to_string();

                tokio::spawn(async move {
                    let result = match verify().await {
                        Ok(checksum) => {
                            records.insert(
                                pair_key(&model, &connection_identity),
                                SchemaAssuranceRecord::new(&model, &connection_identity, checksum),
                            );
                            tracing::debug!(
                                model = %model,
                                connection = %connection_identity,
                                "schema verified"
                            );
                            Ok(())
                        }
                        Err(e) => {
                            tracing::warn!(
                                model = %model,
                                connection = %connection_identity,
                                error = %e,
                                "schema verification failed"
                            );
                            Err(CacheError::source(e))
                        }
                    };
                    flights.remove(&key);
                    let _ = sender.send(result);
                });
                receiver
            }
        };

        match receiver.recv().await {
            Ok(result) => result,
            Err(_) => Err(CacheError::FlightAborted),
        }
    }
}
