use std::sync::Arc;

use thiserror::Error;

/// Error type accepted from compute/verify callbacks.
pub type SourceError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors surfaced by the cache engine.
///
/// Cloneable so a single-flight leader can fan one failure out to every
/// waiter. Only `Source` failures originate outside the cache; the rest
/// are degradations the caller may usually ignore.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error("cache key encoding failed: {0}")]
    KeyEncoding(String),

    #[error("cache backend error: {0}")]
    Backend(String),

    #[error("cache serialization failed: {0}")]
    Serialization(String),

    /// The compute function failed; nothing was cached.
    #[error("source fetch failed: {0}")]
    Source(Arc<SourceError>),

    /// The in-flight leader disappeared without delivering a result.
    #[error("in-flight computation aborted")]
    FlightAborted,
}

impl CacheError {
    pub fn source(error: SourceError) -> Self {
        Self::Source(Arc::new(error))
    }
}

impl From<stratum_core::CoreError> for CacheError {
    fn from(error: stratum_core::CoreError) -> Self {
        match error {
            stratum_core::CoreError::KeyEncoding(msg) => Self::KeyEncoding(msg),
            stratum_core::CoreError::Json(e) => Self::Serialization(e.to_string()),
            other => Self::Backend(other.to_string()),
        }
    }
}

impl From<stratum_store::BackendError> for CacheError {
    fn from(error: stratum_store::BackendError) -> Self {
        Self::Backend(error.to_string())
    }
}
