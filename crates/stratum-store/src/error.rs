use thiserror::Error;

/// Errors raised by cache backends.
///
/// None of these are fatal to the surrounding read or write: `get`
/// failures degrade to a miss, `set` and invalidation failures are
/// logged and dropped, and partial invalidation falls back on the TTL
/// backstop.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The backend could not be reached for a single operation.
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),

    /// A tag sweep deleted some entries before losing connectivity.
    ///
    /// Remaining entries stay cached until their TTL expires; callers
    /// log this and move on.
    #[error("partial invalidation of tag {tag}: {deleted} entries deleted before failure: {reason}")]
    PartialInvalidation {
        tag: String,
        deleted: u64,
        reason: String,
    },

    /// A key pattern that cannot be compiled into a matcher.
    #[error("invalid key pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

impl BackendError {
    /// Create a new Unavailable error
    pub fn unavailable(message: impl ToString) -> Self {
        Self::Unavailable(message.to_string())
    }

    pub fn invalid_pattern(pattern: impl Into<String>, reason: impl ToString) -> Self {
        Self::InvalidPattern {
            pattern: pattern.into(),
            reason: reason.to_string(),
        }
    }
}
