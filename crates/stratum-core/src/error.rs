use thiserror::Error;

/// Core error types for Stratum cache operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The query could not be canonicalized into a stable cache key.
    ///
    /// Callers must treat the affected query as uncacheable and go
    /// straight to the source of truth; this is never fatal.
    #[error("cache key encoding failed: {0}")]
    KeyEncoding(String),

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoreError {
    /// Create a new KeyEncoding error
    pub fn key_encoding(message: impl Into<String>) -> Self {
        Self::KeyEncoding(message.into())
    }

    /// Create a new Configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }
}

/// Result alias for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
