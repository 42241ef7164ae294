//! Core primitives for the Stratum caching subsystem.
//!
//! This crate holds everything the storage and engine layers share:
//! cache key derivation ([`KeyCodec`]), the operation taxonomy
//! ([`OperationKind`]), the configuration surface ([`CacheConfig`]) and
//! the process-wide metrics recorder ([`MetricsRecorder`]).

pub mod config;
pub mod error;
pub mod key;
pub mod metrics;

pub use config::{BackendChoice, CacheConfig};
pub use error::{CoreError, Result};
pub use key::{CacheKey, KeyCodec, ModelTag, OperationKind, SortDirection, SortField};
pub use metrics::{MetricsRecorder, MetricsSnapshot};
