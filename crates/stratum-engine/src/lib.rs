//! Orchestration tier of the Stratum cache.
//!
//! [`CacheLayer`] is the facade applications hold: it wires the key
//! codec and selected backend to the single-flight query manager, the
//! write-driven invalidation router and the schema assurance cache.

pub mod error;
pub mod invalidation;
pub mod layer;
pub mod manager;
pub mod schema;

pub use error::{CacheError, SourceError};
pub use invalidation::{InvalidationRouter, InvalidationScope, scope_for};
pub use layer::CacheLayer;
pub use manager::QueryCacheManager;
pub use schema::{SchemaAssuranceCache, SchemaAssuranceRecord};
