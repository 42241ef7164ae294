//! Storage tier of the Stratum cache.
//!
//! Defines the [`CacheBackend`] trait plus the two production
//! implementations: the bounded in-process [`InMemoryBackend`] and the
//! Redis-backed [`RedisBackend`]. [`BackendSelector`] probes the
//! distributed store at startup and picks whichever backend is usable.

pub mod distributed;
pub mod error;
pub mod memory;
pub mod selector;
pub mod traits;

pub use distributed::RedisBackend;
pub use error::BackendError;
pub use memory::InMemoryBackend;
pub use selector::{BackendHandle, BackendSelector};
pub use traits::{BackendKind, BackendStats, CacheBackend, DynBackend};
