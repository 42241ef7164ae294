//! Configuration surface for the cache subsystem.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Which backend the selector should pick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendChoice {
    /// Probe the distributed store and fall back to memory.
    #[default]
    Auto,
    /// In-process bounded store only.
    Memory,
    /// Prefer the distributed store; still degrades to memory when the
    /// store is unreachable at startup.
    Distributed,
}

impl std::fmt::Display for BackendChoice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Memory => write!(f, "memory"),
            Self::Distributed => write!(f, "distributed"),
        }
    }
}

/// Cache configuration.
///
/// All fields have serde defaults so a bare `[cache]` table works.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Master switch; when false every read goes to the source of truth.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Backend selection mode.
    #[serde(default)]
    pub backend: BackendChoice,

    /// Key namespace isolating tenants/instances on a shared backend.
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Entry TTL in seconds. Absent = entries never expire.
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: Option<u64>,

    /// Maximum entries held by the in-memory backend.
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// Lock shards for the in-memory backend.
    #[serde(default = "default_shards")]
    pub shards: usize,

    /// Distributed store URL (e.g. "redis://localhost:6379").
    #[serde(default)]
    pub distributed_url: Option<String>,

    /// Connection pool size for the distributed store.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Startup health probe budget in milliseconds.
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// TTL for schema assurance records in seconds. Absent = no expiry.
    #[serde(default)]
    pub schema_cache_ttl_secs: Option<u64>,

    /// When false, schema assurance is re-verified on every operation.
    #[serde(default = "default_schema_cache_validation")]
    pub schema_cache_validation: bool,
}

fn default_enabled() -> bool {
    true
}

fn default_namespace() -> String {
    "stratum".to_string()
}

fn default_ttl_secs() -> Option<u64> {
    Some(300)
}

fn default_max_entries() -> usize {
    10_000
}

fn default_shards() -> usize {
    16
}

fn default_pool_size() -> usize {
    10
}

fn default_probe_timeout_ms() -> u64 {
    2000
}

fn default_schema_cache_validation() -> bool {
    true
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            backend: BackendChoice::default(),
            namespace: default_namespace(),
            ttl_secs: default_ttl_secs(),
            max_entries: default_max_entries(),
            shards: default_shards(),
            distributed_url: None,
            pool_size: default_pool_size(),
            probe_timeout_ms: default_probe_timeout_ms(),
            schema_cache_ttl_secs: None,
            schema_cache_validation: default_schema_cache_validation(),
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.namespace.is_empty() {
            return Err("cache.namespace must not be empty".into());
        }
        if self.namespace.contains(':') || self.namespace.contains('*') {
            return Err("cache.namespace must not contain ':' or '*'".into());
        }
        if self.max_entries == 0 {
            return Err("cache.max_entries must be > 0".into());
        }
        if self.shards == 0 {
            return Err("cache.shards must be > 0".into());
        }
        if self.pool_size == 0 {
            return Err("cache.pool_size must be > 0".into());
        }
        if self.probe_timeout_ms == 0 {
            return Err("cache.probe_timeout_ms must be > 0".into());
        }
        Ok(())
    }

    /// Entry TTL as a duration, if configured.
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_secs.map(Duration::from_secs)
    }

    /// Schema assurance TTL as a duration, if configured.
    pub fn schema_ttl(&self) -> Option<Duration> {
        self.schema_cache_ttl_secs.map(Duration::from_secs)
    }

    /// Health probe budget as a duration.
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CacheConfig::default();
        assert!(config.enabled);
        assert_eq!(config.backend, BackendChoice::Auto);
        assert_eq!(config.namespace, "stratum");
        assert_eq!(config.ttl_secs, Some(300));
        assert_eq!(config.max_entries, 10_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_deserialize_empty_table() {
        let config: CacheConfig = serde_json::from_str("{}").unwrap();
        assert!(config.enabled);
        assert_eq!(config.shards, 16);
    }

    #[test]
    fn test_deserialize_backend_choice() {
        let config: CacheConfig =
            serde_json::from_str(r#"{"backend": "distributed", "distributed_url": "redis://h"}"#)
                .unwrap();
        assert_eq!(config.backend, BackendChoice::Distributed);
        assert_eq!(config.distributed_url.as_deref(), Some("redis://h"));
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let config = CacheConfig {
            max_entries: 0,
            ..CacheConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_namespace() {
        let config = CacheConfig {
            namespace: "a:b".into(),
            ..CacheConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_ttl_accessors() {
        let config = CacheConfig {
            ttl_secs: None,
            schema_cache_ttl_secs: Some(60),
            ..CacheConfig::default()
        };
        assert_eq!(config.ttl(), None);
        assert_eq!(config.schema_ttl(), Some(Duration::from_secs(60)));
    }
}
