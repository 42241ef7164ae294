//! Cache key derivation.
//!
//! A logical query (model, operation, filter, sort, pagination) is encoded
//! into a stable string key so that two logically identical queries always
//! land on the same cache entry, regardless of how the caller ordered its
//! filter map.
//!
//! ## Wire format
//!
//! ```text
//! {namespace}:{model}:{operation}:{filterHash}:{sortSpec}:{limit}:{offset}
//! ```
//!
//! `filterHash` is 16 lowercase hex characters derived from the canonical
//! filter rendering. Absent limit/offset and an empty sort render as `-`.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CoreError;

/// An encoded cache key. Opaque to everything except the codec.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Grouping key for all cached entries belonging to one model.
///
/// Every cache entry is associated with exactly one tag; write
/// invalidation purges by tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelTag(String);

impl ModelTag {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModelTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The logical operations the model layer can issue.
///
/// Read kinds participate in result caching; write kinds drive
/// invalidation routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationKind {
    FindUnique,
    FindMany,
    Count,
    Aggregate,
    Create,
    CreateMany,
    Update,
    UpdateMany,
    Upsert,
    Delete,
    DeleteMany,
}

impl OperationKind {
    /// Stable wire name used inside cache keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FindUnique => "findUnique",
            Self::FindMany => "findMany",
            Self::Count => "count",
            Self::Aggregate => "aggregate",
            Self::Create => "create",
            Self::CreateMany => "createMany",
            Self::Update => "update",
            Self::UpdateMany => "updateMany",
            Self::Upsert => "upsert",
            Self::Delete => "delete",
            Self::DeleteMany => "deleteMany",
        }
    }

    /// Whether this operation mutates the underlying store.
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Self::Create
                | Self::CreateMany
                | Self::Update
                | Self::UpdateMany
                | Self::Upsert
                | Self::Delete
                | Self::DeleteMany
        )
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sort direction for a single sort field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Asc => "asc",
            Self::Desc => "desc",
        }
    }
}

/// One field of a sort specification, in caller-given order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SortField {
    pub field: String,
    pub direction: SortDirection,
}

impl SortField {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Asc,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Desc,
        }
    }
}

/// Deterministic encoder from logical queries to cache keys.
///
/// The namespace isolates tenants and independently constructed cache
/// layers that happen to share a backend; it prefixes every key and tag.
#[derive(Debug, Clone)]
pub struct KeyCodec {
    namespace: String,
}

impl KeyCodec {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The invalidation tag grouping every entry for `model`.
    pub fn tag_for(&self, model: &str) -> ModelTag {
        ModelTag(format!("{}:{}", self.namespace, model))
    }

    /// Encode a logical query into a cache key.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::KeyEncoding` when the filter cannot be
    /// canonicalized (it must be a JSON object or absent). Callers treat
    /// that query as uncacheable rather than failing the read.
    pub fn encode(
        &self,
        model: &str,
        operation: OperationKind,
        filter: Option<&Value>,
        sort: &[SortField],
        limit: Option<u64>,
        offset: Option<u64>,
    ) -> Result<CacheKey, CoreError> {
        let filter_hash = hash_filter(filter)?;
        let sort_spec = render_sort(sort);
        let limit = render_opt(limit);
        let offset = render_opt(offset);

        Ok(CacheKey(format!(
            "{}:{}:{}:{}:{}:{}:{}",
            self.namespace, model, operation, filter_hash, sort_spec, limit, offset
        )))
    }
}

fn render_opt(value: Option<u64>) -> String {
    match value {
        Some(n) => n.to_string(),
        None => "-".to_string(),
    }
}

fn render_sort(sort: &[SortField]) -> String {
    if sort.is_empty() {
        return "-".to_string();
    }
    sort.iter()
        .map(|s| format!("{}.{}", s.field, s.direction.as_str()))
        .collect::<Vec<_>>()
        .join(",")
}

/// Hash the canonical rendering of a filter to 16 lowercase hex chars.
fn hash_filter(filter: Option<&Value>) -> Result<String, CoreError> {
    let mut canonical = String::new();
    match filter {
        None | Some(Value::Null) => canonical.push('-'),
        Some(value @ Value::Object(_)) => write_canonical(value, &mut canonical)?,
        Some(other) => {
            return Err(CoreError::key_encoding(format!(
                "filter must be a JSON object, got {}",
                json_type_name(other)
            )));
        }
    }

    let mut hasher = DefaultHasher::new();
    canonical.hash(&mut hasher);
    Ok(format!("{:016x}", hasher.finish()))
}

/// Render a JSON value with object keys in lexicographic order so that
/// `{a:1,b:2}` and `{b:2,a:1}` produce identical bytes.
fn write_canonical(value: &Value, out: &mut String) -> Result<(), CoreError> {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => {
            let escaped = serde_json::to_string(s)?;
            out.push_str(&escaped);
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out)?;
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                let escaped = serde_json::to_string(key)?;
                out.push_str(&escaped);
                out.push(':');
                write_canonical(&map[*key], out)?;
            }
            out.push('}');
        }
    }
    Ok(())
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
