//! Core types used throughout the cache.

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Node identifier in the cluster.
pub type NodeId = u64;

/// Per-entity version stamp. `0` means the entity was never written.
pub type Revision = u64;

/// Kinds of identity objects held in the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Realm,
    Client,
    User,
    Role,
    Session,
}

impl EntityKind {
    /// Prefix used when rendering typed ids.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Realm => "realm",
            EntityKind::Client => "client",
            EntityKind::User => "user",
            EntityKind::Role => "role",
            EntityKind::Session => "session",
        }
    }

    fn parse(prefix: &str) -> Option<Self> {
        match prefix {
            "realm" => Some(EntityKind::Realm),
            "client" => Some(EntityKind::Client),
            "user" => Some(EntityKind::User),
            "role" => Some(EntityKind::Role),
            "session" => Some(EntityKind::Session),
            _ => None,
        }
    }
}

/// Stable identity of a cached domain object.
///
/// Opaque to the cache; `EntityId::of` renders the `kind#key` convention used
/// by the identity model.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(SmolStr);

impl EntityId {
    /// Create an id from a raw string.
    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(SmolStr::new(raw))
    }

    /// Create a typed id, e.g. `user#42`.
    pub fn of(kind: EntityKind, key: impl fmt::Display) -> Self {
        Self(SmolStr::new(format!("{}#{}", kind.as_str(), key)))
    }

    /// Create a typed id with a random UUID key.
    pub fn generate(kind: EntityKind) -> Self {
        Self::of(kind, Uuid::new_v4())
    }

    /// The kind prefix, if the id follows the `kind#key` convention.
    pub fn kind(&self) -> Option<EntityKind> {
        self.0
            .split_once('#')
            .and_then(|(prefix, _)| EntityKind::parse(prefix))
    }

    /// Get the id as a string slice.
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for EntityId {
    fn from(s: String) -> Self {
        Self(SmolStr::from(s))
    }
}

impl AsRef<str> for EntityId {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

/// A payload together with the revision it was published at.
#[derive(Debug)]
pub struct Versioned<T> {
    /// Revision stamped on the payload.
    pub revision: Revision,
    /// The materialized domain object.
    pub payload: Arc<T>,
    /// Whether the read was served from the local cache.
    pub cached: bool,
}

impl<T> Clone for Versioned<T> {
    fn clone(&self) -> Self {
        Self {
            revision: self.revision,
            payload: Arc::clone(&self.payload),
            cached: self.cached,
        }
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    /// Number of entries in local cache (all generations, any init state).
    pub entry_count: u64,
    /// Number of negative (not found) entries.
    pub negative_count: u64,
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Entries evicted by capacity or expiry.
    pub evictions: u64,
}

impl CacheStats {
    /// Hit rate in `0.0..=1.0`.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_ids() {
        let id = EntityId::of(EntityKind::User, 42);
        assert_eq!(id.as_str(), "user#42");
        assert_eq!(id.kind(), Some(EntityKind::User));

        let generated = EntityId::generate(EntityKind::Session);
        assert_eq!(generated.kind(), Some(EntityKind::Session));
        assert_ne!(generated, EntityId::generate(EntityKind::Session));
    }

    #[test]
    fn test_untyped_id() {
        let id = EntityId::from("f81d4fae-7dec-11d0-a765-00a0c91e6bf6");
        assert_eq!(id.kind(), None);

        let id = EntityId::from("widget#1");
        assert_eq!(id.kind(), None);
    }

    #[test]
    fn test_hit_rate() {
        let stats = CacheStats {
            hits: 3,
            misses: 1,
            ..Default::default()
        };
        assert!((stats.hit_rate() - 0.75).abs() < 0.001);
        assert_eq!(CacheStats::default().hit_rate(), 0.0);
    }
}
