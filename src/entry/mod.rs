//! Cache entries: one generation of one cached domain object.
//!
//! An entry is created lazily on first access in the `Uninitialized` state,
//! populated once by whichever caller wins [`InitCoordinator::lock_for_init`],
//! and readable only after it reaches `Initialized`. A logical update never
//! mutates a published entry; it ends the generation and a fresh entry object
//! takes its place.

mod init;

pub use init::{InitCoordinator, InitGuard, InitState};

use crate::error::{Error, Result};
use crate::types::{EntityId, Revision};
use dashmap::DashMap;
use std::any::Any;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

/// Something stamped with an identity and a revision.
pub trait Revisioned {
    /// Stable identity of the cached object.
    fn id(&self) -> &EntityId;

    /// Published revision, `None` until initialized.
    fn revision(&self) -> Option<Revision>;

    /// Whether the entry is older than `current`.
    ///
    /// An unpublished entry is never fresh.
    fn is_stale(&self, current: Revision) -> bool {
        self.revision().map_or(true, |revision| revision < current)
    }
}

/// Side table of artifacts derived from the entry and sharing its lifecycle.
pub trait Extendable {
    /// Look up a cached artifact by key.
    ///
    /// Returns `None` if absent or stored with a different type.
    fn cached_with<V: Any + Send + Sync>(&self, key: &str) -> Option<Arc<V>>;

    /// Store an artifact, replacing any previous value for the key.
    fn cache_with<V: Any + Send + Sync>(&self, key: &str, value: V) -> Result<Arc<V>>;

    /// Return the cached artifact for `key`, computing it first if absent.
    ///
    /// `compute` runs under the side table's shard lock and must not touch
    /// the same entry's extensions.
    fn cached_with_or_insert<V, F>(&self, key: &str, compute: F) -> Result<Arc<V>>
    where
        V: Any + Send + Sync,
        F: FnOnce() -> V;
}

struct Published<T> {
    revision: Revision,
    /// `None` when the loader reported the entity absent.
    payload: Option<Arc<T>>,
}

type Extension = Arc<dyn Any + Send + Sync>;

/// One generation of a cached domain object.
pub struct CacheEntry<T> {
    id: EntityId,
    published: OnceLock<Published<T>>,
    extensions: DashMap<String, Extension>,
    init: InitCoordinator,
    created_at: Instant,
}

impl<T> CacheEntry<T> {
    /// Create an `Uninitialized` entry.
    pub fn new(id: EntityId) -> Self {
        Self {
            id,
            published: OnceLock::new(),
            extensions: DashMap::new(),
            init: InitCoordinator::new(),
            created_at: Instant::now(),
        }
    }

    /// Init state machine of this generation.
    pub fn init(&self) -> &InitCoordinator {
        &self.init
    }

    /// Shorthand for `init().lock_for_init()`.
    pub fn lock_for_init(&self) -> bool {
        self.init.lock_for_init()
    }

    /// Shorthand for `init().try_lock()`.
    pub fn try_lock(&self) -> Option<InitGuard<'_>> {
        self.init.try_lock()
    }

    /// Shorthand for `init().unlock_init(success)`.
    pub fn unlock_init(&self, success: bool) -> Result<()> {
        self.init.unlock_init(success)
    }

    /// Shorthand for `init().ensure_inited(timeout)`.
    pub async fn ensure_inited(&self, timeout: Duration) -> Result<bool> {
        self.init.ensure_inited(timeout).await
    }

    /// Whether the entry is readable.
    pub fn is_initialized(&self) -> bool {
        self.init.is_initialized()
    }

    /// Write the payload and its revision.
    ///
    /// Only the init lock holder may call this, once per generation, before
    /// `unlock_init(true)`.
    pub fn publish(&self, revision: Revision, payload: T) -> Result<Arc<T>> {
        let payload = Arc::new(payload);
        self.set_published(revision, Some(Arc::clone(&payload)))?;
        Ok(payload)
    }

    /// Record that the entity did not exist at `revision`.
    ///
    /// Same contract as [`publish`](Self::publish). Callers that were waiting
    /// on this generation then read the absence instead of loading again.
    pub fn publish_absent(&self, revision: Revision) -> Result<()> {
        self.set_published(revision, None)
    }

    fn set_published(&self, revision: Revision, payload: Option<Arc<T>>) -> Result<()> {
        let state = self.init.state()?;
        if state != InitState::Initializing {
            return Err(Error::InvalidCacheState(format!(
                "publish on {} while {state:?}",
                self.id
            )));
        }

        self.published
            .set(Published { revision, payload })
            .map_err(|_| {
                Error::InvalidCacheState(format!("{} published twice in one generation", self.id))
            })
    }

    /// The payload, only once initialized and present.
    pub fn payload(&self) -> Option<Arc<T>> {
        if !self.is_initialized() {
            return None;
        }
        self.published.get().and_then(|p| p.payload.clone())
    }

    /// Whether this generation records the entity as absent.
    pub fn is_absent(&self) -> bool {
        self.is_initialized() && self.published.get().is_some_and(|p| p.payload.is_none())
    }

    /// Age of this generation.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Number of cached artifacts.
    pub fn extension_count(&self) -> usize {
        self.extensions.len()
    }

    fn require_initialized(&self) -> Result<()> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(Error::InvalidCacheState(format!(
                "extension on {} before initialization",
                self.id
            )))
        }
    }
}

impl<T> Revisioned for CacheEntry<T> {
    fn id(&self) -> &EntityId {
        &self.id
    }

    fn revision(&self) -> Option<Revision> {
        if !self.is_initialized() {
            return None;
        }
        self.published.get().map(|p| p.revision)
    }
}

impl<T> Extendable for CacheEntry<T> {
    fn cached_with<V: Any + Send + Sync>(&self, key: &str) -> Option<Arc<V>> {
        let value = Arc::clone(self.extensions.get(key)?.value());
        value.downcast::<V>().ok()
    }

    fn cache_with<V: Any + Send + Sync>(&self, key: &str, value: V) -> Result<Arc<V>> {
        self.require_initialized()?;
        let value = Arc::new(value);
        self.extensions
            .insert(key.to_string(), Arc::clone(&value) as Extension);
        Ok(value)
    }

    fn cached_with_or_insert<V, F>(&self, key: &str, compute: F) -> Result<Arc<V>>
    where
        V: Any + Send + Sync,
        F: FnOnce() -> V,
    {
        self.require_initialized()?;
        let value = Arc::clone(
            self.extensions
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(compute()) as Extension)
                .value(),
        );
        value.downcast::<V>().map_err(|_| {
            Error::InvalidCacheState(format!(
                "extension {key} on {} holds a different type",
                self.id
            ))
        })
    }
}

impl<T> std::fmt::Debug for CacheEntry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry")
            .field("id", &self.id)
            .field("revision", &self.revision())
            .field("state", &self.init.state().ok())
            .field("extensions", &self.extensions.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn published_entry(revision: Revision, payload: &str) -> CacheEntry<String> {
        let entry = CacheEntry::new(EntityId::from("user#1"));
        assert!(entry.lock_for_init());
        entry.publish(revision, payload.to_string()).unwrap();
        entry.unlock_init(true).unwrap();
        entry
    }

    #[test]
    fn test_payload_hidden_until_initialized() {
        let entry = CacheEntry::new(EntityId::from("user#1"));
        assert!(entry.payload().is_none());
        assert!(entry.revision().is_none());

        assert!(entry.lock_for_init());
        entry.publish(3, "alice".to_string()).unwrap();

        // Published but not yet unlocked.
        assert!(entry.payload().is_none());
        assert!(entry.revision().is_none());

        entry.unlock_init(true).unwrap();
        assert_eq!(entry.payload().as_deref(), Some(&"alice".to_string()));
        assert_eq!(entry.revision(), Some(3));
    }

    #[test]
    fn test_publish_requires_init_lock() {
        let entry: CacheEntry<String> = CacheEntry::new(EntityId::from("user#1"));
        assert!(entry.publish(1, "x".into()).unwrap_err().is_defect());

        let entry = published_entry(1, "x");
        assert!(entry.publish(2, "y".into()).unwrap_err().is_defect());
    }

    #[test]
    fn test_staleness() {
        let entry = published_entry(3, "alice");
        assert!(!entry.is_stale(3));
        assert!(!entry.is_stale(2));
        assert!(entry.is_stale(4));

        let unpublished: CacheEntry<String> = CacheEntry::new(EntityId::from("user#1"));
        assert!(unpublished.is_stale(0));
    }

    #[test]
    fn test_extensions() {
        let entry = published_entry(1, "alice");

        assert!(entry.cached_with::<Vec<String>>("roles").is_none());
        entry
            .cache_with("roles", vec!["admin".to_string()])
            .unwrap();
        assert_eq!(
            entry.cached_with::<Vec<String>>("roles").unwrap().as_slice(),
            ["admin".to_string()]
        );

        // Wrong type reads as absent.
        assert!(entry.cached_with::<u32>("roles").is_none());

        let mut calls = 0;
        let first = entry
            .cached_with_or_insert("count", || {
                calls += 1;
                7u32
            })
            .unwrap();
        let second = entry.cached_with_or_insert("count", || 99u32).unwrap();
        assert_eq!(*first, 7);
        assert_eq!(*second, 7);
        assert_eq!(calls, 1);
        assert_eq!(entry.extension_count(), 2);

        assert!(entry
            .cached_with_or_insert("count", || "wrong".to_string())
            .unwrap_err()
            .is_defect());
    }

    #[test]
    fn test_absent_generation() {
        let entry: CacheEntry<String> = CacheEntry::new(EntityId::from("user#ghost"));
        assert!(entry.lock_for_init());
        entry.publish_absent(4).unwrap();
        assert!(!entry.is_absent());

        entry.unlock_init(true).unwrap();
        assert!(entry.is_absent());
        assert!(entry.payload().is_none());
        assert_eq!(entry.revision(), Some(4));
        assert!(entry.is_stale(5));

        // One outcome per generation.
        assert!(entry.publish_absent(4).unwrap_err().is_defect());
        assert!(!published_entry(1, "alice").is_absent());
    }

    #[test]
    fn test_extensions_require_initialized_entry() {
        let entry: CacheEntry<String> = CacheEntry::new(EntityId::from("user#1"));
        assert!(entry.cache_with("roles", 1u8).unwrap_err().is_defect());
    }
}
