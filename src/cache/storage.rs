//! Moka-backed local storage of entry generations.

use crate::config::CacheConfig;
use crate::entry::{CacheEntry, Revisioned};
use crate::types::{EntityId, Revision};
use moka::future::Cache;
use moka::notification::RemovalCause;
use moka::ops::compute::{CompResult, Op};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Node-local map from entity id to its current entry generation.
///
/// Holds entries in any init state; the caller does the revision check
/// before trusting a payload. Capacity and expiry evictions are equivalent to
/// [`invalidate`](Self::invalidate).
pub struct LocalCache<T> {
    /// Current generation per id.
    entries: Cache<EntityId, Arc<CacheEntry<T>>>,

    /// Revision at which each id was found absent, when enabled.
    negatives: Option<Cache<EntityId, Revision>>,

    /// Entries dropped by capacity or expiry.
    evictions: Arc<AtomicU64>,
}

impl<T: Send + Sync + 'static> LocalCache<T> {
    /// Create storage sized and timed by `config`.
    pub fn new(config: &CacheConfig) -> Self {
        let evictions = Arc::new(AtomicU64::new(0));
        let counter = evictions.clone();

        let mut builder = Cache::builder()
            .max_capacity(config.max_capacity)
            .eviction_listener(
                move |id: Arc<EntityId>, _entry: Arc<CacheEntry<T>>, cause: RemovalCause| {
                    if cause.was_evicted() {
                        counter.fetch_add(1, Ordering::Relaxed);
                        debug!(id = %id, ?cause, "Entry evicted");
                    }
                },
            );

        // Set TTL if configured
        if let Some(ttl) = config.default_ttl {
            builder = builder.time_to_live(ttl);
        }

        // Set TTI if configured
        if let Some(tti) = config.default_tti {
            builder = builder.time_to_idle(tti);
        }

        let negatives = config.negative_ttl.map(|ttl| {
            Cache::builder()
                .max_capacity(config.max_capacity)
                .time_to_live(ttl)
                .build()
        });

        Self {
            entries: builder.build(),
            negatives,
            evictions,
        }
    }

    /// The installed generation for `id`, in whatever state it is.
    pub async fn get(&self, id: &EntityId) -> Option<Arc<CacheEntry<T>>> {
        self.entries.get(id).await
    }

    /// The installed generation for `id`, creating an `Uninitialized` one if
    /// there is none.
    ///
    /// Concurrent callers for the same id receive the same object.
    pub async fn get_or_create(&self, id: &EntityId) -> Arc<CacheEntry<T>> {
        let entry = self
            .entries
            .entry_by_ref(id)
            .or_insert_with(async { Arc::new(CacheEntry::new(id.clone())) })
            .await;
        if entry.is_fresh() {
            debug!(%id, "Created entry generation");
        }
        entry.into_value()
    }

    /// Install `entry`, replacing any prior generation.
    pub async fn put(&self, id: EntityId, entry: Arc<CacheEntry<T>>) {
        self.entries.insert(id, entry).await;
    }

    /// Remove whatever generation is installed for `id`.
    pub async fn invalidate(&self, id: &EntityId) {
        self.entries.invalidate(id).await;
    }

    /// Remove the installed generation only if it is `entry`.
    ///
    /// A reader that found `entry` stale must not evict a newer generation
    /// that another reader installed meanwhile.
    pub async fn invalidate_generation(&self, id: &EntityId, entry: &Arc<CacheEntry<T>>) -> bool {
        let target = Arc::clone(entry);
        let result = self
            .entries
            .entry_by_ref(id)
            .and_compute_with(|current| {
                let op = match current {
                    Some(current) if Arc::ptr_eq(current.value(), &target) => Op::Remove,
                    _ => Op::Nop,
                };
                std::future::ready(op)
            })
            .await;
        matches!(result, CompResult::Removed(_))
    }

    /// Remove the installed generation if it is published below `revision`.
    ///
    /// Entries at or above `revision`, and entries still being populated, are
    /// left alone.
    pub async fn invalidate_if_older(&self, id: &EntityId, revision: Revision) -> bool {
        let result = self
            .entries
            .entry_by_ref(id)
            .and_compute_with(|current| {
                let op = match current {
                    Some(current)
                        if current.value().revision().is_some_and(|r| r < revision) =>
                    {
                        Op::Remove
                    }
                    _ => Op::Nop,
                };
                std::future::ready(op)
            })
            .await;
        matches!(result, CompResult::Removed(_))
    }

    /// Drop every entry and negative result.
    pub fn invalidate_all(&self) {
        self.entries.invalidate_all();
        if let Some(negatives) = &self.negatives {
            negatives.invalidate_all();
        }
    }

    /// Whether not-found results are cached.
    pub fn negatives_enabled(&self) -> bool {
        self.negatives.is_some()
    }

    /// Revision at which `id` was last found absent.
    pub async fn get_negative(&self, id: &EntityId) -> Option<Revision> {
        match &self.negatives {
            Some(negatives) => negatives.get(id).await,
            None => None,
        }
    }

    /// Record that `id` was absent at `revision`. Keeps the higher revision
    /// if one is already recorded.
    pub async fn put_negative(&self, id: EntityId, revision: Revision) {
        let Some(negatives) = &self.negatives else {
            return;
        };
        negatives
            .entry(id)
            .and_compute_with(|current| {
                let op = match current {
                    Some(current) if *current.value() >= revision => Op::Nop,
                    _ => Op::Put(revision),
                };
                std::future::ready(op)
            })
            .await;
    }

    /// Forget a negative result.
    pub async fn invalidate_negative(&self, id: &EntityId) {
        if let Some(negatives) = &self.negatives {
            negatives.invalidate(id).await;
        }
    }

    /// Number of entry generations held.
    pub fn entry_count(&self) -> u64 {
        self.entries.entry_count()
    }

    /// Number of negative results held.
    pub fn negative_count(&self) -> u64 {
        self.negatives
            .as_ref()
            .map_or(0, |negatives| negatives.entry_count())
    }

    /// Entries dropped by capacity or expiry so far.
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Run pending maintenance tasks (expiry, eviction, counts).
    pub async fn run_pending_tasks(&self) {
        self.entries.run_pending_tasks().await;
        if let Some(negatives) = &self.negatives {
            negatives.run_pending_tasks().await;
        }
    }
}

impl<T> std::fmt::Debug for LocalCache<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCache")
            .field("entry_count", &self.entries.entry_count())
            .field("negatives", &self.negatives.is_some())
            .field("evictions", &self.evictions.load(Ordering::Relaxed))
            .finish()
    }
}
