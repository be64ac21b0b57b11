//! Revisioned, cluster-coherent cache.

pub mod storage;

use crate::cluster::{
    InvalidationBus, InvalidationEvent, InvalidationHandler, InvalidationListener,
    InvalidationMessage, LoggingInvalidationListener, Subscription,
};
use crate::config::CacheConfig;
use crate::entry::{CacheEntry, Extendable, InitGuard, InitState, Revisioned};
use crate::error::{Error, Result};
use crate::loader::{LoadError, Loader};
use crate::metrics::CacheMetrics;
use crate::revision::{RevisionStore, RevisionTracker};
use crate::types::{CacheStats, EntityId, NodeId, Revision, Versioned};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use storage::LocalCache;
use tracing::{debug, error, info, warn};

/// Upper bound on ids remembered by the revision view, relative to capacity.
const TRACKED_PER_ENTRY: u64 = 2;

/// What an initialized generation says about a read.
enum Lookup<T> {
    Hit(Versioned<T>),
    Absent,
    Stale,
}

/// The main cache instance of one node.
///
/// Reads are served from the local cache when the entry's revision is
/// current; otherwise exactly one caller per entry reloads it through the
/// [`Loader`] while the others wait a bounded time. Writes elsewhere in the
/// cluster reach this node through the [`InvalidationBus`] and, failing
/// that, through the revision check on the next read.
pub struct RevisionedCache<T> {
    /// Configuration.
    config: CacheConfig,

    /// Local entry generations.
    storage: Arc<LocalCache<T>>,

    /// This node's view of entity revisions.
    tracker: Arc<RevisionTracker>,

    /// Backing-store access.
    loader: Arc<dyn Loader<T>>,

    /// Cluster invalidation transport.
    bus: Arc<dyn InvalidationBus>,

    /// Read and invalidation metrics.
    metrics: Arc<CacheMetrics>,

    /// Delivery of peers' invalidations.
    subscription: Mutex<Option<Subscription>>,

    /// Set once `shutdown` has run.
    shut_down: AtomicBool,
}

impl<T: Send + Sync + 'static> RevisionedCache<T> {
    /// Create a cache node and subscribe it to the bus.
    ///
    /// Invalidation events are logged through [`LoggingInvalidationListener`].
    pub async fn new(
        config: CacheConfig,
        loader: Arc<dyn Loader<T>>,
        revision_store: Arc<dyn RevisionStore>,
        bus: Arc<dyn InvalidationBus>,
    ) -> Result<Self> {
        Self::with_listener(
            config,
            loader,
            revision_store,
            bus,
            Arc::new(LoggingInvalidationListener),
        )
        .await
    }

    /// Like [`new`](Self::new), reporting invalidation events to `listener`.
    pub async fn with_listener(
        config: CacheConfig,
        loader: Arc<dyn Loader<T>>,
        revision_store: Arc<dyn RevisionStore>,
        bus: Arc<dyn InvalidationBus>,
        listener: Arc<dyn InvalidationListener>,
    ) -> Result<Self> {
        config.validate()?;
        info!(node_id = config.node_id, "Starting revisioned cache");

        let storage = Arc::new(LocalCache::new(&config));
        let max_tracked: usize = config
            .max_capacity
            .saturating_mul(TRACKED_PER_ENTRY)
            .try_into()
            .unwrap_or(usize::MAX);
        let tracker = Arc::new(RevisionTracker::new(
            revision_store,
            config.revision_staleness,
            max_tracked,
        ));
        let metrics = Arc::new(CacheMetrics::new());

        let handler = Arc::new(CacheInvalidationHandler {
            node_id: config.node_id,
            storage: storage.clone(),
            tracker: tracker.clone(),
            metrics: metrics.clone(),
            listener,
        });
        let subscription = bus.subscribe(config.node_id, handler)?;

        info!(node_id = config.node_id, "Revisioned cache started");

        Ok(Self {
            config,
            storage,
            tracker,
            loader,
            bus,
            metrics,
            subscription: Mutex::new(Some(subscription)),
            shut_down: AtomicBool::new(false),
        })
    }

    // ==================== Read Operations ====================

    /// Get the current object for `id`.
    ///
    /// Returns `Ok(None)` if the loader reports the entity absent.
    pub async fn get(&self, id: &EntityId) -> Result<Option<Arc<T>>> {
        Ok(self.get_with_revision(id).await?.map(|v| v.payload))
    }

    /// Get the current object for `id` together with its revision.
    pub async fn get_with_revision(&self, id: &EntityId) -> Result<Option<Versioned<T>>> {
        self.ensure_running()?;
        self.metrics.gets.inc();

        let result = self.read(id).await;
        if let Err(e) = &result {
            self.metrics.record_error(e.kind());
        }
        result
    }

    async fn read(&self, id: &EntityId) -> Result<Option<Versioned<T>>> {
        for attempt in 1..=self.config.max_init_attempts {
            let current = self.tracker.current(id).await?;

            if let Some(absent_at) = self.storage.get_negative(id).await {
                if absent_at >= current {
                    self.metrics.negative_hits.inc();
                    return Ok(None);
                }
                self.storage.invalidate_negative(id).await;
            }

            let entry = self.storage.get_or_create(id).await;

            if entry.is_initialized() {
                match self.serve(id, &entry, current).await {
                    Lookup::Hit(hit) => return Ok(Some(hit)),
                    Lookup::Absent => return Ok(None),
                    Lookup::Stale => continue,
                }
            }

            if let Some(guard) = entry.try_lock() {
                self.metrics.misses.inc();
                return self.initialize(id, &entry, guard, current).await;
            }

            // Someone else is populating this generation.
            let wait_started = Instant::now();
            if entry.ensure_inited(self.config.init_timeout).await? {
                match self.serve(id, &entry, current).await {
                    Lookup::Hit(hit) => return Ok(Some(hit)),
                    Lookup::Absent => return Ok(None),
                    Lookup::Stale => continue,
                }
            }

            // A failed initializer resets the entry and wakes us early; only a
            // wait that ran out means the initializer is stuck.
            if wait_started.elapsed() >= self.config.init_timeout
                && entry.init().state()? == InitState::Initializing
            {
                self.metrics.wait_timeouts.inc();
                warn!(
                    %id,
                    timeout_ms = self.config.init_timeout.as_millis() as u64,
                    "Initializer did not finish in time, bypassing cache"
                );
                return self.bypass(id).await;
            }

            // The initializer failed and reset the entry; try again.
            debug!(%id, attempt, "Initialization failed elsewhere, retrying");
        }

        warn!(
            %id,
            attempts = self.config.max_init_attempts,
            "Init attempts exhausted, bypassing cache"
        );
        self.bypass(id).await
    }

    /// Answer from an initialized entry if it is not older than `current`,
    /// or end its generation.
    async fn serve(&self, id: &EntityId, entry: &Arc<CacheEntry<T>>, current: Revision) -> Lookup<T> {
        if let Some(revision) = entry.revision() {
            if revision >= current {
                return match entry.payload() {
                    Some(payload) => {
                        self.metrics.hits.inc();
                        Lookup::Hit(Versioned {
                            revision,
                            payload,
                            cached: true,
                        })
                    }
                    None => {
                        self.metrics.negative_hits.inc();
                        Lookup::Absent
                    }
                };
            }
            debug!(%id, cached = revision, current, "Stale entry, reloading");
        }

        self.metrics.stale_reloads.inc();
        self.storage.invalidate_generation(id, entry).await;
        Lookup::Stale
    }

    /// Populate `entry` while holding its init lock.
    ///
    /// The payload is stamped with `revision`, read before the load started,
    /// so a write racing with the load leaves the entry stale rather than
    /// falsely fresh.
    async fn initialize(
        &self,
        id: &EntityId,
        entry: &Arc<CacheEntry<T>>,
        guard: InitGuard<'_>,
        revision: Revision,
    ) -> Result<Option<Versioned<T>>> {
        self.metrics.loads.inc();
        let outcome = {
            let _in_flight = self.metrics.loads_in_flight.track();
            let timer = self.metrics.load_latency.start_timer();
            let outcome = self.loader.fetch(id).await;
            timer.observe();
            outcome
        };

        match outcome {
            Ok(payload) => {
                let payload = match entry.publish(revision, payload) {
                    Ok(payload) => payload,
                    Err(e) => {
                        abandon(id, guard);
                        return Err(e);
                    }
                };
                guard.complete(true)?;
                debug!(%id, revision, "Entry initialized");
                Ok(Some(Versioned {
                    revision,
                    payload,
                    cached: false,
                }))
            }
            Err(LoadError::NotFound) => {
                self.metrics.not_found.inc();
                // Waiters on this generation read the absence off the entry;
                // later reads go to the negative cache or load again.
                if let Err(e) = entry.publish_absent(revision) {
                    abandon(id, guard);
                    return Err(e);
                }
                guard.complete(true)?;
                self.storage.put_negative(id.clone(), revision).await;
                self.storage.invalidate_generation(id, entry).await;
                debug!(%id, revision, "Entity not found");
                Ok(None)
            }
            Err(LoadError::Failed(reason)) => {
                self.metrics.load_failures.inc();
                guard.complete(false)?;
                warn!(%id, %reason, "Loader failed, entry reset");
                Err(Error::InitializationFailure {
                    id: id.clone(),
                    reason,
                })
            }
        }
    }

    /// Load `id` directly, leaving the cache untouched.
    async fn bypass(&self, id: &EntityId) -> Result<Option<Versioned<T>>> {
        self.metrics.bypasses.inc();
        let revision = self.tracker.current(id).await?;

        match self.loader.fetch(id).await {
            Ok(payload) => Ok(Some(Versioned {
                revision,
                payload: Arc::new(payload),
                cached: false,
            })),
            Err(LoadError::NotFound) => Ok(None),
            Err(LoadError::Failed(reason)) => {
                self.metrics.load_failures.inc();
                Err(Error::InitializationFailure {
                    id: id.clone(),
                    reason,
                })
            }
        }
    }

    /// Get an artifact derived from the current object, cached with its entry.
    ///
    /// `compute` runs at most once per entry generation and key; the result
    /// is discarded with the generation. When the read is not served from a
    /// cached entry the artifact is computed but not cached.
    pub async fn extension<V, F>(&self, id: &EntityId, key: &str, compute: F) -> Result<Option<Arc<V>>>
    where
        V: Any + Send + Sync,
        F: FnOnce(&T) -> V,
    {
        let Some(read) = self.get_with_revision(id).await? else {
            return Ok(None);
        };

        if let Some(entry) = self.storage.get(id).await {
            let same_generation = entry
                .payload()
                .is_some_and(|payload| Arc::ptr_eq(&payload, &read.payload));
            if same_generation {
                let payload = &read.payload;
                return entry
                    .cached_with_or_insert(key, || compute(payload))
                    .map(Some);
            }
        }

        Ok(Some(Arc::new(compute(&read.payload))))
    }

    // ==================== Invalidation ====================

    /// Drop this node's copy of `id`. Peers are not told.
    pub async fn invalidate_local(&self, id: &EntityId) {
        self.metrics.invalidations_issued.inc();
        self.storage.invalidate(id).await;
        self.storage.invalidate_negative(id).await;
        debug!(%id, "Invalidated locally");
    }

    /// Record a write of `id`: bump its revision, drop the local copy and
    /// tell the peers. Returns the new revision.
    ///
    /// Call after the backing store has been written. A failed publish is
    /// logged and otherwise ignored; peers still catch up on their next read.
    pub async fn invalidate_cluster(&self, id: &EntityId) -> Result<Revision> {
        self.ensure_running()?;
        let revision = self.tracker.bump(id).await?;
        self.invalidate_local(id).await;
        self.publish(InvalidationMessage::changed(self.config.node_id, id.clone(), revision));
        Ok(revision)
    }

    /// Record a deletion of `id`: like [`invalidate_cluster`](Self::invalidate_cluster)
    /// but peers also remember the entity as absent when negative caching is
    /// enabled.
    pub async fn invalidate_deleted(&self, id: &EntityId) -> Result<Revision> {
        self.ensure_running()?;
        let revision = self.tracker.bump(id).await?;
        self.invalidate_local(id).await;
        self.storage.put_negative(id.clone(), revision).await;
        self.publish(InvalidationMessage::deleted(self.config.node_id, id.clone(), revision));
        Ok(revision)
    }

    fn publish(&self, message: InvalidationMessage) {
        if let Err(e) = self.bus.publish(&message) {
            self.metrics.record_error(e.kind());
            warn!(
                node_id = self.config.node_id,
                id = %message.id,
                revision = message.revision(),
                error = %e,
                "Failed to publish invalidation"
            );
        }
    }

    // ==================== Introspection ====================

    /// This node's id.
    pub fn node_id(&self) -> NodeId {
        self.config.node_id
    }

    /// The configuration in use.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// This node's revision view.
    pub fn tracker(&self) -> &RevisionTracker {
        &self.tracker
    }

    /// The local entry storage.
    pub fn storage(&self) -> &LocalCache<T> {
        &self.storage
    }

    /// Read and invalidation metrics.
    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    /// Get cache statistics.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entry_count: self.storage.entry_count(),
            negative_count: self.storage.negative_count(),
            hits: self.metrics.hits.get(),
            misses: self.metrics.misses.get(),
            evictions: self.storage.evictions(),
        }
    }

    /// Run pending cache maintenance tasks.
    pub async fn run_pending_tasks(&self) {
        self.storage.run_pending_tasks().await;
    }

    // ==================== Lifecycle ====================

    /// Stop receiving invalidations and drop all local state.
    ///
    /// Later reads and writes fail with [`Error::Shutdown`].
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(node_id = self.config.node_id, "Shutting down revisioned cache");

        let subscription = self.subscription.lock().take();
        if let Some(subscription) = subscription {
            subscription.unsubscribe().await;
        }

        self.storage.invalidate_all();
        self.tracker.clear();
    }

    /// Whether `shutdown` has run.
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_shut_down() {
            Err(Error::Shutdown)
        } else {
            Ok(())
        }
    }
}

/// Release an init lock after a defect that already fails the read.
fn abandon(id: &EntityId, guard: InitGuard<'_>) {
    if let Err(e) = guard.complete(false) {
        error!(%id, error = %e, "Failed to release init lock");
    }
}

impl<T> std::fmt::Debug for RevisionedCache<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RevisionedCache")
            .field("node_id", &self.config.node_id)
            .field("storage", &self.storage)
            .field("shut_down", &self.shut_down.load(Ordering::Relaxed))
            .finish()
    }
}

/// Applies peers' invalidations to one node.
///
/// Every step is monotone, so duplicates and reordering are harmless: the
/// revision view only moves forward, and an entry is dropped only if it is
/// published below the message revision.
struct CacheInvalidationHandler<T> {
    node_id: NodeId,
    storage: Arc<LocalCache<T>>,
    tracker: Arc<RevisionTracker>,
    metrics: Arc<CacheMetrics>,
    listener: Arc<dyn InvalidationListener>,
}

#[async_trait]
impl<T: Send + Sync + 'static> InvalidationHandler for CacheInvalidationHandler<T> {
    async fn on_invalidation(&self, message: InvalidationMessage) {
        let id = &message.id;
        let revision = message.revision();
        let known = self.tracker.last_seen(id);

        let newer = self.tracker.observe(id, revision);
        let evicted = self.storage.invalidate_if_older(id, revision).await;

        let event = if message.is_tombstone() && self.storage.negatives_enabled() && newer {
            self.storage.put_negative(id.clone(), revision).await;
            InvalidationEvent::Tombstoned {
                node_id: self.node_id,
                id: id.clone(),
                revision,
            }
        } else if newer || evicted {
            if newer && !message.is_tombstone() {
                self.storage.invalidate_negative(id).await;
            }
            InvalidationEvent::Applied {
                node_id: self.node_id,
                id: id.clone(),
                revision,
                evicted,
            }
        } else {
            InvalidationEvent::Ignored {
                node_id: self.node_id,
                id: id.clone(),
                revision,
                known,
            }
        };

        if event.is_effective() {
            self.metrics.invalidations_applied.inc();
        } else {
            self.metrics.invalidations_ignored.inc();
        }
        self.listener.on_event(event);
    }

    async fn on_lagged(&self, missed: u64) {
        // Anything could have changed in the frames we lost.
        self.storage.invalidate_all();
        self.tracker.clear();
        self.metrics.resyncs.inc();
        self.listener.on_event(InvalidationEvent::Resynced {
            node_id: self.node_id,
            missed,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::LocalBus;
    use crate::loader::FnLoader;
    use crate::revision::InMemoryRevisionStore;
    use std::sync::atomic::AtomicU64;
    use std::time::Duration;

    struct Fixture {
        cache: RevisionedCache<String>,
        store: Arc<InMemoryRevisionStore>,
        fetches: Arc<AtomicU64>,
    }

    async fn fixture(config: CacheConfig) -> Fixture {
        let fetches = Arc::new(AtomicU64::new(0));
        let counter = fetches.clone();
        let loader = FnLoader::new(move |id: EntityId| {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                match id.as_str() {
                    "user#missing" => Err(LoadError::NotFound),
                    "user#broken" => Err(LoadError::failed("db down")),
                    _ => Ok(format!("{id} v{n}")),
                }
            }
        });
        let loader: Arc<dyn Loader<String>> = Arc::new(loader);
        let store = Arc::new(InMemoryRevisionStore::new());
        let bus = Arc::new(LocalBus::new(64));
        let cache = RevisionedCache::new(config, loader, store.clone(), bus)
            .await
            .unwrap();
        Fixture {
            cache,
            store,
            fetches,
        }
    }

    #[tokio::test]
    async fn test_miss_then_hit() {
        let f = fixture(CacheConfig::new(1)).await;
        let id = EntityId::from("user#1");

        let first = f.cache.get_with_revision(&id).await.unwrap().unwrap();
        assert!(!first.cached);
        assert_eq!(first.revision, 0);

        let second = f.cache.get_with_revision(&id).await.unwrap().unwrap();
        assert!(second.cached);
        assert!(Arc::ptr_eq(&first.payload, &second.payload));
        assert_eq!(f.fetches.load(Ordering::SeqCst), 1);

        let stats = f.cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn test_invalidate_cluster_bumps_and_reloads() {
        let f = fixture(CacheConfig::new(1)).await;
        let id = EntityId::from("user#1");

        f.cache.get(&id).await.unwrap();
        assert_eq!(f.cache.invalidate_cluster(&id).await.unwrap(), 1);
        assert_eq!(f.store.current(&id).await.unwrap(), 1);

        let read = f.cache.get_with_revision(&id).await.unwrap().unwrap();
        assert_eq!(read.revision, 1);
        assert_eq!(read.payload.as_str(), "user#1 v2");
    }

    #[tokio::test]
    async fn test_not_found_is_none() {
        let f = fixture(CacheConfig::new(1)).await;
        let id = EntityId::from("user#missing");

        assert!(f.cache.get(&id).await.unwrap().is_none());
        assert!(f.cache.get(&id).await.unwrap().is_none());
        // Not cached without a negative TTL.
        assert_eq!(f.fetches.load(Ordering::SeqCst), 2);
        assert_eq!(f.cache.metrics().not_found.get(), 2);
    }

    #[tokio::test]
    async fn test_negative_entry_until_recreated() {
        let config = CacheConfig::new(1).with_negative_ttl(Duration::from_secs(60));
        let f = fixture(config).await;
        let id = EntityId::from("user#missing");

        assert!(f.cache.get(&id).await.unwrap().is_none());
        assert!(f.cache.get(&id).await.unwrap().is_none());
        assert_eq!(f.fetches.load(Ordering::SeqCst), 1);
        assert_eq!(f.cache.metrics().negative_hits.get(), 1);

        // A write elsewhere moves the revision past the negative entry.
        f.store.bump(&id).await.unwrap();
        assert!(f.cache.get(&id).await.unwrap().is_none());
        assert_eq!(f.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_loader_failure_surfaces_and_resets() {
        let f = fixture(CacheConfig::new(1)).await;
        let id = EntityId::from("user#broken");

        let err = f.cache.get(&id).await.unwrap_err();
        assert!(matches!(err, Error::InitializationFailure { .. }));
        assert_eq!(f.cache.metrics().errors.get("initialization_failure"), 1);

        let entry = f.cache.storage().get(&id).await.unwrap();
        assert_eq!(entry.init().state().unwrap(), InitState::Uninitialized);
    }

    #[tokio::test]
    async fn test_extension_shares_generation() {
        let f = fixture(CacheConfig::new(1)).await;
        let id = EntityId::from("user#1");

        let mut computed = 0;
        let len = f
            .cache
            .extension(&id, "len", |name: &String| {
                computed += 1;
                name.len()
            })
            .await
            .unwrap()
            .unwrap();
        let again = f
            .cache
            .extension(&id, "len", |_: &String| 0usize)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*len, "user#1 v1".len());
        assert_eq!(*again, *len);
        assert_eq!(computed, 1);

        // A new generation recomputes.
        f.cache.invalidate_cluster(&id).await.unwrap();
        let fresh = f
            .cache
            .extension(&id, "len", |_: &String| 0usize)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*fresh, 0);

        let missing = f
            .cache
            .extension(&EntityId::from("user#missing"), "len", |_: &String| 1usize)
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_rejects_calls() {
        let f = fixture(CacheConfig::new(1)).await;
        let id = EntityId::from("user#1");

        f.cache.get(&id).await.unwrap();
        f.cache.shutdown().await;
        f.cache.shutdown().await;

        assert!(f.cache.is_shut_down());
        assert!(matches!(f.cache.get(&id).await, Err(Error::Shutdown)));
        assert!(matches!(
            f.cache.invalidate_cluster(&id).await,
            Err(Error::Shutdown)
        ));
    }

    #[test]
    fn test_abandon_after_defect_keeps_state() {
        let id = EntityId::from("user#1");
        let entry: CacheEntry<String> = CacheEntry::new(id.clone());
        let guard = entry.try_lock().unwrap();

        // Someone released the lock behind the guard's back.
        entry.unlock_init(true).unwrap();
        abandon(&id, guard);
        assert!(entry.is_initialized());
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let loader: Arc<dyn Loader<u32>> =
            Arc::new(FnLoader::new(|_id: EntityId| async { Ok::<_, LoadError>(0u32) }));
        let result = RevisionedCache::new(
            CacheConfig::new(1).with_max_init_attempts(0),
            loader,
            Arc::new(InMemoryRevisionStore::new()),
            Arc::new(LocalBus::new(8)),
        )
        .await;
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
