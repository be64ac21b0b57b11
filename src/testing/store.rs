//! An in-memory backing store with failure injection.

use crate::loader::{LoadError, Loader};
use crate::types::EntityId;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::debug;

/// A [`Loader`] over a map, counting every fetch.
///
/// Fetches can be slowed down with [`set_delay`](Self::set_delay), made to
/// fail with [`fail_next`](Self::fail_next), or parked until
/// [`release`](Self::release) with [`hang_next`](Self::hang_next).
#[derive(Debug)]
pub struct BackingStore<T> {
    records: DashMap<EntityId, T>,
    fetches: AtomicU64,
    fetches_by_id: DashMap<EntityId, u64>,
    delay: RwLock<Duration>,
    fail_next: AtomicU64,
    hang_next: AtomicU64,
    gate: Semaphore,
}

impl<T: Clone + Send + Sync + 'static> BackingStore<T> {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            fetches: AtomicU64::new(0),
            fetches_by_id: DashMap::new(),
            delay: RwLock::new(Duration::ZERO),
            fail_next: AtomicU64::new(0),
            hang_next: AtomicU64::new(0),
            gate: Semaphore::new(0),
        }
    }

    /// Store `value` under `id`, replacing any previous one.
    pub fn insert(&self, id: EntityId, value: T) {
        self.records.insert(id, value);
    }

    /// Delete `id`. Returns whether it existed.
    pub fn remove(&self, id: &EntityId) -> bool {
        self.records.remove(id).is_some()
    }

    /// Read `id` without counting a fetch.
    pub fn peek(&self, id: &EntityId) -> Option<T> {
        self.records.get(id).map(|r| r.value().clone())
    }

    /// Sleep this long in every fetch.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.write() = delay;
    }

    /// Fail the next `count` fetches.
    pub fn fail_next(&self, count: u64) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Park the next `count` fetches until [`release`](Self::release).
    pub fn hang_next(&self, count: u64) {
        self.hang_next.store(count, Ordering::SeqCst);
    }

    /// Let every parked fetch continue. Later fetches are no longer parked.
    pub fn release(&self) {
        self.gate.close();
    }

    /// Total fetches.
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Fetches of one id.
    pub fn fetch_count_of(&self, id: &EntityId) -> u64 {
        self.fetches_by_id.get(id).map(|n| *n).unwrap_or(0)
    }

    fn take(counter: &AtomicU64) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl<T: Clone + Send + Sync + 'static> Default for BackingStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> Loader<T> for BackingStore<T> {
    async fn fetch(&self, id: &EntityId) -> Result<T, LoadError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        *self.fetches_by_id.entry(id.clone()).or_insert(0) += 1;

        if Self::take(&self.hang_next) {
            debug!(%id, "Fetch parked");
            // Closed once released; the permit itself is never granted.
            let _ = self.gate.acquire().await;
        }

        let delay = *self.delay.read();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if Self::take(&self.fail_next) {
            return Err(LoadError::failed("injected failure"));
        }

        self.peek(id).ok_or(LoadError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_fetch_counts_and_failures() {
        let store = BackingStore::new();
        let id = EntityId::from("user#1");
        store.insert(id.clone(), 7u32);

        store.fail_next(1);
        assert!(matches!(store.fetch(&id).await, Err(LoadError::Failed(_))));
        assert_eq!(store.fetch(&id).await, Ok(7));
        assert_eq!(
            store.fetch(&EntityId::from("user#2")).await,
            Err(LoadError::NotFound)
        );

        assert_eq!(store.fetch_count(), 3);
        assert_eq!(store.fetch_count_of(&id), 2);
    }

    #[tokio::test]
    async fn test_hang_until_release() {
        let store = Arc::new(BackingStore::new());
        let id = EntityId::from("user#1");
        store.insert(id.clone(), 1u32);
        store.hang_next(1);

        let parked = tokio::spawn({
            let store = store.clone();
            let id = id.clone();
            async move { store.fetch(&id).await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!parked.is_finished());

        store.release();
        assert_eq!(parked.await.unwrap(), Ok(1));
    }
}
