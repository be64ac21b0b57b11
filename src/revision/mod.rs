//! Authoritative per-entity revisions and this node's view of them.
//!
//! The [`RevisionStore`] is the cluster-visible substrate: every write to the
//! backing store bumps the entity's revision there. Each node reads it through
//! a [`RevisionTracker`], which keeps the highest revision it has seen per id
//! so a node never moves backwards, and can optionally serve that view for a
//! bounded window instead of asking the store on every read.

mod memory;

pub use memory::InMemoryRevisionStore;

use crate::error::Result;
use crate::types::{EntityId, Revision};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Cluster-wide atomic revision counters.
#[async_trait]
pub trait RevisionStore: Send + Sync + std::fmt::Debug {
    /// Latest revision of `id`, `0` if it was never written.
    async fn current(&self, id: &EntityId) -> Result<Revision>;

    /// Atomically increment the revision of `id` and return the new value.
    async fn bump(&self, id: &EntityId) -> Result<Revision>;

    /// Set the revision of `id` to `new` if it is currently `expected`.
    ///
    /// Fails if `new` does not move the revision forward.
    async fn compare_and_set(&self, id: &EntityId, expected: Revision, new: Revision)
        -> Result<bool>;
}

#[derive(Debug, Clone, Copy)]
struct Observed {
    revision: Revision,
    observed_at: Instant,
}

/// Per-node view of entity revisions.
#[derive(Debug)]
pub struct RevisionTracker {
    store: Arc<dyn RevisionStore>,
    observed: DashMap<EntityId, Observed>,
    staleness: Duration,
    max_tracked: usize,
}

impl RevisionTracker {
    /// Create a tracker over `store`.
    ///
    /// `staleness` is how long an observed revision is served without asking
    /// the store; zero always asks. At most `max_tracked` ids are remembered.
    pub fn new(store: Arc<dyn RevisionStore>, staleness: Duration, max_tracked: usize) -> Self {
        Self {
            store,
            observed: DashMap::new(),
            staleness,
            max_tracked: max_tracked.max(1),
        }
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<dyn RevisionStore> {
        &self.store
    }

    /// Latest known revision of `id`.
    ///
    /// Never lower than a revision this tracker already returned or observed.
    pub async fn current(&self, id: &EntityId) -> Result<Revision> {
        if !self.staleness.is_zero() {
            if let Some(seen) = self.observed.get(id) {
                if seen.observed_at.elapsed() < self.staleness {
                    return Ok(seen.revision);
                }
            }
        }

        let fetched = self.store.current(id).await?;
        Ok(self.record(id, fetched))
    }

    /// Bump the revision of `id` in the store after a write.
    pub async fn bump(&self, id: &EntityId) -> Result<Revision> {
        let revision = self.store.bump(id).await?;
        self.record(id, revision);
        debug!(%id, revision, "Bumped revision");
        Ok(revision)
    }

    /// Record a revision learned from a peer.
    ///
    /// Returns `false` if it is not newer than what is already known.
    pub fn observe(&self, id: &EntityId, revision: Revision) -> bool {
        if let Some(seen) = self.observed.get(id) {
            if revision <= seen.revision {
                return false;
            }
        }
        self.record(id, revision) == revision
    }

    /// Last revision seen for `id` without consulting the store.
    pub fn last_seen(&self, id: &EntityId) -> Option<Revision> {
        self.observed.get(id).map(|seen| seen.revision)
    }

    /// Drop the local view of `id`.
    pub fn forget(&self, id: &EntityId) {
        self.observed.remove(id);
    }

    /// Drop the whole local view.
    ///
    /// Always safe: the store never decrements, so the next read returns at
    /// least what was forgotten.
    pub fn clear(&self) {
        self.observed.clear();
    }

    /// Number of ids in the local view.
    pub fn tracked(&self) -> usize {
        self.observed.len()
    }

    fn record(&self, id: &EntityId, revision: Revision) -> Revision {
        if self.observed.len() >= self.max_tracked && !self.observed.contains_key(id) {
            debug!(tracked = self.observed.len(), "Revision view full, clearing");
            self.observed.clear();
        }

        let now = Instant::now();
        let mut slot = self.observed.entry(id.clone()).or_insert(Observed {
            revision,
            observed_at: now,
        });
        if revision >= slot.revision {
            slot.revision = revision;
            slot.observed_at = now;
        }
        slot.revision
    }
}
