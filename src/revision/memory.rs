//! In-process revision substrate shared by every node of a test cluster.

use super::RevisionStore;
use crate::error::{Error, Result};
use crate::types::{EntityId, Revision};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic per-id counters held in memory.
///
/// Stands in for a consistent counter or CAS register in an external store.
/// Share one instance (behind an `Arc`) between all nodes of a cluster.
#[derive(Debug, Default)]
pub struct InMemoryRevisionStore {
    revisions: DashMap<EntityId, Revision>,
    reads: AtomicU64,
}

impl InMemoryRevisionStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `current` calls served, for observing tracker caching.
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Number of ids ever written.
    pub fn len(&self) -> usize {
        self.revisions.len()
    }

    /// Whether no id was ever written.
    pub fn is_empty(&self) -> bool {
        self.revisions.is_empty()
    }
}

#[async_trait]
impl RevisionStore for InMemoryRevisionStore {
    async fn current(&self, id: &EntityId) -> Result<Revision> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(self.revisions.get(id).map(|r| *r).unwrap_or(0))
    }

    async fn bump(&self, id: &EntityId) -> Result<Revision> {
        let mut slot = self.revisions.entry(id.clone()).or_insert(0);
        *slot += 1;
        Ok(*slot)
    }

    async fn compare_and_set(
        &self,
        id: &EntityId,
        expected: Revision,
        new: Revision,
    ) -> Result<bool> {
        if new <= expected {
            return Err(Error::Revision(format!(
                "revision of {id} cannot move from {expected} to {new}"
            )));
        }

        let mut slot = self.revisions.entry(id.clone()).or_insert(0);
        if *slot != expected {
            return Ok(false);
        }
        *slot = new;
        Ok(true)
    }
}
