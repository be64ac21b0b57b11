//! Testing utilities for revisioned caches.
//!
//! This module provides tools for testing multi-node behavior in one process:
//! - A backing store with failure injection
//! - Chaos testing for invalidation delivery
//! - A test cluster wiring several nodes to one bus and revision store
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          TestCluster                            │
//! │                                                                 │
//! │   ┌──────────┐      ┌──────────┐      ┌──────────┐              │
//! │   │  node 1  │      │  node 2  │      │  node 3  │              │
//! │   └────┬─────┘      └────┬─────┘      └────┬─────┘              │
//! │        │ fetch           │                 │                    │
//! │        ▼                 ▼                 ▼                    │
//! │   ┌───────────────────────────────────────────────────────────┐ │
//! │   │ BackingStore (delays, injected failures, parked fetches)  │ │
//! │   └───────────────────────────────────────────────────────────┘ │
//! │   ┌───────────────────────────────────────────────────────────┐ │
//! │   │ InMemoryRevisionStore (shared revisions)                  │ │
//! │   └───────────────────────────────────────────────────────────┘ │
//! │   ┌───────────────────────────────────────────────────────────┐ │
//! │   │ LocalBus ──filter──▶ ChaosController (drops, partitions)  │ │
//! │   └───────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use cortado::testing::TestCluster;
//! use cortado::EntityId;
//!
//! let cluster = TestCluster::<String>::new(2).await?;
//! let id = EntityId::from("user#42");
//!
//! cluster.write(1, id.clone(), "alice".to_string()).await?;
//! cluster.settle().await;
//! assert_eq!(cluster.node(2).unwrap().get(&id).await?.as_deref(), Some(&"alice".to_string()));
//! ```
//!
//! # Chaos Testing Presets
//!
//! - `ChaosConfig::none()` - No failures (default)
//! - `ChaosConfig::light()` - Low probability of failures
//! - `ChaosConfig::moderate()` - Medium failure rates
//! - `ChaosConfig::heavy()` - High failure rates for stress testing
//! - `ChaosConfig::blackout()` - Every message lost

mod chaos;
mod store;

#[cfg(test)]
mod utils;


pub use chaos::{ChaosConfig, ChaosController, ChaosStats, NetworkPartition};
pub use store::BackingStore;

use crate::cache::RevisionedCache;
use crate::cluster::{InvalidationEvent, InvalidationListener, LocalBus};
use crate::config::CacheConfig;
use crate::error::{Error, Result};
use crate::loader::Loader;
use crate::revision::{InMemoryRevisionStore, RevisionStore};
use crate::types::{EntityId, NodeId, Revision};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How long [`TestCluster::settle`] waits for in-flight deliveries.
const SETTLE_TIME: Duration = Duration::from_millis(50);

/// Listener that keeps every event for later inspection.
#[derive(Debug, Default)]
pub struct RecordingListener {
    events: Mutex<Vec<InvalidationEvent>>,
}

impl RecordingListener {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// All events so far, in arrival order.
    pub fn events(&self) -> Vec<InvalidationEvent> {
        self.events.lock().clone()
    }

    /// Events handled by `node_id`.
    pub fn events_of(&self, node_id: NodeId) -> Vec<InvalidationEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.node_id() == node_id)
            .cloned()
            .collect()
    }

    /// Forget all events.
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl InvalidationListener for RecordingListener {
    fn on_event(&self, event: InvalidationEvent) {
        self.events.lock().push(event);
    }
}

/// A test cluster for integration testing.
///
/// Nodes are numbered from 1 and share one backing store, one revision store
/// and one bus whose deliveries pass through the chaos controller.
pub struct TestCluster<T> {
    /// Nodes in the cluster.
    nodes: Vec<Arc<RevisionedCache<T>>>,

    /// Shared backing store.
    pub store: Arc<BackingStore<T>>,

    /// Shared revision store.
    pub revisions: Arc<InMemoryRevisionStore>,

    /// Shared invalidation bus.
    pub bus: Arc<LocalBus>,

    /// Chaos controller for failure injection.
    pub chaos: Arc<ChaosController>,

    /// Every invalidation event of every node.
    pub events: Arc<RecordingListener>,

    /// When the test started.
    pub started_at: Instant,
}

impl<T: Clone + Send + Sync + 'static> TestCluster<T> {
    /// Create a cluster of `node_count` nodes with default configuration.
    pub async fn new(node_count: usize) -> Result<Self> {
        Self::with_config(node_count, CacheConfig::new).await
    }

    /// Create a cluster, configuring each node with `config`.
    pub async fn with_config<F>(node_count: usize, config: F) -> Result<Self>
    where
        F: Fn(NodeId) -> CacheConfig,
    {
        Self::with_bus_capacity(node_count, LocalBus::DEFAULT_CAPACITY, config).await
    }

    /// Like [`with_config`](Self::with_config), buffering `bus_capacity`
    /// frames per subscriber on the shared bus.
    pub async fn with_bus_capacity<F>(node_count: usize, bus_capacity: usize, config: F) -> Result<Self>
    where
        F: Fn(NodeId) -> CacheConfig,
    {
        let store = Arc::new(BackingStore::new());
        let revisions = Arc::new(InMemoryRevisionStore::new());
        let bus = Arc::new(LocalBus::new(bus_capacity));
        let chaos = Arc::new(ChaosController::with_defaults());
        let events = Arc::new(RecordingListener::new());
        bus.set_filter(chaos.clone());

        let mut nodes = Vec::with_capacity(node_count);
        for node_id in 1..=node_count as NodeId {
            chaos.register_node(node_id);
            let loader: Arc<dyn Loader<T>> = store.clone();
            let revision_store: Arc<dyn RevisionStore> = revisions.clone();
            let node = RevisionedCache::with_listener(
                config(node_id),
                loader,
                revision_store,
                bus.clone(),
                events.clone(),
            )
            .await?;
            nodes.push(Arc::new(node));
        }

        Ok(Self {
            nodes,
            store,
            revisions,
            bus,
            chaos,
            events,
            started_at: Instant::now(),
        })
    }

    /// Get a node by id.
    pub fn node(&self, node_id: NodeId) -> Option<&Arc<RevisionedCache<T>>> {
        self.nodes.iter().find(|n| n.node_id() == node_id)
    }

    /// All nodes.
    pub fn nodes(&self) -> &[Arc<RevisionedCache<T>>] {
        &self.nodes
    }

    /// All node ids.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|n| n.node_id()).collect()
    }

    /// Write `value` to the backing store and invalidate through `writer`.
    pub async fn write(&self, writer: NodeId, id: EntityId, value: T) -> Result<Revision> {
        let node = self.require(writer)?;
        self.store.insert(id.clone(), value);
        node.invalidate_cluster(&id).await
    }

    /// Delete `id` from the backing store and publish a tombstone through `writer`.
    pub async fn delete(&self, writer: NodeId, id: &EntityId) -> Result<Revision> {
        let node = self.require(writer)?;
        self.store.remove(id);
        node.invalidate_deleted(id).await
    }

    fn require(&self, node_id: NodeId) -> Result<&Arc<RevisionedCache<T>>> {
        self.node(node_id)
            .ok_or_else(|| Error::Config(format!("no node {node_id} in test cluster")))
    }

    /// Enable chaos testing.
    pub fn enable_chaos(&self) {
        self.chaos.enable();
    }

    /// Disable chaos testing.
    pub fn disable_chaos(&self) {
        self.chaos.disable();
    }

    /// Cut `node_id` off from every other node's invalidations, both ways.
    ///
    /// Enables chaos if it was off.
    pub fn isolate_node(&self, node_id: NodeId, duration: Duration) {
        let isolated: HashSet<_> = [node_id].into_iter().collect();
        let others: HashSet<_> = self
            .node_ids()
            .into_iter()
            .filter(|&n| n != node_id)
            .collect();
        self.chaos.enable();
        self.chaos.create_partition(isolated, others, duration);
    }

    /// Heal all partitions.
    pub fn heal_partitions(&self) {
        self.chaos.heal_all_partitions();
    }

    /// Give in-flight deliveries time to be handled.
    pub async fn settle(&self) {
        tokio::time::sleep(SETTLE_TIME).await;
    }

    /// Get elapsed time since the cluster started.
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Get chaos statistics.
    pub fn chaos_stats(&self) -> ChaosStats {
        self.chaos.stats()
    }

    /// Shut every node down and close the bus.
    pub async fn shutdown(&self) {
        for node in &self.nodes {
            node.shutdown().await;
        }
        self.bus.close();
    }
}
