//! Revision-checked, cluster-coherent read-through cache.
//!
//! This crate provides an embedded cache for domain objects loaded from a
//! persistent store, shared by several nodes. It uses:
//! - **Moka** for local storage with TTL, idle expiry and TinyLFU eviction
//! - **Revision numbers** per entity to detect stale entries on read
//! - **An invalidation bus** so peers evict their copies right after a write
//!
//! # Features
//!
//! - Single-flight population: one loader call per cold entry, however many readers
//! - Bounded waits: readers never block longer than the init timeout
//! - Recoverable failures: a failed load resets the entry for the next reader
//! - Idempotent, order-insensitive invalidation handling
//! - Optional negative caching and delete tombstones
//! - Derived artifacts cached alongside each entry generation
//!
//! # Example
//!
//! ```rust,no_run
//! use cortado::{
//!     CacheConfig, EntityId, FnLoader, InMemoryRevisionStore, LoadError, LocalBus, Loader,
//!     RevisionedCache,
//! };
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = CacheConfig::new(1)
//!         .with_max_capacity(100_000)
//!         .with_init_timeout(Duration::from_millis(200));
//!
//!     let loader: Arc<dyn Loader<String>> = Arc::new(FnLoader::new(|id: EntityId| async move {
//!         match id.as_str() {
//!             "user#42" => Ok("Alice".to_string()),
//!             _ => Err(LoadError::NotFound),
//!         }
//!     }));
//!
//!     let cache = RevisionedCache::new(
//!         config,
//!         loader,
//!         Arc::new(InMemoryRevisionStore::new()),
//!         Arc::new(LocalBus::default()),
//!     )
//!     .await?;
//!
//!     // First read loads, later reads are served locally
//!     let id = EntityId::from("user#42");
//!     if let Some(user) = cache.get(&id).await? {
//!         println!("Found: {user}");
//!     }
//!
//!     // After writing the backing store, invalidate everywhere
//!     cache.invalidate_cluster(&id).await?;
//!
//!     cache.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │            Application Layer                │
//! └─────────────────────────────────────────────┘
//!                     │
//!                     ▼
//! ┌─────────────────────────────────────────────┐
//! │          RevisionedCache API                │
//! │  • get(id) -> Option<Arc<T>>                │
//! │  • invalidate_cluster(id) -> Revision       │
//! │  • extension(id, key, compute)              │
//! └─────────────────────────────────────────────┘
//!                     │
//!     ┌───────────────┼───────────────┬───────────────┐
//!     ▼               ▼               ▼               ▼
//! ┌─────────┐   ┌──────────┐   ┌────────────┐   ┌─────────┐
//! │  Moka   │   │ Revision │   │Invalidation│   │ Loader  │
//! │ entries │   │ tracker  │   │    bus     │   │ (store) │
//! └─────────┘   └──────────┘   └────────────┘   └─────────┘
//! ```
//!
//! # Consistency Model
//!
//! - **Writes**: the writer updates the backing store, then bumps the
//!   entity's revision and publishes an invalidation
//! - **Reads**: served locally only if the entry's revision is at least the
//!   current one, so a read issued after a bump never sees older data
//! - **Delivery**: best-effort; lost messages are caught by the revision check

pub mod cache;
pub mod cluster;
pub mod config;
pub mod entry;
pub mod error;
pub mod loader;
pub mod metrics;
pub mod revision;
pub mod testing;
pub mod types;

// Re-export main types
pub use cache::storage::LocalCache;
pub use cache::RevisionedCache;
pub use config::CacheConfig;
pub use entry::{CacheEntry, Extendable, InitCoordinator, InitGuard, InitState, Revisioned};
pub use error::{BusError, Error, Result};
pub use loader::{FnLoader, LoadError, Loader};
pub use revision::{InMemoryRevisionStore, RevisionStore, RevisionTracker};
pub use types::{CacheStats, EntityId, EntityKind, NodeId, Revision, Versioned};

// Re-export cluster types
pub use cluster::{
    DeliveryFilter, InvalidationBus, InvalidationEvent, InvalidationHandler, InvalidationKind,
    InvalidationListener, InvalidationMessage, LocalBus, LoggingInvalidationListener,
    NoopInvalidationListener, Subscription,
};

// Re-export metrics types
pub use metrics::{CacheMetrics, Counter, Gauge, Histogram, LabeledCounter, MetricsSnapshot};

// Re-export testing types
pub use testing::{BackingStore, ChaosConfig, ChaosController, ChaosStats, TestCluster};
