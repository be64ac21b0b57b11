//! Example of two cache nodes sharing one database.
//!
//! Both nodes live in this process and talk over a [`LocalBus`]. Run with:
//!   RUST_LOG=info cargo run --example cluster

use cortado::{
    CacheConfig, EntityId, EntityKind, FnLoader, InMemoryRevisionStore, InvalidationBus,
    LoadError, Loader, LocalBus, RevisionStore, RevisionedCache,
};
use dashmap::DashMap;
use std::env;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(env::var("RUST_LOG").unwrap_or_else(|_| "cortado=info".to_string()))
        .init();

    // Shared by every node: the database, the revisions and the bus
    let database: Arc<DashMap<EntityId, String>> = Arc::new(DashMap::new());
    let revisions: Arc<dyn RevisionStore> = Arc::new(InMemoryRevisionStore::new());
    let bus: Arc<dyn InvalidationBus> = Arc::new(LocalBus::default());

    let loader: Arc<dyn Loader<String>> = Arc::new(FnLoader::new({
        let database = database.clone();
        move |id: EntityId| {
            let database = database.clone();
            async move {
                database
                    .get(&id)
                    .map(|row| row.value().clone())
                    .ok_or(LoadError::NotFound)
            }
        }
    }));

    let mut nodes = Vec::new();
    for node_id in [1, 2] {
        let config = CacheConfig::new(node_id)
            .with_max_capacity(100_000)
            .with_default_ttl(Duration::from_secs(3600));
        let node =
            RevisionedCache::new(config, loader.clone(), revisions.clone(), bus.clone()).await?;
        println!("Started node {}", node_id);
        nodes.push(node);
    }
    let (a, b) = (&nodes[0], &nodes[1]);

    let id = EntityId::of(EntityKind::User, 42);
    database.insert(id.clone(), "Alice".to_string());
    a.invalidate_cluster(&id).await?;

    if let Some(read) = b.get_with_revision(&id).await? {
        println!("Node 2 read {} = {} at revision {}", id, read.payload, read.revision);
    }

    // Write through node 1; node 2 drops its copy when the message arrives
    database.insert(id.clone(), "Alice Liddell".to_string());
    let revision = a.invalidate_cluster(&id).await?;
    println!("Node 1 wrote {} at revision {}", id, revision);

    tokio::time::sleep(Duration::from_millis(50)).await;
    println!(
        "Node 2 still holds a copy: {}",
        b.storage().get(&id).await.is_some()
    );

    if let Some(read) = b.get_with_revision(&id).await? {
        println!("Node 2 read {} = {} at revision {}", id, read.payload, read.revision);
    }

    for node in &nodes {
        let snapshot = node.metrics().snapshot();
        println!(
            "Node {}: hits={} misses={} invalidations applied={} ignored={}",
            node.node_id(),
            snapshot.hits,
            snapshot.misses,
            snapshot.invalidations_applied,
            snapshot.invalidations_ignored
        );
    }

    // Shutdown
    println!("\nShutting down...");
    for node in &nodes {
        node.shutdown().await;
    }

    Ok(())
}
