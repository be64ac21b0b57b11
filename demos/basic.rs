//! Basic example of using a revisioned cache on a single node.

use cortado::{
    CacheConfig, EntityId, EntityKind, FnLoader, InMemoryRevisionStore, LoadError, Loader,
    LocalBus, RevisionedCache,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter("cortado=debug,info")
        .init();

    // A pretend database
    let users: Arc<HashMap<EntityId, String>> = Arc::new(
        [(EntityId::of(EntityKind::User, 42), "Alice".to_string())]
            .into_iter()
            .collect(),
    );
    let loader: Arc<dyn Loader<String>> = Arc::new(FnLoader::new(move |id: EntityId| {
        let users = users.clone();
        async move {
            // Simulated query latency
            tokio::time::sleep(Duration::from_millis(20)).await;
            users.get(&id).cloned().ok_or(LoadError::NotFound)
        }
    }));

    let config = CacheConfig::new(1)
        .with_max_capacity(100_000)
        .with_default_ttl(Duration::from_secs(3600))
        .with_negative_ttl(Duration::from_secs(30));

    println!("Starting revisioned cache node 1...");
    let cache = RevisionedCache::new(
        config,
        loader,
        Arc::new(InMemoryRevisionStore::new()),
        Arc::new(LocalBus::default()),
    )
    .await?;
    println!("Cache started!");

    println!("\n--- Reads ---");
    let id = EntityId::of(EntityKind::User, 42);
    for _ in 0..3 {
        let read = cache.get_with_revision(&id).await?;
        if let Some(read) = read {
            println!(
                "Got {} = {} (revision {}, cached: {})",
                id, read.payload, read.revision, read.cached
            );
        }
    }

    let missing = EntityId::of(EntityKind::User, 7);
    println!("Got {} = {:?}", missing, cache.get(&missing).await?);
    println!("Got {} = {:?} (negative entry)", missing, cache.get(&missing).await?);

    println!("\n--- Derived artifacts ---");
    if let Some(greeting) = cache
        .extension(&id, "greeting", |name: &String| format!("Hello, {name}!"))
        .await?
    {
        println!("Extension 'greeting' = {greeting}");
    }

    println!("\n--- Invalidation ---");
    let revision = cache.invalidate_cluster(&id).await?;
    println!("Bumped {} to revision {}", id, revision);
    if let Some(read) = cache.get_with_revision(&id).await? {
        println!("Reloaded at revision {} (cached: {})", read.revision, read.cached);
    }

    // Show stats
    let stats = cache.stats();
    println!("\nCache stats:");
    println!("  Entry count: {}", stats.entry_count);
    println!("  Hits: {}", stats.hits);
    println!("  Misses: {}", stats.misses);
    println!("  Hit rate: {:.2}", stats.hit_rate());

    println!("\nMetrics:\n{}", cache.metrics().to_prometheus());

    // Shutdown
    println!("Shutting down...");
    cache.shutdown().await;

    Ok(())
}
