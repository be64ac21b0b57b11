//! Failure injection for invalidation delivery.
//!
//! The controller plugs into a transport as a [`DeliveryFilter`]: it drops
//! messages at random and blocks delivery across explicit partitions.

use crate::cluster::DeliveryFilter;
use crate::types::NodeId;
use parking_lot::RwLock;
use rand::Rng;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Configuration for chaos testing.
#[derive(Debug, Clone)]
pub struct ChaosConfig {
    /// Probability of dropping a delivered message (0.0 - 1.0).
    pub message_drop_probability: f64,

    /// Probability that a random partition starts on each `maybe_inject_chaos`.
    pub partition_probability: f64,

    /// Minimum partition duration.
    pub partition_min_duration: Duration,

    /// Maximum partition duration.
    pub partition_max_duration: Duration,
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            message_drop_probability: 0.0,
            partition_probability: 0.0,
            partition_min_duration: Duration::from_millis(100),
            partition_max_duration: Duration::from_secs(1),
        }
    }
}

impl ChaosConfig {
    /// Occasional loss.
    pub fn light() -> Self {
        Self {
            message_drop_probability: 0.01,
            partition_probability: 0.01,
            ..Default::default()
        }
    }

    /// Noticeable loss.
    pub fn moderate() -> Self {
        Self {
            message_drop_probability: 0.05,
            partition_probability: 0.05,
            ..Default::default()
        }
    }

    /// Heavy loss for stress tests.
    pub fn heavy() -> Self {
        Self {
            message_drop_probability: 0.2,
            partition_probability: 0.1,
            ..Default::default()
        }
    }

    /// Lose every message.
    pub fn blackout() -> Self {
        Self {
            message_drop_probability: 1.0,
            ..Default::default()
        }
    }

    /// No failures.
    pub fn none() -> Self {
        Self::default()
    }
}

/// A partition blocking delivery between two node sets.
#[derive(Debug, Clone)]
pub struct NetworkPartition {
    /// Nodes on one side.
    pub side_a: HashSet<NodeId>,

    /// Nodes on the other side.
    pub side_b: HashSet<NodeId>,

    /// When the partition heals.
    pub heals_at: Instant,
}

impl NetworkPartition {
    /// Whether this partition blocks `from -> to`.
    pub fn separates(&self, from: NodeId, to: NodeId) -> bool {
        (self.side_a.contains(&from) && self.side_b.contains(&to))
            || (self.side_b.contains(&from) && self.side_a.contains(&to))
    }

    /// Whether the partition has healed.
    pub fn is_healed(&self) -> bool {
        Instant::now() >= self.heals_at
    }
}

/// Chaos controller for injecting delivery failures.
#[derive(Debug)]
pub struct ChaosController {
    config: RwLock<ChaosConfig>,
    enabled: AtomicBool,
    partitions: RwLock<Vec<NetworkPartition>>,
    nodes: RwLock<HashSet<NodeId>>,
    messages_dropped: AtomicU64,
    messages_partitioned: AtomicU64,
    partitions_created: AtomicU64,
}

impl ChaosController {
    /// Create a disabled controller.
    pub fn new(config: ChaosConfig) -> Self {
        Self {
            config: RwLock::new(config),
            enabled: AtomicBool::new(false),
            partitions: RwLock::new(Vec::new()),
            nodes: RwLock::new(HashSet::new()),
            messages_dropped: AtomicU64::new(0),
            messages_partitioned: AtomicU64::new(0),
            partitions_created: AtomicU64::new(0),
        }
    }

    /// Create with default config.
    pub fn with_defaults() -> Self {
        Self::new(ChaosConfig::default())
    }

    /// Start injecting failures.
    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Relaxed);
    }

    /// Stop injecting failures.
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }

    /// Whether failures are being injected.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Replace the configuration.
    pub fn set_config(&self, config: ChaosConfig) {
        *self.config.write() = config;
    }

    /// Register a node for random partitions.
    pub fn register_node(&self, node_id: NodeId) {
        self.nodes.write().insert(node_id);
    }

    /// Roll the dice for dropping one message.
    pub fn should_drop_message(&self) -> bool {
        if !self.is_enabled() {
            return false;
        }

        let probability = self.config.read().message_drop_probability;
        if rand::rng().random::<f64>() < probability {
            self.messages_dropped.fetch_add(1, Ordering::Relaxed);
            return true;
        }
        false
    }

    /// Whether a partition blocks `from -> to`.
    pub fn is_partitioned(&self, from: NodeId, to: NodeId) -> bool {
        if !self.is_enabled() {
            return false;
        }

        let mut partitions = self.partitions.write();
        partitions.retain(|p| !p.is_healed());
        partitions.iter().any(|p| p.separates(from, to))
    }

    /// Block delivery between two sides for `duration`.
    pub fn create_partition(
        &self,
        side_a: HashSet<NodeId>,
        side_b: HashSet<NodeId>,
        duration: Duration,
    ) {
        self.partitions.write().push(NetworkPartition {
            side_a,
            side_b,
            heals_at: Instant::now() + duration,
        });
        self.partitions_created.fetch_add(1, Ordering::Relaxed);
    }

    /// Heal all partitions immediately.
    pub fn heal_all_partitions(&self) {
        self.partitions.write().clear();
    }

    /// Maybe split the registered nodes in two, per the configured probability.
    pub fn maybe_inject_chaos(&self) {
        if !self.is_enabled() {
            return;
        }

        let mut nodes: Vec<_> = self.nodes.read().iter().copied().collect();
        if nodes.len() < 2 {
            return;
        }
        nodes.sort_unstable();

        let config = self.config.read().clone();
        let mut rng = rand::rng();
        if rng.random::<f64>() < config.partition_probability {
            let mid = nodes.len() / 2;
            let side_a = nodes[..mid].iter().copied().collect();
            let side_b = nodes[mid..].iter().copied().collect();

            let min_ms = config.partition_min_duration.as_millis() as u64;
            let max_ms = config.partition_max_duration.as_millis().max(min_ms as u128) as u64;
            let duration = Duration::from_millis(rng.random_range(min_ms..=max_ms));

            self.create_partition(side_a, side_b, duration);
        }
    }

    /// Clear partitions and statistics.
    pub fn reset(&self) {
        self.heal_all_partitions();
        self.messages_dropped.store(0, Ordering::Relaxed);
        self.messages_partitioned.store(0, Ordering::Relaxed);
        self.partitions_created.store(0, Ordering::Relaxed);
    }

    /// Get chaos statistics.
    pub fn stats(&self) -> ChaosStats {
        ChaosStats {
            enabled: self.is_enabled(),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            messages_partitioned: self.messages_partitioned.load(Ordering::Relaxed),
            partitions_created: self.partitions_created.load(Ordering::Relaxed),
            active_partitions: self.partitions.read().len(),
        }
    }
}

impl Default for ChaosController {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl DeliveryFilter for ChaosController {
    fn should_deliver(&self, from: NodeId, to: NodeId) -> bool {
        if self.is_partitioned(from, to) {
            self.messages_partitioned.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        !self.should_drop_message()
    }
}

/// Chaos testing statistics.
#[derive(Debug, Clone)]
pub struct ChaosStats {
    /// Whether chaos is enabled.
    pub enabled: bool,
    /// Messages dropped at random.
    pub messages_dropped: u64,
    /// Messages blocked by a partition.
    pub messages_partitioned: u64,
    /// Partitions created so far.
    pub partitions_created: u64,
    /// Partitions not yet healed.
    pub active_partitions: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_controller_delivers() {
        let chaos = ChaosController::new(ChaosConfig::blackout());
        assert!(chaos.should_deliver(1, 2));

        chaos.enable();
        assert!(!chaos.should_deliver(1, 2));
        assert_eq!(chaos.stats().messages_dropped, 1);
    }

    #[test]
    fn test_partition_is_symmetric_and_heals() {
        let chaos = ChaosController::with_defaults();
        chaos.enable();

        chaos.create_partition([1].into(), [2, 3].into(), Duration::from_secs(60));
        assert!(!chaos.should_deliver(1, 2));
        assert!(!chaos.should_deliver(3, 1));
        assert!(chaos.should_deliver(2, 3));
        assert_eq!(chaos.stats().messages_partitioned, 2);

        chaos.heal_all_partitions();
        assert!(chaos.should_deliver(1, 2));
    }

    #[test]
    fn test_partition_expires() {
        let chaos = ChaosController::with_defaults();
        chaos.enable();

        chaos.create_partition([1].into(), [2].into(), Duration::from_millis(10));
        assert!(chaos.is_partitioned(1, 2));
        std::thread::sleep(Duration::from_millis(20));
        assert!(!chaos.is_partitioned(1, 2));
        assert_eq!(chaos.stats().active_partitions, 0);
    }

    #[test]
    fn test_random_partition_splits_registered_nodes() {
        let chaos = ChaosController::new(ChaosConfig {
            partition_probability: 1.0,
            ..Default::default()
        });
        for node in 1..=4 {
            chaos.register_node(node);
        }
        chaos.enable();

        chaos.maybe_inject_chaos();
        assert_eq!(chaos.stats().partitions_created, 1);
        assert!(chaos.is_partitioned(1, 3));
        assert!(!chaos.is_partitioned(1, 2));
    }
}
