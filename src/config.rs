//! Configuration types for the revisioned cache.

use crate::error::{Error, Result};
use crate::types::NodeId;
use std::time::Duration;

/// Main configuration for a cache node.
///
/// Built once at process start and handed to [`crate::RevisionedCache::new`].
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Unique identifier for this node.
    pub node_id: NodeId,

    /// Maximum number of entries in the local cache.
    pub max_capacity: u64,

    /// Default time-to-live for cache entries.
    pub default_ttl: Option<Duration>,

    /// Default time-to-idle for cache entries.
    pub default_tti: Option<Duration>,

    /// How long a non-winning reader waits for an entry being initialized.
    pub init_timeout: Duration,

    /// How many times one `get` may try to populate or wait on an entry
    /// before falling back to an uncached load.
    pub max_init_attempts: usize,

    /// Lifetime of negative (not found) results. `None` leaves them uncached.
    pub negative_ttl: Option<Duration>,

    /// How long a locally observed revision may be trusted before the
    /// revision store is consulted again. Zero always consults the store.
    pub revision_staleness: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            max_capacity: 100_000,
            default_ttl: Some(Duration::from_secs(3600)), // 1 hour
            default_tti: None,
            init_timeout: Duration::from_millis(500),
            max_init_attempts: 3,
            negative_ttl: None,
            revision_staleness: Duration::ZERO,
        }
    }
}

impl CacheConfig {
    /// Create a new configuration for the given node.
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            ..Default::default()
        }
    }

    /// Set maximum cache capacity.
    pub fn with_max_capacity(mut self, capacity: u64) -> Self {
        self.max_capacity = capacity;
        self
    }

    /// Set default TTL for cache entries.
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = Some(ttl);
        self
    }

    /// Disable TTL-based expiry.
    pub fn without_ttl(mut self) -> Self {
        self.default_ttl = None;
        self
    }

    /// Set default TTI for cache entries.
    pub fn with_default_tti(mut self, tti: Duration) -> Self {
        self.default_tti = Some(tti);
        self
    }

    /// Set the wait bound for readers blocked on an initializing entry.
    pub fn with_init_timeout(mut self, timeout: Duration) -> Self {
        self.init_timeout = timeout;
        self
    }

    /// Set the per-call attempt bound.
    pub fn with_max_init_attempts(mut self, attempts: usize) -> Self {
        self.max_init_attempts = attempts;
        self
    }

    /// Cache not-found results for the given duration.
    pub fn with_negative_ttl(mut self, ttl: Duration) -> Self {
        self.negative_ttl = Some(ttl);
        self
    }

    /// Allow serving locally observed revisions for up to `window`.
    pub fn with_revision_staleness(mut self, window: Duration) -> Self {
        self.revision_staleness = window;
        self
    }

    /// Check the configuration for values the cache cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_capacity == 0 {
            return Err(Error::Config("max_capacity must be positive".into()));
        }
        if self.init_timeout.is_zero() {
            return Err(Error::Config("init_timeout must be positive".into()));
        }
        if self.max_init_attempts == 0 {
            return Err(Error::Config("max_init_attempts must be at least 1".into()));
        }
        if matches!(self.negative_ttl, Some(ttl) if ttl.is_zero()) {
            return Err(Error::Config(
                "negative_ttl must be positive; use None to disable".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CacheConfig::default();
        assert_eq!(config.node_id, 1);
        assert_eq!(config.max_capacity, 100_000);
        assert_eq!(config.init_timeout, Duration::from_millis(500));
        assert!(config.negative_ttl.is_none());
        assert!(config.revision_staleness.is_zero());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = CacheConfig::new(42)
            .with_max_capacity(1_000)
            .with_init_timeout(Duration::from_millis(100))
            .with_negative_ttl(Duration::from_secs(5))
            .without_ttl();

        assert_eq!(config.node_id, 42);
        assert_eq!(config.max_capacity, 1_000);
        assert_eq!(config.init_timeout, Duration::from_millis(100));
        assert_eq!(config.negative_ttl, Some(Duration::from_secs(5)));
        assert!(config.default_ttl.is_none());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(CacheConfig::new(1).with_max_capacity(0).validate().is_err());
        assert!(CacheConfig::new(1)
            .with_init_timeout(Duration::ZERO)
            .validate()
            .is_err());
        assert!(CacheConfig::new(1)
            .with_max_init_attempts(0)
            .validate()
            .is_err());
        assert!(CacheConfig::new(1)
            .with_negative_ttl(Duration::ZERO)
            .validate()
            .is_err());
    }
}
