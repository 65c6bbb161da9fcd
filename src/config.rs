//! Cache configuration

use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Sizing and expiry of each region's in-process cache.
///
/// Zero values mean "no limit".
#[derive(Debug, Clone, Default)]
pub struct LocalStoreConfig {
    /// Initial number of slots reserved in the local cache
    pub initial_capacity: usize,
    /// Maximum number of entries in the local cache
    pub max_capacity: u64,
    /// Evict entries not read for this long
    pub expire_after_access: Duration,
    /// Evict entries this long after they were written
    pub expire_after_write: Duration,
    /// Accepted for compatibility; the local cache has no loader to refresh with
    pub refresh_after_write: Duration,
}

/// Configuration shared by every region of a registry
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Region names known up front
    pub cache_names: HashSet<String>,
    /// Create regions on demand for names outside `cache_names`
    pub dynamic: bool,
    /// Segment inserted between region name and key in shared-store keys
    pub cache_prefix: Option<String>,
    /// Allow JSON `null` to be cached instead of evicting the key
    pub cache_null_values: bool,
    /// Pub/sub topic carrying invalidation events
    pub topic: String,
    /// Shared-store TTL for regions without an override; zero disables expiry
    pub default_ttl: Duration,
    /// Per-region shared-store TTL, keyed by region name
    pub ttl_overrides: HashMap<String, Duration>,
    /// Lease of the distributed lock taken by `put_if_absent`
    pub lock_lease: Duration,
    /// How long `put_if_absent` waits for the distributed lock
    pub lock_acquire_timeout: Duration,
    pub local: LocalStoreConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_names: HashSet::new(),
            dynamic: true,
            cache_prefix: None,
            cache_null_values: true,
            topic: "cache:invalidate".to_owned(),
            default_ttl: Duration::ZERO,
            ttl_overrides: HashMap::new(),
            lock_lease: Duration::from_secs(30),
            lock_acquire_timeout: Duration::from_secs(10),
            local: LocalStoreConfig::default(),
        }
    }
}

impl CacheConfig {
    /// Shared-store TTL for a region, `None` meaning no expiry.
    pub fn ttl_for(&self, region: &str) -> Option<Duration> {
        let ttl = self
            .ttl_overrides
            .get(region)
            .copied()
            .unwrap_or(self.default_ttl);
        (!ttl.is_zero()).then_some(ttl)
    }

    /// Whether a region with this name may be created
    pub fn allows_region(&self, name: &str) -> bool {
        self.dynamic || self.cache_names.contains(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_resolution() {
        let mut config = CacheConfig::default();
        assert_eq!(config.ttl_for("orders"), None);

        config.default_ttl = Duration::from_secs(60);
        assert_eq!(config.ttl_for("orders"), Some(Duration::from_secs(60)));

        config
            .ttl_overrides
            .insert("orders".to_owned(), Duration::from_millis(1500));
        assert_eq!(config.ttl_for("orders"), Some(Duration::from_millis(1500)));
        assert_eq!(config.ttl_for("users"), Some(Duration::from_secs(60)));

        // An explicit zero override disables expiry for that region only
        config
            .ttl_overrides
            .insert("sessions".to_owned(), Duration::ZERO);
        assert_eq!(config.ttl_for("sessions"), None);
    }

    #[test]
    fn test_allows_region() {
        let mut config = CacheConfig {
            dynamic: false,
            ..CacheConfig::default()
        };
        config.cache_names.insert("orders".to_owned());

        assert!(config.allows_region("orders"));
        assert!(!config.allows_region("users"));

        config.dynamic = true;
        assert!(config.allows_region("users"));
    }
}
