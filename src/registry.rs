//! Region registry
//!
//! Owns every [`CacheRegion`] of a process, creating them on first use and
//! routing inbound invalidation events to them.

use std::collections::BTreeSet;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::listener::{InvalidationListener, ListenerHandle};
use crate::{
    CacheConfig, CacheError, CacheRegion, InvalidationEvent, MokaLocalStore, RedisInvalidationBus,
    RedisMutex, RedisSharedStore, SharedBackends,
};

/// Lazily created, process-wide table of regions
pub struct RegionRegistry {
    config: Arc<CacheConfig>,
    node_id: String,
    backends: SharedBackends,
    regions: DashMap<String, Arc<CacheRegion>>,
}

impl RegionRegistry {
    /// Create a registry over already connected backends.
    ///
    /// Each registry gets a fresh node id stamped on the events it publishes.
    pub fn new(config: CacheConfig, backends: SharedBackends) -> Self {
        Self {
            config: Arc::new(config),
            node_id: uuid::Uuid::new_v4().to_string(),
            backends,
            regions: DashMap::new(),
        }
    }

    /// Create a registry backed by Redis for the shared store, bus and lock
    pub async fn connect(
        redis_client: redis::Client,
        config: CacheConfig,
    ) -> Result<Arc<Self>, CacheError> {
        let redis_manager = redis::aio::ConnectionManager::new(redis_client.clone()).await?;
        let backends = SharedBackends::new(
            Arc::new(RedisSharedStore::new(redis_manager.clone())),
            Arc::new(RedisInvalidationBus::new(
                redis_client,
                redis_manager.clone(),
                config.topic.clone(),
            )),
            Arc::new(RedisMutex::new(redis_manager, config.lock_acquire_timeout)),
        );
        Ok(Arc::new(Self::new(config, backends)))
    }

    /// Subscribe this registry to the invalidation bus
    pub async fn start_listener(self: &Arc<Self>) -> Result<ListenerHandle, CacheError> {
        InvalidationListener::new(Arc::clone(self), Arc::clone(&self.backends.bus))
            .start()
            .await
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Get the region called `name`, creating it on first access.
    ///
    /// Returns `None` for names outside the allow-list when dynamic creation is off,
    /// and for names that are empty or contain `:`. The region name is the first
    /// segment of every shared-store key, so a `:` inside it would let one region's
    /// keys overlap another's.
    pub fn region(&self, name: &str) -> Option<Arc<CacheRegion>> {
        if let Some(region) = self.regions.get(name) {
            return Some(Arc::clone(region.value()));
        }
        if name.is_empty() || name.contains(':') {
            warn!("Rejecting invalid cache region name '{}'", name);
            return None;
        }
        if !self.config.allows_region(name) {
            debug!("Region {} is not configured and dynamic creation is off", name);
            return None;
        }

        let region = self
            .regions
            .entry(name.to_owned())
            .or_insert_with(|| {
                debug!("Creating cache region {}", name);
                Arc::new(self.build_region(name))
            })
            .value()
            .clone();
        Some(region)
    }

    /// Configured region names plus any created dynamically, sorted
    pub fn region_names(&self) -> Vec<String> {
        let mut names: BTreeSet<String> = self.config.cache_names.iter().cloned().collect();
        names.extend(self.regions.iter().map(|r| r.key().clone()));
        names.into_iter().collect()
    }

    /// Apply an invalidation event to the local store of the named region.
    ///
    /// Regions this node has never used hold nothing to invalidate.
    pub async fn route_invalidation(&self, event: &InvalidationEvent) {
        let Some(region) = self.regions.get(&event.region).map(|r| Arc::clone(r.value())) else {
            debug!("Invalidation for untracked region {} ignored", event.region);
            return;
        };
        region.clear_local(event.key.as_deref()).await;
    }

    fn build_region(&self, name: &str) -> CacheRegion {
        CacheRegion::new(
            name,
            self.node_id.clone(),
            Arc::clone(&self.config),
            Arc::new(MokaLocalStore::new(&self.config.local)),
            self.backends.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryBus, MemoryMutex, MemorySharedStore};
    use serde_json::json;

    fn registry(config: CacheConfig) -> RegionRegistry {
        RegionRegistry::new(
            config,
            SharedBackends::new(
                Arc::new(MemorySharedStore::new()),
                Arc::new(MemoryBus::new()),
                Arc::new(MemoryMutex::default()),
            ),
        )
    }

    #[test]
    fn test_region_is_created_once() {
        let registry = registry(CacheConfig::default());
        let a = registry.region("orders").unwrap();
        let b = registry.region("orders").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.name(), "orders");
    }

    #[test]
    fn test_concurrent_creation_yields_one_region() {
        let registry = Arc::new(registry(CacheConfig::default()));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || registry.region("orders").unwrap())
            })
            .collect();
        let regions: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(regions.iter().all(|r| Arc::ptr_eq(r, &regions[0])));
    }

    #[test]
    fn test_static_allow_list() {
        let mut config = CacheConfig {
            dynamic: false,
            ..CacheConfig::default()
        };
        config.cache_names.insert("orders".to_owned());
        let registry = registry(config);

        assert!(registry.region("orders").is_some());
        assert!(registry.region("users").is_none());
        assert_eq!(registry.region_names(), vec!["orders".to_owned()]);
    }

    #[test]
    fn test_region_names_include_dynamic() {
        let mut config = CacheConfig::default();
        config.cache_names.insert("users".to_owned());
        let registry = registry(config);
        registry.region("orders");
        assert_eq!(
            registry.region_names(),
            vec!["orders".to_owned(), "users".to_owned()]
        );
    }

    #[tokio::test]
    async fn test_region_names_cannot_overlap() {
        let registry = registry(CacheConfig::default());
        assert!(registry.region("orders:archive").is_none());
        assert!(registry.region("").is_none());

        // "orders" key "archive:1" stays inside the orders namespace only
        let orders = registry.region("orders").unwrap();
        let archive = registry.region("archive").unwrap();
        archive.put("1", json!("keep me")).await.unwrap();
        orders.put("archive:1", json!("x")).await.unwrap();
        assert_ne!(orders.composite_key("archive:1"), archive.composite_key("1"));

        orders.clear().await.unwrap();
        archive.clear_local(None).await;
        assert_eq!(
            archive.lookup("1").await.unwrap().as_deref(),
            Some(&json!("keep me"))
        );
        assert_eq!(
            registry.region_names(),
            vec!["archive".to_owned(), "orders".to_owned()]
        );
    }

    #[test]
    fn test_node_ids_are_unique() {
        assert_ne!(
            registry(CacheConfig::default()).node_id(),
            registry(CacheConfig::default()).node_id()
        );
    }

    #[tokio::test]
    async fn test_route_invalidation() {
        let registry = registry(CacheConfig::default());
        let orders = registry.region("orders").unwrap();
        orders.put("1", json!(1)).await.unwrap();
        orders.put("2", json!(2)).await.unwrap();

        registry
            .route_invalidation(&InvalidationEvent::key("orders", "1"))
            .await;
        assert!(orders.local_store().get("1").await.is_none());
        assert!(orders.local_store().get("2").await.is_some());

        registry
            .route_invalidation(&InvalidationEvent::clear_all("orders"))
            .await;
        assert!(orders.local_store().get("2").await.is_none());

        // Untracked region: nothing happens, nothing is created
        registry
            .route_invalidation(&InvalidationEvent::key("users", "1"))
            .await;
        assert_eq!(registry.region_names(), vec!["orders".to_owned()]);
    }
}
