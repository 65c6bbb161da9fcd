//! Two-tier cache region
//!
//! A region pairs a private in-process store (L1) with the shared store (L2)
//! and keeps the L1 copies of other nodes honest by broadcasting an
//! invalidation event on every mutation.
//!
//! Mutations always touch the shared store first, then publish, then update
//! the local store. Other nodes are therefore never told to drop a key while
//! the shared store still holds the value being replaced.

use std::future::Future;
use std::sync::Arc;

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use tracing::{debug, warn};

use crate::key_lock::KeyLocks;
use crate::{
    CacheConfig, CacheError, DistributedMutex, InvalidationBus, InvalidationEvent, LocalStore,
    SharedStore,
};

/// Connections shared by every region of a process
#[derive(Clone)]
pub struct SharedBackends {
    pub shared: Arc<dyn SharedStore>,
    pub bus: Arc<dyn InvalidationBus>,
    pub mutex: Arc<dyn DistributedMutex>,
}

impl SharedBackends {
    pub fn new(
        shared: Arc<dyn SharedStore>,
        bus: Arc<dyn InvalidationBus>,
        mutex: Arc<dyn DistributedMutex>,
    ) -> Self {
        Self { shared, bus, mutex }
    }
}

/// One named two-tier cache
pub struct CacheRegion {
    name: String,
    node_id: String,
    config: Arc<CacheConfig>,
    local: Arc<dyn LocalStore>,
    backends: SharedBackends,
    load_locks: KeyLocks,
}

impl CacheRegion {
    pub fn new(
        name: impl Into<String>,
        node_id: impl Into<String>,
        config: Arc<CacheConfig>,
        local: Arc<dyn LocalStore>,
        backends: SharedBackends,
    ) -> Self {
        Self {
            name: name.into(),
            node_id: node_id.into(),
            config,
            local,
            backends,
            load_locks: KeyLocks::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The region's in-process store
    pub fn local_store(&self) -> &Arc<dyn LocalStore> {
        &self.local
    }

    /// Shared-store key: `name:prefix:key`, or `name:key` without a prefix
    pub fn composite_key(&self, key: &str) -> String {
        match self.config.cache_prefix.as_deref() {
            Some(prefix) if !prefix.trim().is_empty() => {
                format!("{}:{}:{}", self.name, prefix, key)
            }
            _ => format!("{}:{}", self.name, key),
        }
    }

    /// Get a value, trying the local store before the shared store.
    ///
    /// A shared-store hit is copied into the local store. A shared-store value
    /// that is not valid JSON is deleted and reported as a miss.
    pub async fn lookup(&self, key: &str) -> Result<Option<Arc<Value>>, CacheError> {
        if let Some(value) = self.local.get(key).await {
            debug!("Cache hit L1 for key: {}:{}", self.name, key);
            return Ok(Some(value));
        }

        let cache_key = self.composite_key(key);
        let Some(json) = self.backends.shared.get(&cache_key).await? else {
            debug!("Cache miss for key: {}", cache_key);
            return Ok(None);
        };

        match serde_json::from_str::<Value>(&json) {
            Ok(value) => {
                debug!("Cache hit L2 for key: {}", cache_key);
                let value = Arc::new(value);
                self.local.put(key, Arc::clone(&value)).await;
                Ok(Some(value))
            }
            Err(e) => {
                warn!(
                    "Failed to deserialize cached value for key {}: {}. Deleting corrupt entry.",
                    cache_key, e
                );
                if let Err(del_err) = self.backends.shared.delete(&cache_key).await {
                    warn!(
                        "Failed to delete corrupt L2 entry {}: {}",
                        cache_key, del_err
                    );
                }
                Ok(None)
            }
        }
    }

    /// Typed [`lookup`](Self::lookup)
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
        match self.lookup(key).await? {
            Some(value) => Ok(Some(T::deserialize(&*value)?)),
            None => Ok(None),
        }
    }

    /// Get a value, computing and storing it on a miss.
    ///
    /// Concurrent misses for the same key within this process are serialized,
    /// so `loader` runs once and the other callers read its result back.
    pub async fn get_or_load<T, F, Fut, E>(&self, key: &str, loader: F) -> Result<T, CacheError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        if let Some(value) = self.get(key).await? {
            return Ok(value);
        }

        let _guard = self.load_locks.lock(key).await;
        if let Some(value) = self.get(key).await? {
            debug!("Value for {}:{} loaded by a concurrent caller", self.name, key);
            return Ok(value);
        }

        let value = loader().await.map_err(|e| CacheError::ValueRetrieval {
            key: key.to_owned(),
            source: e.into(),
        })?;
        self.insert(key, &value).await?;
        Ok(value)
    }

    /// Store a value in both tiers and tell other nodes to drop their copy.
    ///
    /// `null` evicts the key instead when the region does not cache nulls.
    pub async fn put(&self, key: &str, value: Value) -> Result<(), CacheError> {
        if value.is_null() && !self.config.cache_null_values {
            return self.evict(key).await;
        }

        let cache_key = self.composite_key(key);
        let ttl = self.config.ttl_for(&self.name);
        let json = serde_json::to_string(&value)?;
        let written = async {
            self.backends.shared.set(&cache_key, json, ttl).await?;
            self.publish(InvalidationEvent::key(&self.name, key)).await
        }
        .await;
        if let Err(e) = written {
            // Our local copy may now be older than the shared store
            warn!("Cache put for key {} failed: {}", cache_key, e);
            self.local.invalidate(key).await;
            return Err(e);
        }
        self.local.put(key, Arc::new(value)).await;
        debug!("Cache put for key: {} (ttl {:?})", cache_key, ttl);
        Ok(())
    }

    /// Typed [`put`](Self::put)
    pub async fn insert<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
    ) -> Result<(), CacheError> {
        self.put(key, serde_json::to_value(value)?).await
    }

    /// Remove a key from both tiers on every node
    pub async fn evict(&self, key: &str) -> Result<(), CacheError> {
        let cache_key = self.composite_key(key);
        let deleted = async {
            self.backends.shared.delete(&cache_key).await?;
            self.publish(InvalidationEvent::key(&self.name, key)).await
        }
        .await;
        self.local.invalidate(key).await;
        deleted?;
        debug!("Cache evict for key: {}", cache_key);
        Ok(())
    }

    /// Remove every key of this region from both tiers on every node
    pub async fn clear(&self) -> Result<(), CacheError> {
        let namespace = format!("{}:", self.name);
        let cleared = async {
            let keys = self.backends.shared.list_keys(&namespace).await?;
            for cache_key in &keys {
                self.backends.shared.delete(cache_key).await?;
            }
            self.publish(InvalidationEvent::clear_all(&self.name)).await?;
            Ok::<_, CacheError>(keys.len())
        }
        .await;
        self.local.invalidate_all().await;
        let cleared = cleared?;
        debug!("Cache clear for region {} ({} shared keys)", self.name, cleared);
        Ok(())
    }

    /// Store `value` unless the shared store already holds one, cluster-wide.
    ///
    /// Returns the existing value, or `None` when `value` was stored.
    pub async fn put_if_absent(
        &self,
        key: &str,
        value: Value,
    ) -> Result<Option<Arc<Value>>, CacheError> {
        let cache_key = self.composite_key(key);
        let lease = self
            .backends
            .mutex
            .acquire(&cache_key, self.config.lock_lease)
            .await?;

        let result = self.put_if_absent_locked(key, &cache_key, value).await;

        if let Err(e) = self.backends.mutex.release(&lease).await {
            warn!(
                "Failed to release lock {}: {}. It will expire with its lease.",
                cache_key, e
            );
        }
        result
    }

    async fn put_if_absent_locked(
        &self,
        key: &str,
        cache_key: &str,
        value: Value,
    ) -> Result<Option<Arc<Value>>, CacheError> {
        if let Some(json) = self.backends.shared.get(cache_key).await? {
            debug!("put_if_absent: {} already present", cache_key);
            return Ok(Some(Arc::new(serde_json::from_str(&json)?)));
        }
        self.put(key, value).await?;
        Ok(None)
    }

    /// Drop one key, or every key, from this node's local store only
    pub async fn clear_local(&self, key: Option<&str>) {
        match key {
            Some(key) => {
                debug!("Clear local cache for key: {}:{}", self.name, key);
                self.local.invalidate(key).await;
            }
            None => {
                debug!("Clear local cache for region {}", self.name);
                self.local.invalidate_all().await;
            }
        }
    }

    async fn publish(&self, event: InvalidationEvent) -> Result<(), CacheError> {
        let payload = event.with_origin(&self.node_id).encode()?;
        self.backends.bus.publish(payload).await
    }
}
