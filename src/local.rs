//! In-process (L1) store of a region

use std::sync::Arc;

use async_trait::async_trait;
use moka::future::Cache;
use serde_json::Value;
use tracing::warn;

use crate::config::LocalStoreConfig;

/// Bounded in-process cache owned by a single region.
///
/// Eviction (capacity and TTL) is the implementation's business.
#[async_trait]
pub trait LocalStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Option<Arc<Value>>;

    async fn put(&self, key: &str, value: Arc<Value>);

    async fn invalidate(&self, key: &str);

    async fn invalidate_all(&self);
}

/// Moka-backed local store
#[derive(Clone)]
pub struct MokaLocalStore {
    cache: Cache<String, Arc<Value>>,
}

impl MokaLocalStore {
    pub fn new(config: &LocalStoreConfig) -> Self {
        let mut builder = Cache::builder();
        if config.initial_capacity > 0 {
            builder = builder.initial_capacity(config.initial_capacity);
        }
        if config.max_capacity > 0 {
            builder = builder.max_capacity(config.max_capacity);
        }
        if !config.expire_after_access.is_zero() {
            builder = builder.time_to_idle(config.expire_after_access);
        }
        if !config.expire_after_write.is_zero() {
            builder = builder.time_to_live(config.expire_after_write);
        }
        if !config.refresh_after_write.is_zero() {
            warn!(
                "refresh_after_write ({:?}) is not supported by the local store and is ignored",
                config.refresh_after_write
            );
        }

        Self {
            cache: builder.build(),
        }
    }
}

#[async_trait]
impl LocalStore for MokaLocalStore {
    async fn get(&self, key: &str) -> Option<Arc<Value>> {
        self.cache.get(key).await
    }

    async fn put(&self, key: &str, value: Arc<Value>) {
        self.cache.insert(key.to_owned(), value).await;
    }

    async fn invalidate(&self, key: &str) {
        self.cache.invalidate(key).await;
    }

    async fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_put_get_invalidate() {
        let store = MokaLocalStore::new(&LocalStoreConfig::default());
        store.put("a", Arc::new(json!(1))).await;
        store.put("b", Arc::new(json!("two"))).await;

        assert_eq!(store.get("a").await.as_deref(), Some(&json!(1)));

        store.invalidate("a").await;
        assert!(store.get("a").await.is_none());
        assert!(store.get("b").await.is_some());

        store.invalidate_all().await;
        assert!(store.get("b").await.is_none());
    }

    #[tokio::test]
    async fn test_expire_after_write() {
        let store = MokaLocalStore::new(&LocalStoreConfig {
            expire_after_write: Duration::from_millis(50),
            ..LocalStoreConfig::default()
        });
        store.put("a", Arc::new(json!(1))).await;
        assert!(store.get("a").await.is_some());

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(store.get("a").await.is_none());
    }
}
