//! In-memory capability implementations
//!
//! Stand-ins for Redis used by tests. Several registries sharing the same
//! instances behave like several nodes sharing one Redis.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use tokio::sync::broadcast;

use crate::{CacheError, DistributedMutex, InvalidationBus, MutexLease, SharedStore};

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    ttl: Option<Duration>,
    expires_at: Option<Instant>,
}

/// Shared store kept in a `HashMap`, honouring TTLs lazily
#[derive(Debug, Default)]
pub struct MemorySharedStore {
    entries: Mutex<HashMap<String, StoredValue>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
    unavailable: AtomicBool,
}

impl MemorySharedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw value at a composite key, bypassing the call counters
    pub fn raw(&self, key: &str) -> Option<String> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .get(key)
            .filter(|v| !is_expired(v))
            .map(|v| v.value.clone())
    }

    /// TTL a key was written with
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.get(key).and_then(|v| v.ttl)
    }

    /// Number of `get` calls served
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Number of `set` and `delete` calls served
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Make every call fail with [`CacheError::Store`] until switched back
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), CacheError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CacheError::Store("shared store unavailable".to_owned()));
        }
        Ok(())
    }
}

fn is_expired(value: &StoredValue) -> bool {
    value.expires_at.is_some_and(|at| Instant::now() >= at)
}

#[async_trait]
impl SharedStore for MemorySharedStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.check_available()?;
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.raw(key))
    }

    async fn set(
        &self,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        self.check_available()?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(
            key.to_owned(),
            StoredValue {
                value,
                ttl,
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.check_available()?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(key);
        Ok(())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, CacheError> {
        self.check_available()?;
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries
            .iter()
            .filter(|(k, v)| k.starts_with(prefix) && !is_expired(v))
            .map(|(k, _)| k.clone())
            .collect())
    }
}

/// Bus fanning every payload out to all current subscribers
#[derive(Debug)]
pub struct MemoryBus {
    tx: broadcast::Sender<Vec<u8>>,
    published: Mutex<Vec<String>>,
    unavailable: AtomicBool,
}

impl Default for MemoryBus {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self {
            tx,
            published: Mutex::new(Vec::new()),
            unavailable: AtomicBool::new(false),
        }
    }
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every payload published so far, in order
    pub fn published(&self) -> Vec<String> {
        self.published
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Make `publish` fail with [`CacheError::Store`] until switched back
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Deliver a raw payload to subscribers without recording it
    pub fn inject(&self, payload: &[u8]) {
        let _ = self.tx.send(payload.to_vec());
    }
}

#[async_trait]
impl InvalidationBus for MemoryBus {
    async fn publish(&self, payload: String) -> Result<(), CacheError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CacheError::Store("invalidation bus unavailable".to_owned()));
        }
        self.published
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(payload.clone());
        // No subscribers is not an error for pub/sub
        let _ = self.tx.send(payload.into_bytes());
        Ok(())
    }

    async fn subscribe(&self) -> Result<BoxStream<'static, Vec<u8>>, CacheError> {
        let rx = self.tx.subscribe();
        Ok(stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(payload) => return Some((payload, rx)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed())
    }
}

/// Lock table with lease expiry
#[derive(Debug)]
pub struct MemoryMutex {
    held: Mutex<HashMap<String, (String, Instant)>>,
    acquire_timeout: Duration,
}

impl Default for MemoryMutex {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl MemoryMutex {
    pub fn new(acquire_timeout: Duration) -> Self {
        Self {
            held: Mutex::new(HashMap::new()),
            acquire_timeout,
        }
    }

    pub fn is_locked(&self, name: &str) -> bool {
        let held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        held.get(name)
            .is_some_and(|(_, expires)| Instant::now() < *expires)
    }

    fn try_acquire(&self, name: &str, token: &str, lease: Duration) -> bool {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        match held.get(name) {
            Some((_, expires)) if now < *expires => false,
            _ => {
                held.insert(name.to_owned(), (token.to_owned(), now + lease));
                true
            }
        }
    }
}

#[async_trait]
impl DistributedMutex for MemoryMutex {
    async fn acquire(&self, name: &str, lease: Duration) -> Result<MutexLease, CacheError> {
        let token = uuid::Uuid::new_v4().to_string();
        let deadline = Instant::now() + self.acquire_timeout;
        loop {
            if self.try_acquire(name, &token, lease) {
                return Ok(MutexLease {
                    name: name.to_owned(),
                    token,
                });
            }
            if Instant::now() >= deadline {
                return Err(CacheError::LockTimeout {
                    name: name.to_owned(),
                });
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn release(&self, lease: &MutexLease) -> Result<(), CacheError> {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        if held
            .get(&lease.name)
            .is_some_and(|(token, _)| *token == lease.token)
        {
            held.remove(&lease.name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_store_ttl_expiry() {
        let store = MemorySharedStore::new();
        store
            .set("r:a", "1".to_owned(), Some(Duration::from_millis(20)))
            .await
            .unwrap();
        store.set("r:b", "2".to_owned(), None).await.unwrap();
        assert_eq!(store.get("r:a").await.unwrap().as_deref(), Some("1"));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(store.get("r:a").await.unwrap().is_none());
        assert_eq!(store.list_keys("r:").await.unwrap(), vec!["r:b".to_owned()]);
    }

    #[tokio::test]
    async fn test_mutex_lease_expires() {
        let mutex = MemoryMutex::new(Duration::from_millis(20));
        let first = mutex
            .acquire("k", Duration::from_millis(100))
            .await
            .unwrap();
        assert!(matches!(
            mutex.acquire("k", Duration::from_millis(100)).await,
            Err(CacheError::LockTimeout { .. })
        ));

        // Crashed holder: never released, lease runs out
        tokio::time::sleep(Duration::from_millis(120)).await;
        let second = mutex
            .acquire("k", Duration::from_millis(100))
            .await
            .unwrap();

        // The stale lease must not free the new holder's lock
        mutex.release(&first).await.unwrap();
        assert!(mutex.is_locked("k"));
        mutex.release(&second).await.unwrap();
        assert!(!mutex.is_locked("k"));
    }
}
