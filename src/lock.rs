//! Cluster-wide mutual exclusion with leases

use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::CacheError;

/// A held distributed lock. Pass it back to [`DistributedMutex::release`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutexLease {
    pub name: String,
    /// Identifies the holder so a lease that expired and was re-taken
    /// elsewhere is not released by mistake
    pub token: String,
}

/// Named lock shared by every node.
///
/// A lease bounds how long a crashed holder can keep the lock.
#[async_trait]
pub trait DistributedMutex: Send + Sync + 'static {
    /// Wait for the lock, failing with [`CacheError::LockTimeout`] after the
    /// implementation's acquire timeout.
    async fn acquire(&self, name: &str, lease: Duration) -> Result<MutexLease, CacheError>;

    async fn release(&self, lease: &MutexLease) -> Result<(), CacheError>;
}

const LOCK_KEY_PREFIX: &str = "lock:";
const RETRY_INTERVAL: Duration = Duration::from_millis(50);

// Delete the key only while it still holds our token
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Redis lock using `SET NX PX` and a compare-and-delete release
#[derive(Clone)]
pub struct RedisMutex {
    redis: redis::aio::ConnectionManager,
    acquire_timeout: Duration,
}

impl RedisMutex {
    pub fn new(redis: redis::aio::ConnectionManager, acquire_timeout: Duration) -> Self {
        Self {
            redis,
            acquire_timeout,
        }
    }
}

#[async_trait]
impl DistributedMutex for RedisMutex {
    async fn acquire(&self, name: &str, lease: Duration) -> Result<MutexLease, CacheError> {
        let key = format!("{LOCK_KEY_PREFIX}{name}");
        let token = uuid::Uuid::new_v4().to_string();
        let lease_ms = u64::try_from(lease.as_millis()).unwrap_or(u64::MAX).max(1);
        let deadline = Instant::now() + self.acquire_timeout;
        let mut conn = self.redis.clone();

        loop {
            let acquired: Option<String> = redis::cmd("SET")
                .arg(&key)
                .arg(&token)
                .arg("NX")
                .arg("PX")
                .arg(lease_ms)
                .query_async(&mut conn)
                .await?;
            if acquired.is_some() {
                debug!("Acquired lock {} (lease {:?})", key, lease);
                return Ok(MutexLease {
                    name: name.to_owned(),
                    token,
                });
            }
            if Instant::now() >= deadline {
                warn!("Timed out waiting for lock {}", key);
                return Err(CacheError::LockTimeout {
                    name: name.to_owned(),
                });
            }
            tokio::time::sleep(RETRY_INTERVAL).await;
        }
    }

    async fn release(&self, lease: &MutexLease) -> Result<(), CacheError> {
        let key = format!("{LOCK_KEY_PREFIX}{}", lease.name);
        let mut conn = self.redis.clone();
        let deleted: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(&key)
            .arg(&lease.token)
            .invoke_async(&mut conn)
            .await?;
        if deleted == 0 {
            warn!("Lock {} expired before release", key);
        } else {
            debug!("Released lock {}", key);
        }
        Ok(())
    }
}
