//! tiercache - Two-tier cache regions with cross-node invalidation
//!
//! Each named region keeps hot values in an in-process Moka cache (L1) backed
//! by a shared Redis cache (L2):
//! - Reads try L1, then L2, repairing L1 on an L2 hit
//! - Writes, evictions and clears update L2, broadcast an invalidation event
//!   over Redis pub/sub, then update L1
//! - Every node's listener drops the L1 entries named by other nodes' events
//! - `get_or_load` runs the loader once per key per process under contention
//! - `put_if_absent` is first-write-wins across the cluster via a Redis lock
//!
//! Redis is the consistency backstop: a lost invalidation only delays
//! convergence until the stale L1 entry expires or is evicted.

mod bus;
mod config;
mod error;
mod event;
mod key_lock;
mod listener;
mod local;
mod lock;
pub mod memory;
mod region;
mod registry;
mod shared;

pub use bus::{InvalidationBus, RedisInvalidationBus};
pub use config::{CacheConfig, LocalStoreConfig};
pub use error::CacheError;
pub use event::InvalidationEvent;
pub use listener::{InvalidationListener, ListenerHandle};
pub use local::{LocalStore, MokaLocalStore};
pub use lock::{DistributedMutex, MutexLease, RedisMutex};
pub use region::{CacheRegion, SharedBackends};
pub use registry::RegionRegistry;
pub use shared::{RedisSharedStore, SharedStore};

// Re-export async_trait for implementors of the capability traits
pub use async_trait::async_trait;
