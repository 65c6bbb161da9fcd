//! Cache error types

use redis::RedisError;

/// Cache-related errors
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Redis error: {0}")]
    Redis(#[from] RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Shared store or invalidation bus failure reported by a non-Redis backend
    #[error("Store error: {0}")]
    Store(String),

    /// The caller-supplied loader of `get_or_load` failed
    #[error("Value for key '{key}' could not be loaded: {source}")]
    ValueRetrieval {
        key: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The distributed lock was not acquired within the acquire timeout
    #[error("Timed out acquiring distributed lock '{name}'")]
    LockTimeout { name: String },
}
