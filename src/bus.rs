//! Pub/sub channel carrying invalidation events

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use redis::AsyncCommands;
use tracing::debug;

use crate::CacheError;

/// Broadcast channel every node subscribes to.
///
/// Payloads are opaque bytes; decoding is the listener's job so a malformed
/// message can be dropped without tearing down the subscription.
#[async_trait]
pub trait InvalidationBus: Send + Sync + 'static {
    async fn publish(&self, payload: String) -> Result<(), CacheError>;

    /// Open a subscription. The stream ends when the underlying connection is lost.
    async fn subscribe(&self) -> Result<BoxStream<'static, Vec<u8>>, CacheError>;
}

/// Redis pub/sub bus bound to one topic
#[derive(Clone)]
pub struct RedisInvalidationBus {
    client: redis::Client,
    redis: redis::aio::ConnectionManager,
    topic: String,
}

impl RedisInvalidationBus {
    pub fn new(
        client: redis::Client,
        redis: redis::aio::ConnectionManager,
        topic: impl Into<String>,
    ) -> Self {
        Self {
            client,
            redis,
            topic: topic.into(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

#[async_trait]
impl InvalidationBus for RedisInvalidationBus {
    async fn publish(&self, payload: String) -> Result<(), CacheError> {
        let mut conn = self.redis.clone();
        conn.publish::<_, _, ()>(&self.topic, &payload).await?;
        debug!("Invalidation published on channel '{}': {}", self.topic, payload);
        Ok(())
    }

    async fn subscribe(&self) -> Result<BoxStream<'static, Vec<u8>>, CacheError> {
        // Subscriptions need a dedicated connection
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(&self.topic).await?;
        debug!("Subscribed to channel {}", self.topic);

        Ok(pubsub
            .into_on_message()
            .map(|msg| msg.get_payload_bytes().to_vec())
            .boxed())
    }
}
