//! Invalidation listener
//!
//! Subscribes to the invalidation bus and drops local entries named by events
//! published from other nodes.
//!
//! ## Example Flow
//!
//! ```text
//! Node 1: region.put("42", v)
//!   ↓ shared store SET orders:42, then PUBLISH {"region":"orders","key":"42","origin":"node-1"}
//! Node 1 listener: origin is itself → ignored (its local copy is already current)
//! Node 2 listener: drops "42" from the local store of region "orders"
//! ```

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::{CacheError, InvalidationBus, InvalidationEvent, RegionRegistry};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(300);

pub struct InvalidationListener {
    registry: Arc<RegionRegistry>,
    bus: Arc<dyn InvalidationBus>,
}

/// Running listener task
pub struct ListenerHandle {
    task: JoinHandle<()>,
}

impl ListenerHandle {
    /// Stop listening. Local stores are no longer invalidated afterwards.
    pub fn shutdown(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl InvalidationListener {
    pub fn new(registry: Arc<RegionRegistry>, bus: Arc<dyn InvalidationBus>) -> Self {
        Self { registry, bus }
    }

    /// Subscribe, then process events on a background task.
    ///
    /// The first subscription must succeed; if the connection is lost later the
    /// task resubscribes with exponential backoff.
    pub async fn start(self) -> Result<ListenerHandle, CacheError> {
        let stream = self.bus.subscribe().await?;
        info!(
            "Invalidation listener started for node {}",
            self.registry.node_id()
        );

        let task = tokio::spawn(async move {
            self.consume(stream).await;
            let mut backoff = INITIAL_BACKOFF;
            loop {
                warn!(
                    "Invalidation subscription lost, resubscribing in {}s",
                    backoff.as_secs()
                );
                tokio::time::sleep(backoff).await;
                match self.bus.subscribe().await {
                    Ok(stream) => {
                        backoff = INITIAL_BACKOFF;
                        self.consume(stream).await;
                    }
                    Err(e) => {
                        error!("Invalidation listener failed to resubscribe: {}", e);
                        backoff = (backoff * 2).min(MAX_BACKOFF);
                    }
                }
            }
        });

        Ok(ListenerHandle { task })
    }

    async fn consume(&self, mut stream: BoxStream<'static, Vec<u8>>) {
        while let Some(payload) = stream.next().await {
            self.handle_payload(&payload).await;
        }
    }

    /// Decode and apply one bus message. Malformed messages are logged and dropped.
    pub async fn handle_payload(&self, payload: &[u8]) {
        let event = match InvalidationEvent::decode(payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(
                    "Dropping malformed invalidation message ({}): {}",
                    e,
                    String::from_utf8_lossy(payload)
                );
                return;
            }
        };

        if event.origin.as_deref() == Some(self.registry.node_id()) {
            debug!(
                "Ignoring own invalidation for region {} key {:?}",
                event.region, event.key
            );
            return;
        }

        debug!(
            "Invalidation received for region {} key {:?}",
            event.region, event.key
        );
        self.registry.route_invalidation(&event).await;
    }
}
