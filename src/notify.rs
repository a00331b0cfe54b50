// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Fire-and-forget pub/sub notifications.
//!
//! Publishing follows the cache's failure rule: failures are logged and the
//! caller gets `None`. Subscribing is a setup step, so it returns `Result`.
//!
//! Delivery-status events for a tenant go to
//! `{delivery_channel_prefix}:{tenant_id}`:
//!
//! ```rust,no_run
//! # async fn example() {
//! use std::sync::Arc;
//! use tenant_cache::backend::MemoryStore;
//! use tenant_cache::config::NotifierConfig;
//! use tenant_cache::model::{DeliveryState, DeliveryStatusEvent};
//! use tenant_cache::notify::Notifier;
//!
//! let notifier = Notifier::new(Arc::new(MemoryStore::new()), NotifierConfig::default());
//! let event = DeliveryStatusEvent::now("c1", "msg-1", DeliveryState::Delivered);
//! notifier.notify_delivery_status(&event).await; // "delivery-status:c1"
//! # }
//! ```

use crate::backend::{KvBackend, RedisStore};
use crate::config::NotifierConfig;
use crate::error::{CacheError, Result};
use crate::kv::decode_value;
use crate::metrics;
use crate::model::DeliveryStatusEvent;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error};

/// A message received from a channel, payload decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct PubSubMessage {
    pub channel: String,
    pub payload: Value,
}

/// Pub/sub notifier over a shared store handle.
pub struct Notifier<B: KvBackend = RedisStore> {
    backend: Arc<B>,
    config: NotifierConfig,
}

impl<B: KvBackend> Clone for Notifier<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            config: self.config.clone(),
        }
    }
}

impl<B: KvBackend> Notifier<B> {
    pub fn new(backend: Arc<B>, config: NotifierConfig) -> Self {
        Self { backend, config }
    }

    /// Channel carrying a tenant's delivery-status events.
    pub fn delivery_channel(&self, tenant_id: &str) -> String {
        format!("{}:{}", self.config.delivery_channel_prefix, tenant_id)
    }

    /// JSON-encode and publish. Returns the number of subscribers reached,
    /// `None` on failure.
    pub async fn publish<T>(&self, channel: &str, payload: &T) -> Option<u64>
    where
        T: Serialize + ?Sized,
    {
        let result = match serde_json::to_string(payload) {
            Ok(encoded) => self.backend.publish(channel, encoded).await,
            Err(e) => Err(CacheError::from(e)),
        };

        match result {
            Ok(receivers) => {
                metrics::record_publish(true);
                debug!(channel, receivers, "Published notification");
                Some(receivers)
            }
            Err(e) => {
                metrics::record_publish(false);
                metrics::record_store_error("PUBLISH", e.kind());
                error!(channel, error = %e, "Publish failed, notification dropped");
                None
            }
        }
    }

    /// Publish a delivery-status change on the tenant's channel.
    pub async fn notify_delivery_status(&self, event: &DeliveryStatusEvent) -> Option<u64> {
        let channel = self.delivery_channel(&event.tenant_id);
        self.publish(&channel, event).await
    }

    /// Subscribe to a channel. Payloads are decoded as JSON with the raw
    /// string as fallback.
    pub async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, PubSubMessage>> {
        let messages = self.backend.subscribe(channel).await?;
        debug!(channel, "Subscribed");
        Ok(messages
            .map(|message| PubSubMessage {
                channel: message.channel,
                payload: decode_value(message.payload),
            })
            .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryStore;
    use crate::model::DeliveryState;
    use serde_json::json;

    fn notifier() -> (Arc<MemoryStore>, Notifier<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (
            Arc::clone(&store),
            Notifier::new(store, NotifierConfig::default()),
        )
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let (_, notifier) = notifier();
        assert_eq!(notifier.publish("ch", &json!({"a": 1})).await, Some(0));
    }

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let (_, notifier) = notifier();
        let mut messages = notifier.subscribe("ch").await.unwrap();

        assert_eq!(notifier.publish("ch", &json!({"a": 1})).await, Some(1));
        let message = messages.next().await.unwrap();
        assert_eq!(message.channel, "ch");
        assert_eq!(message.payload, json!({"a": 1}));
    }

    #[tokio::test]
    async fn test_delivery_status_channel() {
        let (_, notifier) = notifier();
        assert_eq!(notifier.delivery_channel("c1"), "delivery-status:c1");

        let mut messages = notifier.subscribe("delivery-status:c1").await.unwrap();
        let event = DeliveryStatusEvent::now("c1", "m-1", DeliveryState::Failed)
            .with_error("rejected by carrier");
        assert_eq!(notifier.notify_delivery_status(&event).await, Some(1));

        let message = messages.next().await.unwrap();
        let received: DeliveryStatusEvent = serde_json::from_value(message.payload).unwrap();
        assert_eq!(received, event);
    }

    #[tokio::test]
    async fn test_publish_failure_is_none() {
        let (store, notifier) = notifier();
        store.set_available(false);
        assert_eq!(notifier.publish("ch", "x").await, None);
        assert!(notifier.subscribe("ch").await.is_err());
    }
}
