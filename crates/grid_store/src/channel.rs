//! Update channel: best-effort topic broadcast of cell updates.
//!
//! Delivery is at-most-once with no replay. Events published while nobody is
//! subscribed are dropped.

use crate::cell::UpdateEvent;
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tracing::{debug, info, warn};

/// Infinite feed of events published after the subscription was established.
pub type EventStream = BoxStream<'static, Result<UpdateEvent>>;

/// Named-topic publish/subscribe.
#[async_trait]
pub trait UpdateChannel: Send + Sync + 'static {
    /// Publish without waiting for subscribers and without retry.
    async fn publish(&self, topic: &str, event: &UpdateEvent) -> Result<()>;

    /// Subscribe to a topic. Resolves once the subscription is live.
    async fn subscribe(&self, topic: &str) -> Result<EventStream>;
}

/// Redis pub/sub backed update channel.
#[derive(Clone)]
pub struct RedisUpdateChannel {
    client: redis::Client,
    publisher: MultiplexedConnection,
}

impl RedisUpdateChannel {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let publisher = client.get_multiplexed_async_connection().await?;
        Ok(Self { client, publisher })
    }
}

#[async_trait]
impl UpdateChannel for RedisUpdateChannel {
    async fn publish(&self, topic: &str, event: &UpdateEvent) -> Result<()> {
        let mut conn = self.publisher.clone();
        let receivers: usize = conn
            .publish(topic, event.to_string())
            .await
            .map_err(|e| Error::PublishFailed(e.to_string()))?;
        debug!("Published {} to '{}' ({} receivers)", event, topic, receivers);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<EventStream> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(topic).await?;
        info!("Subscribed to Redis channel '{}'", topic);

        let stream = pubsub.into_on_message().map(|msg| {
            let payload: String = msg
                .get_payload()
                .map_err(|e| Error::MalformedEvent(e.to_string()))?;
            payload.parse::<UpdateEvent>().inspect_err(|e| {
                warn!("Dropping unparseable payload: {}", e);
            })
        });

        Ok(stream.boxed())
    }
}
