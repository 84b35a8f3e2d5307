use async_trait::async_trait;
use futures_util::stream::StreamExt;
use log::{debug, info};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;

use super::{Broker, BrokerMessage, MessageStream};
use crate::error::Result;

/// Redis pub/sub. Publishing shares one multiplexed connection; every
/// subscription opens its own, since a subscribed connection can do nothing
/// else.
pub struct RedisBroker {
    client: redis::Client,
    conn: MultiplexedConnection,
}

impl RedisBroker {
    /// `url` is a `redis://[:password@]host:port[/db]` address. Fails unless
    /// the server answers `PING`.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let mut conn = client.get_multiplexed_tokio_connection().await?;
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        info!("Redis ping - {}", pong);
        Ok(Self { client, conn })
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<()> {
        let mut conn = self.conn.clone();
        let receivers: i64 = conn.publish(channel, payload).await?;
        debug!("Published on {} to {} receivers", channel, receivers);
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<MessageStream> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.psubscribe(pattern).await?;
        info!("Subscribed to {}", pattern);
        let stream = pubsub.into_on_message().map(|msg| BrokerMessage {
            channel: msg.get_channel_name().to_string(),
            payload: msg.get_payload_bytes().to_vec(),
        });
        Ok(stream.boxed())
    }
}
