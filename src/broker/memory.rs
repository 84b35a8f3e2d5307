use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use log::warn;
use tokio::sync::broadcast;

use super::{channel_matches, Broker, BrokerMessage, MessageStream};
use crate::error::Result;

/// In-process broker over a tokio broadcast channel.
#[derive(Clone)]
pub struct MemoryBroker {
    tx: broadcast::Sender<BrokerMessage>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(256)
    }
}

impl MemoryBroker {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<()> {
        // Err only means nobody is subscribed.
        let _ = self.tx.send(BrokerMessage {
            channel: channel.to_string(),
            payload,
        });
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<MessageStream> {
        let rx = self.tx.subscribe();
        let pattern = pattern.to_string();
        let stream = stream::unfold((rx, pattern), |(mut rx, pattern)| async move {
            loop {
                match rx.recv().await {
                    Ok(msg) if channel_matches(&pattern, &msg.channel) => {
                        return Some((msg, (rx, pattern)));
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Subscriber on {} dropped {} messages", pattern, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_only_matching_channels() {
        let broker = MemoryBroker::default();
        let mut sub = broker.subscribe("servers:*:request").await.unwrap();

        broker.publish("servers:added", b"{}".to_vec()).await.unwrap();
        broker
            .publish("servers:3:request", b"hello".to_vec())
            .await
            .unwrap();

        let msg = sub.next().await.unwrap();
        assert_eq!(msg.channel, "servers:3:request");
        assert_eq!(msg.payload, b"hello");
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_fine() {
        let broker = MemoryBroker::default();
        broker.publish("servers:added", Vec::new()).await.unwrap();
    }
}
