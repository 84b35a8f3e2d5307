use std::sync::Arc;

use log::info;

use super::{CommandMessage, IntegrityScheme};
use crate::broker::{request_channel, Broker};
use crate::error::Result;

/// Signs commands and publishes them on the target server's request channel.
#[derive(Clone)]
pub struct CommandDispatcher {
    broker: Arc<dyn Broker>,
    scheme: IntegrityScheme,
}

impl CommandDispatcher {
    pub fn new(broker: Arc<dyn Broker>, scheme: IntegrityScheme) -> Self {
        Self { broker, scheme }
    }

    pub async fn send(
        &self,
        requester_id: &str,
        target: &str,
        arguments: Vec<String>,
        server_id: u64,
    ) -> Result<()> {
        let message = CommandMessage::signed(&self.scheme, requester_id, target, arguments);
        self.forward(&message, server_id).await
    }

    /// Publishes a message signed elsewhere. A tag that does not match its
    /// fields is rejected before anything reaches the broker.
    pub async fn forward(&self, message: &CommandMessage, server_id: u64) -> Result<()> {
        message.verify(&self.scheme)?;
        let channel = request_channel(server_id);
        self.broker.publish(&channel, message.to_bytes()?).await?;
        info!(
            "Sent {:?} from {} to {}",
            message.target, message.requester_id, channel
        );
        Ok(())
    }
}
