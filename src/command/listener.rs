use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use tokio::time::sleep;

use super::{CommandMessage, IntegrityScheme};
use crate::broker::{server_id_from_channel, Broker};
use crate::error::{Error, Result};

/// Executes one kind of command. Handlers are keyed by `target`.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, server_id: &str, command: &CommandMessage) -> Result<()>;
}

/// What happened to a message that passed verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Handled,
    Unhandled,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenerStats {
    pub accepted: u64,
    pub rejected: u64,
    pub handler_errors: u64,
    /// Subscriptions established, including the first.
    pub subscriptions: u64,
}

#[derive(Default)]
struct Counters {
    accepted: AtomicU64,
    rejected: AtomicU64,
    handler_errors: AtomicU64,
    subscriptions: AtomicU64,
}

pub struct CommandListener {
    broker: Arc<dyn Broker>,
    scheme: IntegrityScheme,
    handlers: HashMap<String, Arc<dyn CommandHandler>>,
    counters: Counters,
    retry_delay: Duration,
}

impl CommandListener {
    pub fn new(broker: Arc<dyn Broker>, scheme: IntegrityScheme) -> Self {
        Self {
            broker,
            scheme,
            handlers: HashMap::new(),
            counters: Counters::default(),
            retry_delay: Duration::from_secs(5),
        }
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn register(&mut self, target: impl Into<String>, handler: Arc<dyn CommandHandler>) {
        self.handlers.insert(target.into(), handler);
    }

    pub fn stats(&self) -> ListenerStats {
        ListenerStats {
            accepted: self.counters.accepted.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            handler_errors: self.counters.handler_errors.load(Ordering::Relaxed),
            subscriptions: self.counters.subscriptions.load(Ordering::Relaxed),
        }
    }

    /// Runs until the task is dropped. Bad messages are logged and dropped,
    /// and a subscription that fails or ends is retried after the delay.
    pub async fn listen(&self, pattern: &str) {
        loop {
            let mut stream = match self.broker.subscribe(pattern).await {
                Ok(stream) => stream,
                Err(e) => {
                    error!(
                        "Failed to subscribe to {}: {}. Retrying in {:?}...",
                        pattern, e, self.retry_delay
                    );
                    sleep(self.retry_delay).await;
                    continue;
                }
            };
            self.counters.subscriptions.fetch_add(1, Ordering::Relaxed);
            info!("Accepting server requests on {}", pattern);

            while let Some(msg) = stream.next().await {
                match self.handle(&msg.channel, &msg.payload).await {
                    Ok(delivery) => debug!("{} -> {:?}", msg.channel, delivery),
                    Err(e) => error!("Dropped request on {}: {}", msg.channel, e),
                }
            }

            warn!(
                "Subscription to {} ended. Resubscribing in {:?}...",
                pattern, self.retry_delay
            );
            sleep(self.retry_delay).await;
        }
    }

    /// Decodes and verifies one message, then hands it to the handler
    /// registered for its target. Handler failures are logged, not returned.
    pub async fn handle(&self, channel: &str, payload: &[u8]) -> Result<Delivery> {
        let command = CommandMessage::from_bytes(payload).map_err(|e| {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            e
        })?;
        if let Err(e) = command.verify(&self.scheme) {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(e);
        }
        self.counters.accepted.fetch_add(1, Ordering::Relaxed);
        info!(
            "Received request from {}: {} {:?}",
            channel, command.target, command.arguments
        );

        let Some(handler) = self.handlers.get(&command.target) else {
            debug!("No handler registered for {:?}", command.target);
            return Ok(Delivery::Unhandled);
        };
        let server_id = server_id_from_channel(channel)
            .ok_or_else(|| Error::Parse(format!("no server id in channel {}", channel)))?;

        if let Err(e) = handler.handle(server_id, &command).await {
            self.counters.handler_errors.fetch_add(1, Ordering::Relaxed);
            error!("Handler for {:?} failed: {}", command.target, e);
        }
        Ok(Delivery::Handled)
    }
}
