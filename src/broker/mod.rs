//! Publish/subscribe transport.
//!
//! Channel names follow the `servers:<id>:request` / `servers:added`
//! convention; subscriptions take Redis-style glob patterns.

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::error::Result;

pub mod memory;
pub mod redis;

pub use self::memory::MemoryBroker;
pub use self::redis::RedisBroker;

pub const SERVERS_ADDED: &str = "servers:added";
pub const REQUEST_PATTERN: &str = "servers:*:request";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub channel: String,
    pub payload: Vec<u8>,
}

pub type MessageStream = BoxStream<'static, BrokerMessage>;

#[async_trait]
pub trait Broker: Send + Sync {
    /// Fire-and-forget; having no subscribers is not an error.
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<()>;

    /// Stream of every message whose channel matches `pattern`. It ends when
    /// the underlying connection goes away.
    async fn subscribe(&self, pattern: &str) -> Result<MessageStream>;
}

pub fn request_channel(server_id: impl std::fmt::Display) -> String {
    format!("servers:{}:request", server_id)
}

/// `servers:<id>:request` -> `<id>`.
pub fn server_id_from_channel(channel: &str) -> Option<&str> {
    channel
        .strip_prefix("servers:")?
        .strip_suffix(":request")
        .filter(|id| !id.is_empty())
}

/// Glob match with `*` (any run, possibly empty) and `?` (one byte).
pub fn channel_matches(pattern: &str, channel: &str) -> bool {
    let (p, c) = (pattern.as_bytes(), channel.as_bytes());
    let (mut pi, mut ci) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while ci < c.len() {
        match p.get(pi) {
            Some(b'*') => {
                backtrack = Some((pi, ci));
                pi += 1;
            }
            Some(&b) if b == b'?' || b == c[ci] => {
                pi += 1;
                ci += 1;
            }
            _ => match backtrack {
                Some((star, matched)) => {
                    pi = star + 1;
                    ci = matched + 1;
                    backtrack = Some((star, matched + 1));
                }
                None => return false,
            },
        }
    }
    p[pi..].iter().all(|&b| b == b'*')
}
