//! Commands sent to running servers over the broker.
//!
//! A message travels as JSON `{uuid, target, arguments, hash}`. `hash` is
//! the lowercase hex tag over `uuid + target + arguments.join(" ")`.
//!
//! With [`IntegrityScheme::Digest`] the tag is a plain MD5 of public
//! fields, the format existing producers emit: it catches corruption, but
//! anyone who knows the format can mint a valid tag. [`IntegrityScheme::Keyed`] mixes a shared secret in through
//! HMAC-SHA256, which is what actually authenticates the sender.

use std::fmt;

use hmac::{Hmac, Mac};
use md5::Md5;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

pub mod dispatcher;
pub mod listener;

pub use dispatcher::CommandDispatcher;
pub use listener::{CommandHandler, CommandListener, Delivery, ListenerStats};

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone)]
pub enum IntegrityScheme {
    Digest,
    Keyed(HmacSha256),
}

impl fmt::Debug for IntegrityScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntegrityScheme::Digest => f.write_str("Digest"),
            IntegrityScheme::Keyed(_) => f.write_str("Keyed(..)"),
        }
    }
}

impl IntegrityScheme {
    pub fn keyed(secret: &[u8]) -> Result<Self> {
        let mac = HmacSha256::new_from_slice(secret)
            .map_err(|e| Error::Parse(format!("unusable command secret: {}", e)))?;
        Ok(IntegrityScheme::Keyed(mac))
    }

    /// Keyed when a secret is configured, bare digest otherwise.
    pub fn from_secret(secret: Option<&str>) -> Result<Self> {
        match secret.filter(|s| !s.is_empty()) {
            Some(secret) => Self::keyed(secret.as_bytes()),
            None => Ok(IntegrityScheme::Digest),
        }
    }

    pub fn is_keyed(&self) -> bool {
        matches!(self, IntegrityScheme::Keyed(_))
    }

    pub fn tag(&self, input: &[u8]) -> String {
        match self {
            IntegrityScheme::Digest => hex::encode(Md5::digest(input)),
            IntegrityScheme::Keyed(mac) => {
                let mut mac = mac.clone();
                mac.update(input);
                hex::encode(mac.finalize().into_bytes())
            }
        }
    }

    pub fn matches(&self, input: &[u8], tag: &str) -> bool {
        match self {
            IntegrityScheme::Digest => self.tag(input) == tag,
            IntegrityScheme::Keyed(mac) => {
                // Uppercase hex would decode fine; the wire format is lowercase.
                if tag.bytes().any(|b| b.is_ascii_uppercase()) {
                    return false;
                }
                let Ok(expected) = hex::decode(tag) else {
                    return false;
                };
                let mut mac = mac.clone();
                mac.update(input);
                mac.verify_slice(&expected).is_ok()
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandMessage {
    #[serde(rename = "uuid")]
    pub requester_id: String,
    pub target: String,
    pub arguments: Vec<String>,
    pub hash: String,
}

impl CommandMessage {
    pub fn signed(
        scheme: &IntegrityScheme,
        requester_id: impl Into<String>,
        target: impl Into<String>,
        arguments: Vec<String>,
    ) -> Self {
        let mut message = Self {
            requester_id: requester_id.into(),
            target: target.into(),
            arguments,
            hash: String::new(),
        };
        message.hash = scheme.tag(message.signing_input().as_bytes());
        message
    }

    pub fn signing_input(&self) -> String {
        format!(
            "{}{}{}",
            self.requester_id,
            self.target,
            self.arguments.join(" ")
        )
    }

    pub fn verify(&self, scheme: &IntegrityScheme) -> Result<()> {
        if scheme.matches(self.signing_input().as_bytes(), &self.hash) {
            Ok(())
        } else {
            Err(Error::Integrity {
                requester: self.requester_id.clone(),
                target: self.target.clone(),
            })
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
