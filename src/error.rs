//! Error taxonomy shared by the orchestrator and the command layer.
//!
//! Every failure the core can produce falls into one of a handful of kinds.
//! Per-template and per-message failures are logged by the surrounding loop
//! and never stop it; only an unreachable registry or broker at startup is
//! fatal, and that decision lives in `main`.

use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// A template, network, container or record is absent.
    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    /// The container runtime rejected or failed a call.
    #[error("container runtime error: {0}")]
    Runtime(String),

    /// A manifest or wire message could not be decoded.
    #[error("parse error: {0}")]
    Parse(String),

    /// The integrity tag of a command message did not match its fields.
    #[error("integrity check failed for command {target:?} from {requester}")]
    Integrity { requester: String, target: String },

    /// A container with the same name already exists.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("provisioning of {container} timed out after {elapsed:?}")]
    Timeout { container: String, elapsed: Duration },

    #[error("no free port left in {first}..={last}")]
    PortsExhausted { first: u16, last: u16 },

    #[error("registry error: {0}")]
    Registry(String),

    #[error("broker error: {0}")]
    Broker(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// HTTP-style status an outer API layer should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::Parse(_) | Error::Integrity { .. } => 400,
            Error::NotFound { .. } => 404,
            Error::Conflict(_) => 409,
            Error::Runtime(_) | Error::PortsExhausted { .. } | Error::Io(_) => 500,
            Error::Registry(_) | Error::Broker(_) => 503,
            Error::Timeout { .. } => 504,
        }
    }

    /// Fixed text safe to hand to external callers. Internal details stay in
    /// the logs.
    pub fn public_message(&self) -> &'static str {
        match self {
            Error::Parse(_) => "malformed request",
            Error::Integrity { .. } => "invalid request",
            Error::NotFound { .. } => "not found",
            Error::Conflict(_) => "already exists",
            Error::Runtime(_) | Error::PortsExhausted { .. } | Error::Io(_) => {
                "internal error"
            }
            Error::Registry(_) | Error::Broker(_) => "service unavailable",
            Error::Timeout { .. } => "operation timed out",
        }
    }

    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status_code())
    }
}

impl From<bollard::errors::Error> for Error {
    fn from(err: bollard::errors::Error) -> Self {
        match err {
            bollard::errors::Error::DockerResponseServerError {
                status_code: 409,
                message,
            } => Error::Conflict(message),
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                message,
            } => Error::NotFound {
                kind: "runtime object",
                name: message,
            },
            other => Error::Runtime(other.to_string()),
        }
    }
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Error::Broker(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Parse(err.to_string())
    }
}
