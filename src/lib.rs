//! Provisioning and supervision of per-tenant game servers.
//!
//! Each server runs in its own container. The [`lifecycle`] manager maps a
//! [`types::ServerRecord`] to a running container, the [`scan`] converges
//! every preloaded template at startup, and the [`command`] layer carries
//! integrity-tagged commands to servers over the [`broker`].
//!
//! The registry, container runtime and broker are injected as trait
//! objects, so every component can be driven by fakes in tests.

pub mod broker;
pub mod command;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod network;
pub mod ports;
pub mod registry;
pub mod runtime;
pub mod scan;
pub mod templates;
pub mod types;
pub mod worker;

pub use error::{Error, Result};
