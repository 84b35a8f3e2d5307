//! Overlay network attachment.

use std::sync::Arc;

use log::{debug, info};

use crate::error::{Error, Result};
use crate::runtime::ContainerRuntime;
use crate::types::{ContainerHandle, NetworkInfo};

#[derive(Clone)]
pub struct NetworkAttacher {
    runtime: Arc<dyn ContainerRuntime>,
    network_name: String,
}

impl NetworkAttacher {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, network_name: impl Into<String>) -> Self {
        Self {
            runtime,
            network_name: network_name.into(),
        }
    }

    pub fn network_name(&self) -> &str {
        &self.network_name
    }

    /// Exact-name lookup over the full network listing.
    pub async fn resolve(&self) -> Result<NetworkInfo> {
        self.runtime
            .list_networks()
            .await?
            .into_iter()
            .find(|n| n.name == self.network_name)
            .ok_or_else(|| Error::not_found("network", &self.network_name))
    }

    /// Connects `container_id` to the configured network. Runtime errors
    /// are returned as-is; nothing is retried.
    pub async fn attach(&self, container_id: &str) -> Result<()> {
        let network = self.resolve().await?;
        debug!("Resolved network {} -> {}", network.name, network.id);
        self.runtime
            .connect_network(&network.id, container_id)
            .await?;
        info!("Attached {} to network {}", container_id, network.name);
        Ok(())
    }

    pub fn is_attached(&self, container: &ContainerHandle) -> bool {
        container.networks.iter().any(|n| *n == self.network_name)
    }
}
