use std::path::Path;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{ContainerHandle, ContainerSpec, NetworkInfo};

pub mod docker;
pub use docker::DockerRuntime;

/// The container engine the orchestrator drives. The runtime is the source
/// of truth for container state; callers re-list instead of caching.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn pull_image(&self, image: &str) -> Result<()>;

    /// Builds `context` (a directory) using `dockerfile` relative to it.
    async fn build_image(&self, context: &Path, dockerfile: &str, tag: &str) -> Result<()>;

    /// Creates a stopped container and returns its id. A name already taken
    /// yields `Error::Conflict`.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    /// Starting a running container is not an error.
    async fn start_container(&self, id: &str) -> Result<()>;

    async fn remove_container(&self, id: &str) -> Result<()>;

    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerHandle>>;

    async fn list_networks(&self) -> Result<Vec<NetworkInfo>>;

    async fn connect_network(&self, network_id: &str, container_id: &str) -> Result<()>;
}
