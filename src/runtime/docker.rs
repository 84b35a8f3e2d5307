use super::ContainerRuntime;
use crate::error::{Error, Result};
use crate::types::{normalize_container_name, ContainerHandle, ContainerSpec, NetworkInfo};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
    StartContainerOptions,
};
use bollard::image::{BuildImageOptions, CreateImageOptions};
use bollard::models::{EndpointSettings, HostConfig, Mount, MountTypeEnum, PortBinding};
use bollard::network::{ConnectNetworkOptions, ListNetworksOptions};
use bollard::Docker;
use futures_util::stream::StreamExt;
use log::{debug, info};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connects to the local Docker daemon (unix socket on Linux, or
    /// `DOCKER_HOST`) and checks that it answers.
    pub async fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()?;
        docker.ping().await?;
        info!("Connected to Docker daemon");
        Ok(Self { docker })
    }

    fn archive_context(context: PathBuf) -> Result<Vec<u8>> {
        let mut archive = tar::Builder::new(Vec::new());
        archive.append_dir_all(".", &context)?;
        Ok(archive.into_inner()?)
    }
}

/// Splits `repo[:tag]`, defaulting to `latest`. A colon inside the registry
/// host part (`host:5000/repo`) is not a tag separator.
fn split_image_tag(image: &str) -> (&str, &str) {
    match image.rsplit_once(':') {
        Some((repo, tag)) if !tag.contains('/') => (repo, tag),
        _ => (image, "latest"),
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn pull_image(&self, image: &str) -> Result<()> {
        let (repo, tag) = split_image_tag(image);
        info!("Pulling image {}:{}", repo, tag);
        let opts = CreateImageOptions {
            from_image: repo.to_string(),
            tag: tag.to_string(),
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(opts), None, None);
        while let Some(progress) = stream.next().await {
            let progress = progress?;
            if let Some(status) = progress.status {
                debug!("pull {}: {}", image, status);
            }
        }
        Ok(())
    }

    async fn build_image(&self, context: &Path, dockerfile: &str, tag: &str) -> Result<()> {
        info!("Building image {} from {}", tag, context.display());
        let context = context.to_path_buf();
        let body = tokio::task::spawn_blocking(move || Self::archive_context(context))
            .await
            .map_err(|e| Error::Runtime(format!("context archiving aborted: {}", e)))??;

        let opts = BuildImageOptions {
            dockerfile: dockerfile.to_string(),
            t: tag.to_string(),
            rm: true,
            ..Default::default()
        };
        let mut stream = self.docker.build_image(opts, None, Some(body.into()));
        while let Some(step) = stream.next().await {
            let step = step?;
            if let Some(message) = step.error {
                return Err(Error::Runtime(format!("build of {} failed: {}", tag, message)));
            }
            if let Some(line) = step.stream {
                let line = line.trim_end();
                if !line.is_empty() {
                    debug!("build {}: {}", tag, line);
                }
            }
        }
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let port_key = format!("{}/tcp", spec.container_port);
        let port_bindings = HashMap::from([(
            port_key.clone(),
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: Some(spec.host_port.to_string()),
            }]),
        )]);
        let exposed_ports = HashMap::from([(port_key, HashMap::new())]);
        let mounts = spec
            .mounts
            .iter()
            .map(|m| Mount {
                target: Some(m.target.clone()),
                source: Some(m.source.clone()),
                typ: Some(MountTypeEnum::BIND),
                read_only: Some(m.read_only),
                ..Default::default()
            })
            .collect();

        let config = Config {
            image: Some(spec.image.clone()),
            env: Some(spec.env.clone()),
            exposed_ports: Some(exposed_ports),
            host_config: Some(HostConfig {
                mounts: Some(mounts),
                port_bindings: Some(port_bindings),
                ..Default::default()
            }),
            ..Default::default()
        };
        let opts = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let response = self.docker.create_container(Some(opts), config).await?;
        for warning in &response.warnings {
            debug!("create {}: {}", spec.name, warning);
        }
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        match self
            .docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(()) => Ok(()),
            // 304: already started
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => {
                debug!("Container {} already running", id);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        let opts = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.docker.remove_container(id, Some(opts)).await?;
        Ok(())
    }

    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerHandle>> {
        let opts = ListContainersOptions::<String> {
            all,
            ..Default::default()
        };
        let containers = self.docker.list_containers(Some(opts)).await?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                let id = c.id?;
                let name = c
                    .names
                    .as_ref()
                    .and_then(|n| n.first())
                    .map(|n| normalize_container_name(n).to_string())
                    .unwrap_or_else(|| id.clone());
                let networks = c
                    .network_settings
                    .and_then(|s| s.networks)
                    .map(|n| n.into_keys().collect())
                    .unwrap_or_default();
                Some(ContainerHandle {
                    id,
                    name,
                    state: c.state.unwrap_or_default(),
                    status: c.status.unwrap_or_default(),
                    networks,
                })
            })
            .collect())
    }

    async fn list_networks(&self) -> Result<Vec<NetworkInfo>> {
        let networks = self
            .docker
            .list_networks(None::<ListNetworksOptions<String>>)
            .await?;
        Ok(networks
            .into_iter()
            .filter_map(|n| {
                Some(NetworkInfo {
                    id: n.id?,
                    name: n.name?,
                })
            })
            .collect())
    }

    async fn connect_network(&self, network_id: &str, container_id: &str) -> Result<()> {
        let opts = ConnectNetworkOptions {
            container: container_id.to_string(),
            endpoint_config: EndpointSettings::default(),
        };
        self.docker.connect_network(network_id, opts).await?;
        Ok(())
    }
}
