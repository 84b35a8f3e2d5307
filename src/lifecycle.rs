//! Container lifecycle for a single server.
//!
//! A server moves `Absent -> Created -> Attached -> Running`: the container
//! is created with its data bind mount and port binding, attached to the
//! orchestration network, then started. Nothing is written to the registry
//! until the container runs, so a failed attempt never leaves a record.
//! What it may leave is a container: after `Created`, a failure triggers a
//! forced removal, and a removal that fails is remembered as an [`Orphan`].
//! A create call that errors or times out may still have produced the
//! container, so that case is looked up by name and removed the same way.
//!
//! There is no per-server lock. Two attempts racing for one container name
//! are settled by the runtime's name uniqueness; the loser gets
//! `Error::Conflict` and the winner's container is left untouched.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::broker::{Broker, SERVERS_ADDED};
use crate::config::{BindMode, Config, PlatformConfig};
use crate::error::{Error, Result};
use crate::network::NetworkAttacher;
use crate::ports::PortAllocator;
use crate::registry::Registry;
use crate::runtime::ContainerRuntime;
use crate::templates::{self, TemplateImporter, DOCKERFILE};
use crate::types::{
    ContainerHandle, ContainerSpec, MountSpec, NewServer, ServerAdded, ServerRecord,
    ServerStatus, Template,
};

#[derive(Debug, Clone)]
pub struct ProvisionSettings {
    pub image: String,
    pub templates_dir: PathBuf,
    pub network_name: String,
    pub data_root: PathBuf,
    pub local_data_root: PathBuf,
    pub container_data_path: String,
    pub service_port: u16,
    pub timeout: Duration,
    pub region: String,
    pub bind_mode: BindMode,
    pub port_span: u16,
    pub default_env: HashMap<String, String>,
    pub platform: PlatformConfig,
}

impl ProvisionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            image: config.server_image.clone(),
            templates_dir: config.templates_dir.clone(),
            network_name: config.network_name.clone(),
            data_root: config.data_root.clone(),
            local_data_root: config.local_data_root().clone(),
            container_data_path: config.container_data_path.clone(),
            service_port: config.service_port,
            timeout: config.provision_timeout(),
            region: config.default_region.clone(),
            bind_mode: config.bind_mode,
            port_span: config.port_span,
            default_env: config.default_env.clone(),
            platform: config.platform.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleState {
    Absent,
    /// Create was requested but never confirmed.
    Creating,
    Created { id: String },
    Attached { id: String },
    Running { id: String },
}

impl LifecycleState {
    pub fn container_id(&self) -> Option<&str> {
        match self {
            LifecycleState::Absent | LifecycleState::Creating => None,
            LifecycleState::Created { id }
            | LifecycleState::Attached { id }
            | LifecycleState::Running { id } => Some(id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciled {
    /// The container existed and is now attached and running.
    Started,
    /// The container was missing and has been recreated from its record.
    Provisioned(ServerRecord),
}

/// A container left behind by a failed attempt that could not be removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Orphan {
    pub container_name: String,
    /// `None` when the container could not even be looked up.
    pub container_id: Option<String>,
    pub state: LifecycleState,
    pub since: DateTime<Utc>,
}

/// Wall-clock allowance for one provisioning attempt.
struct Budget {
    started: Instant,
    deadline: Instant,
}

impl Budget {
    fn new(timeout: Duration) -> Self {
        let started = Instant::now();
        Self {
            started,
            deadline: started + timeout,
        }
    }

    async fn run<T>(&self, container: &str, step: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout_at(self.deadline, step)
            .await
            .map_err(|_| Error::Timeout {
                container: container.to_string(),
                elapsed: self.started.elapsed(),
            })?
    }
}

pub struct LifecycleManager {
    runtime: Arc<dyn ContainerRuntime>,
    registry: Arc<dyn Registry>,
    broker: Arc<dyn Broker>,
    network: NetworkAttacher,
    templates: TemplateImporter,
    ports: PortAllocator,
    settings: ProvisionSettings,
    orphans: Mutex<Vec<Orphan>>,
}

impl LifecycleManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        registry: Arc<dyn Registry>,
        broker: Arc<dyn Broker>,
        settings: ProvisionSettings,
    ) -> Self {
        Self {
            network: NetworkAttacher::new(runtime.clone(), settings.network_name.clone()),
            templates: TemplateImporter::new(settings.templates_dir.clone()),
            ports: PortAllocator::new(settings.port_span),
            runtime,
            registry,
            broker,
            settings,
            orphans: Mutex::new(Vec::new()),
        }
    }

    pub fn registry(&self) -> &Arc<dyn Registry> {
        &self.registry
    }

    pub fn templates(&self) -> &TemplateImporter {
        &self.templates
    }

    /// Configured defaults, then the template env, then the platform
    /// variables every server needs. Later layers win.
    pub fn environment(&self, record: &ServerRecord, template: &Template) -> Vec<String> {
        let platform = &self.settings.platform;
        let mut env: HashMap<String, String> = self.settings.default_env.clone();
        env.extend(template.env.clone());
        env.extend([
            ("API_HOST".to_string(), platform.api_host.clone()),
            ("API_PORT".to_string(), platform.api_port.to_string()),
            ("API_KEY".to_string(), platform.api_key.clone()),
            ("DATABASE_DSN".to_string(), platform.database_dsn.clone()),
            ("REDIS_ADDRESS".to_string(), platform.broker_address.clone()),
            ("REDIS_PASSWORD".to_string(), platform.broker_password.clone()),
            ("SERVER_ID".to_string(), record.id.to_string()),
            ("SERVER_CONTAINER".to_string(), record.container_name.clone()),
        ]);

        let mut pairs: Vec<String> = env.into_iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        pairs.sort();
        pairs
    }

    /// Runs the create/attach/start sequence for `record`. The registry is
    /// not touched.
    pub async fn provision(
        &self,
        record: &ServerRecord,
        template: &Template,
    ) -> Result<ContainerHandle> {
        info!(
            "Creating container for server {} ({}) on port {}",
            record.name, record.container_name, record.port
        );
        let budget = Budget::new(self.settings.timeout);
        let mut state = LifecycleState::Absent;

        match self.advance(&mut state, &budget, record, template).await {
            Ok(handle) => Ok(handle),
            Err(e) => {
                error!(
                    "Provisioning {} failed in state {:?}: {}",
                    record.container_name, state, e
                );
                self.compensate(&record.container_name, state).await;
                Err(e)
            }
        }
    }

    async fn advance(
        &self,
        state: &mut LifecycleState,
        budget: &Budget,
        record: &ServerRecord,
        template: &Template,
    ) -> Result<ContainerHandle> {
        let name = record.container_name.as_str();

        let image = budget.run(name, self.ensure_image(template)).await?;
        let spec = self.container_spec(record, template, image).await?;

        let id = match budget.run(name, self.runtime.create_container(&spec)).await {
            Ok(id) => id,
            // The name belongs to someone else's container.
            Err(e @ Error::Conflict(_)) => return Err(e),
            Err(e) => {
                *state = LifecycleState::Creating;
                return Err(e);
            }
        };
        info!("Container created: {} ({})", name, id);
        *state = LifecycleState::Created { id: id.clone() };

        budget.run(name, self.network.attach(&id)).await?;
        *state = LifecycleState::Attached { id: id.clone() };

        budget.run(name, self.runtime.start_container(&id)).await?;
        info!("Container started: {} ({})", name, id);
        *state = LifecycleState::Running { id: id.clone() };

        Ok(ContainerHandle {
            id,
            name: name.to_string(),
            state: "running".to_string(),
            status: String::new(),
            networks: vec![self.network.network_name().to_string()],
        })
    }

    async fn ensure_image(&self, template: &Template) -> Result<String> {
        match &template.dockerfile {
            Some(_) => {
                let tag = format!("berth/{}", template.folder.to_lowercase());
                self.runtime
                    .build_image(&template.dir, DOCKERFILE, &tag)
                    .await?;
                Ok(tag)
            }
            None => {
                self.runtime.pull_image(&self.settings.image).await?;
                Ok(self.settings.image.clone())
            }
        }
    }

    /// Also prepares the server's data directory and seeds it from the
    /// template's folders.
    async fn container_spec(
        &self,
        record: &ServerRecord,
        template: &Template,
        image: String,
    ) -> Result<ContainerSpec> {
        let local_dir = self
            .settings
            .local_data_root
            .join("servers")
            .join(&record.container_name);
        tokio::fs::create_dir_all(&local_dir).await?;
        {
            let template = template.clone();
            let local_dir = local_dir.clone();
            tokio::task::spawn_blocking(move || templates::seed_folders(&template, &local_dir))
                .await
                .map_err(|e| Error::Runtime(format!("seeding aborted: {}", e)))??;
        }

        let data_dir = self
            .settings
            .data_root
            .join("servers")
            .join(&record.container_name);
        let mut mounts = vec![MountSpec {
            source: data_dir.display().to_string(),
            target: self.settings.container_data_path.clone(),
            read_only: false,
        }];
        for raw in &template.mounts {
            match serde_json::from_value::<MountSpec>(raw.clone()) {
                Ok(mount) => mounts.push(mount),
                Err(e) => warn!(
                    "Ignoring mount {} in template {}: {}",
                    raw, template.folder, e
                ),
            }
        }

        Ok(ContainerSpec {
            name: record.container_name.clone(),
            image,
            env: self.environment(record, template),
            mounts,
            container_port: self.settings.service_port,
            host_port: record.port,
        })
    }

    /// Removes whatever a failed attempt left behind. Runs on a fresh
    /// deadline so a hung runtime cannot stall the caller.
    async fn compensate(&self, container_name: &str, state: LifecycleState) {
        let budget = Budget::new(self.settings.timeout);
        let id = match &state {
            LifecycleState::Absent => return,
            LifecycleState::Creating => {
                match budget.run(container_name, self.find_container(container_name)).await {
                    Ok(Some(container)) => container.id,
                    Ok(None) => return,
                    Err(e) => {
                        error!("Could not look up {} after failed create: {}", container_name, e);
                        self.track_orphan(container_name, None, state.clone()).await;
                        return;
                    }
                }
            }
            LifecycleState::Created { id }
            | LifecycleState::Attached { id }
            | LifecycleState::Running { id } => id.clone(),
        };

        warn!("Removing partially provisioned container {} ({})", container_name, id);
        match budget
            .run(container_name, self.runtime.remove_container(&id))
            .await
        {
            Ok(()) => info!("Removed container {}", id),
            Err(e) => {
                error!("Could not remove {} ({}): {}", container_name, id, e);
                self.track_orphan(container_name, Some(id), state).await;
            }
        }
    }

    async fn track_orphan(
        &self,
        container_name: &str,
        container_id: Option<String>,
        state: LifecycleState,
    ) {
        self.orphans.lock().await.push(Orphan {
            container_name: container_name.to_string(),
            container_id,
            state,
            since: Utc::now(),
        });
    }

    /// Provisions a server that has no record yet, then persists it and
    /// announces it on `servers:added`.
    pub async fn provision_new(&self, template: &Template) -> Result<ServerRecord> {
        if self
            .registry
            .find_by_container_name(&template.folder)
            .await?
            .is_some()
        {
            return Err(Error::Conflict(format!(
                "server {} is already registered",
                template.folder
            )));
        }

        let last_id = self.registry.last().await?.map(|r| r.id).unwrap_or(0);
        let in_use: HashSet<u16> = self
            .registry
            .all()
            .await?
            .into_iter()
            .map(|r| r.port)
            .collect();
        let port = self.ports.next(last_id, &in_use)?;

        let server = NewServer {
            name: template.name.clone(),
            container_name: template.folder.clone(),
            ip: match self.settings.bind_mode {
                BindMode::Internal => template.folder.clone(),
                BindMode::Wildcard => "0.0.0.0".to_string(),
            },
            region: self.settings.region.clone(),
            port,
        };
        let server_id = self.registry.next_id().await?;
        let provisional = server.clone().into_record(server_id, Utc::now());
        info!(
            "Generating server {} with port {}",
            provisional.container_name, port
        );

        self.provision(&provisional, template).await?;

        let record = self.registry.create(server).await?;
        if record.id != provisional.id {
            warn!(
                "Server {} was started with SERVER_ID={} but registered as {}",
                record.container_name, provisional.id, record.id
            );
        }
        self.announce(record.id).await;
        Ok(record)
    }

    /// Converges one server: starts its container if it exists, otherwise
    /// recreates it from its record and template.
    pub async fn reconcile(&self, container_name: &str) -> Result<Reconciled> {
        if let Some(container) = self.find_container(container_name).await? {
            let budget = Budget::new(self.settings.timeout);
            if self.network.is_attached(&container) {
                debug!("{} already on {}", container_name, self.network.network_name());
            } else {
                budget
                    .run(container_name, self.network.attach(&container.id))
                    .await?;
            }
            if container.is_running() {
                debug!("{} already running", container_name);
            } else {
                budget
                    .run(container_name, self.runtime.start_container(&container.id))
                    .await?;
            }
            info!("Reconciled existing container {}", container_name);
            return Ok(Reconciled::Started);
        }

        let record = self
            .registry
            .find_by_container_name(container_name)
            .await?
            .ok_or_else(|| Error::not_found("server record", container_name))?;
        let template = self.templates.load(container_name)?;

        self.provision(&record, &template).await?;
        self.announce(record.id).await;
        Ok(Reconciled::Provisioned(record))
    }

    async fn announce(&self, server_id: u64) {
        let payload = match serde_json::to_vec(&ServerAdded { server_id }) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Error marshalling server added notification: {}", e);
                return;
            }
        };
        if let Err(e) = self.broker.publish(SERVERS_ADDED, payload).await {
            error!("Failed to announce server {}: {}", server_id, e);
        }
    }

    async fn find_container(&self, container_name: &str) -> Result<Option<ContainerHandle>> {
        Ok(self
            .runtime
            .list_containers(true)
            .await?
            .into_iter()
            .find(|c| c.name == container_name))
    }

    pub async fn status(&self, container_name: &str) -> Result<ServerStatus> {
        Ok(match self.find_container(container_name).await? {
            Some(c) => ServerStatus::Online {
                state: c.state,
                health: c.status,
            },
            None => ServerStatus::Offline,
        })
    }

    /// Every registered server with its observed status. Containers without
    /// a record do not appear.
    pub async fn overview(&self) -> Result<Vec<(ServerRecord, ServerStatus)>> {
        let containers = self.runtime.list_containers(true).await?;
        let records = self.registry.all().await?;
        Ok(records
            .into_iter()
            .map(|record| {
                let status = containers
                    .iter()
                    .find(|c| c.name == record.container_name)
                    .map(|c| ServerStatus::Online {
                        state: c.state.clone(),
                        health: c.status.clone(),
                    })
                    .unwrap_or(ServerStatus::Offline);
                (record, status)
            })
            .collect())
    }

    pub async fn orphans(&self) -> Vec<Orphan> {
        self.orphans.lock().await.clone()
    }

    /// Retries removal of recorded orphans; returns how many went away.
    pub async fn cleanup_orphans(&self) -> usize {
        let pending = std::mem::take(&mut *self.orphans.lock().await);
        let mut removed = 0;
        let mut remaining = Vec::new();
        for orphan in pending {
            match self.remove_orphan(&orphan).await {
                Ok(()) | Err(Error::NotFound { .. }) => {
                    info!("Cleaned up orphan {}", orphan.container_name);
                    removed += 1;
                }
                Err(e) => {
                    warn!("Orphan {} still present: {}", orphan.container_name, e);
                    remaining.push(orphan);
                }
            }
        }
        self.orphans.lock().await.extend(remaining);
        removed
    }

    async fn remove_orphan(&self, orphan: &Orphan) -> Result<()> {
        let name = orphan.container_name.as_str();
        let budget = Budget::new(self.settings.timeout);
        let id = match &orphan.container_id {
            Some(id) => id.clone(),
            None => {
                // A registered server adopts its container on reconcile.
                if self.registry.find_by_container_name(name).await?.is_some() {
                    return Ok(());
                }
                match budget.run(name, self.find_container(name)).await? {
                    Some(container) => container.id,
                    None => return Ok(()),
                }
            }
        };
        budget.run(name, self.runtime.remove_container(&id)).await
    }
}
