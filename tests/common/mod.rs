#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tempfile::TempDir;

use berth::broker::{Broker, MemoryBroker, MessageStream, SERVERS_ADDED};
use berth::config::{BindMode, Config};
use berth::lifecycle::{LifecycleManager, ProvisionSettings};
use berth::registry::JsonRegistry;
use berth::runtime::ContainerRuntime;
use berth::types::{ContainerHandle, ContainerSpec, NetworkInfo, ServerAdded};
use berth::{Error, Result};

pub const NETWORK: &str = "berth-overlay";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Pull,
    Build,
    Create,
    Start,
    Remove,
    List,
    Connect,
}

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub id: String,
    pub spec: ContainerSpec,
    pub running: bool,
    pub networks: Vec<String>,
}

#[derive(Default)]
struct State {
    containers: Vec<FakeContainer>,
    networks: Vec<NetworkInfo>,
    next_id: u64,
    failing: HashSet<Op>,
    hanging: HashSet<Op>,
    stalling: HashSet<Op>,
    calls: HashMap<Op, usize>,
    builds: Vec<(String, String)>,
    pulls: Vec<String>,
}

/// In-memory container runtime with Docker's name-uniqueness rule and
/// per-operation failure injection.
pub struct FakeRuntime {
    state: Mutex<State>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        let state = State {
            networks: vec![
                NetworkInfo {
                    id: "net-bridge".into(),
                    name: "bridge".into(),
                },
                NetworkInfo {
                    id: "net-overlay".into(),
                    name: NETWORK.into(),
                },
            ],
            ..Default::default()
        };
        Self {
            state: Mutex::new(state),
        }
    }

    pub fn fail(&self, op: Op) {
        self.state.lock().unwrap().failing.insert(op);
    }

    pub fn heal(&self, op: Op) {
        let mut state = self.state.lock().unwrap();
        state.failing.remove(&op);
        state.hanging.remove(&op);
        state.stalling.remove(&op);
    }

    /// The operation never completes.
    pub fn hang(&self, op: Op) {
        self.state.lock().unwrap().hanging.insert(op);
    }

    /// The operation takes effect, but its reply never arrives.
    pub fn stall(&self, op: Op) {
        self.state.lock().unwrap().stalling.insert(op);
    }

    pub fn calls(&self, op: Op) -> usize {
        self.state.lock().unwrap().calls.get(&op).copied().unwrap_or(0)
    }

    pub fn containers(&self) -> Vec<FakeContainer> {
        self.state.lock().unwrap().containers.clone()
    }

    pub fn container(&self, name: &str) -> Option<FakeContainer> {
        self.containers().into_iter().find(|c| c.spec.name == name)
    }

    pub fn builds(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().builds.clone()
    }

    pub fn pulls(&self) -> Vec<String> {
        self.state.lock().unwrap().pulls.clone()
    }

    /// A container that exists without anything in the registry.
    pub fn insert_foreign(&self, name: &str, running: bool) {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = format!("c{}", state.next_id);
        state.containers.push(FakeContainer {
            id,
            spec: ContainerSpec {
                name: name.to_string(),
                image: "foreign".into(),
                env: Vec::new(),
                mounts: Vec::new(),
                container_port: 25565,
                host_port: 40000,
            },
            running,
            networks: Vec::new(),
        });
    }

    pub fn stop(&self, name: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(c) = state.containers.iter_mut().find(|c| c.spec.name == name) {
            c.running = false;
        }
    }

    pub fn detach(&self, name: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(c) = state.containers.iter_mut().find(|c| c.spec.name == name) {
            c.networks.clear();
        }
    }

    async fn enter(&self, op: Op) -> Result<()> {
        let hang = {
            let mut state = self.state.lock().unwrap();
            *state.calls.entry(op).or_default() += 1;
            if state.failing.contains(&op) {
                return Err(Error::Runtime(format!("injected {:?} failure", op)));
            }
            state.hanging.contains(&op)
        };
        if hang {
            std::future::pending::<()>().await;
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn pull_image(&self, image: &str) -> Result<()> {
        self.enter(Op::Pull).await?;
        self.state.lock().unwrap().pulls.push(image.to_string());
        Ok(())
    }

    async fn build_image(&self, context: &Path, dockerfile: &str, tag: &str) -> Result<()> {
        self.enter(Op::Build).await?;
        assert!(context.join(dockerfile).is_file());
        self.state
            .lock()
            .unwrap()
            .builds
            .push((tag.to_string(), dockerfile.to_string()));
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        self.enter(Op::Create).await?;
        let (id, stall) = {
            let mut state = self.state.lock().unwrap();
            if state.containers.iter().any(|c| c.spec.name == spec.name) {
                return Err(Error::Conflict(format!(
                    "container name \"/{}\" is already in use",
                    spec.name
                )));
            }
            state.next_id += 1;
            let id = format!("c{}", state.next_id);
            state.containers.push(FakeContainer {
                id: id.clone(),
                spec: spec.clone(),
                running: false,
                networks: Vec::new(),
            });
            (id, state.stalling.contains(&Op::Create))
        };
        if stall {
            std::future::pending::<()>().await;
        }
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.enter(Op::Start).await?;
        let mut state = self.state.lock().unwrap();
        let container = state
            .containers
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| Error::not_found("container", id))?;
        container.running = true;
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        self.enter(Op::Remove).await?;
        let mut state = self.state.lock().unwrap();
        let before = state.containers.len();
        state.containers.retain(|c| c.id != id);
        if state.containers.len() == before {
            return Err(Error::not_found("container", id));
        }
        Ok(())
    }

    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerHandle>> {
        self.enter(Op::List).await?;
        let state = self.state.lock().unwrap();
        Ok(state
            .containers
            .iter()
            .filter(|c| all || c.running)
            .map(|c| ContainerHandle {
                id: c.id.clone(),
                name: c.spec.name.clone(),
                state: if c.running { "running" } else { "created" }.to_string(),
                status: if c.running { "Up 1 second" } else { "Created" }.to_string(),
                networks: c.networks.clone(),
            })
            .collect())
    }

    async fn list_networks(&self) -> Result<Vec<NetworkInfo>> {
        Ok(self.state.lock().unwrap().networks.clone())
    }

    async fn connect_network(&self, network_id: &str, container_id: &str) -> Result<()> {
        self.enter(Op::Connect).await?;
        let mut state = self.state.lock().unwrap();
        let network = state
            .networks
            .iter()
            .find(|n| n.id == network_id)
            .map(|n| n.name.clone())
            .ok_or_else(|| Error::not_found("network", network_id))?;
        let container = state
            .containers
            .iter_mut()
            .find(|c| c.id == container_id)
            .ok_or_else(|| Error::not_found("container", container_id))?;
        if container.networks.contains(&network) {
            return Err(Error::Runtime(format!(
                "endpoint with name {} already exists in network {}",
                container.spec.name, network
            )));
        }
        container.networks.push(network);
        Ok(())
    }
}

pub struct Harness {
    pub runtime: Arc<FakeRuntime>,
    pub registry: Arc<JsonRegistry>,
    pub broker: Arc<MemoryBroker>,
    pub manager: Arc<LifecycleManager>,
    pub templates: TempDir,
    pub data: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(|_| {})
    }

    pub fn with(adjust: impl FnOnce(&mut ProvisionSettings)) -> Self {
        let templates = TempDir::new().unwrap();
        let data = TempDir::new().unwrap();

        let mut config = Config::default();
        config.templates_dir = templates.path().to_path_buf();
        config.data_root = "/srv/berth".into();
        config.local_data_root = Some(data.path().to_path_buf());
        config.network_name = NETWORK.into();
        config.bind_mode = BindMode::Internal;
        config.provision_timeout_secs = 5;
        config.platform.api_key = "k-test".into();
        let mut settings = ProvisionSettings::from_config(&config);
        adjust(&mut settings);

        let runtime = Arc::new(FakeRuntime::new());
        let registry = Arc::new(JsonRegistry::in_memory());
        let broker = Arc::new(MemoryBroker::default());
        let manager = Arc::new(LifecycleManager::new(
            runtime.clone(),
            registry.clone(),
            broker.clone(),
            settings,
        ));

        Self {
            runtime,
            registry,
            broker,
            manager,
            templates,
            data,
        }
    }

    pub fn add_template(&self, folder: &str, manifest: &str) -> std::path::PathBuf {
        let dir = self.templates.path().join(folder);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("template.json"), manifest).unwrap();
        dir
    }

    pub async fn added(&self) -> MessageStream {
        self.broker.subscribe(SERVERS_ADDED).await.unwrap()
    }
}

pub async fn next_added(stream: &mut MessageStream) -> ServerAdded {
    let msg = tokio::time::timeout(Duration::from_secs(1), stream.next())
        .await
        .expect("no servers:added notification")
        .expect("broker closed");
    serde_json::from_slice(&msg.payload).unwrap()
}

/// True when nothing arrives within a short grace period.
pub async fn nothing_added(stream: &mut MessageStream) -> bool {
    tokio::time::timeout(Duration::from_millis(50), stream.next())
        .await
        .is_err()
}

pub fn env_of(container: &FakeContainer) -> HashMap<String, String> {
    container
        .spec
        .env
        .iter()
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
