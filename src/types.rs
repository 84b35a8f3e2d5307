//! Data structures used throughout the orchestrator.
//!
//! Records and notifications are serialised using
//! [`serde`](https://serde.rs/): `ServerRecord` is what the registry
//! persists, `ServerAdded` is broadcast on the broker whenever a container
//! has been freshly provisioned. `ContainerHandle` and `NetworkInfo` are
//! runtime-reported views and are never cached beyond a single operation.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A persisted game server.
///
/// `container_name` is the join key between the registry and the container
/// runtime's namespace; at most one container may carry a given name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerRecord {
    pub id: u64,
    pub name: String,
    pub container_name: String,
    pub ip: String,
    pub region: String,
    pub port: u16,
    pub created_at: DateTime<Utc>,
    pub last_ping: DateTime<Utc>,
}

/// A server about to be inserted. The registry assigns the id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewServer {
    pub name: String,
    pub container_name: String,
    pub ip: String,
    pub region: String,
    pub port: u16,
}

impl NewServer {
    pub fn into_record(self, id: u64, now: DateTime<Utc>) -> ServerRecord {
        ServerRecord {
            id,
            name: self.name,
            container_name: self.container_name,
            ip: self.ip,
            region: self.region,
            port: self.port,
            created_at: now,
            last_ping: now,
        }
    }
}

/// One preconfigured kind of server, read from a template directory.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    pub name: String,
    /// Directory name; doubles as the container name of servers built from it.
    pub folder: String,
    pub dir: PathBuf,
    pub env: HashMap<String, String>,
    /// Opaque descriptors; entries shaped like [`MountSpec`] become binds.
    pub mounts: Vec<serde_json::Value>,
    /// Template sub-directory -> path inside the server data directory.
    pub folders: HashMap<String, String>,
    pub dockerfile: Option<PathBuf>,
}

/// An extra bind mount requested by a template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountSpec {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub read_only: bool,
}

/// Everything the runtime needs to create one server container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// `KEY=value` pairs, already merged.
    pub env: Vec<String>,
    pub mounts: Vec<MountSpec>,
    /// Port inside the container, exposed as TCP.
    pub container_port: u16,
    pub host_port: u16,
}

/// Runtime-reported view of a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    pub id: String,
    /// Name without the leading `/` the runtime reports.
    pub name: String,
    pub state: String,
    pub status: String,
    pub networks: Vec<String>,
}

impl ContainerHandle {
    pub fn is_running(&self) -> bool {
        self.state == "running"
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInfo {
    pub id: String,
    pub name: String,
}

/// Published on `servers:added` once a container has been freshly provisioned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerAdded {
    pub server_id: u64,
}

/// Observed state of a server, derived from its record and the container list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ServerStatus {
    Online { state: String, health: String },
    Offline,
}

/// Strips the `/` prefix the runtime puts in front of container names.
pub fn normalize_container_name(raw: &str) -> &str {
    raw.trim_start_matches('/')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_added_wire_shape() {
        let json = serde_json::to_string(&ServerAdded { server_id: 7 }).unwrap();
        assert_eq!(json, r#"{"server_id":7}"#);
    }

    #[test]
    fn mount_spec_defaults_to_writable() {
        let spec: MountSpec =
            serde_json::from_str(r#"{"source":"/srv/maps","target":"/maps"}"#).unwrap();
        assert!(!spec.read_only);
    }

    #[test]
    fn offline_status_serialises_flat() {
        let json = serde_json::to_value(ServerStatus::Offline).unwrap();
        assert_eq!(json, serde_json::json!({"status": "offline"}));
    }
}
