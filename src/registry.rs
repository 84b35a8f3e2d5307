//! Persisted server records.
//!
//! [`Registry`] is the capability the orchestrator consumes. [`JsonRegistry`]
//! keeps the table in memory and, when opened on a path, rewrites a JSON
//! snapshot after every mutation (temp file, then rename, so a crash never
//! leaves a half-written table behind).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::types::{NewServer, ServerRecord};

#[async_trait]
pub trait Registry: Send + Sync {
    async fn find_by_id(&self, id: u64) -> Result<Option<ServerRecord>>;

    async fn find_by_container_name(&self, container_name: &str) -> Result<Option<ServerRecord>>;

    /// Inserts a record under the next sequence id. Container names are
    /// unique; a duplicate yields `Error::Conflict`.
    async fn create(&self, server: NewServer) -> Result<ServerRecord>;

    async fn save(&self, record: &ServerRecord) -> Result<()>;

    async fn delete(&self, id: u64) -> Result<()>;

    /// Most recently inserted record (highest id).
    async fn last(&self) -> Result<Option<ServerRecord>>;

    /// Id the next `create` will hand out. Nothing is reserved, so a
    /// concurrent `create` can still take it first.
    async fn next_id(&self) -> Result<u64>;

    async fn all(&self) -> Result<Vec<ServerRecord>>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Table {
    /// Highest id ever handed out; ids are not reused after deletion.
    sequence: u64,
    records: BTreeMap<u64, ServerRecord>,
}

#[derive(Debug, Default)]
pub struct JsonRegistry {
    path: Option<PathBuf>,
    table: RwLock<Table>,
}

impl JsonRegistry {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Loads the snapshot at `path`, starting empty when it does not exist.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let table = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<Table>(&bytes)
                .map_err(|e| Error::Registry(format!("{}: {}", path.display(), e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No registry at {}, starting empty", path.display());
                Table::default()
            }
            Err(e) => return Err(Error::Registry(format!("{}: {}", path.display(), e))),
        };
        info!(
            "Registry opened with {} records ({})",
            table.records.len(),
            path.display()
        );
        Ok(Self {
            path: Some(path),
            table: RwLock::new(table),
        })
    }

    async fn flush(&self, table: &Table) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let bytes = serde_json::to_vec_pretty(table)?;
        write_atomic(path, &bytes)
            .await
            .map_err(|e| Error::Registry(format!("{}: {}", path.display(), e)))
    }

    /// Replaces `table` with `next` once the snapshot holds it.
    async fn commit(&self, table: &mut Table, next: Table) -> Result<()> {
        self.flush(&next).await?;
        *table = next;
        Ok(())
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await
}

#[async_trait]
impl Registry for JsonRegistry {
    async fn find_by_id(&self, id: u64) -> Result<Option<ServerRecord>> {
        Ok(self.table.read().await.records.get(&id).cloned())
    }

    async fn find_by_container_name(&self, container_name: &str) -> Result<Option<ServerRecord>> {
        let table = self.table.read().await;
        Ok(table
            .records
            .values()
            .find(|r| r.container_name == container_name)
            .cloned())
    }

    async fn create(&self, server: NewServer) -> Result<ServerRecord> {
        let mut table = self.table.write().await;
        if table
            .records
            .values()
            .any(|r| r.container_name == server.container_name)
        {
            return Err(Error::Conflict(format!(
                "record for container {} already exists",
                server.container_name
            )));
        }
        let mut next = table.clone();
        next.sequence += 1;
        let record = server.into_record(next.sequence, Utc::now());
        next.records.insert(record.id, record.clone());
        self.commit(&mut table, next).await?;
        debug!("Created record {} ({})", record.id, record.container_name);
        Ok(record)
    }

    async fn save(&self, record: &ServerRecord) -> Result<()> {
        let mut table = self.table.write().await;
        if !table.records.contains_key(&record.id) {
            return Err(Error::not_found("server", record.id.to_string()));
        }
        if table
            .records
            .values()
            .any(|r| r.id != record.id && r.container_name == record.container_name)
        {
            return Err(Error::Conflict(format!(
                "container name {} is taken",
                record.container_name
            )));
        }
        let mut next = table.clone();
        next.sequence = next.sequence.max(record.id);
        next.records.insert(record.id, record.clone());
        self.commit(&mut table, next).await
    }

    async fn delete(&self, id: u64) -> Result<()> {
        let mut table = self.table.write().await;
        let mut next = table.clone();
        if next.records.remove(&id).is_none() {
            return Err(Error::not_found("server", id.to_string()));
        }
        self.commit(&mut table, next).await
    }

    async fn last(&self) -> Result<Option<ServerRecord>> {
        let table = self.table.read().await;
        Ok(table.records.values().next_back().cloned())
    }

    async fn next_id(&self) -> Result<u64> {
        Ok(self.table.read().await.sequence + 1)
    }

    async fn all(&self) -> Result<Vec<ServerRecord>> {
        Ok(self.table.read().await.records.values().cloned().collect())
    }
}
