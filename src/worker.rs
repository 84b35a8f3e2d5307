//! Dedicated provisioning task.
//!
//! Provisioning blocks on image pulls and container calls for minutes at a
//! time, so it never runs on a caller's path: jobs are queued on a bounded
//! channel and executed one after another by a single task.

use std::sync::Arc;

use log::{error, info};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::lifecycle::{LifecycleManager, Reconciled};
use crate::scan::{ReconciliationScan, ScanReport};
use crate::types::ServerRecord;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Job {
    Scan,
    /// Fresh provisioning from the template directory named `template`.
    Provision { template: String },
    Reconcile { container_name: String },
    /// Retries removal of containers failed attempts left behind.
    CleanupOrphans,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Scanned(ScanReport),
    Provisioned(ServerRecord),
    Reconciled(Reconciled),
    CleanedUp(usize),
}

type Envelope = (Job, Option<oneshot::Sender<Result<JobOutcome>>>);

#[derive(Clone)]
pub struct WorkerHandle {
    tx: mpsc::Sender<Envelope>,
}

impl WorkerHandle {
    /// Queues a job whose outcome is only logged.
    pub async fn submit(&self, job: Job) -> Result<()> {
        self.tx.send((job, None)).await.map_err(|_| worker_gone())
    }

    /// Queues a job and waits for its outcome.
    pub async fn request(&self, job: Job) -> Result<JobOutcome> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send((job, Some(reply_tx)))
            .await
            .map_err(|_| worker_gone())?;
        reply_rx.await.map_err(|_| worker_gone())?
    }
}

fn worker_gone() -> Error {
    Error::Runtime("provision worker has stopped".to_string())
}

pub struct ProvisionWorker {
    manager: Arc<LifecycleManager>,
    scan: ReconciliationScan,
}

impl ProvisionWorker {
    pub fn new(manager: Arc<LifecycleManager>) -> Self {
        Self {
            scan: ReconciliationScan::new(manager.clone()),
            manager,
        }
    }

    pub fn spawn(self, capacity: usize) -> (WorkerHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity);
        let handle = tokio::spawn(self.run(rx));
        (WorkerHandle { tx }, handle)
    }

    async fn run(self, mut rx: mpsc::Receiver<Envelope>) {
        while let Some((job, reply)) = rx.recv().await {
            info!("Running job {:?}", job);
            let outcome = self.execute(job.clone()).await;
            match reply {
                Some(reply) => {
                    // The requester may have given up waiting.
                    let _ = reply.send(outcome);
                }
                None => match outcome {
                    Ok(done) => info!("Job {:?} finished: {:?}", job, done),
                    Err(e) => error!("Job {:?} failed: {}", job, e),
                },
            }
        }
        info!("Provision queue closed, shutting down");
    }

    async fn execute(&self, job: Job) -> Result<JobOutcome> {
        match job {
            Job::Scan => self
                .scan
                .run(self.manager.templates().dir())
                .await
                .map(JobOutcome::Scanned),
            Job::Provision { template } => {
                let template = self.manager.templates().load(&template)?;
                self.manager
                    .provision_new(&template)
                    .await
                    .map(JobOutcome::Provisioned)
            }
            Job::Reconcile { container_name } => self
                .manager
                .reconcile(&container_name)
                .await
                .map(JobOutcome::Reconciled),
            Job::CleanupOrphans => Ok(JobOutcome::CleanedUp(self.manager.cleanup_orphans().await)),
        }
    }
}
