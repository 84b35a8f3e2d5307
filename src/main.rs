//! Berth daemon entry point.

use std::sync::Arc;

use log::{error, info, warn};
use tokio::signal;

use berth::broker::{Broker, RedisBroker};
use berth::command::{CommandListener, IntegrityScheme};
use berth::config::Config;
use berth::lifecycle::{LifecycleManager, ProvisionSettings};
use berth::registry::{JsonRegistry, Registry};
use berth::runtime::{ContainerRuntime, DockerRuntime};
use berth::worker::{Job, ProvisionWorker};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    // Load configuration
    let cfg = Config::load()?;
    info!("Configuration loaded");

    // Registry and broker are required; without them there is nothing to run.
    let registry: Arc<dyn Registry> = match &cfg.registry_path {
        Some(path) => Arc::new(JsonRegistry::open(path).await?),
        None => {
            warn!("No registry_path configured, server records will not persist");
            Arc::new(JsonRegistry::in_memory())
        }
    };
    let broker: Arc<dyn Broker> = Arc::new(RedisBroker::connect(&cfg.broker.url).await?);
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerRuntime::connect().await?);

    let scheme = IntegrityScheme::from_secret(cfg.command_secret.as_deref())?;
    if !scheme.is_keyed() {
        warn!("No command_secret set: command tags are unkeyed and can be forged by anyone");
    }

    // Command listener
    let listener =
        CommandListener::new(broker.clone(), scheme).with_retry_delay(cfg.listener_retry());
    let pattern = cfg.command_pattern.clone();
    let listener_handle = tokio::spawn(async move { listener.listen(&pattern).await });

    // Provisioning worker, seeded with the startup scan
    let manager = Arc::new(LifecycleManager::new(
        runtime,
        registry,
        broker,
        ProvisionSettings::from_config(&cfg),
    ));
    let (worker, worker_handle) = ProvisionWorker::new(manager).spawn(64);
    worker.submit(Job::Scan).await?;

    // Periodic orphan cleanup
    let sweep_handle = cfg.orphan_sweep().map(|period| {
        let worker = worker.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = worker.submit(Job::CleanupOrphans).await {
                    error!("Orphan sweep stopped: {}", e);
                    break;
                }
            }
        })
    });

    // Graceful Shutdown
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received Ctrl+C, shutting down...");
        }
        Err(err) => {
            error!("Unable to listen for shutdown signal: {}", err);
        }
    }

    // Abort tasks
    listener_handle.abort();
    worker_handle.abort();
    if let Some(handle) = sweep_handle {
        handle.abort();
    }

    info!("Shutdown complete.");
    Ok(())
}
