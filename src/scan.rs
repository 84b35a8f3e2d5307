//! Startup reconciliation over the preloaded templates.

use std::path::Path;
use std::sync::Arc;

use log::{error, info};

use crate::error::Result;
use crate::lifecycle::{LifecycleManager, Reconciled};
use crate::templates::TemplateImporter;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    /// Existing containers that were (re)started.
    pub started: Vec<String>,
    /// Containers created during the scan, with or without a prior record.
    pub provisioned: Vec<String>,
    pub failed: Vec<String>,
    /// Orphans from earlier attempts removed before the pass.
    pub orphans_removed: usize,
}

pub struct ReconciliationScan {
    manager: Arc<LifecycleManager>,
}

impl ReconciliationScan {
    pub fn new(manager: Arc<LifecycleManager>) -> Self {
        Self { manager }
    }

    /// Walks every template in order. A registered server is reconciled,
    /// anything else is provisioned fresh. One template failing never stops
    /// the others; only an unreadable templates directory is an error.
    pub async fn run(&self, templates_dir: &Path) -> Result<ScanReport> {
        info!("Preloading servers from {}", templates_dir.display());
        let mut report = ScanReport {
            orphans_removed: self.manager.cleanup_orphans().await,
            ..Default::default()
        };

        for item in TemplateImporter::new(templates_dir).list()? {
            let template = match item {
                Ok(template) => template,
                Err(e) => {
                    error!("Skipping template: {}", e);
                    continue;
                }
            };
            let name = template.folder.clone();

            let registered = match self.manager.registry().find_by_container_name(&name).await {
                Ok(record) => record.is_some(),
                Err(e) => {
                    error!("Registry lookup for {} failed: {}", name, e);
                    report.failed.push(name);
                    continue;
                }
            };

            let outcome = if registered {
                self.manager.reconcile(&name).await
            } else {
                self.manager
                    .provision_new(&template)
                    .await
                    .map(Reconciled::Provisioned)
            };

            match outcome {
                Ok(Reconciled::Started) => report.started.push(name),
                Ok(Reconciled::Provisioned(_)) => report.provisioned.push(name),
                Err(e) => {
                    error!("Preloading server {} failed: {}", name, e);
                    report.failed.push(name);
                }
            }
        }

        info!(
            "Scan finished: {} started, {} provisioned, {} failed",
            report.started.len(),
            report.provisioned.len(),
            report.failed.len()
        );
        Ok(report)
    }
}
