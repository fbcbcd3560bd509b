//! Backup run: every configured container through archive, upload and retention.
//!
//! Containers are processed one at a time in plan order. A container that
//! fails takes its dependents down with it; unrelated containers still run.

use crate::archive::{archive_sources, Archiver};
use crate::catalog::backup_file_name;
use crate::config::{Config, ContainerConfig};
use crate::docker::{ContainerControl, VolumeInspector};
use crate::plan::ExecutionPlan;
use crate::remote::{join_remote_path, RemoteStorage};
use crate::retention::{apply_retention, RetentionPolicy, RetentionSummary};
use crate::upload::{UploadOutcome, Uploader};
use crate::utils::{Result, VolbackError};
use chrono::Local;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Prefix of per-container working directories.
pub const WORK_DIR_PREFIX: &str = "volback-";

/// Working directories older than this are removed at start-up.
pub const STALE_WORK_DIR_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// External capabilities a run needs.
pub struct Collaborators<'a> {
    pub storage: &'a dyn RemoteStorage,
    pub inspector: &'a dyn VolumeInspector,
    pub control: &'a dyn ContainerControl,
    pub archiver: &'a dyn Archiver,
}

#[derive(Debug, Clone)]
pub struct RunSettings {
    /// Remote folder prefix
    pub destination: String,
    pub policy: RetentionPolicy,
    pub retention_best_effort: bool,
    pub chunk_size: u64,
    pub temp_root: PathBuf,
}

impl RunSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            destination: config.dropbox.path.clone(),
            policy: config.retention.policy,
            retention_best_effort: config.retention.best_effort,
            chunk_size: config.upload.chunk_size,
            temp_root: config.work.temp_dir.clone(),
        }
    }
}

#[derive(Debug)]
pub enum ContainerOutcome {
    Succeeded {
        remote_path: String,
        upload: UploadOutcome,
        /// `None` when retention is disabled or failed in best-effort mode
        retention: Option<RetentionSummary>,
    },
    Failed(String),
    Skipped {
        failed_dependency: String,
    },
    Cancelled,
}

impl ContainerOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ContainerOutcome::Succeeded { .. })
    }
}

#[derive(Debug, Default)]
pub struct RunReport {
    pub outcomes: Vec<(String, ContainerOutcome)>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(|(_, o)| o.is_success())
    }

    pub fn outcome(&self, container: &str) -> Option<&ContainerOutcome> {
        self.outcomes
            .iter()
            .find(|(name, _)| name == container)
            .map(|(_, o)| o)
    }

    pub fn failures(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| !o.is_success())
            .count()
    }
}

pub struct Runner<'a> {
    deps: Collaborators<'a>,
    settings: RunSettings,
    cancel: CancellationToken,
}

impl<'a> Runner<'a> {
    pub fn new(deps: Collaborators<'a>, settings: RunSettings, cancel: CancellationToken) -> Self {
        Self {
            deps,
            settings,
            cancel,
        }
    }

    /// Process every container of `plan`, in order.
    pub async fn run(&self, plan: &ExecutionPlan) -> RunReport {
        info!("Found {} containers to process", plan.len());

        let mut report = RunReport::default();
        let mut unhealthy: HashSet<String> = HashSet::new();

        for config in plan.order() {
            let name = config.container.clone();

            let outcome = if self.cancel.is_cancelled() {
                ContainerOutcome::Cancelled
            } else if let Some(dep) = config.depends_on.iter().find(|d| unhealthy.contains(*d)) {
                warn!(
                    container = %name,
                    dependency = %dep,
                    "Skipping container: dependency did not complete"
                );
                ContainerOutcome::Skipped {
                    failed_dependency: dep.clone(),
                }
            } else {
                info!(container = %name, "Processing container");
                match self.run_container(config).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        error!(container = %name, error = %e, "Container backup failed");
                        ContainerOutcome::Failed(e.to_string())
                    }
                }
            };

            if !outcome.is_success() {
                unhealthy.insert(name.clone());
            }
            report.outcomes.push((name, outcome));
        }

        report
    }

    async fn run_container(&self, config: &ContainerConfig) -> Result<ContainerOutcome> {
        let work_dir = self.settings.temp_root.join(format!(
            "{}{}-{}",
            WORK_DIR_PREFIX,
            config.container,
            Local::now().format("%Y%m%d%H%M%S")
        ));
        tokio::fs::create_dir_all(&work_dir).await?;

        let result = self.backup_container(config, &work_dir).await;

        info!("Cleaning up temporary directory: {}", work_dir.display());
        if let Err(e) = tokio::fs::remove_dir_all(&work_dir).await {
            warn!(
                "Failed to remove temporary directory {}: {}",
                work_dir.display(),
                e
            );
        }

        result
    }

    async fn backup_container(
        &self,
        config: &ContainerConfig,
        work_dir: &Path,
    ) -> Result<ContainerOutcome> {
        let name = config.container.as_str();

        if config.stop {
            self.deps.control.stop(name).await?;
        }

        let archived = self.archive_volumes(name, work_dir).await;

        // Bring the container back even if archiving failed
        if config.stop {
            if let Err(e) = self.deps.control.start(name).await {
                if archived.is_ok() {
                    return Err(e);
                }
                error!(container = %name, error = %e, "Failed to restart container");
            }
        }
        let archive = archived?;

        if self.cancel.is_cancelled() {
            return Err(VolbackError::Cancelled);
        }

        let remote_path = join_remote_path(&[
            &self.settings.destination,
            config.backup_id(),
            &backup_file_name(&Local::now()),
        ]);
        info!("Uploading to Dropbox: {}", remote_path);

        let chunk_size = self.settings.chunk_size;
        let uploader = Uploader::with_cancel(self.deps.storage, chunk_size, self.cancel.clone());
        let upload = uploader.upload(&archive, &remote_path).await?;
        info!("Backup successfully uploaded to Dropbox");

        let retention = self.prune(config).await?;

        Ok(ContainerOutcome::Succeeded {
            remote_path,
            upload,
            retention,
        })
    }

    async fn archive_volumes(&self, name: &str, work_dir: &Path) -> Result<PathBuf> {
        let volumes = self.deps.inspector.volumes(name).await?.into_volumes()?;
        let sources = archive_sources(&volumes);
        info!(container = %name, "Archiving {} of {} volumes", sources.len(), volumes.len());
        self.deps.archiver.run(name, &sources, work_dir).await
    }

    async fn prune(&self, config: &ContainerConfig) -> Result<Option<RetentionSummary>> {
        if !self.settings.policy.is_enabled() {
            return Ok(None);
        }

        let folder = join_remote_path(&[&self.settings.destination, config.backup_id()]);
        let policy = &self.settings.policy;
        match apply_retention(self.deps.storage, &folder, policy).await {
            Ok(summary) => {
                if !summary.is_complete() {
                    warn!(
                        container = %config.container,
                        "Retention left {} backups that could not be deleted",
                        summary.failed
                    );
                }
                Ok(Some(summary))
            }
            Err(e) if self.settings.retention_best_effort => {
                warn!(container = %config.container, error = %e, "Retention management failed");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

/// Remove `volback-*` directories under `root` not modified within `max_age`.
pub fn cleanup_stale_work_dirs(root: &Path, max_age: Duration) -> Result<usize> {
    let mut removed = 0;

    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        let name = entry.file_name();
        if !name.to_string_lossy().starts_with(WORK_DIR_PREFIX) {
            continue;
        }
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        if !metadata.is_dir() {
            continue;
        }
        let age = metadata
            .modified()
            .ok()
            .and_then(|m| m.elapsed().ok())
            .unwrap_or_default();
        if age >= max_age {
            let path = entry.path();
            info!("Cleaning up old temporary directory: {}", path.display());
            match std::fs::remove_dir_all(&path) {
                Ok(()) => removed += 1,
                Err(e) => warn!(
                    "Failed to remove old temporary directory {}: {}",
                    path.display(),
                    e
                ),
            }
        }
    }

    Ok(removed)
}
