//! Retention pass against a remote folder: list, classify, decide, delete.

use super::policy::{compute_keep_set, sort_newest_first, RetentionPolicy};
use crate::catalog;
use crate::remote::RemoteStorage;
use crate::utils::Result;
use tracing::{info, warn};

/// Outcome of one retention pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionSummary {
    pub kept: usize,
    pub deleted: usize,
    pub failed: usize,
    /// Listing entries whose names are not backup timestamps
    pub skipped: usize,
    pub failed_paths: Vec<String>,
}

impl RetentionSummary {
    pub fn is_complete(&self) -> bool {
        self.failed == 0
    }
}

/// Prune the archives directly under `folder` according to `policy`.
///
/// Only a failing listing is an error. Individual delete failures are logged,
/// counted and do not stop the remaining deletions.
pub async fn apply_retention(
    storage: &dyn RemoteStorage,
    folder: &str,
    policy: &RetentionPolicy,
) -> Result<RetentionSummary> {
    info!("Managing backup retention in {}", folder);

    let entries = storage.list(folder).await?;
    let paths: Vec<String> = entries.into_iter().map(|e| e.path).collect();
    let catalog = catalog::build(&paths);

    let mut summary = RetentionSummary {
        skipped: catalog.skipped.len(),
        ..Default::default()
    };

    let mut backups = catalog.backups;
    if backups.is_empty() {
        info!("No backups found to process");
        return Ok(summary);
    }

    sort_newest_first(&mut backups);
    let keep = compute_keep_set(&backups, policy);
    summary.kept = keep.len();

    for backup in &backups {
        if let Some(tier) = keep.tier_of(&backup.remote_path) {
            info!("Keeping {} backup: {}", tier, backup.remote_path);
            continue;
        }

        info!("Deleting old backup: {}", backup.remote_path);
        match storage.delete(&backup.remote_path).await {
            Ok(()) => summary.deleted += 1,
            Err(e) => {
                warn!("Failed to delete backup {}: {}", backup.remote_path, e);
                summary.failed += 1;
                summary.failed_paths.push(backup.remote_path.clone());
            }
        }
    }

    info!(
        kept = summary.kept,
        deleted = summary.deleted,
        failed = summary.failed,
        skipped = summary.skipped,
        "Retention management completed"
    );
    Ok(summary)
}
