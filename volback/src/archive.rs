//! Volume archiving.
//!
//! `PackmateArchiver` runs the `dublok/packmate` image once per volume into a
//! staging directory, then once more to bundle the staging directory into the
//! final `<name>.7z`.

use crate::catalog::ARCHIVE_SUFFIX;
use crate::docker::{run_command, Volume};
use crate::utils::{Result, VolbackError};
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use std::path::{Path, PathBuf};
use tracing::info;

const PACKMATE_IMAGE: &str = "dublok/packmate:latest";
const STAGING_DIR: &str = "staging";

/// One volume to archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveSource {
    pub source: String,
    pub destination: String,
    pub kind: String,
}

/// Volumes worth archiving: tmpfs mounts and mounts without a host source are skipped.
pub fn archive_sources(volumes: &[Volume]) -> Vec<ArchiveSource> {
    volumes
        .iter()
        .filter(|v| {
            if v.kind == "tmpfs" {
                info!("Skipping tmpfs volume {}", v.destination);
                return false;
            }
            if v.source.is_empty() {
                info!("Skipping volume with empty source ({})", v.destination);
                return false;
            }
            true
        })
        .map(|v| ArchiveSource {
            source: v.source.clone(),
            destination: v.destination.clone(),
            kind: v.kind.clone(),
        })
        .collect()
}

/// Produces a single archive named `<name>.7z` in `output_dir` from `sources`.
#[async_trait]
pub trait Archiver: Send + Sync {
    async fn run(
        &self,
        name: &str,
        sources: &[ArchiveSource],
        output_dir: &Path,
    ) -> Result<PathBuf>;
}

/// Path of the final archive for `name` inside `output_dir`.
pub fn final_archive_path(output_dir: &Path, name: &str) -> PathBuf {
    output_dir.join(format!("{}{}", name, ARCHIVE_SUFFIX))
}

/// Per-volume archive name: the source path, base64-encoded so it is a flat file name.
pub fn volume_archive_name(source: &str) -> String {
    URL_SAFE.encode(source.as_bytes())
}

/// Archiver backed by the packmate Docker image.
#[derive(Debug, Clone)]
pub struct PackmateArchiver {
    docker: String,
    image: String,
}

impl Default for PackmateArchiver {
    fn default() -> Self {
        Self {
            docker: "docker".to_string(),
            image: PACKMATE_IMAGE.to_string(),
        }
    }
}

impl PackmateArchiver {
    fn packmate_args(&self, source: &str, output: &str, name: &str) -> Vec<String> {
        vec![
            "run".to_string(),
            "--rm".to_string(),
            "-v".to_string(),
            format!("{}:/source:ro", source),
            "-v".to_string(),
            format!("{}:/output", output),
            self.image.clone(),
            "--name".to_string(),
            name.to_string(),
            "--compression=0".to_string(),
            "--method=copy".to_string(),
            "--multithreading=true".to_string(),
            "--extra=-ms=off".to_string(),
        ]
    }

    async fn docker(&self, args: Vec<String>, what: &str) -> Result<()> {
        let output = run_command(&self.docker, &args, None).await?;
        if !output.success {
            return Err(VolbackError::Archive(format!(
                "{} failed: {}{}",
                what,
                output.stdout.trim(),
                output.stderr.trim()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Archiver for PackmateArchiver {
    async fn run(
        &self,
        name: &str,
        sources: &[ArchiveSource],
        output_dir: &Path,
    ) -> Result<PathBuf> {
        let staging = output_dir.join(STAGING_DIR);
        tokio::fs::create_dir_all(&staging).await?;
        let staging_str = staging.to_string_lossy().to_string();

        info!("Pulling {}", self.image);
        let pull = vec!["pull".to_string(), self.image.clone()];
        self.docker(pull, "image pull").await?;

        for (i, src) in sources.iter().enumerate() {
            info!(
                "Volume {}/{}: {} -> {} ({})",
                i + 1,
                sources.len(),
                src.source,
                src.destination,
                src.kind
            );
            let volume_name = volume_archive_name(&src.source);
            let args = self.packmate_args(&src.source, &staging_str, &volume_name);
            self.docker(args, "volume archive").await?;
        }

        let args = self.packmate_args(&staging_str, &output_dir.to_string_lossy(), name);
        self.docker(args, "final archive").await?;

        let archive = final_archive_path(output_dir, name);
        if !tokio::fs::try_exists(&archive).await.unwrap_or(false) {
            return Err(VolbackError::Archive(format!(
                "final archive was not created at {}",
                archive.display()
            )));
        }

        tokio::fs::remove_dir_all(&staging).await?;
        Ok(archive)
    }
}
