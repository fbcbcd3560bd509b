//! Configuration management for volback.
//!
//! Loads an optional TOML file; command-line flags and their environment
//! variables override whatever the file sets.

use crate::remote::DropboxCredentials;
use crate::retention::RetentionPolicy;
use crate::upload::DEFAULT_CHUNK_SIZE;
use crate::utils::{Result, VolbackError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub dropbox: DropboxConfig,
    pub retention: RetentionConfig,
    pub upload: UploadConfig,
    pub work: WorkConfig,
    pub log: LogConfig,
    pub containers: Vec<ContainerConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DropboxConfig {
    pub refresh_token: String,
    pub client_id: String,
    pub client_secret: String,

    /// Destination folder prefix, e.g. `/backups`
    pub path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    #[serde(flatten)]
    pub policy: RetentionPolicy,

    /// Report retention failures as warnings instead of failing the container
    pub best_effort: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Single-request limit and session chunk size in bytes (default: 150 MiB)
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkConfig {
    /// Parent of the per-container working directories
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// One container to back up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerConfig {
    pub container: String,

    /// Remote folder name; defaults to the container name
    #[serde(default)]
    pub backup_id: Option<String>,

    /// Stop the container while its volumes are archived
    #[serde(default)]
    pub stop: bool,

    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl ContainerConfig {
    pub fn new(container: &str) -> Self {
        Self {
            container: container.to_string(),
            backup_id: None,
            stop: false,
            depends_on: Vec::new(),
        }
    }

    pub fn backup_id(&self) -> &str {
        match self.backup_id.as_deref() {
            Some(id) if !id.is_empty() => id,
            _ => &self.container,
        }
    }
}

fn default_chunk_size() -> u64 {
    DEFAULT_CHUNK_SIZE
}

fn default_temp_dir() -> PathBuf {
    std::env::temp_dir()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
        }
    }
}

impl Default for WorkConfig {
    fn default() -> Self {
        Self {
            temp_dir: default_temp_dir(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Values supplied on the command line or through the environment.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub containers_json: Option<String>,
    pub refresh_token: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub dropbox_path: Option<String>,
    pub keep_daily: Option<usize>,
    pub keep_weekly: Option<usize>,
    pub keep_monthly: Option<usize>,
    pub keep_yearly: Option<usize>,
    pub chunk_size_mib: Option<u64>,
    pub temp_dir: Option<PathBuf>,
    pub log_level: Option<String>,
    pub retention_best_effort: bool,
}

/// Parse the `CONTAINERS` JSON array.
pub fn parse_containers_json(json: &str) -> Result<Vec<ContainerConfig>> {
    serde_json::from_str(json).map_err(|e| {
        VolbackError::Config(format!("failed to parse container configurations: {}", e))
    })
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Layer command-line / environment values on top of this configuration.
    pub fn apply(&mut self, overrides: Overrides) -> Result<()> {
        if let Some(json) = overrides.containers_json.filter(|j| !j.trim().is_empty()) {
            self.containers = parse_containers_json(&json)?;
        }

        set_if_some(&mut self.dropbox.refresh_token, overrides.refresh_token);
        set_if_some(&mut self.dropbox.client_id, overrides.client_id);
        set_if_some(&mut self.dropbox.client_secret, overrides.client_secret);
        set_if_some(&mut self.dropbox.path, overrides.dropbox_path);

        let policy = &mut self.retention.policy;
        set_if_some(&mut policy.keep_daily, overrides.keep_daily);
        set_if_some(&mut policy.keep_weekly, overrides.keep_weekly);
        set_if_some(&mut policy.keep_monthly, overrides.keep_monthly);
        set_if_some(&mut policy.keep_yearly, overrides.keep_yearly);

        if let Some(mib) = overrides.chunk_size_mib {
            let Some(bytes) = mib.checked_mul(1024 * 1024) else {
                return Err(VolbackError::Config(format!(
                    "chunk size of {} MiB is out of range",
                    mib
                )));
            };
            self.upload.chunk_size = bytes;
        }
        set_if_some(&mut self.work.temp_dir, overrides.temp_dir);
        set_if_some(&mut self.log.level, overrides.log_level);
        if overrides.retention_best_effort {
            self.retention.best_effort = true;
        }

        Ok(())
    }

    /// Check that a run can start with this configuration.
    pub fn validate(&self) -> Result<()> {
        if self.containers.is_empty() {
            return Err(VolbackError::Config(
                "no container configurations provided".to_string(),
            ));
        }
        for c in &self.containers {
            if c.container.trim().is_empty() {
                return Err(VolbackError::Config(format!(
                    "container entry without a name: {:?}",
                    c
                )));
            }
        }
        if self.dropbox.refresh_token.is_empty()
            || self.dropbox.client_id.is_empty()
            || self.dropbox.client_secret.is_empty()
        {
            return Err(VolbackError::Config(
                "Dropbox refresh token, client id and client secret are required".to_string(),
            ));
        }
        if self.upload.chunk_size == 0 {
            return Err(VolbackError::Config(
                "chunk size must be greater than zero".to_string(),
            ));
        }
        if self.upload.chunk_size > DEFAULT_CHUNK_SIZE {
            return Err(VolbackError::Config(format!(
                "chunk size {} exceeds the {} byte single-request limit",
                self.upload.chunk_size, DEFAULT_CHUNK_SIZE
            )));
        }
        Ok(())
    }

    pub fn credentials(&self) -> DropboxCredentials {
        DropboxCredentials {
            refresh_token: self.dropbox.refresh_token.clone(),
            client_id: self.dropbox.client_id.clone(),
            client_secret: self.dropbox.client_secret.clone(),
        }
    }
}

fn set_if_some<T>(slot: &mut T, value: Option<T>) {
    if let Some(v) = value {
        *slot = v;
    }
}
