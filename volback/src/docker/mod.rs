//! Container collaborators: volume enumeration and lifecycle control.
//!
//! Both talk to the Docker CLI. Each call runs under its own timeout so a
//! hung daemon cannot stall the whole run.

use crate::utils::{Result, VolbackError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

/// Timeout applied to every Docker invocation.
pub const DOCKER_TIMEOUT: Duration = Duration::from_secs(30);

/// Grace period given to `docker stop` before the container is killed.
const STOP_GRACE_SECS: u32 = 10;

/// A mount of a container, as reported by `docker inspect`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub source: String,
    pub destination: String,
    pub mode: String,
    pub rw: bool,
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InspectStatus {
    Success,
    Failed,
}

/// Volume enumeration result for one container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeReport {
    pub container_name: String,
    pub status: InspectStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub volumes: Vec<Volume>,
}

impl VolumeReport {
    pub fn failed(container: &str, error: impl Into<String>) -> Self {
        Self {
            container_name: container.to_string(),
            status: InspectStatus::Failed,
            error: Some(error.into()),
            volumes: Vec::new(),
        }
    }

    /// Volumes, or the inspect failure as an error.
    pub fn into_volumes(self) -> Result<Vec<Volume>> {
        match self.status {
            InspectStatus::Success => Ok(self.volumes),
            InspectStatus::Failed => Err(VolbackError::Docker(format!(
                "failed to get volumes of {}: {}",
                self.container_name,
                self.error.unwrap_or_default()
            ))),
        }
    }
}

#[async_trait]
pub trait VolumeInspector: Send + Sync {
    /// Enumerate mounts. An unknown container is reported as `Failed`, not `Err`.
    async fn volumes(&self, container: &str) -> Result<VolumeReport>;
}

#[async_trait]
pub trait ContainerControl: Send + Sync {
    async fn stop(&self, container: &str) -> Result<()>;
    async fn start(&self, container: &str) -> Result<()>;
}

/// Docker CLI implementation of both collaborators.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
    timeout: Duration,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
            timeout: DOCKER_TIMEOUT,
        }
    }
}

/// Subset of `docker inspect` output we rely on.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectedContainer {
    #[serde(default)]
    mounts: Vec<InspectedMount>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectedMount {
    #[serde(rename = "Type", default)]
    kind: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    source: String,
    #[serde(default)]
    destination: String,
    #[serde(default)]
    mode: String,
    #[serde(rename = "RW", default)]
    rw: bool,
}

impl From<InspectedMount> for Volume {
    fn from(m: InspectedMount) -> Self {
        Volume {
            source: m.source,
            destination: m.destination,
            mode: m.mode,
            rw: m.rw,
            kind: m.kind,
            name: m.name,
        }
    }
}

/// Parse the JSON array printed by `docker inspect <container>`.
pub fn parse_inspect_output(container: &str, output: &str) -> Result<VolumeReport> {
    let mut inspected: Vec<InspectedContainer> = serde_json::from_str(output)?;
    let Some(first) = inspected.pop() else {
        return Ok(VolumeReport::failed(container, "no such container"));
    };

    let volumes = first.mounts.into_iter().map(Volume::from).collect();
    Ok(VolumeReport {
        container_name: container.to_string(),
        status: InspectStatus::Success,
        error: None,
        volumes,
    })
}

pub(crate) struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Run a command to completion, capturing its output. `None` waits indefinitely.
pub(crate) async fn run_command(
    program: &str,
    args: &[String],
    timeout: Option<Duration>,
) -> Result<CommandOutput> {
    debug!("Executing: {} {:?}", program, args);

    let child = Command::new(program).args(args).kill_on_drop(true).output();
    let output = match timeout {
        Some(limit) => match tokio::time::timeout(limit, child).await {
            Ok(output) => output?,
            Err(_) => {
                let msg = format!("{} timed out after {}s", program, limit.as_secs());
                return Err(VolbackError::Docker(msg));
            }
        },
        None => child.await?,
    };

    Ok(CommandOutput {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

impl DockerCli {
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    async fn control(&self, action: &str, args: Vec<String>, container: &str) -> Result<()> {
        let output = run_command(&self.binary, &args, Some(self.timeout)).await?;
        if !output.success {
            return Err(VolbackError::Docker(format!(
                "failed to {} container {}: {}",
                action,
                container,
                output.stderr.trim()
            )));
        }
        let state = if action == "stop" {
            "stopped"
        } else {
            "started"
        };
        info!("Container {} {}", container, state);
        Ok(())
    }
}

#[async_trait]
impl VolumeInspector for DockerCli {
    async fn volumes(&self, container: &str) -> Result<VolumeReport> {
        let args = vec!["inspect".to_string(), container.to_string()];
        let output = run_command(&self.binary, &args, Some(self.timeout)).await?;
        if !output.success {
            return Ok(VolumeReport::failed(container, output.stderr.trim()));
        }
        parse_inspect_output(container, &output.stdout)
    }
}

#[async_trait]
impl ContainerControl for DockerCli {
    async fn stop(&self, container: &str) -> Result<()> {
        let args = vec![
            "stop".to_string(),
            "-t".to_string(),
            STOP_GRACE_SECS.to_string(),
            container.to_string(),
        ];
        self.control("stop", args, container).await
    }

    async fn start(&self, container: &str) -> Result<()> {
        let args = vec!["start".to_string(), container.to_string()];
        self.control("start", args, container).await
    }
}
