//! volback - main entry point
//!
//! One-shot run: back up every configured container, then exit non-zero if
//! any of them did not complete.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use volback::archive::PackmateArchiver;
use volback::config::{Config, Overrides};
use volback::docker::DockerCli;
use volback::plan::build_plan;
use volback::remote::DropboxClient;
use volback::runner::{
    cleanup_stale_work_dirs, Collaborators, ContainerOutcome, RunSettings, Runner,
    STALE_WORK_DIR_AGE,
};
use volback::{shutdown, utils};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// JSON array of container configurations
    #[arg(long, env = "CONTAINERS")]
    containers: Option<String>,

    #[arg(long, env = "DROPBOX_REFRESH_TOKEN", hide_env_values = true)]
    dropbox_refresh_token: Option<String>,

    #[arg(long, env = "DROPBOX_CLIENT_ID")]
    dropbox_client_id: Option<String>,

    #[arg(long, env = "DROPBOX_CLIENT_SECRET", hide_env_values = true)]
    dropbox_client_secret: Option<String>,

    /// Remote folder prefix
    #[arg(long, env = "DROPBOX_PATH")]
    dropbox_path: Option<String>,

    #[arg(long, env = "KEEP_DAILY")]
    keep_daily: Option<usize>,

    #[arg(long, env = "KEEP_WEEKLY")]
    keep_weekly: Option<usize>,

    #[arg(long, env = "KEEP_MONTHLY")]
    keep_monthly: Option<usize>,

    #[arg(long, env = "KEEP_YEARLY")]
    keep_yearly: Option<usize>,

    /// Upload chunk size in MiB
    #[arg(long, env = "CHUNK_SIZE_MIB")]
    chunk_size_mib: Option<u64>,

    /// Parent directory for temporary archives
    #[arg(long, env = "TEMP_DIR")]
    temp_dir: Option<PathBuf>,

    /// Log retention failures instead of failing the container
    #[arg(long, env = "RETENTION_BEST_EFFORT")]
    retention_best_effort: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, env = "LOG_LEVEL")]
    log_level: Option<String>,
}

impl Args {
    fn overrides(&self) -> Overrides {
        Overrides {
            containers_json: self.containers.clone(),
            refresh_token: self.dropbox_refresh_token.clone(),
            client_id: self.dropbox_client_id.clone(),
            client_secret: self.dropbox_client_secret.clone(),
            dropbox_path: self.dropbox_path.clone(),
            keep_daily: self.keep_daily,
            keep_weekly: self.keep_weekly,
            keep_monthly: self.keep_monthly,
            keep_yearly: self.keep_yearly,
            chunk_size_mib: self.chunk_size_mib,
            temp_dir: self.temp_dir.clone(),
            log_level: self.log_level.clone(),
            retention_best_effort: self.retention_best_effort,
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // A missing .env file is fine
    let _ = dotenvy::dotenv();
    let args = Args::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &args.config {
        Config::from_file(config_path)?
    } else {
        Config::default()
    };
    config.apply(args.overrides())?;

    // Initialize logging
    utils::logger::init(&config.log.level)?;

    tracing::info!("Starting volback v{}", env!("CARGO_PKG_VERSION"));

    config.validate()?;
    let plan = build_plan(&config.containers)?;

    match cleanup_stale_work_dirs(&config.work.temp_dir, STALE_WORK_DIR_AGE) {
        Ok(0) => {}
        Ok(n) => tracing::info!("Removed {} stale working directories", n),
        Err(e) => tracing::warn!(
            "Failed to scan {} for stale working directories: {}",
            config.work.temp_dir.display(),
            e
        ),
    }

    let cancel = CancellationToken::new();
    let signal_listener = tokio::spawn(shutdown::cancel_on_signal(cancel.clone()));

    let storage = DropboxClient::new(config.credentials());
    let docker = DockerCli::default();
    let archiver = PackmateArchiver::default();

    let runner = Runner::new(
        Collaborators {
            storage: &storage,
            inspector: &docker,
            control: &docker,
            archiver: &archiver,
        },
        RunSettings::from_config(&config),
        cancel.clone(),
    );
    let report = runner.run(&plan).await;

    // Stop the signal listener
    cancel.cancel();
    let _ = signal_listener.await;

    for (container, outcome) in &report.outcomes {
        match outcome {
            ContainerOutcome::Succeeded { remote_path, .. } => {
                tracing::info!("{}: backed up to {}", container, remote_path)
            }
            ContainerOutcome::Failed(reason) => {
                tracing::error!("{}: failed: {}", container, reason)
            }
            ContainerOutcome::Skipped { failed_dependency } => tracing::warn!(
                "{}: skipped, dependency {} did not complete",
                container, failed_dependency
            ),
            ContainerOutcome::Cancelled => tracing::warn!("{}: cancelled", container),
        }
    }

    if report.is_success() {
        tracing::info!("All {} containers backed up", report.outcomes.len());
        Ok(ExitCode::SUCCESS)
    } else {
        tracing::error!(
            "{} of {} containers did not complete",
            report.failures(),
            report.outcomes.len()
        );
        Ok(ExitCode::FAILURE)
    }
}
