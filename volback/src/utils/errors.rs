//! Custom error types for volback.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum VolbackError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Remote error (status {status}): {body}")]
    Remote { status: u16, body: String },

    #[error("Invalid backup timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("Upload session aborted during {stage} at offset {offset}: {source}")]
    SessionAbort {
        stage: &'static str,
        offset: u64,
        #[source]
        source: Box<VolbackError>,
    },

    #[error("Docker error: {0}")]
    Docker(String),

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Dependency cycle involving container: {0}")]
    DependencyCycle(String),

    #[error("Container {container} depends on unknown container {dependency}")]
    UnknownDependency {
        container: String,
        dependency: String,
    },

    #[error("Operation cancelled")]
    Cancelled,
}

impl VolbackError {
    /// Wrap a failed chunk operation so the caller sees which step broke the session.
    pub fn session_abort(stage: &'static str, offset: u64, source: VolbackError) -> Self {
        VolbackError::SessionAbort {
            stage,
            offset,
            source: Box::new(source),
        }
    }
}

pub type Result<T> = std::result::Result<T, VolbackError>;
