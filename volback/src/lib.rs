//! volback
//!
//! Backs up Docker container volumes to Dropbox: archive each container's
//! volumes, upload the archive (chunked above the single-request limit) and
//! prune older backups with a daily / weekly / monthly / yearly policy.

pub mod archive;
pub mod catalog;
pub mod config;
pub mod docker;
pub mod plan;
pub mod remote;
pub mod retention;
pub mod runner;
pub mod shutdown;
pub mod transfer;
pub mod upload;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use utils::errors::{Result, VolbackError};
