//! Backup retention: the pure keep-set engine and the remote pruning pass.

pub mod orchestrator;
pub mod policy;

pub use orchestrator::{apply_retention, RetentionSummary};
pub use policy::{compute_keep_set, KeepSet, RetentionPolicy, Tier};
