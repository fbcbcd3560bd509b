//! Utility modules for volback.

pub mod errors;
pub mod logger;

pub use errors::{Result, VolbackError};
