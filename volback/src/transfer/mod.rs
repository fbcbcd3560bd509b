//! Transfer helpers shared by the upload path.

pub mod progress;
