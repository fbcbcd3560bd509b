//! Remote storage capability used by the upload and retention paths.
//!
//! `DropboxClient` is the production implementation. Everything above this
//! layer talks to the `RemoteStorage` trait so it can run against fakes.

pub mod dropbox;
pub mod token;

#[cfg(test)]
pub(crate) mod testing;

use crate::utils::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::path::Path;

pub use dropbox::{DropboxClient, DropboxCredentials, DropboxEndpoints};

/// One entry returned by a folder listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    /// Display path, always absolute
    pub path: String,
}

impl RemoteEntry {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

/// Authenticated remote store with single-shot and session-based uploads.
///
/// No method retries on its own; a non-success response surfaces as
/// `VolbackError::Remote` and the caller decides what to do.
#[async_trait]
pub trait RemoteStorage: Send + Sync {
    /// List archive entries directly under `path`. Non-archive entries are omitted.
    async fn list(&self, path: &str) -> Result<Vec<RemoteEntry>>;

    /// Delete a single entry.
    async fn delete(&self, path: &str) -> Result<()>;

    /// Upload a whole file in one request. Name collisions are auto-renamed.
    async fn upload_small(&self, local_file: &Path, remote_path: &str) -> Result<()>;

    /// Open an upload session with the first chunk; returns the session id.
    async fn start_session(&self, first_chunk: Bytes) -> Result<String>;

    /// Append a chunk at `offset`, which must equal the bytes already sent.
    async fn append_session(&self, session_id: &str, offset: u64, chunk: Bytes) -> Result<()>;

    /// Commit the session to `remote_path` in "add" mode (fails on collision).
    async fn finish_session(&self, session_id: &str, offset: u64, remote_path: &str) -> Result<()>;
}

/// Prefix `path` with `/` when it is missing.
pub fn ensure_leading_slash(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    }
}

/// Join remote path segments with single slashes and a leading slash.
pub fn join_remote_path(segments: &[&str]) -> String {
    let joined = segments
        .iter()
        .flat_map(|s| s.split('/'))
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("/");
    ensure_leading_slash(&joined)
}
