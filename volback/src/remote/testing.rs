//! In-memory `RemoteStorage` that records every call, for unit tests.

use super::{RemoteEntry, RemoteStorage};
use crate::utils::{Result, VolbackError};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    List(String),
    Delete(String),
    UploadSmall { remote_path: String, len: u64 },
    Start { len: usize },
    Append {
        session_id: String,
        offset: u64,
        len: usize,
    },
    Finish {
        session_id: String,
        offset: u64,
        remote_path: String,
    },
}

#[derive(Default)]
pub struct RecordingStorage {
    pub listing: Vec<String>,
    pub fail_deletes: HashSet<String>,
    /// Fail the n-th append (1-based)
    pub fail_append_at: Option<usize>,
    pub fail_list: bool,
    pub(crate) calls: Mutex<Vec<Call>>,
    /// Bytes received by the session, in order
    pub(crate) received: Mutex<Vec<u8>>,
}

impl RecordingStorage {
    pub fn with_listing<S: Into<String>>(listing: impl IntoIterator<Item = S>) -> Self {
        Self {
            listing: listing.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn received(&self) -> Vec<u8> {
        self.received.lock().unwrap().clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Delete(p) => Some(p),
                _ => None,
            })
            .collect()
    }

    fn push(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn receive(&self, data: &[u8]) {
        self.received.lock().unwrap().extend_from_slice(data);
    }
}

fn remote_error(body: &str) -> VolbackError {
    VolbackError::Remote {
        status: 500,
        body: body.to_string(),
    }
}

#[async_trait]
impl RemoteStorage for RecordingStorage {
    async fn list(&self, path: &str) -> Result<Vec<RemoteEntry>> {
        self.push(Call::List(path.to_string()));
        if self.fail_list {
            return Err(remote_error("list failed"));
        }
        Ok(self
            .listing
            .iter()
            .filter(|p| p.ends_with(crate::catalog::ARCHIVE_SUFFIX))
            .map(|p| RemoteEntry::new(p.clone()))
            .collect())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.push(Call::Delete(path.to_string()));
        if self.fail_deletes.contains(path) {
            return Err(remote_error("delete failed"));
        }
        Ok(())
    }

    async fn upload_small(&self, local_file: &Path, remote_path: &str) -> Result<()> {
        let data = tokio::fs::read(local_file).await?;
        self.push(Call::UploadSmall {
            remote_path: remote_path.to_string(),
            len: data.len() as u64,
        });
        self.receive(&data);
        Ok(())
    }

    async fn start_session(&self, first_chunk: Bytes) -> Result<String> {
        self.push(Call::Start {
            len: first_chunk.len(),
        });
        self.receive(&first_chunk);
        Ok("session-1".to_string())
    }

    async fn append_session(&self, session_id: &str, offset: u64, chunk: Bytes) -> Result<()> {
        self.push(Call::Append {
            session_id: session_id.to_string(),
            offset,
            len: chunk.len(),
        });

        let appends = self
            .calls()
            .iter()
            .filter(|c| matches!(c, Call::Append { .. }))
            .count();
        if self.fail_append_at == Some(appends) {
            return Err(remote_error("append failed"));
        }

        let mut received = self.received.lock().unwrap();
        if received.len() as u64 != offset {
            return Err(VolbackError::Remote {
                status: 409,
                body: format!("incorrect_offset: expected {}", received.len()),
            });
        }
        received.extend_from_slice(&chunk);
        Ok(())
    }

    async fn finish_session(&self, session_id: &str, offset: u64, remote_path: &str) -> Result<()> {
        self.push(Call::Finish {
            session_id: session_id.to_string(),
            offset,
            remote_path: remote_path.to_string(),
        });
        Ok(())
    }
}
