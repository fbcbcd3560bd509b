//! Archive upload: single request for small files, an upload session otherwise.
//!
//! A session walks `NotStarted -> Started -> Appending -> Finished`. Any
//! failing call moves it to `Aborted`; nothing is resumed and bytes already
//! appended on the remote side are left for the store to expire.

use crate::remote::RemoteStorage;
use crate::transfer::progress::{
    format_bytes, format_duration, format_speed, ProgressTracker, UploadProgress,
};
use crate::utils::{Result, VolbackError};
use bytes::Bytes;
use std::io::SeekFrom;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Largest body accepted by a single upload request (150 MiB).
pub const DEFAULT_CHUNK_SIZE: u64 = 150 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadMode {
    Simple,
    Chunked,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOutcome {
    pub mode: UploadMode,
    pub bytes: u64,
    /// Requests carrying file data
    pub chunks: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    NotStarted,
    Started,
    Appending { appended: u64 },
    Finished,
    Aborted,
}

/// Bookkeeping for one in-flight upload session.
#[derive(Debug)]
pub struct UploadSession {
    pub session_id: Option<String>,
    pub cursor_offset: u64,
    pub total_size: u64,
    pub chunk_size: u64,
    state: SessionState,
}

impl UploadSession {
    pub fn new(total_size: u64, chunk_size: u64) -> Self {
        Self {
            session_id: None,
            cursor_offset: 0,
            total_size,
            chunk_size,
            state: SessionState::NotStarted,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Size of the chunk that starts at the current cursor.
    pub fn next_chunk_len(&self) -> u64 {
        self.chunk_size.min(self.total_size - self.cursor_offset)
    }

    pub fn total_chunks(&self) -> u64 {
        self.total_size.div_ceil(self.chunk_size)
    }

    pub fn has_remaining(&self) -> bool {
        self.cursor_offset < self.total_size
    }

    fn started(&mut self, session_id: String, first_len: u64) {
        self.session_id = Some(session_id);
        self.cursor_offset = first_len;
        self.state = SessionState::Started;
    }

    fn appended(&mut self, len: u64) {
        self.cursor_offset += len;
        let appended = match self.state {
            SessionState::Appending { appended } => appended + 1,
            _ => 1,
        };
        self.state = SessionState::Appending { appended };
    }

    fn finished(&mut self) {
        self.session_id = None;
        self.state = SessionState::Finished;
    }

    fn abort(&mut self, stage: &'static str, source: VolbackError) -> VolbackError {
        self.state = SessionState::Aborted;
        VolbackError::session_abort(stage, self.cursor_offset, source)
    }
}

/// Uploads local archives through a `RemoteStorage`.
pub struct Uploader<'a> {
    storage: &'a dyn RemoteStorage,
    chunk_size: u64,
    cancel: CancellationToken,
}

impl<'a> Uploader<'a> {
    pub fn new(storage: &'a dyn RemoteStorage, chunk_size: u64) -> Self {
        Self::with_cancel(storage, chunk_size, CancellationToken::new())
    }

    pub fn with_cancel(
        storage: &'a dyn RemoteStorage,
        chunk_size: u64,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            storage,
            chunk_size: chunk_size.max(1),
            cancel,
        }
    }

    /// Upload `local_file` to `remote_path`.
    pub async fn upload(&self, local_file: &Path, remote_path: &str) -> Result<UploadOutcome> {
        let mut file = File::open(local_file).await?;
        let total_size = file.metadata().await?.len();

        info!(
            "Starting upload of {} ({}) to {}",
            local_file.display(),
            format_bytes(total_size),
            remote_path
        );

        if total_size <= self.chunk_size {
            info!("Small file detected - using simple upload");
            if self.cancel.is_cancelled() {
                return Err(VolbackError::Cancelled);
            }
            self.storage.upload_small(local_file, remote_path).await?;
            return Ok(UploadOutcome {
                mode: UploadMode::Simple,
                bytes: total_size,
                chunks: 1,
            });
        }

        info!("Large file detected - using chunked upload");
        let mut session = UploadSession::new(total_size, self.chunk_size);
        let chunks = self
            .run_session(&mut file, &mut session, remote_path)
            .await?;

        Ok(UploadOutcome {
            mode: UploadMode::Chunked,
            bytes: total_size,
            chunks,
        })
    }

    async fn run_session(
        &self,
        file: &mut File,
        session: &mut UploadSession,
        remote_path: &str,
    ) -> Result<u64> {
        let total_chunks = session.total_chunks();
        let mut tracker = ProgressTracker::new(session.total_size, total_chunks);
        info!(
            "Chunk size: {}, total chunks: {}",
            format_bytes(session.chunk_size),
            total_chunks
        );

        // Start: first chunk opens the session
        let first_len = session.next_chunk_len();
        let first = match self.read_checked(file, 0, first_len).await {
            Ok(bytes) => bytes,
            Err(e) => return Err(session.abort("start", e)),
        };
        let id = match self.storage.start_session(first).await {
            Ok(id) => id,
            Err(e) => return Err(session.abort("start", e)),
        };
        debug!("Upload session {} started", id);
        session.started(id.clone(), first_len);
        self.log_chunk(tracker.chunk_sent(session.cursor_offset));

        // Append: strictly increasing offsets, one request at a time
        while session.has_remaining() {
            let offset = session.cursor_offset;
            let len = session.next_chunk_len();

            let chunk = match self.read_checked(file, offset, len).await {
                Ok(bytes) => bytes,
                Err(e) => return Err(session.abort("append", e)),
            };
            if let Err(e) = self.storage.append_session(&id, offset, chunk).await {
                warn!("Append at {} failed, abandoning session {}", offset, id);
                return Err(session.abort("append", e));
            }

            session.appended(len);
            self.log_chunk(tracker.chunk_sent(session.cursor_offset));
        }

        // Finish: commit with the final offset, which equals the file size
        if self.cancel.is_cancelled() {
            return Err(session.abort("finish", VolbackError::Cancelled));
        }
        if let Err(e) = self
            .storage
            .finish_session(&id, session.cursor_offset, remote_path)
            .await
        {
            return Err(session.abort("finish", e));
        }
        session.finished();

        info!(
            "Upload completed: {} in {} ({})",
            format_bytes(session.total_size),
            format_duration(tracker.elapsed().as_secs()),
            format_speed(tracker.average_speed())
        );
        Ok(total_chunks)
    }

    /// Positional read of exactly `len` bytes, refusing to start once cancelled.
    async fn read_checked(&self, file: &mut File, offset: u64, len: u64) -> Result<Bytes> {
        if self.cancel.is_cancelled() {
            return Err(VolbackError::Cancelled);
        }
        read_chunk_at(file, offset, len).await
    }

    fn log_chunk(&self, progress: &UploadProgress) {
        info!(
            "Uploaded chunk {}/{} ({:.1}%, {} of {}, {}, ETA {})",
            progress.chunk,
            progress.total_chunks,
            progress.percent(),
            format_bytes(progress.sent_bytes),
            format_bytes(progress.total_bytes),
            format_speed(progress.bytes_per_second),
            format_duration(progress.eta_seconds)
        );
    }
}

/// Read exactly `len` bytes starting at `offset`.
pub async fn read_chunk_at(file: &mut File, offset: u64, len: u64) -> Result<Bytes> {
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = vec![0u8; len as usize];
    file.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
}
