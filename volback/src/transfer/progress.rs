//! Byte-level progress for archive uploads.
//!
//! The chunked uploader reports after every chunk; the tracker turns those
//! offsets into percentages, speeds and estimates for the log.

use std::time::{Duration, Instant};

/// Snapshot of an upload in progress
#[derive(Debug, Clone)]
pub struct UploadProgress {
    pub total_bytes: u64,
    pub sent_bytes: u64,
    /// 1-based index of the last chunk sent
    pub chunk: u64,
    pub total_chunks: u64,
    pub bytes_per_second: u64,
    pub eta_seconds: u64,
}

impl UploadProgress {
    pub fn percent(&self) -> f64 {
        if self.total_bytes == 0 {
            100.0
        } else {
            (self.sent_bytes as f64 / self.total_bytes as f64 * 100.0).min(100.0)
        }
    }

    pub fn is_complete(&self) -> bool {
        self.sent_bytes >= self.total_bytes
    }
}

/// Tracks chunk offsets over time
pub struct ProgressTracker {
    start_time: Instant,
    last_update_time: Instant,
    last_bytes: u64,
    progress: UploadProgress,
}

impl ProgressTracker {
    pub fn new(total_bytes: u64, total_chunks: u64) -> Self {
        let now = Instant::now();
        Self {
            start_time: now,
            last_update_time: now,
            last_bytes: 0,
            progress: UploadProgress {
                total_bytes,
                sent_bytes: 0,
                chunk: 0,
                total_chunks,
                bytes_per_second: 0,
                eta_seconds: 0,
            },
        }
    }

    /// Record that the cursor moved to `sent_bytes` after another chunk.
    pub fn chunk_sent(&mut self, sent_bytes: u64) -> &UploadProgress {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update_time).as_secs_f64();

        if elapsed > 0.0 {
            let diff = sent_bytes.saturating_sub(self.last_bytes);
            self.progress.bytes_per_second = (diff as f64 / elapsed) as u64;
        }

        if self.progress.bytes_per_second > 0 {
            let remaining = self.progress.total_bytes.saturating_sub(sent_bytes);
            self.progress.eta_seconds = remaining / self.progress.bytes_per_second;
        }

        self.progress.sent_bytes = sent_bytes;
        self.progress.chunk += 1;
        self.last_update_time = now;
        self.last_bytes = sent_bytes;

        &self.progress
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Average speed since the tracker was created
    pub fn average_speed(&self) -> u64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            (self.progress.sent_bytes as f64 / elapsed) as u64
        } else {
            0
        }
    }

    pub fn progress(&self) -> &UploadProgress {
        &self.progress
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

pub fn format_speed(bytes_per_second: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_second))
}

pub fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    }
}
