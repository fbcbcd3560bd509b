//! Backup catalog - turns a remote listing into typed backup records.
//!
//! Archive names follow the `YYYYMMDD.HHMMSS.7z` layout and carry the local
//! wall-clock time at which the backup was taken. Anything else in the folder
//! is ignored: it is never retained and never deleted.

use crate::utils::{Result, VolbackError};
use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use tracing::warn;

/// Suffix of every archive produced by the pipeline.
pub const ARCHIVE_SUFFIX: &str = ".7z";

const TIMESTAMP_FORMAT: &str = "%Y%m%d.%H%M%S";

/// One archived snapshot on the remote store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backup {
    pub remote_path: String,
    pub timestamp: DateTime<Local>,
}

/// Result of classifying a listing.
#[derive(Debug, Default)]
pub struct Catalog {
    pub backups: Vec<Backup>,
    /// Entries whose names did not parse as a backup timestamp
    pub skipped: Vec<String>,
}

/// Parse a backup file name (with or without the `.7z` suffix) into a local timestamp.
pub fn parse_backup_timestamp(filename: &str) -> Result<DateTime<Local>> {
    let stem = filename.strip_suffix(ARCHIVE_SUFFIX).unwrap_or(filename);

    // chrono skips spaces and accepts unpadded fields; the layout is fixed-width
    if !is_fixed_width_stamp(stem) {
        return Err(VolbackError::InvalidTimestamp(filename.to_string()));
    }

    let naive = NaiveDateTime::parse_from_str(stem, TIMESTAMP_FORMAT).map_err(|e| {
        VolbackError::InvalidTimestamp(format!("{}: {}", filename, e))
    })?;

    // Ambiguous local times (DST fall-back) resolve to the earlier instant;
    // non-existent ones (spring-forward gap) are rejected.
    Local
        .from_local_datetime(&naive)
        .earliest()
        .ok_or_else(|| {
            VolbackError::InvalidTimestamp(format!("{}: not a valid local time", filename))
        })
}

/// `YYYYMMDD.HHMMSS`: eight digits, a dot, six digits.
fn is_fixed_width_stamp(stem: &str) -> bool {
    let bytes = stem.as_bytes();
    if bytes.len() != 15 || bytes[8] != b'.' {
        return false;
    }
    bytes[..8].iter().chain(&bytes[9..]).all(u8::is_ascii_digit)
}

/// File name for a backup taken at `time`.
pub fn backup_file_name(time: &DateTime<Local>) -> String {
    format!("{}{}", time.format(TIMESTAMP_FORMAT), ARCHIVE_SUFFIX)
}

/// Classify raw remote paths. Survivors are returned in input order, unsorted.
pub fn build<S: AsRef<str>>(entries: &[S]) -> Catalog {
    let mut catalog = Catalog::default();

    for entry in entries {
        let path = entry.as_ref();
        let filename = path.rsplit('/').next().unwrap_or(path);

        match parse_backup_timestamp(filename) {
            Ok(timestamp) => catalog.backups.push(Backup {
                remote_path: path.to_string(),
                timestamp,
            }),
            Err(e) => {
                warn!("Skipping file with invalid format: {} ({})", filename, e);
                catalog.skipped.push(path.to_string());
            }
        }
    }

    catalog
}
