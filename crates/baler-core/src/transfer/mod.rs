//! Chunked, resumable transfer of package files to and from storage backends.

pub mod download;
pub mod upload;

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::archive::ARCHIVE_FILE;
use crate::database::DATABASE_FILE;
use crate::error::Result;
use crate::installer::INSTALLER_FILE;

pub use download::{download_package, DownloadOutcome, DownloadState};
pub use upload::{cancel_upload, upload_package, UploadState};

/// Files making up a package, in transfer order.
pub const PACKAGE_FILES: [&str; 3] = [ARCHIVE_FILE, DATABASE_FILE, INSTALLER_FILE];

/// Marker file whose presence asks running work on a package to stop.
pub const CANCEL_FILE: &str = "cancel";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    Upload,
    Download,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum TransferStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    /// Rate limited; not to be retried before `until`.
    Backoff { until: DateTime<Utc> },
}

impl TransferStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferStatus::Succeeded | TransferStatus::Failed | TransferStatus::Cancelled
        )
    }

    /// Whether work may be done on the transfer at `now`.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        match self {
            TransferStatus::Pending | TransferStatus::Running => true,
            TransferStatus::Backoff { until } => *until <= now,
            _ => false,
        }
    }
}

impl std::fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferStatus::Pending => f.write_str("pending"),
            TransferStatus::Running => f.write_str("running"),
            TransferStatus::Succeeded => f.write_str("succeeded"),
            TransferStatus::Failed => f.write_str("failed"),
            TransferStatus::Cancelled => f.write_str("cancelled"),
            TransferStatus::Backoff { until } => write!(f, "backoff until {}", until.to_rfc3339()),
        }
    }
}

/// State of one package transfer to or from one storage target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub storage_id: String,
    pub direction: TransferDirection,
    pub status: TransferStatus,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl TransferRecord {
    pub fn new(storage_id: &str, direction: TransferDirection) -> Self {
        Self {
            storage_id: storage_id.to_string(),
            direction,
            status: TransferStatus::Pending,
            bytes_transferred: 0,
            total_bytes: 0,
            started_at: None,
            finished_at: None,
            error: None,
        }
    }

    pub(crate) fn finish(&mut self, status: TransferStatus, error: Option<String>) {
        self.status = status;
        self.error = error;
        self.finished_at = Some(Utc::now());
    }
}

/// Object name of a package file on a storage target.
pub fn remote_name(package: &str, file: &str) -> String {
    format!("{package}/{file}")
}

/// Combined size of the package files present in `dir`.
pub fn package_size(dir: &Path) -> Result<u64> {
    let mut total = 0;
    for name in PACKAGE_FILES {
        total += std::fs::metadata(dir.join(name))?.len();
    }
    Ok(total)
}

pub(crate) fn checkpoint_path(dir: &Path, direction: TransferDirection, storage_id: &str) -> PathBuf {
    let prefix = match direction {
        TransferDirection::Upload => "upload",
        TransferDirection::Download => "download",
    };
    dir.join("checkpoints")
        .join(format!("{prefix}-{storage_id}.json"))
}

/// A file's slice of a byte range spanning several concatenated files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Piece {
    pub file: usize,
    pub offset: u64,
    pub len: u64,
}

/// Split `[offset, offset+len)` of the concatenation of `sizes` into
/// per-file pieces.
pub(crate) fn split_range(sizes: &[u64], offset: u64, len: u64) -> Vec<Piece> {
    let mut pieces = Vec::new();
    let end = offset + len;
    let mut start = 0u64;
    for (file, &size) in sizes.iter().enumerate() {
        let file_end = start + size;
        let lo = offset.max(start);
        let hi = end.min(file_end);
        if lo < hi {
            pieces.push(Piece {
                file,
                offset: lo - start,
                len: hi - lo,
            });
        }
        start = file_end;
    }
    pieces
}
