use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use baler_storage::StorageBackend;

use super::{checkpoint_path, remote_name, split_range, TransferDirection, CANCEL_FILE, PACKAGE_FILES};
use crate::chunking::{
    ActionError, ByteRangeIterator, ChunkLimits, ChunkOutcome, ChunkingManager, Persistence,
    StopReason,
};
use crate::error::{BalerError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadFile {
    pub name: String,
    pub size: u64,
}

/// Extra data of a download job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadState {
    pub chunk_size: u64,
    pub files: Vec<DownloadFile>,
    /// Set while the storage asked us to wait.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// Every file is in place under its final name.
    Complete { bytes: u64 },
    Stopped { bytes: u64, total: u64 },
    Backoff { until: DateTime<Utc> },
    Cancelled,
    Failed(String),
}

fn part_path(dest: &Path, name: &str) -> PathBuf {
    dest.join(format!("{name}.part"))
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Open every `.part` file, cut back to what the checkpoint at `covered`
/// bytes of the concatenated package says has been written.
fn open_parts(dest: &Path, state: &DownloadState, covered: u64) -> Result<Vec<File>> {
    let mut parts = Vec::with_capacity(state.files.len());
    let mut start = 0u64;
    for file in &state.files {
        let path = part_path(dest, &file.name);
        let keep = covered.saturating_sub(start).min(file.size);
        let mut part = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;
        let len = part.metadata()?.len();
        if len < keep {
            return Err(BalerError::StaleCheckpoint(format!(
                "{} is shorter ({len}) than its checkpoint ({keep})",
                path.display()
            )));
        }
        part.set_len(keep)?;
        part.seek(SeekFrom::End(0))?;
        parts.push(part);
        start += file.size;
    }
    Ok(parts)
}

fn discard(dest: &Path, state: &DownloadState) -> Result<()> {
    for file in &state.files {
        remove_if_exists(&part_path(dest, &file.name))?;
    }
    Ok(())
}

/// Run one bounded slice of downloading `package` from `storage` into `dest`.
pub fn download_package(
    storage: &dyn StorageBackend,
    package: &str,
    dest: &Path,
    limits: ChunkLimits,
) -> Result<DownloadOutcome> {
    fs::create_dir_all(dest)?;
    let checkpoint = checkpoint_path(dest, TransferDirection::Download, storage.id());
    let mut store: Persistence<DownloadState, u64> = Persistence::file(&checkpoint);

    let cancel_marker = dest.join(CANCEL_FILE);
    let (mut state, last) = match store.load_record()? {
        Some(r) => (r.extra_data.clone(), r.position),
        None => {
            let mut files = Vec::new();
            for name in PACKAGE_FILES {
                let remote = remote_name(package, name);
                let size = storage
                    .object_size(&remote)?
                    .ok_or(BalerError::PackageNotFound(remote))?;
                files.push(DownloadFile {
                    name: name.to_string(),
                    size,
                });
            }
            let state = DownloadState {
                chunk_size: storage.download_chunk_size(),
                files,
                backoff_until: None,
            };
            (state, None)
        }
    };
    if let Some(until) = state.backoff_until.take() {
        if until > Utc::now() && !cancel_marker.exists() {
            debug!(package, storage = storage.id(), until = %until, "download still backing off");
            return Ok(DownloadOutcome::Backoff { until });
        }
    }
    let chunk = state.chunk_size.max(1);
    let sizes: Vec<u64> = state.files.iter().map(|f| f.size).collect();
    let total: u64 = sizes.iter().sum();
    let covered = last.map_or(0, |p| (p + chunk).min(total));
    let mut parts = open_parts(dest, &state, covered)?;

    let probe = cancel_marker.clone();
    let mut manager = ChunkingManager::new(
        format!("download:{}", storage.id()),
        ByteRangeIterator::new(total, chunk),
        store,
        state,
        limits,
    )
    .with_cancel_probe(move || probe.exists());

    let outcome = manager.start(false, |_, &(offset, len), state| {
        for piece in split_range(&sizes, offset, len) {
            let name = &state.files[piece.file].name;
            let data = storage.download_chunk(&remote_name(package, name), piece.offset, piece.len)?;
            if data.len() as u64 != piece.len {
                return Err(ActionError::new(format!(
                    "short read of {name}: {} of {} bytes at {}",
                    data.len(),
                    piece.len,
                    piece.offset
                )));
            }
            let part = &mut parts[piece.file];
            part.seek(SeekFrom::Start(piece.offset))?;
            part.write_all(&data)?;
        }
        Ok(())
    });

    for part in &parts {
        part.sync_data()?;
    }
    drop(parts);
    let state = manager.extra().clone();
    let bytes = manager.last_position().map_or(covered, |p| (p + chunk).min(total));

    match outcome {
        ChunkOutcome::Complete => {
            for file in &state.files {
                fs::rename(part_path(dest, &file.name), dest.join(&file.name))?;
            }
            manager.delete_checkpoint()?;
            info!(package, storage = storage.id(), bytes = total, "download complete");
            Ok(DownloadOutcome::Complete { bytes: total })
        }
        ChunkOutcome::Stopped(StopReason::Cancelled) => {
            discard(dest, &state)?;
            manager.delete_checkpoint()?;
            remove_if_exists(&cancel_marker)?;
            info!(package, storage = storage.id(), "download cancelled");
            Ok(DownloadOutcome::Cancelled)
        }
        ChunkOutcome::Stopped(reason) => {
            debug!(package, ?reason, bytes, total, "download paused");
            Ok(DownloadOutcome::Stopped { bytes, total })
        }
        ChunkOutcome::Error(failure) => match failure.retry_after {
            Some(retry_after) => {
                let until = Utc::now()
                    + chrono::Duration::from_std(retry_after)
                        .unwrap_or_else(|_| chrono::Duration::seconds(60));
                warn!(package, storage = storage.id(), until = %until, "download rate limited");
                manager.save_extra(DownloadState {
                    backoff_until: Some(until),
                    ..state
                })?;
                Ok(DownloadOutcome::Backoff { until })
            }
            None => {
                discard(dest, &state)?;
                manager.delete_checkpoint()?;
                Ok(DownloadOutcome::Failed(failure.to_string()))
            }
        },
    }
}
