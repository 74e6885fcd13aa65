use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use baler_storage::{StorageBackend, TransferRef, UploadHandle};

use super::{
    checkpoint_path, package_size, remote_name, split_range, TransferDirection, TransferRecord,
    TransferStatus, CANCEL_FILE, PACKAGE_FILES,
};
use crate::build::BuildProgress;
use crate::chunking::{
    ActionError, ByteRangeIterator, ChunkLimits, ChunkOutcome, ChunkingManager, Persistence,
    StopReason,
};
use crate::error::{BalerError, Result};
use crate::events::BuildEvents;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadFile {
    pub name: String,
    pub size: u64,
    /// Resumable session, once opened.
    pub handle: Option<UploadHandle>,
    pub finished: bool,
}

/// Extra data of an upload job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadState {
    /// Range size the checkpointed offsets are aligned to.
    pub chunk_size: u64,
    pub files: Vec<UploadFile>,
}

impl UploadState {
    fn for_dir(dir: &Path, chunk_size: u64) -> Result<Self> {
        let mut files = Vec::new();
        for name in PACKAGE_FILES {
            files.push(UploadFile {
                name: name.to_string(),
                size: std::fs::metadata(dir.join(name))?.len(),
                handle: None,
                finished: false,
            });
        }
        Ok(Self { chunk_size, files })
    }

    fn sizes(&self) -> Vec<u64> {
        self.files.iter().map(|f| f.size).collect()
    }

    fn total(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }

    /// Session of the first file still being sent.
    pub fn in_flight(&self) -> Option<&UploadHandle> {
        self.files
            .iter()
            .find(|f| !f.finished && f.handle.is_some())
            .and_then(|f| f.handle.as_ref())
    }

    /// Mark sessions committed by a run killed before its checkpoint.
    fn reconcile(&mut self, storage: &dyn StorageBackend) -> Result<()> {
        for file in self.files.iter_mut().filter(|f| !f.finished) {
            if let Some(handle) = &file.handle {
                if storage.object_size(&handle.name)? == Some(file.size) {
                    debug!(object = %handle.name, "upload already committed");
                    file.finished = true;
                }
            }
        }
        Ok(())
    }
}

fn read_piece(path: &Path, offset: u64, len: u64) -> Result<Vec<u8>> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut data = Vec::with_capacity(len as usize);
    file.take(len).read_to_end(&mut data)?;
    if data.len() as u64 != len {
        return Err(BalerError::InvalidFormat(format!(
            "{} changed during upload",
            path.display()
        )));
    }
    Ok(data)
}

fn open_and_finish(
    storage: &dyn StorageBackend,
    package: &str,
    file: &mut UploadFile,
) -> Result<()> {
    if file.handle.is_none() {
        file.handle = Some(storage.begin_upload(&remote_name(package, &file.name), file.size)?);
    }
    if let Some(handle) = &file.handle {
        storage.finish_upload(handle)?;
    }
    file.finished = true;
    Ok(())
}

fn store_record(progress: &mut BuildProgress, record: &TransferRecord) {
    *progress.transfer_mut(&record.storage_id, TransferDirection::Upload) = record.clone();
}

/// Run one bounded slice of the upload of the package in `dir` to `storage`.
///
/// The updated record is written into `progress`; the caller persists it.
/// Terminal records and records in backoff are returned untouched.
pub fn upload_package(
    storage: &dyn StorageBackend,
    progress: &mut BuildProgress,
    dir: &Path,
    limits: ChunkLimits,
    events: &dyn BuildEvents,
) -> Result<TransferRecord> {
    let storage_id = storage.id().to_string();
    let now = Utc::now();
    let mut record = progress
        .transfer(&storage_id, TransferDirection::Upload)
        .cloned()
        .unwrap_or_else(|| TransferRecord::new(&storage_id, TransferDirection::Upload));
    if !record.status.is_ready(now) {
        debug!(storage = %storage_id, status = %record.status, "upload not runnable");
        return Ok(record);
    }

    if record.status == TransferStatus::Pending {
        let size = package_size(dir)?;
        record.total_bytes = size;
        if let Err(e) = events.validate_upload_target(progress, storage, size) {
            warn!(package = %progress.name, storage = %storage_id, error = %e, "upload target rejected");
            record.finish(TransferStatus::Failed, Some(e.to_string()));
            store_record(progress, &record);
            events.transfer_failed(progress, &record);
            return Ok(record);
        }
    }

    let checkpoint = checkpoint_path(dir, TransferDirection::Upload, &storage_id);
    let mut store: Persistence<UploadState, u64> = Persistence::file(&checkpoint);
    let mut state = match store.load_record()? {
        Some(r) => r.extra_data.clone(),
        None => UploadState::for_dir(dir, storage.upload_chunk_size())?,
    };
    state.reconcile(storage)?;
    let sizes = state.sizes();
    let total = state.total();
    let chunk = state.chunk_size.max(1);

    record.total_bytes = total;
    record.status = TransferStatus::Running;
    record.error = None;
    record.started_at.get_or_insert(now);

    let package = progress.name.clone();
    let cancel_marker = dir.join(CANCEL_FILE);
    let probe = cancel_marker.clone();
    let mut manager = ChunkingManager::new(
        format!("upload:{storage_id}"),
        ByteRangeIterator::new(total, chunk),
        store,
        state,
        limits,
    )
    .with_cancel_probe(move || probe.exists());

    let outcome = manager.start(false, |_, &(offset, len), state| {
        for piece in split_range(&sizes, offset, len) {
            let file = &mut state.files[piece.file];
            if file.finished {
                continue;
            }
            if file.handle.is_none() {
                file.handle = Some(storage.begin_upload(&remote_name(&package, &file.name), file.size)?);
            }
            let data = read_piece(&dir.join(&file.name), piece.offset, piece.len)?;
            let handle = file
                .handle
                .as_ref()
                .ok_or_else(|| ActionError::new("upload session missing"))?;
            storage.upload_chunk(handle, piece.offset, &data)?;
            if piece.offset + piece.len == file.size {
                storage.finish_upload(handle)?;
                file.finished = true;
            }
        }
        Ok(())
    });

    let sent = manager
        .last_position()
        .map_or(0, |p| (p + chunk).min(total));
    record.bytes_transferred = sent;
    let mut state = manager.extra().clone();

    match outcome {
        ChunkOutcome::Complete => {
            for file in state.files.iter_mut().filter(|f| !f.finished) {
                open_and_finish(storage, &package, file)?;
            }
            manager.delete_checkpoint()?;
            record.bytes_transferred = total;
            record.finish(TransferStatus::Succeeded, None);
            info!(package = %package, storage = %storage_id, bytes = total, "upload complete");
            store_record(progress, &record);
            events.transfer_completed(progress, &record);
        }
        ChunkOutcome::Stopped(StopReason::Cancelled) => {
            let transfer = TransferRef {
                storage_id: storage_id.clone(),
                package: package.clone(),
                upload: state.in_flight().cloned(),
            };
            storage.cancel_upload(&transfer)?;
            manager.delete_checkpoint()?;
            remove_marker(&cancel_marker)?;
            record.finish(TransferStatus::Cancelled, None);
            store_record(progress, &record);
            events.transfer_cancelled(progress, &record);
        }
        ChunkOutcome::Stopped(reason) => {
            debug!(storage = %storage_id, ?reason, sent, total, "upload paused");
            store_record(progress, &record);
        }
        ChunkOutcome::Error(failure) => {
            if let Some(retry_after) = failure.retry_after {
                let until = Utc::now()
                    + chrono::Duration::from_std(retry_after)
                        .unwrap_or_else(|_| chrono::Duration::seconds(60));
                warn!(storage = %storage_id, until = %until, "upload rate limited");
                record.status = TransferStatus::Backoff { until };
                record.error = Some(failure.message);
                store_record(progress, &record);
            } else {
                let transfer = TransferRef {
                    storage_id: storage_id.clone(),
                    package: package.clone(),
                    upload: state.in_flight().cloned(),
                };
                if let Err(e) = storage.fail_upload(&transfer) {
                    warn!(storage = %storage_id, error = %e, "fail_upload failed");
                }
                manager.delete_checkpoint()?;
                record.finish(TransferStatus::Failed, Some(failure.to_string()));
                store_record(progress, &record);
                events.transfer_failed(progress, &record);
            }
        }
    }
    Ok(record)
}

fn remove_marker(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Cancel the upload of `progress` to `storage_id` directly.
///
/// A no-op for transfers that never started or already ended. When the
/// storage is no longer configured the record is still marked cancelled.
pub fn cancel_upload(
    storage: Option<&dyn StorageBackend>,
    storage_id: &str,
    progress: &mut BuildProgress,
    dir: &Path,
    events: &dyn BuildEvents,
) -> Result<bool> {
    let Some(record) = progress.transfer(storage_id, TransferDirection::Upload).cloned() else {
        debug!(storage = storage_id, "no upload to cancel");
        return Ok(false);
    };
    if record.status.is_terminal() || record.status == TransferStatus::Pending {
        debug!(storage = storage_id, status = %record.status, "no upload in flight");
        return Ok(false);
    }

    let checkpoint = checkpoint_path(dir, TransferDirection::Upload, storage_id);
    let mut store: Persistence<UploadState, u64> = Persistence::file(&checkpoint);
    let in_flight = store
        .load_record()?
        .and_then(|r| r.extra_data.in_flight().cloned());
    match storage {
        Some(storage) => storage.cancel_upload(&TransferRef {
            storage_id: storage_id.to_string(),
            package: progress.name.clone(),
            upload: in_flight,
        })?,
        None => warn!(
            storage = storage_id,
            package = %progress.name,
            "storage is no longer configured; marking upload cancelled"
        ),
    }
    store.delete()?;

    let mut record = record;
    record.finish(TransferStatus::Cancelled, None);
    store_record(progress, &record);
    events.transfer_cancelled(progress, &record);
    Ok(true)
}
