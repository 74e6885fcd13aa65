//! Resumable archive expansion.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{glob_digest, read_header, safe_join, Record, HEADER_LEN};
use crate::chunking::{
    ActionError, ChunkFailure, ChunkLimits, ChunkOutcome, ChunkingManager, Persistence,
    SeekableIterator,
};
use crate::error::{BalerError, Result};
use crate::platform::fs::{apply_mode, set_file_mtime};

/// Records of an archive. Key and position are the record's byte offset.
pub struct ArchiveRecordIterator {
    path: PathBuf,
    len: u64,
    reader: Option<BufReader<File>>,
    offset: u64,
    current: Option<Record>,
}

impl ArchiveRecordIterator {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut it = Self {
            len: 0,
            path,
            reader: None,
            offset: HEADER_LEN,
            current: None,
        };
        it.rewind()?;
        Ok(it)
    }

    fn reader(&mut self) -> Result<&mut BufReader<File>> {
        if self.reader.is_none() {
            let mut file = File::open(&self.path)?;
            self.len = file.metadata()?.len();
            read_header(&mut file)?;
            self.reader = Some(BufReader::new(file));
        }
        self.reader
            .as_mut()
            .ok_or_else(|| BalerError::Other("archive reader unavailable".into()))
    }

    fn read_at(&mut self, offset: u64) -> Result<Option<Record>> {
        let reader = self.reader()?;
        reader.seek(SeekFrom::Start(offset))?;
        Record::read_from(reader)
    }
}

impl SeekableIterator for ArchiveRecordIterator {
    type Key = u64;
    type Item = Record;
    type Position = u64;

    fn rewind(&mut self) -> Result<()> {
        self.offset = HEADER_LEN;
        self.current = self.read_at(HEADER_LEN)?;
        Ok(())
    }

    fn is_valid(&self) -> bool {
        self.current.is_some()
    }

    fn current(&self) -> Option<&Record> {
        self.current.as_ref()
    }

    fn key(&self) -> Option<u64> {
        self.current.as_ref().map(|_| self.offset)
    }

    fn advance(&mut self) -> Result<()> {
        if let Some(record) = self.current.take() {
            self.offset += record.encoded_len();
            self.current = self.read_at(self.offset)?;
        }
        Ok(())
    }

    fn position(&self) -> Option<u64> {
        self.key()
    }

    fn seek(&mut self, position: &u64) -> Result<bool> {
        if *position < HEADER_LEN {
            return Ok(false);
        }
        match self.read_at(*position) {
            Ok(Some(record)) => {
                self.offset = *position;
                self.current = Some(record);
                Ok(true)
            }
            Ok(None) | Err(BalerError::InvalidFormat(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn progress_percent(&self) -> Option<f64> {
        (self.len > 0).then(|| self.offset as f64 * 100.0 / self.len as f64)
    }

    fn stop_iteration(&mut self) {
        self.reader = None;
    }
}

/// Extra data of the expand job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveExpandState {
    pub files_created: u64,
    pub dirs_created: u64,
    pub bytes_written: u64,
    /// Archive path of the file being filled, if one is open.
    pub current_file: Option<String>,
    pub current_file_len: u64,
    pub current_file_size: u64,
    pub current_mtime: i64,
    pub current_mode: u32,
    pub footer_seen: bool,
}

/// Applies archive records under a destination directory.
pub struct Expander {
    dest: PathBuf,
    out: Option<File>,
}

impl Expander {
    /// Reopen the partially written file, if any, cut back to the length the
    /// checkpoint covers.
    pub fn open(dest: &Path, state: &ArchiveExpandState) -> Result<Self> {
        fs::create_dir_all(dest)?;
        let mut out = None;
        if let Some(current) = &state.current_file {
            let path = safe_join(dest, current)?;
            let mut file = OpenOptions::new().write(true).open(&path)?;
            let len = file.metadata()?.len();
            if len < state.current_file_len {
                return Err(BalerError::StaleCheckpoint(format!(
                    "{} is shorter ({len}) than its checkpoint ({})",
                    path.display(),
                    state.current_file_len
                )));
            }
            file.set_len(state.current_file_len)?;
            file.seek(SeekFrom::End(0))?;
            out = Some(file);
        }
        Ok(Self {
            dest: dest.to_path_buf(),
            out,
        })
    }

    pub fn apply(&mut self, record: &Record, state: &mut ArchiveExpandState) -> Result<()> {
        if state.footer_seen {
            return Err(BalerError::InvalidFormat("record after archive footer".into()));
        }
        match record {
            Record::Dir { path, .. } => {
                self.ensure_no_open_file(state)?;
                fs::create_dir_all(safe_join(&self.dest, path)?)?;
                state.dirs_created += 1;
            }
            Record::File {
                path,
                size,
                mtime,
                mode,
            } => {
                self.ensure_no_open_file(state)?;
                let target = safe_join(&self.dest, path)?;
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                let file = File::create(&target)?;
                state.current_file = Some(path.clone());
                state.current_file_len = 0;
                state.current_file_size = *size;
                state.current_mtime = *mtime;
                state.current_mode = *mode;
                self.out = Some(file);
                if *size == 0 {
                    self.finish_file(state)?;
                }
            }
            Record::Glob { digest, data } => {
                if glob_digest(data) != *digest {
                    return Err(BalerError::InvalidFormat(format!(
                        "glob digest mismatch in {}",
                        state.current_file.as_deref().unwrap_or("-")
                    )));
                }
                let len = data.len() as u64;
                if state.current_file_len + len > state.current_file_size {
                    return Err(BalerError::InvalidFormat(format!(
                        "glob overruns {}",
                        state.current_file.as_deref().unwrap_or("-")
                    )));
                }
                let out = self
                    .out
                    .as_mut()
                    .ok_or_else(|| BalerError::InvalidFormat("glob without a file header".into()))?;
                out.write_all(data)?;
                state.current_file_len += len;
                state.bytes_written += len;
                if state.current_file_len == state.current_file_size {
                    self.finish_file(state)?;
                }
            }
            Record::End { dirs, files, bytes } => {
                self.ensure_no_open_file(state)?;
                if (*dirs, *files, *bytes)
                    != (state.dirs_created, state.files_created, state.bytes_written)
                {
                    return Err(BalerError::InvalidFormat(format!(
                        "footer counts {dirs}/{files}/{bytes} do not match expanded {}/{}/{}",
                        state.dirs_created, state.files_created, state.bytes_written
                    )));
                }
                state.footer_seen = true;
            }
        }
        Ok(())
    }

    fn ensure_no_open_file(&self, state: &ArchiveExpandState) -> Result<()> {
        match &state.current_file {
            Some(path) => Err(BalerError::InvalidFormat(format!(
                "{path} ended after {} of {} bytes",
                state.current_file_len, state.current_file_size
            ))),
            None => Ok(()),
        }
    }

    fn finish_file(&mut self, state: &mut ArchiveExpandState) -> Result<()> {
        if let Some(out) = self.out.take() {
            out.sync_data()?;
        }
        if let Some(path) = state.current_file.take() {
            let target = safe_join(&self.dest, &path)?;
            apply_mode(&target, state.current_mode)?;
            set_file_mtime(&target, state.current_mtime)?;
        }
        state.files_created += 1;
        state.current_file_len = 0;
        state.current_file_size = 0;
        Ok(())
    }

    /// Flush the open file so its length matches the next checkpoint.
    pub fn sync(&self) -> Result<()> {
        if let Some(out) = &self.out {
            out.sync_data()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpandOutcome {
    Complete(ArchiveExpandState),
    /// The budget ran out; call again to continue.
    Stopped(ArchiveExpandState),
    Error(ChunkFailure),
}

/// Expand `archive` into `dest` for one bounded slice of work.
///
/// Progress is checkpointed at `checkpoint`, which is removed once the
/// archive's footer has been applied.
pub fn expand_archive(
    archive: &Path,
    dest: &Path,
    checkpoint: &Path,
    limits: ChunkLimits,
    rewind: bool,
) -> Result<ExpandOutcome> {
    let mut store: Persistence<ArchiveExpandState, u64> = Persistence::file(checkpoint);
    let state = if rewind {
        ArchiveExpandState::default()
    } else {
        store.load_record()?.map(|r| r.extra_data.clone()).unwrap_or_default()
    };
    let iterator = ArchiveRecordIterator::open(archive)?;
    let mut expander = Expander::open(dest, &state)?;

    let mut manager = ChunkingManager::new("expand", iterator, store, state, limits);
    let outcome = manager.start(rewind, |_, record, state| {
        expander.apply(record, state).map_err(ActionError::from)
    });
    expander.sync()?;

    match outcome {
        ChunkOutcome::Complete => {
            let state = manager.extra().clone();
            if !state.footer_seen {
                return Err(BalerError::InvalidFormat(format!(
                    "{} has no footer",
                    archive.display()
                )));
            }
            manager.delete_checkpoint()?;
            info!(
                dest = %dest.display(),
                files = state.files_created,
                dirs = state.dirs_created,
                bytes = state.bytes_written,
                "archive expanded"
            );
            Ok(ExpandOutcome::Complete(state))
        }
        ChunkOutcome::Stopped(reason) => {
            debug!(?reason, "archive expansion paused");
            Ok(ExpandOutcome::Stopped(manager.extra().clone()))
        }
        ChunkOutcome::Error(failure) => Ok(ExpandOutcome::Error(failure)),
    }
}
