//! Resumable archive creation from the scan inventory.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{glob_digest, write_header, Record, HEADER_LEN};
use crate::chunking::SeekableIterator;
use crate::error::{BalerError, Result};
use crate::platform::fs::is_soft_io_error;
use crate::scan::{EntryKind, InventoryEntry};

/// One unit of archive work. Also the persisted position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "unit", rename_all = "snake_case")]
pub enum ArchiveUnit {
    Directory { entry: u64 },
    FileHeader { entry: u64 },
    FileGlob { entry: u64, offset: u64, len: u64 },
    Footer,
}

#[derive(Debug, Clone)]
pub struct ArchiveItem {
    pub unit: ArchiveUnit,
    /// `None` for the footer.
    pub entry: Option<InventoryEntry>,
}

/// Walks the inventory as directory, file-header, glob and footer units.
pub struct ArchiveUnitIterator {
    entries: Vec<InventoryEntry>,
    roots: Vec<PathBuf>,
    glob_size: u64,
    /// Bytes of file data before each entry.
    offsets: Vec<u64>,
    total_bytes: u64,
    current: Option<ArchiveItem>,
}

impl ArchiveUnitIterator {
    pub fn new(entries: Vec<InventoryEntry>, roots: Vec<PathBuf>, glob_size: u64) -> Self {
        let mut offsets = Vec::with_capacity(entries.len());
        let mut total_bytes = 0u64;
        for e in &entries {
            offsets.push(total_bytes);
            total_bytes += e.size;
        }
        let mut it = Self {
            entries,
            roots,
            glob_size: glob_size.max(1),
            offsets,
            total_bytes,
            current: None,
        };
        it.current = Some(it.item(it.unit_for_entry(0)));
        it
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    fn unit_for_entry(&self, index: u64) -> ArchiveUnit {
        match self.entries.get(index as usize) {
            None => ArchiveUnit::Footer,
            Some(e) if e.kind == EntryKind::Dir => ArchiveUnit::Directory { entry: index },
            Some(_) => ArchiveUnit::FileHeader { entry: index },
        }
    }

    fn glob_at(&self, entry: u64, offset: u64) -> ArchiveUnit {
        let size = self.entries[entry as usize].size;
        ArchiveUnit::FileGlob {
            entry,
            offset,
            len: self.glob_size.min(size - offset),
        }
    }

    fn item(&self, unit: ArchiveUnit) -> ArchiveItem {
        let entry = match unit {
            ArchiveUnit::Directory { entry }
            | ArchiveUnit::FileHeader { entry }
            | ArchiveUnit::FileGlob { entry, .. } => self.entries.get(entry as usize).cloned(),
            ArchiveUnit::Footer => None,
        };
        ArchiveItem { unit, entry }
    }

    fn next_unit(&self, unit: ArchiveUnit) -> Option<ArchiveUnit> {
        match unit {
            ArchiveUnit::Directory { entry } => Some(self.unit_for_entry(entry + 1)),
            ArchiveUnit::FileHeader { entry } => {
                if self.entries[entry as usize].size > 0 {
                    Some(self.glob_at(entry, 0))
                } else {
                    Some(self.unit_for_entry(entry + 1))
                }
            }
            ArchiveUnit::FileGlob { entry, offset, len } => {
                let next = offset + len;
                if next < self.entries[entry as usize].size {
                    Some(self.glob_at(entry, next))
                } else {
                    Some(self.unit_for_entry(entry + 1))
                }
            }
            ArchiveUnit::Footer => None,
        }
    }

    fn source_path(&self, entry: &InventoryEntry) -> Option<PathBuf> {
        let root = self.roots.get(entry.root)?;
        Some(if entry.rel.is_empty() {
            root.clone()
        } else {
            root.join(&entry.rel)
        })
    }

    /// Whether `unit` is a unit this inventory would produce.
    fn is_well_formed(&self, unit: &ArchiveUnit) -> bool {
        match *unit {
            ArchiveUnit::Footer => true,
            ArchiveUnit::Directory { entry } => self
                .entries
                .get(entry as usize)
                .is_some_and(|e| e.kind == EntryKind::Dir),
            ArchiveUnit::FileHeader { entry } => self
                .entries
                .get(entry as usize)
                .is_some_and(|e| e.kind == EntryKind::File),
            ArchiveUnit::FileGlob { entry, offset, len } => {
                self.entries.get(entry as usize).is_some_and(|e| {
                    e.kind == EntryKind::File
                        && offset < e.size
                        && offset % self.glob_size == 0
                        && len == self.glob_size.min(e.size - offset)
                })
            }
        }
    }
}

impl SeekableIterator for ArchiveUnitIterator {
    type Key = ArchiveUnit;
    type Item = ArchiveItem;
    type Position = ArchiveUnit;

    fn rewind(&mut self) -> Result<()> {
        self.current = Some(self.item(self.unit_for_entry(0)));
        Ok(())
    }

    fn is_valid(&self) -> bool {
        self.current.is_some()
    }

    fn current(&self) -> Option<&ArchiveItem> {
        self.current.as_ref()
    }

    fn key(&self) -> Option<ArchiveUnit> {
        self.current.as_ref().map(|i| i.unit)
    }

    fn advance(&mut self) -> Result<()> {
        if let Some(unit) = self.key() {
            self.current = self.next_unit(unit).map(|u| self.item(u));
        }
        Ok(())
    }

    fn position(&self) -> Option<ArchiveUnit> {
        self.key()
    }

    /// A glob position is stale when its source file vanished or shrank
    /// below the size recorded in the inventory.
    fn seek(&mut self, position: &ArchiveUnit) -> Result<bool> {
        if !self.is_well_formed(position) {
            return Ok(false);
        }
        if let ArchiveUnit::FileGlob { entry, .. } = position {
            let e = &self.entries[*entry as usize];
            let Some(path) = self.source_path(e) else {
                return Ok(false);
            };
            match std::fs::metadata(&path) {
                Ok(m) if m.len() >= e.size => {}
                Ok(m) => {
                    debug!(path = %path.display(), size = m.len(), expected = e.size, "source file shrank");
                    return Ok(false);
                }
                Err(_) => return Ok(false),
            }
        }
        self.current = Some(self.item(*position));
        Ok(true)
    }

    fn progress_percent(&self) -> Option<f64> {
        if self.total_bytes == 0 {
            return None;
        }
        let done = match self.key()? {
            ArchiveUnit::Directory { entry } | ArchiveUnit::FileHeader { entry } => {
                self.offsets[entry as usize]
            }
            ArchiveUnit::FileGlob { entry, offset, .. } => self.offsets[entry as usize] + offset,
            ArchiveUnit::Footer => self.total_bytes,
        };
        Some(done as f64 * 100.0 / self.total_bytes as f64)
    }
}

/// Extra data of the archive job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveCreateState {
    pub dir_index: u64,
    pub file_index: u64,
    pub skipped_files: u64,
    pub skipped_dirs: u64,
    /// Files that shrank while being archived; their tail is zero-filled.
    pub changed_files: u64,
    /// Archive length covered by this checkpoint.
    pub archive_offset: u64,
    /// File payload bytes written.
    pub bytes_written: u64,
    /// A file header was written and its globs are not finished.
    pub header_written: bool,
    pub header_offset: u64,
    /// Entry whose source could not be opened; its globs are skipped.
    pub skip_entry: Option<u64>,
    pub footer_written: bool,
}

/// Appends units to the archive file.
pub struct ArchiveWriter {
    file: File,
    roots: Vec<PathBuf>,
    source: Option<(u64, File)>,
}

impl ArchiveWriter {
    /// Open `path` for the unit after the checkpoint.
    ///
    /// A fresh state starts a new archive with its header. Otherwise the
    /// archive is cut back to the checkpointed length; a shorter archive
    /// means the checkpoint is newer than the data and cannot be trusted.
    pub fn open(
        path: &Path,
        roots: Vec<PathBuf>,
        state: &mut ArchiveCreateState,
        created: i64,
    ) -> Result<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)?;
        if state.archive_offset == 0 {
            file.set_len(0)?;
            write_header(&mut file, created)?;
            state.archive_offset = HEADER_LEN;
        } else {
            let len = file.metadata()?.len();
            if len < state.archive_offset {
                return Err(BalerError::StaleCheckpoint(format!(
                    "{} is shorter ({len}) than its checkpoint ({})",
                    path.display(),
                    state.archive_offset
                )));
            }
            file.set_len(state.archive_offset)?;
            file.seek(SeekFrom::End(0))?;
        }
        Ok(Self {
            file,
            roots,
            source: None,
        })
    }

    fn source_path(&self, entry: &InventoryEntry) -> Result<PathBuf> {
        let root = self.roots.get(entry.root).ok_or_else(|| {
            BalerError::InvalidFormat(format!("inventory root {} out of range", entry.root))
        })?;
        Ok(if entry.rel.is_empty() {
            root.clone()
        } else {
            root.join(&entry.rel)
        })
    }

    fn append(&mut self, record: &Record, state: &mut ArchiveCreateState) -> Result<()> {
        let bytes = record.encode()?;
        self.file.write_all(&bytes)?;
        state.archive_offset += bytes.len() as u64;
        Ok(())
    }

    pub fn write_unit(&mut self, item: &ArchiveItem, state: &mut ArchiveCreateState) -> Result<()> {
        match (item.unit, item.entry.as_ref()) {
            (ArchiveUnit::Directory { .. }, Some(entry)) => {
                self.append(
                    &Record::Dir {
                        path: entry.path.clone(),
                        mtime: entry.mtime,
                        mode: entry.mode,
                    },
                    state,
                )?;
                state.dir_index += 1;
            }
            (ArchiveUnit::FileHeader { entry: index }, Some(entry)) => {
                self.write_file_header(index, entry, state)?;
            }
            (ArchiveUnit::FileGlob { entry: index, offset, len }, Some(entry)) => {
                self.write_glob(index, entry, offset, len, state)?;
            }
            (ArchiveUnit::Footer, _) => {
                self.append(
                    &Record::End {
                        dirs: state.dir_index,
                        files: state.file_index,
                        bytes: state.bytes_written,
                    },
                    state,
                )?;
                self.file.sync_all()?;
                state.footer_written = true;
            }
            (unit, None) => {
                return Err(BalerError::Other(format!("archive unit {unit:?} has no entry")))
            }
        }
        Ok(())
    }

    fn write_file_header(
        &mut self,
        index: u64,
        entry: &InventoryEntry,
        state: &mut ArchiveCreateState,
    ) -> Result<()> {
        let path = self.source_path(entry)?;
        let source = match File::open(&path) {
            Ok(f) => f,
            Err(e) if is_soft_io_error(&e) => {
                warn!(path = %path.display(), error = %e, "skipping unreadable file");
                state.skipped_files += 1;
                state.skip_entry = Some(index);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        state.header_offset = state.archive_offset;
        self.append(
            &Record::File {
                path: entry.path.clone(),
                size: entry.size,
                mtime: entry.mtime,
                mode: entry.mode,
            },
            state,
        )?;
        state.skip_entry = None;
        if entry.size == 0 {
            state.header_written = false;
            state.file_index += 1;
        } else {
            state.header_written = true;
            self.source = Some((index, source));
        }
        Ok(())
    }

    fn write_glob(
        &mut self,
        index: u64,
        entry: &InventoryEntry,
        offset: u64,
        len: u64,
        state: &mut ArchiveCreateState,
    ) -> Result<()> {
        let last = offset + len >= entry.size;
        if state.skip_entry == Some(index) {
            if last {
                state.skip_entry = None;
            }
            return Ok(());
        }

        let source = match self.source.take() {
            Some((i, f)) if i == index => f,
            _ => File::open(self.source_path(entry)?)?,
        };
        let mut source = source;
        source.seek(SeekFrom::Start(offset))?;
        let mut data = Vec::with_capacity(len as usize);
        (&mut source).take(len).read_to_end(&mut data)?;
        if (data.len() as u64) < len {
            warn!(
                path = %entry.path,
                expected = len,
                read = data.len(),
                "file shrank while archiving; padding with zeros"
            );
            state.changed_files += 1;
            data.resize(len as usize, 0);
        }

        self.append(
            &Record::Glob {
                digest: glob_digest(&data),
                data,
            },
            state,
        )?;
        state.bytes_written += len;
        if last {
            state.header_written = false;
            state.file_index += 1;
        } else {
            self.source = Some((index, source));
        }
        Ok(())
    }

    /// Flush archive data to disk.
    pub fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}
