//! The scan phase: a resumable walk over the source roots producing the
//! package inventory.

pub mod filters;
pub mod tree;

use std::cmp::Ordering;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ignore::gitignore::Gitignore;
use ignore::{DirEntry, Walk, WalkBuilder};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::chunking::SeekableIterator;
use crate::error::{BalerError, Result};
use crate::platform::fs::{is_soft_io_error, non_utf8_hex, path_from_hex, summarize_metadata};

pub use filters::{FilterScope, Filters, InstanceFilters};
pub use tree::{ScanTree, TreeNode};

pub const INVENTORY_FILE: &str = "inventory.jsonl";
/// Big files retained by name in the scan report.
const MAX_BIG_FILES: usize = 100;

/// Top-level directory name of a source root inside the archive.
pub fn root_label(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "root".to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Dir,
    File,
}

/// One line of `inventory.jsonl`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryEntry {
    pub root: usize,
    /// Path relative to the source root (`""` for the root itself).
    pub rel: String,
    /// `/`-separated path inside the archive.
    pub path: String,
    pub kind: EntryKind,
    pub size: u64,
    pub mtime: i64,
    pub mode: u32,
}

pub fn read_inventory(path: &Path) -> Result<Vec<InventoryEntry>> {
    let reader = BufReader::new(File::open(path)?);
    let mut entries = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        entries.push(serde_json::from_str(&line)?);
    }
    Ok(entries)
}

/// Position of the walk: source root index and path relative to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanPosition {
    pub root: usize,
    pub path: String,
    /// Exact bytes of `path` when the name is not UTF-8.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_path: Option<String>,
    /// The walk error reported for `path`, which follows the directory
    /// entry of the same path.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub unreadable: bool,
}

impl ScanPosition {
    fn target(&self) -> PathBuf {
        self.raw_path
            .as_deref()
            .and_then(path_from_hex)
            .unwrap_or_else(|| PathBuf::from(&self.path))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalkKind {
    Dir,
    File,
    /// Symlinks, sockets, devices.
    Other,
    Unreadable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkEntry {
    pub root: usize,
    pub rel: PathBuf,
    pub abs: PathBuf,
    pub kind: WalkKind,
}

struct ExcludeRules {
    filters: Filters,
    patterns: Vec<Gitignore>,
}

fn build_excludes(root: &Path, patterns: &[String]) -> Result<Gitignore> {
    let mut builder = ignore::gitignore::GitignoreBuilder::new(root);
    for pat in patterns {
        builder
            .add_line(None, pat)
            .map_err(|e| BalerError::Config(format!("invalid exclude pattern '{pat}': {e}")))?;
    }
    builder
        .build()
        .map_err(|e| BalerError::Config(format!("exclude matcher build failed: {e}")))
}

/// Sorted, depth-first walk over several roots without following symlinks.
///
/// Excluded directories are pruned from the walk. Excluded files are still
/// yielded so the scan can account for them. Walk order equals the
/// component-wise order of relative paths, which is what makes `seek` cheap:
/// the rebuilt walker skips every subtree that sorts before the target.
pub struct WalkIterator {
    roots: Vec<PathBuf>,
    rules: Arc<ExcludeRules>,
    root_idx: usize,
    walk: Option<Walk>,
    current: Option<WalkEntry>,
}

impl WalkIterator {
    pub fn new(roots: Vec<PathBuf>, filters: Filters, exclude_patterns: &[String]) -> Result<Self> {
        let patterns = roots
            .iter()
            .map(|r| build_excludes(r, exclude_patterns))
            .collect::<Result<Vec<_>>>()?;
        let mut it = Self {
            roots,
            rules: Arc::new(ExcludeRules { filters, patterns }),
            root_idx: 0,
            walk: None,
            current: None,
        };
        it.rewind()?;
        Ok(it)
    }

    fn build_walk(&self, root_idx: usize, resume: Option<PathBuf>) -> Walk {
        let root = self.roots[root_idx].clone();
        let mut builder = WalkBuilder::new(&root);
        builder
            .follow_links(false)
            .hidden(false)
            .ignore(false)
            .parents(false)
            .git_global(false)
            .git_exclude(false)
            .git_ignore(false)
            .require_git(false)
            .sort_by_file_name(std::ffi::OsStr::cmp);

        let rules = Arc::clone(&self.rules);
        builder.filter_entry(move |entry| {
            let path = entry.path();
            if path == root {
                return true;
            }
            let rel = path.strip_prefix(&root).unwrap_or(path);
            if let Some(target) = &resume {
                if rel < target.as_path() && !target.starts_with(rel) {
                    return false;
                }
            }
            let is_dir = entry.file_type().is_some_and(|ft| ft.is_dir());
            if rules.patterns[root_idx]
                .matched_path_or_any_parents(rel, is_dir)
                .is_ignore()
            {
                return false;
            }
            !(is_dir && rules.filters.excludes_dir(path))
        });
        builder.build()
    }

    fn entry_from(&self, entry: DirEntry) -> WalkEntry {
        let root = &self.roots[self.root_idx];
        let rel = entry.path().strip_prefix(root).unwrap_or(Path::new("")).to_path_buf();
        let kind = match entry.file_type() {
            Some(ft) if ft.is_dir() => WalkKind::Dir,
            Some(ft) if ft.is_file() => WalkKind::File,
            _ => WalkKind::Other,
        };
        WalkEntry {
            root: self.root_idx,
            rel,
            abs: entry.into_path(),
            kind,
        }
    }

    /// Walk errors that carry a path become unreadable entries; the rest
    /// cannot be positioned and are only logged.
    fn entry_from_error(&self, err: ignore::Error) -> Option<WalkEntry> {
        let root = &self.roots[self.root_idx];
        let Some(path) = error_path(&err).map(Path::to_path_buf) else {
            warn!(error = %err, "skipping walk error without a path");
            return None;
        };
        let rel = path.strip_prefix(root).ok()?.to_path_buf();
        Some(WalkEntry {
            root: self.root_idx,
            rel,
            abs: path,
            kind: WalkKind::Unreadable(err.to_string()),
        })
    }

    fn next_entry(&mut self) -> Option<WalkEntry> {
        loop {
            if self.walk.is_none() {
                if self.root_idx >= self.roots.len() {
                    return None;
                }
                self.walk = Some(self.build_walk(self.root_idx, None));
            }
            let next = self.walk.as_mut().and_then(|w| w.next());
            match next {
                Some(Ok(entry)) => return Some(self.entry_from(entry)),
                Some(Err(err)) => {
                    if let Some(entry) = self.entry_from_error(err) {
                        return Some(entry);
                    }
                }
                None => {
                    self.walk = None;
                    self.root_idx += 1;
                }
            }
        }
    }
}

fn error_path(err: &ignore::Error) -> Option<&Path> {
    match err {
        ignore::Error::WithPath { path, .. } => Some(path.as_path()),
        ignore::Error::WithDepth { err, .. } | ignore::Error::WithLineNumber { err, .. } => {
            error_path(err)
        }
        _ => None,
    }
}

fn rel_string(rel: &Path) -> String {
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

impl SeekableIterator for WalkIterator {
    type Key = String;
    type Item = WalkEntry;
    type Position = ScanPosition;

    fn rewind(&mut self) -> Result<()> {
        self.root_idx = 0;
        self.walk = None;
        self.current = self.next_entry();
        Ok(())
    }

    fn is_valid(&self) -> bool {
        self.current.is_some()
    }

    fn current(&self) -> Option<&WalkEntry> {
        self.current.as_ref()
    }

    fn key(&self) -> Option<String> {
        self.current.as_ref().map(|e| e.abs.to_string_lossy().to_string())
    }

    fn advance(&mut self) -> Result<()> {
        if self.current.is_some() {
            self.current = self.next_entry();
        }
        Ok(())
    }

    fn position(&self) -> Option<ScanPosition> {
        self.current.as_ref().map(|e| ScanPosition {
            root: e.root,
            path: rel_string(&e.rel),
            raw_path: non_utf8_hex(&e.rel),
            unreadable: matches!(e.kind, WalkKind::Unreadable(_)),
        })
    }

    fn seek(&mut self, position: &ScanPosition) -> Result<bool> {
        self.current = None;
        self.walk = None;
        if position.root >= self.roots.len() {
            return Ok(false);
        }
        self.root_idx = position.root;
        let target = position.target();
        let mut walk = self.build_walk(position.root, Some(target.clone()));

        while let Some(next) = walk.next() {
            let entry = match next {
                Ok(entry) => self.entry_from(entry),
                Err(err) => match self.entry_from_error(err) {
                    Some(entry) => entry,
                    None => continue,
                },
            };
            match entry.rel.as_path().cmp(target.as_path()) {
                Ordering::Less => continue,
                Ordering::Equal
                    if matches!(entry.kind, WalkKind::Unreadable(_)) != position.unreadable =>
                {
                    continue
                }
                Ordering::Equal => {
                    self.current = Some(entry);
                    self.walk = Some(walk);
                    return Ok(true);
                }
                Ordering::Greater => break,
            }
        }
        debug!(root = position.root, path = %position.path, "scan position no longer exists");
        Ok(false)
    }

    fn progress_percent(&self) -> Option<f64> {
        if self.roots.is_empty() {
            return None;
        }
        let done = self.root_idx.min(self.roots.len());
        Some(done as f64 * 100.0 / self.roots.len() as f64)
    }

    fn stop_iteration(&mut self) {
        self.walk = None;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BigFile {
    pub path: String,
    pub size: u64,
}

/// Extra data of the scan job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanState {
    pub dirs: u64,
    pub files: u64,
    pub total_bytes: u64,
    pub excluded_files: u64,
    pub excluded_bytes: u64,
    pub skipped_links: u64,
    pub big_files: Vec<BigFile>,
    pub big_file_count: u64,
    /// Bytes of `inventory.jsonl` covered by this checkpoint.
    pub inventory_len: u64,
    pub filters: Filters,
}

/// What the scan found, kept in the build progress.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanReport {
    pub dirs: u64,
    pub files: u64,
    pub total_bytes: u64,
    pub excluded_files: u64,
    pub excluded_bytes: u64,
    pub skipped_links: u64,
    pub unreadable: u64,
    pub big_files: Vec<BigFile>,
    pub big_file_count: u64,
    pub filters: Filters,
}

impl ScanState {
    pub fn new(filters: Filters) -> Self {
        Self {
            filters,
            ..Self::default()
        }
    }

    pub fn report(&self) -> ScanReport {
        ScanReport {
            dirs: self.dirs,
            files: self.files,
            total_bytes: self.total_bytes,
            excluded_files: self.excluded_files,
            excluded_bytes: self.excluded_bytes,
            skipped_links: self.skipped_links,
            unreadable: self.filters.unreadable_total(),
            big_files: self.big_files.clone(),
            big_file_count: self.big_file_count,
            filters: self.filters.clone(),
        }
    }
}

/// Appends accepted walk entries to the inventory.
pub struct InventoryWriter {
    file: File,
    labels: Vec<String>,
    big_file_threshold: u64,
}

impl InventoryWriter {
    /// Open the inventory for appending, first cutting it back to the length
    /// recorded in `state` so entries after the last checkpoint are dropped.
    pub fn open(
        path: &Path,
        state: &ScanState,
        roots: &[PathBuf],
        big_file_threshold: u64,
    ) -> Result<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)?;
        let len = file.metadata()?.len();
        if len < state.inventory_len {
            return Err(BalerError::StaleCheckpoint(format!(
                "{} is shorter ({len}) than its checkpoint ({})",
                path.display(),
                state.inventory_len
            )));
        }
        file.set_len(state.inventory_len)?;
        file.seek(SeekFrom::End(0))?;
        Ok(Self {
            file,
            labels: roots.iter().map(|r| root_label(r)).collect(),
            big_file_threshold,
        })
    }

    pub fn record(&mut self, entry: &WalkEntry, state: &mut ScanState) -> Result<()> {
        let is_dir = entry.kind == WalkKind::Dir;
        match &entry.kind {
            WalkKind::Unreadable(message) => {
                debug!(path = %entry.abs.display(), error = %message, "unreadable entry");
                state.filters.record_unreadable(&entry.abs, false);
                return Ok(());
            }
            WalkKind::Other => {
                state.skipped_links += 1;
                return Ok(());
            }
            WalkKind::Dir | WalkKind::File => {}
        }

        if entry.rel.to_str().is_none() {
            state.filters.record_unknown(&entry.abs, is_dir);
            return Ok(());
        }

        let metadata = match fs::symlink_metadata(&entry.abs) {
            Ok(m) => summarize_metadata(&m),
            Err(e) if is_soft_io_error(&e) => {
                state.filters.record_unreadable(&entry.abs, is_dir);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        if !is_dir && state.filters.excludes_file(&entry.abs) {
            state.excluded_files += 1;
            state.excluded_bytes += metadata.size;
            return Ok(());
        }

        let rel = rel_string(&entry.rel);
        let label = &self.labels[entry.root];
        let archive_path = if rel.is_empty() {
            label.clone()
        } else {
            format!("{label}/{rel}")
        };
        let line = InventoryEntry {
            root: entry.root,
            rel,
            path: archive_path,
            kind: if is_dir { EntryKind::Dir } else { EntryKind::File },
            size: if is_dir { 0 } else { metadata.size },
            mtime: metadata.mtime,
            mode: metadata.mode,
        };

        let mut bytes = serde_json::to_vec(&line)?;
        bytes.push(b'\n');
        self.file.write_all(&bytes)?;
        state.inventory_len += bytes.len() as u64;

        if is_dir {
            state.dirs += 1;
        } else {
            state.files += 1;
            state.total_bytes += line.size;
            if line.size >= self.big_file_threshold {
                state.big_file_count += 1;
                if state.big_files.len() < MAX_BIG_FILES {
                    state.big_files.push(BigFile {
                        path: line.path.clone(),
                        size: line.size,
                    });
                }
            }
        }
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}
