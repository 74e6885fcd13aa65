use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use baler_storage::{
    RetryConfig, StorageBackend, StorageConfig, StorageKind, StorageRegistry, TransferRef,
    UploadHandle,
};
use baler_types::error::{BalerError, Result};

use crate::build::{BuildProgress, Engine, Phase};
use crate::config::{BalerConfig, LockModeConfig};
use crate::database::{DatabaseSource, SqlValue};
use crate::events::{default_upload_validation, BuildEvents};
use crate::transfer::TransferRecord;

#[derive(Default)]
struct MemoryState {
    objects: BTreeMap<String, Vec<u8>>,
    /// token -> (object name, bytes received, declared size)
    sessions: HashMap<String, (String, Vec<u8>, u64)>,
    next_token: u64,
    rate_limit_next: Option<Duration>,
    fail_next: Option<String>,
    fail_deletes: HashSet<String>,
    chunk_calls: usize,
    cancels: usize,
    fails: usize,
}

/// In-memory storage target. Clones share their objects, so a test can
/// keep one handle while the registry owns another.
#[derive(Clone)]
pub struct MemoryStorage {
    id: String,
    upload_chunk: u64,
    download_chunk: u64,
    authorized: bool,
    free_space: Option<u64>,
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStorage {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            upload_chunk: 1024,
            download_chunk: 1024,
            authorized: true,
            free_space: None,
            state: Arc::new(Mutex::new(MemoryState::default())),
        }
    }

    pub fn with_chunk_sizes(mut self, upload: u64, download: u64) -> Self {
        self.upload_chunk = upload;
        self.download_chunk = download;
        self
    }

    pub fn with_free_space(mut self, free: Option<u64>) -> Self {
        self.free_space = free;
        self
    }

    pub fn unauthorized(mut self) -> Self {
        self.authorized = false;
        self
    }

    /// The next chunk transfer fails with `RateLimited`.
    pub fn rate_limit_next(&self, retry_after: Duration) {
        self.state.lock().unwrap().rate_limit_next = Some(retry_after);
    }

    /// The next chunk transfer fails with a plain error.
    pub fn fail_next(&self, message: &str) {
        self.state.lock().unwrap().fail_next = Some(message.to_string());
    }

    pub fn fail_delete(&self, name: &str) {
        self.state.lock().unwrap().fail_deletes.insert(name.to_string());
    }

    pub fn put_object(&self, name: &str, data: &[u8]) {
        self.state
            .lock()
            .unwrap()
            .objects
            .insert(name.to_string(), data.to_vec());
    }

    pub fn object(&self, name: &str) -> Option<Vec<u8>> {
        self.state.lock().unwrap().objects.get(name).cloned()
    }

    pub fn object_names(&self) -> Vec<String> {
        self.state.lock().unwrap().objects.keys().cloned().collect()
    }

    pub fn open_sessions(&self) -> usize {
        self.state.lock().unwrap().sessions.len()
    }

    pub fn chunk_calls(&self) -> usize {
        self.state.lock().unwrap().chunk_calls
    }

    pub fn cancel_count(&self) -> usize {
        self.state.lock().unwrap().cancels
    }

    pub fn fail_count(&self) -> usize {
        self.state.lock().unwrap().fails
    }

    fn injected_fault(state: &mut MemoryState) -> Result<()> {
        state.chunk_calls += 1;
        if let Some(retry_after) = state.rate_limit_next.take() {
            return Err(BalerError::RateLimited { retry_after });
        }
        if let Some(message) = state.fail_next.take() {
            return Err(BalerError::Other(message));
        }
        Ok(())
    }

    fn drop_session(&self, transfer: &TransferRef) {
        let mut state = self.state.lock().unwrap();
        if let Some(token) = transfer.upload.as_ref().and_then(|h| h.token.as_ref()) {
            state.sessions.remove(token);
        }
    }
}

impl StorageBackend for MemoryStorage {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> StorageKind {
        StorageKind::Local
    }

    fn is_authorized(&self) -> bool {
        self.authorized
    }

    fn free_space(&self) -> Result<Option<u64>> {
        Ok(self.free_space)
    }

    fn upload_chunk_size(&self) -> u64 {
        self.upload_chunk
    }

    fn download_chunk_size(&self) -> u64 {
        self.download_chunk
    }

    fn begin_upload(&self, name: &str, total_size: u64) -> Result<UploadHandle> {
        let mut state = self.state.lock().unwrap();
        state.next_token += 1;
        let token = format!("t{}", state.next_token);
        state
            .sessions
            .insert(token.clone(), (name.to_string(), Vec::new(), total_size));
        Ok(UploadHandle {
            name: name.to_string(),
            token: Some(token),
            total_size,
        })
    }

    fn upload_chunk(&self, handle: &UploadHandle, offset: u64, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        Self::injected_fault(&mut state)?;
        let token = handle.token.clone().unwrap_or_default();
        let (_, buf, _) = state
            .sessions
            .get_mut(&token)
            .ok_or_else(|| BalerError::StaleCheckpoint(format!("no session {token}")))?;
        buf.truncate(offset as usize);
        if buf.len() != offset as usize {
            return Err(BalerError::Other(format!("gap before offset {offset}")));
        }
        buf.extend_from_slice(data);
        Ok(())
    }

    fn finish_upload(&self, handle: &UploadHandle) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let token = handle.token.clone().unwrap_or_default();
        let (name, buf, total) = state
            .sessions
            .remove(&token)
            .ok_or_else(|| BalerError::StaleCheckpoint(format!("no session {token}")))?;
        if buf.len() as u64 != total {
            return Err(BalerError::Other(format!(
                "{name}: {} of {total} bytes",
                buf.len()
            )));
        }
        state.objects.insert(name, buf);
        Ok(())
    }

    fn cancel_upload(&self, transfer: &TransferRef) -> Result<()> {
        self.drop_session(transfer);
        self.state.lock().unwrap().cancels += 1;
        Ok(())
    }

    fn fail_upload(&self, transfer: &TransferRef) -> Result<()> {
        self.drop_session(transfer);
        self.state.lock().unwrap().fails += 1;
        Ok(())
    }

    fn download_chunk(&self, name: &str, offset: u64, length: u64) -> Result<Vec<u8>> {
        let mut state = self.state.lock().unwrap();
        Self::injected_fault(&mut state)?;
        let data = state
            .objects
            .get(name)
            .ok_or_else(|| BalerError::PackageNotFound(name.to_string()))?;
        let start = (offset as usize).min(data.len());
        let end = (offset + length).min(data.len() as u64) as usize;
        Ok(data[start..end].to_vec())
    }

    fn object_size(&self, name: &str) -> Result<Option<u64>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .objects
            .get(name)
            .map(|d| d.len() as u64))
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .objects
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn delete(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_deletes.contains(name) {
            return Err(BalerError::Other(format!("delete of {name} refused")));
        }
        state.objects.remove(name);
        Ok(())
    }
}

struct MemoryTable {
    name: String,
    columns: Vec<String>,
    rows: Vec<Vec<SqlValue>>,
}

/// Database source over in-memory tables.
#[derive(Default)]
pub struct MemoryDatabase {
    tables: Vec<MemoryTable>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, name: &str, columns: &[&str], rows: Vec<Vec<SqlValue>>) -> Self {
        self.tables.push(MemoryTable {
            name: name.to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows,
        });
        self
    }

    fn table(&self, name: &str) -> Result<&MemoryTable> {
        self.tables
            .iter()
            .find(|t| t.name == name)
            .ok_or_else(|| BalerError::Other(format!("no table {name}")))
    }
}

impl DatabaseSource for MemoryDatabase {
    fn name(&self) -> String {
        "memory".into()
    }

    fn tables(&self) -> Result<Vec<String>> {
        Ok(self.tables.iter().map(|t| t.name.clone()).collect())
    }

    fn create_statement(&self, table: &str) -> Result<String> {
        let t = self.table(table)?;
        Ok(format!("CREATE TABLE \"{}\" ({})", t.name, t.columns.join(", ")))
    }

    fn columns(&self, table: &str) -> Result<Vec<String>> {
        Ok(self.table(table)?.columns.clone())
    }

    fn row_count(&self, table: &str) -> Result<u64> {
        Ok(self.table(table)?.rows.len() as u64)
    }

    fn rows(&self, table: &str, offset: u64, limit: u64) -> Result<Vec<Vec<SqlValue>>> {
        Ok(self
            .table(table)?
            .rows
            .iter()
            .skip(offset as usize)
            .take(limit as usize)
            .cloned()
            .collect())
    }
}

/// Events collected as short strings, e.g. `phase:scan`.
#[derive(Clone, Default)]
pub struct RecordingEvents {
    log: Arc<Mutex<Vec<String>>>,
    reject_uploads: bool,
}

impl RecordingEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rejecting_uploads() -> Self {
        Self {
            reject_uploads: true,
            ..Self::default()
        }
    }

    pub fn entries(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    fn push(&self, entry: String) {
        self.log.lock().unwrap().push(entry);
    }
}

impl BuildEvents for RecordingEvents {
    fn phase_completed(&self, _progress: &BuildProgress, phase: Phase) {
        self.push(format!("phase:{phase}"));
    }

    fn build_failed(&self, _progress: &BuildProgress, error: &str) {
        self.push(format!("failed:{error}"));
    }

    fn transfer_completed(&self, _progress: &BuildProgress, record: &TransferRecord) {
        self.push(format!("transfer_completed:{}", record.storage_id));
    }

    fn transfer_failed(&self, _progress: &BuildProgress, record: &TransferRecord) {
        self.push(format!("transfer_failed:{}", record.storage_id));
    }

    fn transfer_cancelled(&self, _progress: &BuildProgress, record: &TransferRecord) {
        self.push(format!("transfer_cancelled:{}", record.storage_id));
    }

    fn validate_upload_target(
        &self,
        progress: &BuildProgress,
        target: &dyn StorageBackend,
        package_size: u64,
    ) -> Result<()> {
        if self.reject_uploads {
            return Err(BalerError::TransferRejected("rejected by test".into()));
        }
        default_upload_validation(progress, target, package_size)
    }
}

/// Deterministic pseudo-random bytes.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u32).wrapping_mul(31).wrapping_add(seed as u32) as u8)
        .collect()
}

/// A small source tree: nested dirs, an empty dir, an empty file and a file
/// large enough to span several globs.
pub fn make_tree(root: &Path) -> PathBuf {
    let src = root.join("site");
    std::fs::create_dir_all(src.join("docs/deep")).unwrap();
    std::fs::create_dir_all(src.join("empty")).unwrap();
    std::fs::write(src.join("index.html"), b"<html>hello</html>").unwrap();
    std::fs::write(src.join("docs/readme.txt"), b"read me").unwrap();
    std::fs::write(src.join("docs/deep/blob.bin"), pattern(20_000, 7)).unwrap();
    std::fs::write(src.join("docs/empty.txt"), b"").unwrap();
    std::fs::write(src.join("z.log"), pattern(300, 1)).unwrap();
    src
}

/// Relative path -> contents (`None` for directories) of every entry.
pub fn snapshot_tree(root: &Path) -> BTreeMap<String, Option<Vec<u8>>> {
    let mut out = BTreeMap::new();
    for entry in ignore::WalkBuilder::new(root)
        .hidden(false)
        .ignore(false)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .parents(false)
        .build()
    {
        let entry = entry.unwrap();
        let rel = entry
            .path()
            .strip_prefix(root)
            .unwrap()
            .to_string_lossy()
            .to_string();
        if rel.is_empty() {
            continue;
        }
        let content = if entry.file_type().is_some_and(|t| t.is_dir()) {
            None
        } else {
            Some(std::fs::read(entry.path()).unwrap())
        };
        out.insert(rel, content);
    }
    out
}

/// Config over `sources` with small globs and segments, no time budget and
/// plain file locking.
pub fn test_config(backup_dir: &Path, sources: &[&Path]) -> BalerConfig {
    let mut config = BalerConfig::new(
        backup_dir.to_string_lossy().to_string(),
        sources
            .iter()
            .map(|s| s.to_string_lossy().to_string())
            .collect(),
    );
    config.installation_id = Some("test-install".into());
    config.archive.glob_size = "4KiB".into();
    config.installer.segment_size = "8KiB".into();
    config.database.batch_rows = 2;
    config.chunk.time_budget = None;
    config.lock.mode = LockModeConfig::File;
    config
}

/// Storage entry for `id` so `build.upload_to` validates. The engine's
/// registry is replaced by [`memory_engine`].
pub fn storage_entry(id: &str, path: &Path, max_kept: i64) -> StorageConfig {
    StorageConfig {
        id: id.to_string(),
        kind: StorageKind::Local,
        path: path.to_string_lossy().to_string(),
        priority: 0,
        upload_chunk_size: None,
        download_chunk_size: None,
        max_kept,
        retry: RetryConfig::default(),
    }
}

/// Engine over `config` whose only storage target is `storage`.
pub fn memory_engine(config: BalerConfig, storage: &MemoryStorage) -> Engine {
    let mut registry = StorageRegistry::new();
    registry.register(0, Box::new(storage.clone())).unwrap();
    Engine::from_config(config).unwrap().with_registry(registry)
}
