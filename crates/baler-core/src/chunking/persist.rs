use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{BalerError, Result};

const KEY_PROCESSING: &str = "isProcessing";
const KEY_EXTRA: &str = "extraData";
const KEY_POSITION: &str = "position";

/// The durable unit of a chunk job: processing flag, opaque extra data and
/// the position of the last completed item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointRecord<E, P> {
    pub is_processing: bool,
    pub extra_data: E,
    pub position: Option<P>,
}

/// Raw byte store behind a [`Persistence`] adapter.
pub trait CheckpointBackend: Send {
    /// Stored bytes, or `None` when nothing was ever saved.
    fn read(&mut self) -> Result<Option<Vec<u8>>>;

    /// Replace the stored bytes. On failure the previous value must survive.
    fn write(&mut self, bytes: &[u8]) -> Result<()>;

    fn remove(&mut self) -> Result<()>;

    fn describe(&self) -> String;
}

/// Checkpoint stored as a JSON file, replaced atomically on every save.
#[derive(Debug, Clone)]
pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CheckpointBackend for FileBackend {
    fn read(&mut self) -> Result<Option<Vec<u8>>> {
        match fs::read(&self.path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        atomic_write(&self.path, bytes)
    }

    fn remove(&mut self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Write `data` to a temp file next to `path`, verify and sync it, then
/// rename it into place. Readers never see a partial file and a failed write
/// leaves the previous file untouched.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.flush()?;
    let written = tmp.as_file().metadata()?.len();
    if written != data.len() as u64 {
        return Err(BalerError::Io(std::io::Error::new(
            std::io::ErrorKind::WriteZero,
            format!(
                "short write to {}: {written} of {} bytes",
                path.display(),
                data.len()
            ),
        )));
    }
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Shared in-process byte store. Clones see the same value, which lets tests
/// inspect what a "process" left behind and inject write failures.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    data: Arc<Mutex<Option<Vec<u8>>>>,
    writes: Arc<AtomicUsize>,
    fail_from_write: Arc<AtomicUsize>,
    failures_left: Arc<AtomicUsize>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` writes, then recover.
    pub fn fail_next_writes(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    /// Fail every write after `n` successful ones (simulates a dying disk).
    pub fn fail_after_writes(&self, n: usize) {
        self.fail_from_write
            .store(self.writes.load(Ordering::SeqCst) + n + 1, Ordering::SeqCst);
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn raw(&self) -> Option<Vec<u8>> {
        self.data.lock().map(|d| d.clone()).unwrap_or_default()
    }

    /// Decoded JSON currently held, for assertions.
    pub fn json(&self) -> Option<serde_json::Value> {
        self.raw().and_then(|b| serde_json::from_slice(&b).ok())
    }
}

impl CheckpointBackend for MemoryBackend {
    fn read(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(self.raw())
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let attempt = self.writes.load(Ordering::SeqCst) + 1;
        let fail_from = self.fail_from_write.load(Ordering::SeqCst);
        let transient = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if transient || (fail_from != 0 && attempt >= fail_from) {
            return Err(BalerError::Io(std::io::Error::other(
                "injected checkpoint write failure",
            )));
        }
        let mut guard = self
            .data
            .lock()
            .map_err(|_| BalerError::Other("memory checkpoint poisoned".into()))?;
        *guard = Some(bytes.to_vec());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn remove(&mut self) -> Result<()> {
        let mut guard = self
            .data
            .lock()
            .map_err(|_| BalerError::Other("memory checkpoint poisoned".into()))?;
        *guard = None;
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".into()
    }
}

type MirrorHook<E, P> = Box<dyn FnMut(&CheckpointRecord<E, P>) -> Result<()> + Send>;

/// Caching persistence adapter for one chunk job.
///
/// Once loaded, the cached record is authoritative until it is overwritten by
/// [`save`](Self::save) or dropped by [`delete`](Self::delete).
pub struct Persistence<E, P> {
    backend: Box<dyn CheckpointBackend>,
    cache: Option<CheckpointRecord<E, P>>,
    loaded: bool,
    processing: bool,
    mirror: Option<MirrorHook<E, P>>,
}

impl<E, P> Persistence<E, P>
where
    E: Serialize + DeserializeOwned + Clone,
    P: Serialize + DeserializeOwned + Clone,
{
    pub fn new(backend: impl CheckpointBackend + 'static) -> Self {
        Self {
            backend: Box::new(backend),
            cache: None,
            loaded: false,
            processing: false,
            mirror: None,
        }
    }

    /// File-backed adapter at `path`.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::new(FileBackend::new(path))
    }

    /// Hook run after every successful save, with the record already cached.
    pub fn with_mirror(
        mut self,
        hook: impl FnMut(&CheckpointRecord<E, P>) -> Result<()> + Send + 'static,
    ) -> Self {
        self.mirror = Some(Box::new(hook));
        self
    }

    /// Load (once) and return the full record.
    pub fn load_record(&mut self) -> Result<Option<&CheckpointRecord<E, P>>> {
        if !self.loaded {
            self.cache = match self.backend.read()? {
                Some(bytes) => decode_record(&bytes, &self.backend.describe()),
                None => None,
            };
            self.loaded = true;
        }
        Ok(self.cache.as_ref())
    }

    /// Position of the last completed item, or `None` when there is no checkpoint.
    pub fn load(&mut self) -> Result<Option<P>> {
        Ok(self.load_record()?.and_then(|r| r.position.clone()))
    }

    /// Whether any checkpoint record exists.
    pub fn exists(&mut self) -> Result<bool> {
        Ok(self.load_record()?.is_some())
    }

    /// Durably store `{processing, extra, position}`.
    pub fn save(&mut self, position: Option<&P>, extra: &E) -> Result<()> {
        let record = CheckpointRecord {
            is_processing: self.processing,
            extra_data: extra.clone(),
            position: position.cloned(),
        };
        let bytes = serde_json::to_vec(&record)?;
        self.backend.write(&bytes)?;
        self.cache = Some(record);
        self.loaded = true;
        if let (Some(hook), Some(record)) = (self.mirror.as_mut(), self.cache.as_ref()) {
            if let Err(e) = hook(record) {
                warn!(checkpoint = %self.backend.describe(), error = %e, "checkpoint mirror hook failed");
            }
        }
        Ok(())
    }

    pub fn delete(&mut self) -> Result<()> {
        self.backend.remove()?;
        self.cache = None;
        self.loaded = true;
        debug!(checkpoint = %self.backend.describe(), "checkpoint deleted");
        Ok(())
    }

    /// Flag written with the next save.
    pub fn set_processing(&mut self, processing: bool) {
        self.processing = processing;
    }

    pub fn is_processing(&self) -> bool {
        self.processing
    }

    /// Extra data of the cached record, if one was loaded or saved.
    pub fn extra_data(&self) -> Option<&E> {
        self.cache.as_ref().map(|r| &r.extra_data)
    }

    pub fn describe(&self) -> String {
        self.backend.describe()
    }
}

/// Decode a stored record. A record missing any of its three keys, or one
/// that does not parse, counts as "no checkpoint".
fn decode_record<E, P>(bytes: &[u8], origin: &str) -> Option<CheckpointRecord<E, P>>
where
    E: DeserializeOwned,
    P: DeserializeOwned,
{
    let value: serde_json::Value = match serde_json::from_slice(bytes) {
        Ok(v) => v,
        Err(e) => {
            warn!(checkpoint = origin, error = %e, "ignoring unparseable checkpoint");
            return None;
        }
    };
    let complete = value.as_object().is_some_and(|obj| {
        obj.contains_key(KEY_PROCESSING)
            && obj.contains_key(KEY_EXTRA)
            && obj.contains_key(KEY_POSITION)
    });
    if !complete {
        warn!(checkpoint = origin, "ignoring checkpoint with missing keys");
        return None;
    }
    match serde_json::from_value(value) {
        Ok(record) => Some(record),
        Err(e) => {
            warn!(checkpoint = origin, error = %e, "ignoring checkpoint of unexpected shape");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_write_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("cp.json");
        atomic_write(&path, b"one").unwrap();
        atomic_write(&path, b"two").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"two");
        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name() != "cp.json")
            .collect();
        assert!(leftovers.is_empty(), "temp files left behind");
    }

    #[test]
    fn missing_key_is_no_checkpoint() {
        let rec: Option<CheckpointRecord<u32, u32>> =
            decode_record(br#"{"isProcessing":false,"position":3}"#, "t");
        assert!(rec.is_none());
        let rec: Option<CheckpointRecord<u32, u32>> = decode_record(b"{not json", "t");
        assert!(rec.is_none());
        let rec: Option<CheckpointRecord<u32, u32>> =
            decode_record(br#"{"isProcessing":true,"extraData":1,"position":null}"#, "t");
        assert_eq!(
            rec,
            Some(CheckpointRecord {
                is_processing: true,
                extra_data: 1,
                position: None
            })
        );
    }

    #[test]
    fn memory_backend_fault_injection() {
        let mut backend = MemoryBackend::new();
        backend.fail_next_writes(1);
        assert!(backend.write(b"a").is_err());
        backend.write(b"b").unwrap();
        backend.fail_after_writes(1);
        backend.write(b"c").unwrap();
        assert!(backend.write(b"d").is_err());
        assert_eq!(backend.raw().unwrap(), b"c");
        assert_eq!(backend.write_count(), 2);
    }
}
