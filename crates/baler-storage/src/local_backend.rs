use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};

use rand::RngCore;
use tracing::{debug, warn};

use baler_types::error::{BalerError, Result};

use crate::retry::retry_io;
use crate::{
    clamp_chunk_size, RetryConfig, StorageBackend, StorageConfig, StorageKind, TransferRef,
    UploadHandle,
};

/// Directory under the root holding in-flight upload sessions.
const UPLOADS_DIR: &str = ".uploads";
const DEFAULT_UPLOAD_CHUNK: u64 = 8 * 1024 * 1024;
const DEFAULT_DOWNLOAD_CHUNK: u64 = 8 * 1024 * 1024;

/// Storage backend for a local (or mounted) directory using `std::fs` directly.
pub struct LocalBackend {
    id: String,
    root: PathBuf,
    upload_chunk: u64,
    download_chunk: u64,
    retry: RetryConfig,
}

impl LocalBackend {
    /// Create a backend rooted at the given directory path.
    pub fn new(id: &str, root: &str) -> Result<Self> {
        let root_path = PathBuf::from(crate::paths::expand_tilde(root));
        // Canonicalize if the path already exists for clearer errors and
        // correct strip_prefix behavior with symlinked roots.
        let root = if root_path.exists() {
            fs::canonicalize(&root_path)?
        } else {
            root_path
        };
        Ok(Self {
            id: id.to_string(),
            root,
            upload_chunk: DEFAULT_UPLOAD_CHUNK,
            download_chunk: DEFAULT_DOWNLOAD_CHUNK,
            retry: RetryConfig::default(),
        })
    }

    pub fn from_config(cfg: &StorageConfig) -> Result<Self> {
        let mut backend = Self::new(&cfg.id, &cfg.path)?;
        if let Some(n) = cfg.upload_chunk_size {
            backend.upload_chunk = clamp_chunk_size(n);
        }
        if let Some(n) = cfg.download_chunk_size {
            backend.download_chunk = clamp_chunk_size(n);
        }
        backend.retry = cfg.retry.clone();
        Ok(backend)
    }

    pub fn with_chunk_sizes(mut self, upload: u64, download: u64) -> Self {
        self.upload_chunk = clamp_chunk_size(upload);
        self.download_chunk = clamp_chunk_size(download);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Reject storage keys that could escape the storage root.
    fn validate_key(key: &str) -> Result<()> {
        if key.is_empty() {
            return Err(BalerError::InvalidFormat("unsafe storage key: empty".into()));
        }
        if key.starts_with('/') || key.starts_with('\\') {
            return Err(BalerError::InvalidFormat(format!(
                "unsafe storage key: absolute path '{key}'"
            )));
        }
        if key.contains('\\') {
            return Err(BalerError::InvalidFormat(format!(
                "unsafe storage key: contains backslash '{key}'"
            )));
        }
        for component in Path::new(key).components() {
            if component == Component::ParentDir {
                return Err(BalerError::InvalidFormat(format!(
                    "unsafe storage key: parent traversal '{key}'"
                )));
            }
        }
        if key == UPLOADS_DIR || key.starts_with(&format!("{UPLOADS_DIR}/")) {
            return Err(BalerError::InvalidFormat(format!(
                "unsafe storage key: reserved prefix '{key}'"
            )));
        }
        Ok(())
    }

    /// Resolve a `/`-separated storage key to a filesystem path under the root.
    fn resolve(&self, key: &str) -> Result<PathBuf> {
        Self::validate_key(key)?;
        Ok(self.root.join(key))
    }

    fn part_path(&self, handle: &UploadHandle) -> Result<PathBuf> {
        let token = handle
            .token
            .as_deref()
            .ok_or_else(|| BalerError::InvalidFormat("upload handle without token".into()))?;
        if token.is_empty() || !token.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(BalerError::InvalidFormat(format!(
                "invalid upload token '{token}'"
            )));
        }
        Ok(self.root.join(UPLOADS_DIR).join(format!("{token}.part")))
    }

    fn remove_part(&self, transfer: &TransferRef) -> Result<bool> {
        let Some(handle) = transfer.upload.as_ref() else {
            return Ok(false);
        };
        let path = self.part_path(handle)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn write_at(&self, path: &Path, offset: u64, data: &[u8]) -> Result<()> {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;
        let len = file.metadata()?.len();
        if len < offset {
            return Err(BalerError::InvalidFormat(format!(
                "upload gap in {}: have {len} bytes, chunk starts at {offset}",
                path.display()
            )));
        }
        // Drop anything written past the last acknowledged chunk.
        file.set_len(offset)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        file.sync_data()?;
        Ok(())
    }

    /// Recursively list all files under `dir`, adding their paths relative to
    /// `self.root` as `/`-separated keys.
    fn list_recursive(&self, dir: &Path, keys: &mut Vec<String>) -> Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                if dir == self.root && entry.file_name() == UPLOADS_DIR {
                    continue;
                }
                self.list_recursive(&entry.path(), keys)?;
            } else if file_type.is_file() {
                if let Ok(rel) = entry.path().strip_prefix(&self.root) {
                    let key = rel
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/");
                    keys.push(key);
                }
            }
        }
        Ok(())
    }
}

impl StorageBackend for LocalBackend {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> StorageKind {
        StorageKind::Local
    }

    fn is_authorized(&self) -> bool {
        match fs::create_dir_all(&self.root) {
            Ok(()) => fs::metadata(&self.root)
                .map(|m| m.is_dir() && !m.permissions().readonly())
                .unwrap_or(false),
            Err(e) => {
                debug!(storage = %self.id, error = %e, "storage root not accessible");
                false
            }
        }
    }

    fn free_space(&self) -> Result<Option<u64>> {
        #[cfg(unix)]
        {
            let probe = if self.root.exists() {
                self.root.clone()
            } else {
                self.root
                    .ancestors()
                    .find(|p| p.exists())
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| PathBuf::from("/"))
            };
            let stat = nix::sys::statvfs::statvfs(&probe)
                .map_err(|e| BalerError::Io(std::io::Error::from(e)))?;
            #[allow(clippy::unnecessary_cast)]
            let bytes = (stat.blocks_available() as u64).saturating_mul(stat.fragment_size() as u64);
            Ok(Some(bytes))
        }

        #[cfg(not(unix))]
        {
            Ok(None)
        }
    }

    fn upload_chunk_size(&self) -> u64 {
        self.upload_chunk
    }

    fn download_chunk_size(&self) -> u64 {
        self.download_chunk
    }

    fn begin_upload(&self, name: &str, total_size: u64) -> Result<UploadHandle> {
        Self::validate_key(name)?;
        fs::create_dir_all(self.root.join(UPLOADS_DIR))?;
        let mut buf = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut buf);
        let handle = UploadHandle {
            name: name.to_string(),
            token: Some(hex::encode(buf)),
            total_size,
        };
        fs::File::create(self.part_path(&handle)?)?;
        debug!(storage = %self.id, object = name, total_size, "upload session opened");
        Ok(handle)
    }

    fn upload_chunk(&self, handle: &UploadHandle, offset: u64, data: &[u8]) -> Result<()> {
        let path = self.part_path(handle)?;
        if !path.exists() {
            return Err(BalerError::StaleCheckpoint(format!(
                "upload session for '{}' no longer exists",
                handle.name
            )));
        }
        retry_io(&self.retry, "upload_chunk", &self.id, || {
            self.write_at(&path, offset, data)
        })
    }

    fn finish_upload(&self, handle: &UploadHandle) -> Result<()> {
        let part = self.part_path(handle)?;
        let len = fs::metadata(&part)?.len();
        if len != handle.total_size {
            return Err(BalerError::InvalidFormat(format!(
                "upload of '{}' incomplete: {len} of {} bytes",
                handle.name, handle.total_size
            )));
        }
        let target = self.resolve(&handle.name)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&part, &target)?;
        debug!(storage = %self.id, object = %handle.name, "upload committed");
        Ok(())
    }

    fn cancel_upload(&self, transfer: &TransferRef) -> Result<()> {
        if self.remove_part(transfer)? {
            debug!(storage = %self.id, package = %transfer.package, "cancelled upload session");
        }
        Ok(())
    }

    fn fail_upload(&self, transfer: &TransferRef) -> Result<()> {
        if self.remove_part(transfer)? {
            warn!(storage = %self.id, package = %transfer.package, "discarded failed upload session");
        }
        Ok(())
    }

    fn download_chunk(&self, name: &str, offset: u64, length: u64) -> Result<Vec<u8>> {
        let path = self.resolve(name)?;
        let mut file = match fs::File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BalerError::PackageNotFound(name.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = Vec::new();
        file.take(length).read_to_end(&mut buf)?;
        Ok(buf)
    }

    fn object_size(&self, name: &str) -> Result<Option<u64>> {
        let path = self.resolve(name)?;
        match fs::metadata(&path) {
            Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        match fs::metadata(&self.root) {
            Ok(meta) if meta.is_dir() => {
                let mut keys = Vec::new();
                self.list_recursive(&self.root, &mut keys)?;
                keys.retain(|k| k.starts_with(prefix));
                keys.sort();
                Ok(keys)
            }
            Ok(_) => Ok(Vec::new()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn delete(&self, name: &str) -> Result<()> {
        let path = self.resolve(name)?;
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        // Remove the package directory once it is empty.
        if let Some(parent) = path.parent() {
            if parent != self.root {
                let _ = fs::remove_dir(parent);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(dir: &Path) -> LocalBackend {
        LocalBackend::new("local", dir.to_str().unwrap()).unwrap()
    }

    fn upload(backend: &LocalBackend, name: &str, data: &[u8]) {
        let handle = backend.begin_upload(name, data.len() as u64).unwrap();
        backend.upload_chunk(&handle, 0, data).unwrap();
        backend.finish_upload(&handle).unwrap();
    }

    #[test]
    fn validate_key_rejects_unsafe_keys() {
        assert!(LocalBackend::validate_key("/etc/passwd").is_err());
        assert!(LocalBackend::validate_key("\\Windows\\System32").is_err());
        assert!(LocalBackend::validate_key("../../outside").is_err());
        assert!(LocalBackend::validate_key("foo/../../etc/passwd").is_err());
        assert!(LocalBackend::validate_key("foo\\bar").is_err());
        assert!(LocalBackend::validate_key("").is_err());
        assert!(LocalBackend::validate_key(".uploads/abc.part").is_err());
    }

    #[test]
    fn validate_key_accepts_safe_keys() {
        assert!(LocalBackend::validate_key("pkg_20240101000000_00/archive.balr").is_ok());
        assert!(LocalBackend::validate_key("installer.json").is_ok());
    }

    #[test]
    fn chunked_upload_commits_object() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());
        let handle = backend.begin_upload("pkg/archive.balr", 10).unwrap();
        backend.upload_chunk(&handle, 0, b"hello").unwrap();
        backend.upload_chunk(&handle, 5, b"world").unwrap();
        assert_eq!(backend.object_size("pkg/archive.balr").unwrap(), None);
        backend.finish_upload(&handle).unwrap();
        assert_eq!(backend.object_size("pkg/archive.balr").unwrap(), Some(10));
        assert_eq!(
            backend.download_chunk("pkg/archive.balr", 3, 4).unwrap(),
            b"lowo"
        );
    }

    #[test]
    fn resending_a_chunk_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());
        let handle = backend.begin_upload("obj", 6).unwrap();
        backend.upload_chunk(&handle, 0, b"abc").unwrap();
        backend.upload_chunk(&handle, 3, b"dXX").unwrap();
        // Checkpoint was at offset 3: the second chunk is sent again.
        backend.upload_chunk(&handle, 3, b"def").unwrap();
        backend.finish_upload(&handle).unwrap();
        assert_eq!(backend.download_chunk("obj", 0, 100).unwrap(), b"abcdef");
    }

    #[test]
    fn upload_gap_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());
        let handle = backend.begin_upload("obj", 6).unwrap();
        assert!(backend.upload_chunk(&handle, 3, b"def").is_err());
    }

    #[test]
    fn finish_rejects_short_upload() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());
        let handle = backend.begin_upload("obj", 6).unwrap();
        backend.upload_chunk(&handle, 0, b"abc").unwrap();
        assert!(backend.finish_upload(&handle).is_err());
    }

    #[test]
    fn cancel_and_fail_are_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());
        let handle = backend.begin_upload("obj", 3).unwrap();
        let transfer = TransferRef {
            storage_id: "local".into(),
            package: "pkg".into(),
            upload: Some(handle.clone()),
        };
        backend.cancel_upload(&transfer).unwrap();
        backend.cancel_upload(&transfer).unwrap();
        backend.fail_upload(&transfer).unwrap();
        assert!(backend.upload_chunk(&handle, 0, b"abc").is_err());

        let idle = TransferRef {
            storage_id: "local".into(),
            package: "pkg".into(),
            upload: None,
        };
        backend.cancel_upload(&idle).unwrap();
        backend.fail_upload(&idle).unwrap();
    }

    #[test]
    fn list_skips_upload_sessions_and_filters_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());
        upload(&backend, "a_1/archive.balr", b"1");
        upload(&backend, "a_1/installer.json", b"2");
        upload(&backend, "b_2/archive.balr", b"3");
        backend.begin_upload("c_3/archive.balr", 9).unwrap();

        assert_eq!(
            backend.list("").unwrap(),
            vec!["a_1/archive.balr", "a_1/installer.json", "b_2/archive.balr"]
        );
        assert_eq!(backend.list("b_").unwrap(), vec!["b_2/archive.balr"]);
    }

    #[test]
    fn delete_missing_object_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());
        upload(&backend, "p/x", b"x");
        backend.delete("p/x").unwrap();
        backend.delete("p/x").unwrap();
        assert!(backend.list("").unwrap().is_empty());
        assert!(!dir.path().join("p").exists());
    }

    #[test]
    fn download_of_missing_object_reports_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());
        assert!(matches!(
            backend.download_chunk("nope", 0, 1),
            Err(BalerError::PackageNotFound(_))
        ));
    }

    #[test]
    fn authorized_and_reports_space() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(&dir.path().join("sub"));
        assert!(backend.is_authorized());
        #[cfg(unix)]
        assert!(backend.free_space().unwrap().unwrap() > 0);
    }
}
