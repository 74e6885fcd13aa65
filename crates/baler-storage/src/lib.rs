pub mod local_backend;
pub mod paths;
pub mod registry;
pub mod retry;

use serde::{Deserialize, Serialize};

use baler_types::error::{BalerError, Result};

pub use registry::StorageRegistry;

/// Smallest chunk a backend may negotiate (64 KiB).
pub const MIN_CHUNK_SIZE: u64 = 64 * 1024;
/// Largest chunk a backend may negotiate (256 MiB).
pub const MAX_CHUNK_SIZE: u64 = 256 * 1024 * 1024;

/// Kind tag of a storage backend, as written in config files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Local,
}

impl std::fmt::Display for StorageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageKind::Local => write!(f, "local"),
        }
    }
}

/// An in-flight upload as returned by [`StorageBackend::begin_upload`].
///
/// `token` is the backend's resumable-session handle. Callers persist the
/// whole handle next to their byte offset so a later invocation can resume
/// the same remote session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadHandle {
    pub name: String,
    pub token: Option<String>,
    pub total_size: u64,
}

/// Reference to a transfer for cancel/fail notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRef {
    pub storage_id: String,
    pub package: String,
    /// Upload currently in flight, if any.
    pub upload: Option<UploadHandle>,
}

/// Capability set every remote storage backend provides.
///
/// All methods are blocking. Backends signal throttling with
/// [`BalerError::RateLimited`] and never retry it themselves.
pub trait StorageBackend: Send + Sync {
    /// Stable identifier from the configuration.
    fn id(&self) -> &str;

    fn kind(&self) -> StorageKind;

    /// Whether credentials are present and accepted.
    fn is_authorized(&self) -> bool;

    /// Free space in bytes, or `None` when the backend cannot tell.
    fn free_space(&self) -> Result<Option<u64>>;

    /// Bytes sent per upload attempt.
    fn upload_chunk_size(&self) -> u64;

    /// Bytes fetched per download attempt.
    fn download_chunk_size(&self) -> u64;

    /// Open a resumable upload session for `name`.
    fn begin_upload(&self, name: &str, total_size: u64) -> Result<UploadHandle>;

    /// Write `data` at `offset` of the session. Re-sending the same range is
    /// allowed and must leave the same result.
    fn upload_chunk(&self, handle: &UploadHandle, offset: u64, data: &[u8]) -> Result<()>;

    /// Commit the session; the object becomes visible under `handle.name`.
    fn finish_upload(&self, handle: &UploadHandle) -> Result<()>;

    /// Abandon an upload on user or timeout cancellation. Idempotent.
    fn cancel_upload(&self, transfer: &TransferRef) -> Result<()>;

    /// Abandon an upload that cannot proceed. Idempotent.
    fn fail_upload(&self, transfer: &TransferRef) -> Result<()>;

    /// Read up to `length` bytes of `name` starting at `offset`.
    fn download_chunk(&self, name: &str, offset: u64, length: u64) -> Result<Vec<u8>>;

    /// Size of a committed object, or `None` when absent.
    fn object_size(&self, name: &str) -> Result<Option<u64>>;

    /// Names of committed objects starting with `prefix`.
    fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Delete a committed object. Deleting a missing object is not an error.
    fn delete(&self, name: &str) -> Result<()>;
}

/// Retry configuration for transient backend errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

fn default_max_retries() -> usize {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_retry_max_delay_ms() -> u64 {
    60_000
}

/// Configuration of one storage target.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    pub id: String,
    pub kind: StorageKind,
    /// Root path (local) of the storage target.
    pub path: String,
    /// Lower values are tried first.
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub upload_chunk_size: Option<u64>,
    #[serde(default)]
    pub download_chunk_size: Option<u64>,
    /// Packages kept on this storage by purge; `<= 0` keeps everything.
    #[serde(default)]
    pub max_kept: i64,
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Clamp a requested chunk size into the supported range.
pub fn clamp_chunk_size(requested: u64) -> u64 {
    requested.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE)
}

/// Build a storage backend from its configuration.
pub fn backend_from_config(cfg: &StorageConfig) -> Result<Box<dyn StorageBackend>> {
    if cfg.id.trim().is_empty() {
        return Err(BalerError::Config("storage id must not be empty".into()));
    }
    match cfg.kind {
        StorageKind::Local => Ok(Box::new(local_backend::LocalBackend::from_config(cfg)?)),
    }
}
