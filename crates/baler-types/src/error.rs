use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, BalerError>;

#[derive(Debug, Error)]
pub enum BalerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("build is locked by another invocation (lock: {0})")]
    Locked(String),

    #[error("rate limited by storage backend, retry after {}s", retry_after.as_secs())]
    RateLimited { retry_after: Duration },

    #[error("stale checkpoint: {0}")]
    StaleCheckpoint(String),

    #[error("package not found: '{0}'")]
    PackageNotFound(String),

    #[error("storage not found: '{0}'")]
    StorageNotFound(String),

    #[error("invalid format: {0}")]
    InvalidFormat(String),

    #[error("storage '{0}' is not authorized")]
    Unauthorized(String),

    #[error("insufficient space on '{storage}': need {needed} bytes, {available} available")]
    InsufficientSpace {
        storage: String,
        needed: u64,
        available: u64,
    },

    #[error("transfer rejected: {0}")]
    TransferRejected(String),

    #[error("unsupported backend: '{0}'")]
    UnsupportedBackend(String),

    #[error("chunk run failed: {0}")]
    Chunk(String),

    #[error("{0}")]
    Other(String),
}

impl BalerError {
    /// Retry-after hint carried by rate-limit errors.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            BalerError::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}
