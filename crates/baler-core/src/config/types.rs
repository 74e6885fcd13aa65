use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use baler_storage::StorageConfig;

use super::defaults::*;
use super::deserialize::*;
use crate::chunking::ChunkLimits;
use crate::error::{BalerError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BalerConfig {
    /// Identifies this installation in lock names. Default: hostname.
    #[serde(default)]
    pub installation_id: Option<String>,
    /// Directory holding package directories and the lock file.
    pub backup_dir: String,
    /// Prefix of package names.
    #[serde(default = "default_label")]
    pub label: String,
    pub sources: Vec<String>,
    /// Gitignore-style patterns, matched relative to each source root.
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
    #[serde(default)]
    pub filters: FiltersConfig,
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub installer: InstallerConfig,
    #[serde(default)]
    pub chunk: ChunkConfig,
    #[serde(default)]
    pub build: BuildConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub storages: Vec<StorageConfig>,
}

impl BalerConfig {
    /// Minimal configuration: one source, defaults everywhere else.
    pub fn new(backup_dir: impl Into<String>, sources: Vec<String>) -> Self {
        Self {
            installation_id: None,
            backup_dir: backup_dir.into(),
            label: default_label(),
            sources,
            exclude_patterns: Vec::new(),
            filters: FiltersConfig::default(),
            scan: ScanConfig::default(),
            archive: ArchiveConfig::default(),
            database: DatabaseConfig::default(),
            installer: InstallerConfig::default(),
            chunk: ChunkConfig::default(),
            build: BuildConfig::default(),
            lock: LockConfig::default(),
            storages: Vec::new(),
        }
    }

    pub fn backup_dir(&self) -> PathBuf {
        PathBuf::from(&self.backup_dir)
    }

    /// Database used for named build locks, if any.
    pub fn named_lock_database(&self) -> Option<&str> {
        self.lock
            .database
            .as_deref()
            .or(self.database.sqlite.as_deref())
    }

    pub fn installation_id(&self) -> String {
        self.installation_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(crate::platform::hostname)
    }

    pub fn validate(&self) -> Result<()> {
        if self.backup_dir.trim().is_empty() {
            return Err(BalerError::Config("backup_dir must not be empty".into()));
        }
        if self.sources.is_empty() {
            return Err(BalerError::Config(
                "at least one source directory is required".into(),
            ));
        }
        if self.label.is_empty()
            || !self
                .label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(BalerError::Config(format!(
                "label '{}' must be non-empty and contain only letters, digits and '-'",
                self.label
            )));
        }

        let mut labels = Vec::new();
        for source in &self.sources {
            let label = crate::scan::root_label(std::path::Path::new(source));
            if labels.contains(&label) {
                return Err(BalerError::Config(format!(
                    "duplicate source directory name '{label}'"
                )));
            }
            labels.push(label);
        }

        self.scan.big_file_threshold_bytes()?;
        let glob_size = self.archive.glob_size_bytes()?;
        if glob_size == 0 {
            return Err(BalerError::Config("archive.glob_size must be > 0".into()));
        }
        if glob_size > u64::from(crate::archive::MAX_GLOB_LEN) {
            return Err(BalerError::Config(format!(
                "archive.glob_size must be at most {} bytes",
                crate::archive::MAX_GLOB_LEN
            )));
        }
        if self.installer.segment_size_bytes()? == 0 {
            return Err(BalerError::Config(
                "installer.segment_size must be > 0".into(),
            ));
        }
        if self.database.batch_rows == 0 {
            return Err(BalerError::Config("database.batch_rows must be > 0".into()));
        }
        self.chunk.limits()?;

        for target in &self.build.upload_to {
            if !self.storages.iter().any(|s| &s.id == target) {
                return Err(BalerError::Config(format!(
                    "build.upload_to references unknown storage '{target}'"
                )));
            }
        }
        Ok(())
    }
}

/// Paths and extensions never included in a package.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FiltersConfig {
    /// Absolute directory paths.
    #[serde(default)]
    pub dirs: Vec<String>,
    /// Absolute file paths.
    #[serde(default)]
    pub files: Vec<String>,
    /// File extensions without the leading dot.
    #[serde(default)]
    pub exts: Vec<String>,
    /// Unreadable paths kept in the scan report; the counter keeps going.
    #[serde(default = "default_max_unreadable")]
    pub max_unreadable: usize,
}

impl Default for FiltersConfig {
    fn default() -> Self {
        Self {
            dirs: Vec::new(),
            files: Vec::new(),
            exts: Vec::new(),
            max_unreadable: default_max_unreadable(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScanConfig {
    /// Files at or above this size are listed in the scan report.
    #[serde(
        default = "default_big_file_threshold",
        deserialize_with = "deserialize_human_string"
    )]
    pub big_file_threshold: String,
    #[serde(default = "default_max_children")]
    pub max_children: usize,
    #[serde(default = "default_max_nodes")]
    pub max_nodes: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            big_file_threshold: default_big_file_threshold(),
            max_children: default_max_children(),
            max_nodes: default_max_nodes(),
        }
    }
}

impl ScanConfig {
    pub fn big_file_threshold_bytes(&self) -> Result<u64> {
        parse_human_size(&self.big_file_threshold)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArchiveConfig {
    /// Payload bytes per glob record.
    #[serde(
        default = "default_glob_size",
        deserialize_with = "deserialize_human_string"
    )]
    pub glob_size: String,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            glob_size: default_glob_size(),
        }
    }
}

impl ArchiveConfig {
    pub fn glob_size_bytes(&self) -> Result<u64> {
        parse_human_size(&self.glob_size)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    /// SQLite database exported into the package. None: header-only script.
    #[serde(default)]
    pub sqlite: Option<String>,
    #[serde(default = "default_batch_rows")]
    pub batch_rows: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            sqlite: None,
            batch_rows: default_batch_rows(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstallerConfig {
    #[serde(
        default = "default_segment_size",
        deserialize_with = "deserialize_human_string"
    )]
    pub segment_size: String,
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            segment_size: default_segment_size(),
        }
    }
}

impl InstallerConfig {
    pub fn segment_size_bytes(&self) -> Result<u64> {
        parse_human_size(&self.segment_size)
    }
}

/// Budget of one invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChunkConfig {
    /// Wall-clock budget per invocation; `null` removes the bound.
    #[serde(
        default = "default_time_budget_opt",
        deserialize_with = "deserialize_optional_human_string"
    )]
    pub time_budget: Option<String>,
    /// Items per phase and invocation (0 = unlimited).
    #[serde(default)]
    pub max_iterations: u64,
    /// Pause after every item.
    #[serde(default, deserialize_with = "deserialize_optional_human_string")]
    pub throttle: Option<String>,
    /// Persist every N items while running (0 = only when stopping).
    #[serde(default)]
    pub checkpoint_every: u64,
}

fn default_time_budget_opt() -> Option<String> {
    Some(default_time_budget())
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            time_budget: default_time_budget_opt(),
            max_iterations: 0,
            throttle: None,
            checkpoint_every: 0,
        }
    }
}

impl ChunkConfig {
    pub fn time_budget(&self) -> Result<Option<Duration>> {
        self.time_budget
            .as_deref()
            .map(parse_human_duration)
            .transpose()
    }

    pub fn limits(&self) -> Result<ChunkLimits> {
        Ok(ChunkLimits {
            max_iterations: self.max_iterations,
            time_budget: self.time_budget()?,
            throttle: self.throttle.as_deref().map(parse_human_duration).transpose()?,
            checkpoint_every: self.checkpoint_every,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildConfig {
    /// Failed chunk runs tolerated before the package is marked failed.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Storage ids a finished package is uploaded to.
    #[serde(default)]
    pub upload_to: Vec<String>,
    /// Apply the storage's `max_kept` after a successful upload.
    #[serde(default = "default_true")]
    pub purge_after_upload: bool,
    /// Check a downloaded archive against its installer manifest.
    #[serde(default = "default_true")]
    pub verify_download: bool,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            upload_to: Vec::new(),
            purge_after_upload: true,
            verify_download: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LockConfig {
    #[serde(default = "default_lock_mode")]
    pub mode: LockModeConfig,
    /// SQLite file holding named locks. Defaults to `database.sqlite`.
    #[serde(default)]
    pub database: Option<String>,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            mode: default_lock_mode(),
            database: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockModeConfig {
    Auto,
    File,
    Named,
}
