//! The package build state machine and the engine that drives it.
//!
//! Every public [`Engine`] operation is one invocation slice: it takes the
//! build lock, loads the package's [`BuildProgress`], does as much work as
//! the time budget allows and persists the progress at phase boundaries.

pub mod phases;
pub mod progress;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, info, warn};

use baler_storage::{StorageBackend, StorageRegistry};
use baler_types::PackageId;

use crate::archive::{expand_archive, ExpandOutcome, ARCHIVE_FILE};
use crate::chunking::{ChunkFailure, ChunkLimits, FailureKind, StopReason};
use crate::config::BalerConfig;
use crate::database::{DatabaseSource, SqliteSource, DATABASE_FILE};
use crate::error::{BalerError, Result};
use crate::events::{BuildEvents, LogEvents};
use crate::installer::{read_manifest, verify_package, INSTALLER_FILE};
use crate::lock::{BuildLock, LockGuard, MarkerLockProvider, NamedLockProvider, SqliteLockProvider};
use crate::purge::{purge_old_backups, PurgeReport};
use crate::scan::{InstanceFilters, INVENTORY_FILE};
use crate::transfer::{
    cancel_upload, download_package, upload_package, DownloadOutcome, TransferDirection,
    TransferRecord, TransferStatus, CANCEL_FILE,
};

pub use phases::{checkpoint_path, remove_checkpoint, PhaseRun, STATUS_FILE};
pub use progress::{BuildProgress, BuildStatus, Phase, PROGRESS_FILE};

use phases::PhaseContext;

/// Directory under the backup dir holding named-lock markers.
pub const NAMED_LOCK_DIR: &str = "named-locks";

/// What one invocation did to a package.
#[derive(Debug, Clone)]
pub struct BuildReport {
    pub package: String,
    pub status: BuildStatus,
    pub phase: Phase,
    pub phases_completed: Vec<Phase>,
    /// Why the invocation stopped before the package was done, if it did.
    pub stopped: Option<StopReason>,
    pub error: Option<String>,
    pub transfers: Vec<TransferRecord>,
}

impl BuildReport {
    fn new(progress: &BuildProgress) -> Self {
        Self {
            package: progress.name.clone(),
            status: progress.status,
            phase: progress.phase,
            phases_completed: Vec::new(),
            stopped: None,
            error: None,
            transfers: Vec::new(),
        }
    }
}

fn remove_file_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn has_pending_uploads(progress: &BuildProgress) -> bool {
    progress
        .transfers
        .iter()
        .any(|t| t.direction == TransferDirection::Upload && !t.status.is_terminal())
}

/// Composition root: configuration, storage targets, lock, events and the
/// optional database source.
pub struct Engine {
    config: BalerConfig,
    registry: StorageRegistry,
    events: Box<dyn BuildEvents>,
    database: Option<Box<dyn DatabaseSource>>,
    lock: BuildLock,
    limits: ChunkLimits,
}

impl Engine {
    pub fn from_config(config: BalerConfig) -> Result<Self> {
        config.validate()?;
        let registry = StorageRegistry::from_configs(&config.storages)?;
        let limits = config.chunk.limits()?;
        let database: Option<Box<dyn DatabaseSource>> = match &config.database.sqlite {
            Some(path) => Some(Box::new(SqliteSource::open(Path::new(path))?)),
            None => None,
        };
        let provider: Arc<dyn NamedLockProvider> = match config.named_lock_database() {
            Some(path) => Arc::new(SqliteLockProvider::new(path)),
            None => Arc::new(MarkerLockProvider::new(
                config.backup_dir().join(NAMED_LOCK_DIR),
            )),
        };
        let lock = Self::lock_for(&config, provider);
        Ok(Self {
            config,
            registry,
            events: Box::new(LogEvents),
            database,
            lock,
            limits,
        })
    }

    fn lock_for(config: &BalerConfig, provider: Arc<dyn NamedLockProvider>) -> BuildLock {
        BuildLock::new(
            &config.backup_dir(),
            &config.installation_id(),
            config.lock.mode.into(),
        )
        .with_named_provider(provider)
    }

    pub fn with_events(mut self, events: Box<dyn BuildEvents>) -> Self {
        self.events = events;
        self
    }

    pub fn with_database(mut self, database: Option<Box<dyn DatabaseSource>>) -> Self {
        self.database = database;
        self
    }

    pub fn with_named_lock_provider(mut self, provider: Arc<dyn NamedLockProvider>) -> Self {
        self.lock = Self::lock_for(&self.config, provider);
        self
    }

    pub fn with_registry(mut self, registry: StorageRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Replace the per-invocation budget taken from the configuration.
    pub fn with_limits(mut self, limits: ChunkLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn config(&self) -> &BalerConfig {
        &self.config
    }

    pub fn registry(&self) -> &StorageRegistry {
        &self.registry
    }

    pub fn limits(&self) -> ChunkLimits {
        self.limits
    }

    pub fn build_lock(&self) -> &BuildLock {
        &self.lock
    }

    pub fn package_dir(&self, name: &str) -> PathBuf {
        self.config.backup_dir().join(name)
    }

    fn acquire(&self) -> Result<LockGuard> {
        self.lock.try_acquire()
    }

    /// Limits for the next chunk run, or `None` when the budget is spent.
    fn budget_left(&self, started: Instant) -> Option<ChunkLimits> {
        match self.limits.time_budget {
            None => Some(self.limits),
            Some(budget) => budget
                .checked_sub(started.elapsed())
                .filter(|left| !left.is_zero())
                .map(|left| self.limits.with_time_budget(Some(left))),
        }
    }

    /// Every package under the backup dir, oldest first.
    pub fn list_packages(&self) -> Result<Vec<BuildProgress>> {
        let backup_dir = self.config.backup_dir();
        let entries = match fs::read_dir(&backup_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut packages = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() || !entry.path().join(PROGRESS_FILE).exists() {
                continue;
            }
            match BuildProgress::load(&entry.path()) {
                Ok(progress) => packages.push(progress),
                Err(e) => warn!(dir = %entry.path().display(), error = %e, "unreadable package progress"),
            }
        }
        packages.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.name.cmp(&b.name)));
        Ok(packages)
    }

    /// Progress of `name`, or of the newest package.
    pub fn status(&self, name: Option<&str>) -> Result<Option<BuildProgress>> {
        match name {
            Some(name) => BuildProgress::load(&self.package_dir(name)).map(Some),
            None => Ok(self.list_packages()?.pop()),
        }
    }

    fn building(&self) -> Result<Option<BuildProgress>> {
        Ok(self
            .list_packages()?
            .into_iter()
            .rev()
            .find(|p| p.status == BuildStatus::Building))
    }

    /// Newest package with build or upload work left.
    fn unfinished(&self) -> Result<Option<BuildProgress>> {
        Ok(self
            .list_packages()?
            .into_iter()
            .rev()
            .find(|p| p.status == BuildStatus::Building || (p.status == BuildStatus::Built && has_pending_uploads(p))))
    }

    fn load_or_unfinished(&self, name: Option<&str>) -> Result<BuildProgress> {
        match name {
            Some(name) => BuildProgress::load(&self.package_dir(name)),
            None => self
                .unfinished()?
                .ok_or_else(|| BalerError::PackageNotFound("no package has work left".into())),
        }
    }

    /// Create a new package and run its initialize phase.
    pub fn start_build(&self, filters: InstanceFilters) -> Result<BuildProgress> {
        let _guard = self.acquire()?;
        self.start_locked(filters)
    }

    fn start_locked(&self, filters: InstanceFilters) -> Result<BuildProgress> {
        if let Some(existing) = self.building()? {
            return Err(BalerError::Other(format!(
                "package {} is still building; continue or restart it",
                existing.name
            )));
        }
        let mut progress = BuildProgress::new(PackageId::generate(), &self.config.label, Utc::now());
        progress.sources = self.config.sources.clone();
        progress.instance_filters = filters;
        let dir = self.package_dir(&progress.name);
        fs::create_dir_all(dir.join("checkpoints"))?;
        self.initialize(&mut progress, &dir)?;
        info!(package = %progress.name, dir = %dir.display(), "build started");
        Ok(progress)
    }

    fn initialize(&self, progress: &mut BuildProgress, dir: &Path) -> Result<()> {
        progress.started_at = Some(Utc::now());
        progress.phase = Phase::Scan;
        progress.save(dir)?;
        self.events.phase_completed(progress, Phase::Initialize);
        Ok(())
    }

    /// Advance `name` (or the package with work left) for one budget.
    pub fn continue_build(&self, name: Option<&str>) -> Result<BuildReport> {
        let _guard = self.acquire()?;
        let mut progress = self.load_or_unfinished(name)?;
        self.drive(&mut progress)
    }

    /// Continue the unfinished package, or start a new one when none is left.
    pub fn run(&self, filters: InstanceFilters) -> Result<BuildReport> {
        let _guard = self.acquire()?;
        let mut progress = match self.unfinished()? {
            Some(progress) => progress,
            None => self.start_locked(filters)?,
        };
        self.drive(&mut progress)
    }

    fn drive(&self, progress: &mut BuildProgress) -> Result<BuildReport> {
        let dir = self.package_dir(&progress.name);
        let started = Instant::now();
        let mut report = BuildReport::new(progress);

        while progress.status == BuildStatus::Building {
            let Some(limits) = self.budget_left(started) else {
                report.stopped = Some(StopReason::TimeBudget);
                break;
            };
            let phase = progress.phase;
            let ctx = PhaseContext {
                config: &self.config,
                dir: &dir,
                limits,
                database: self.database.as_deref(),
            };
            let phase_started = Instant::now();
            let run = match phase {
                Phase::Initialize => {
                    self.initialize(progress, &dir)?;
                    report.phases_completed.push(Phase::Initialize);
                    continue;
                }
                Phase::Complete => {
                    self.complete(progress, &dir)?;
                    report.phases_completed.push(Phase::Complete);
                    break;
                }
                Phase::Scan => phases::run_scan(&ctx, progress)?,
                Phase::Archive => phases::run_archive(&ctx, progress)?,
                Phase::Database => phases::run_database(&ctx, progress)?,
                Phase::Installer => phases::run_installer(&ctx, progress)?,
            };
            progress.add_phase_duration(phase, phase_started.elapsed().as_secs_f64());

            match run {
                PhaseRun::Complete => {
                    progress.phase = phase.next();
                    progress.save(&dir)?;
                    remove_checkpoint(&dir, phase)?;
                    info!(package = %progress.name, %phase, "phase complete");
                    self.events.phase_completed(progress, phase);
                    report.phases_completed.push(phase);
                }
                PhaseRun::Stopped(StopReason::Cancelled) => {
                    remove_checkpoint(&dir, phase)?;
                    remove_file_if_exists(&dir.join(CANCEL_FILE))?;
                    self.fail(progress, &dir, "cancelled")?;
                    report.stopped = Some(StopReason::Cancelled);
                    report.error = progress.last_error.clone();
                    break;
                }
                PhaseRun::Stopped(reason) => {
                    progress.save(&dir)?;
                    report.stopped = Some(reason);
                    break;
                }
                PhaseRun::Failed(failure) => {
                    self.record_failure(progress, &dir, phase, &failure)?;
                    report.error = Some(failure.to_string());
                    break;
                }
            }
        }

        if progress.status == BuildStatus::Built && report.stopped.is_none() && report.error.is_none() {
            self.upload_pending(progress, &dir, started, &mut report)?;
        }
        report.status = progress.status;
        report.phase = progress.phase;
        report.transfers = progress.transfers.clone();
        Ok(report)
    }

    fn complete(&self, progress: &mut BuildProgress, dir: &Path) -> Result<()> {
        progress.status = BuildStatus::Built;
        progress.completed_at = Some(Utc::now());
        progress.last_error = None;
        for storage_id in &self.config.build.upload_to {
            progress.transfer_mut(storage_id, TransferDirection::Upload);
        }
        progress.save(dir)?;
        remove_file_if_exists(&dir.join(STATUS_FILE))?;
        info!(package = %progress.name, bytes = progress.processed_bytes, "package built");
        self.events.phase_completed(progress, Phase::Complete);
        Ok(())
    }

    fn fail(&self, progress: &mut BuildProgress, dir: &Path, error: &str) -> Result<()> {
        progress.failed = true;
        progress.status = BuildStatus::Failed;
        progress.last_error = Some(error.to_string());
        progress.completed_at = Some(Utc::now());
        progress.save(dir)?;
        self.events.build_failed(progress, error);
        Ok(())
    }

    fn record_failure(
        &self,
        progress: &mut BuildProgress,
        dir: &Path,
        phase: Phase,
        failure: &ChunkFailure,
    ) -> Result<()> {
        progress.retries += 1;
        progress.last_error = Some(failure.to_string());
        if failure.kind == FailureKind::Seek {
            warn!(package = %progress.name, %phase, "checkpoint is stale; phase restarts from scratch");
            remove_checkpoint(dir, phase)?;
        }
        if progress.retries > self.config.build.max_retries {
            let error = failure.to_string();
            return self.fail(progress, dir, &error);
        }
        warn!(
            package = %progress.name,
            %phase,
            retries = progress.retries,
            error = %failure,
            "phase failed; will retry"
        );
        progress.save(dir)
    }

    fn upload_pending(
        &self,
        progress: &mut BuildProgress,
        dir: &Path,
        started: Instant,
        report: &mut BuildReport,
    ) -> Result<()> {
        let pending: Vec<String> = progress
            .transfers
            .iter()
            .filter(|t| t.direction == TransferDirection::Upload && !t.status.is_terminal())
            .map(|t| t.storage_id.clone())
            .collect();
        for storage_id in pending {
            let Some(limits) = self.budget_left(started) else {
                report.stopped = Some(StopReason::TimeBudget);
                break;
            };
            let Some(storage) = self.registry.get(&storage_id) else {
                warn!(package = %progress.name, storage = %storage_id, "upload target is not configured");
                let record = progress.transfer_mut(&storage_id, TransferDirection::Upload);
                record.finish(
                    TransferStatus::Failed,
                    Some(BalerError::StorageNotFound(storage_id.clone()).to_string()),
                );
                let record = record.clone();
                progress.save(dir)?;
                self.events.transfer_failed(progress, &record);
                continue;
            };
            let record = upload_package(storage, progress, dir, limits, self.events.as_ref())?;
            progress.save(dir)?;
            match record.status {
                TransferStatus::Succeeded => self.purge_after_upload(storage, progress),
                TransferStatus::Running => {
                    report.stopped = Some(StopReason::TimeBudget);
                    break;
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn max_kept(&self, storage_id: &str) -> i64 {
        self.config
            .storages
            .iter()
            .find(|s| s.id == storage_id)
            .map_or(0, |s| s.max_kept)
    }

    fn purge_after_upload(&self, storage: &dyn StorageBackend, progress: &BuildProgress) {
        if !self.config.build.purge_after_upload {
            return;
        }
        let keep = [progress.name.clone()];
        match purge_old_backups(storage, &keep, self.max_kept(storage.id())) {
            Ok(report) => debug!(
                storage = storage.id(),
                kept = report.kept.len(),
                deleted = report.deleted.len(),
                failed = report.failed.len(),
                "retention applied"
            ),
            Err(e) => warn!(storage = storage.id(), error = %e, "retention pass failed"),
        }
    }

    /// Upload a built package to one storage target for one budget.
    ///
    /// A finished, failed or cancelled earlier transfer to the same target
    /// is started over.
    pub fn upload(&self, name: &str, storage_id: &str) -> Result<TransferRecord> {
        let _guard = self.acquire()?;
        let dir = self.package_dir(name);
        let mut progress = BuildProgress::load(&dir)?;
        if progress.status != BuildStatus::Built {
            return Err(BalerError::Other(format!(
                "package {name} is not built ({:?})",
                progress.status
            )));
        }
        let storage = self.registry.require(storage_id)?;
        let record = progress.transfer_mut(storage_id, TransferDirection::Upload);
        if record.status.is_terminal() {
            *record = TransferRecord::new(storage_id, TransferDirection::Upload);
        }
        let record = upload_package(storage, &mut progress, &dir, self.limits, self.events.as_ref())?;
        progress.save(&dir)?;
        if record.status == TransferStatus::Succeeded {
            self.purge_after_upload(storage, &progress);
        }
        Ok(record)
    }

    /// Cancel an upload directly; see [`cancel_upload`].
    pub fn cancel_transfer(&self, name: &str, storage_id: &str) -> Result<bool> {
        let _guard = self.acquire()?;
        let dir = self.package_dir(name);
        let mut progress = BuildProgress::load(&dir)?;
        let cancelled = cancel_upload(
            self.registry.get(storage_id),
            storage_id,
            &mut progress,
            &dir,
            self.events.as_ref(),
        )?;
        if cancelled {
            progress.save(&dir)?;
        }
        Ok(cancelled)
    }

    /// Ask whatever runs on a package to stop at its next item.
    ///
    /// Does not take the lock: the marker is meant for an invocation that
    /// currently holds it.
    pub fn request_cancel(&self, name: Option<&str>) -> Result<PathBuf> {
        let progress = self.load_or_unfinished(name)?;
        let marker = self.package_dir(&progress.name).join(CANCEL_FILE);
        fs::write(&marker, Utc::now().to_rfc3339())?;
        info!(package = %progress.name, "cancel requested");
        Ok(marker)
    }

    /// Reset a package to a fresh build and drop its artifacts.
    pub fn restart(&self, name: Option<&str>) -> Result<BuildProgress> {
        let _guard = self.acquire()?;
        let progress = match name {
            Some(name) => BuildProgress::load(&self.package_dir(name))?,
            None => self
                .list_packages()?
                .pop()
                .ok_or_else(|| BalerError::PackageNotFound("no packages".into()))?,
        };
        if let Some(storage) = &progress.downloaded_from {
            return Err(BalerError::Other(format!(
                "package {} was downloaded from '{storage}' and cannot be rebuilt",
                progress.name
            )));
        }
        if progress.status != BuildStatus::Building {
            if let Some(other) = self.building()? {
                return Err(BalerError::Other(format!(
                    "package {} is still building",
                    other.name
                )));
            }
        }

        let dir = self.package_dir(&progress.name);
        for file in [INVENTORY_FILE, ARCHIVE_FILE, DATABASE_FILE, INSTALLER_FILE, STATUS_FILE, CANCEL_FILE] {
            remove_file_if_exists(&dir.join(file))?;
        }
        match fs::remove_dir_all(dir.join("checkpoints")) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        fs::create_dir_all(dir.join("checkpoints"))?;

        let mut fresh = progress.reset();
        self.initialize(&mut fresh, &dir)?;
        info!(package = %fresh.name, "build restarted");
        Ok(fresh)
    }

    /// Delete old packages on `storage_id`, defaulting to its configured
    /// `max_kept`.
    pub fn purge(&self, storage_id: &str, keep: &[String], max_kept: Option<i64>) -> Result<PurgeReport> {
        let _guard = self.acquire()?;
        let storage = self.registry.require(storage_id)?;
        purge_old_backups(storage, keep, max_kept.unwrap_or_else(|| self.max_kept(storage_id)))
    }

    /// Download `package` from `storage_id` into the backup dir for one
    /// budget. A completed download becomes a built package.
    pub fn download(&self, storage_id: &str, package: &str) -> Result<DownloadOutcome> {
        let _guard = self.acquire()?;
        let storage = self.registry.require(storage_id)?;
        let dir = self.package_dir(package);
        if dir.join(PROGRESS_FILE).exists() {
            return Err(BalerError::Other(format!(
                "package {package} already exists in {}",
                self.config.backup_dir().display()
            )));
        }

        let outcome = download_package(storage, package, &dir, self.limits)?;
        if let DownloadOutcome::Complete { bytes } = outcome {
            let manifest = if self.config.build.verify_download {
                verify_package(&dir)?
            } else {
                read_manifest(&dir.join(INSTALLER_FILE))?
            };
            let id = PackageId::from_hex(&manifest.package_id).map_err(BalerError::InvalidFormat)?;
            let mut progress = BuildProgress::new(id, &manifest.label, manifest.created_at);
            progress.name = manifest.package_name.clone();
            progress.status = BuildStatus::Built;
            progress.phase = Phase::Complete;
            progress.scan_done = true;
            progress.archive_built = true;
            progress.database_script_built = true;
            progress.installer_built = true;
            progress.expected_bytes = manifest.bytes;
            progress.processed_bytes = manifest.bytes;
            progress.create_state.dir_index = manifest.dirs;
            progress.create_state.file_index = manifest.files;
            progress.create_state.bytes_written = manifest.bytes;
            progress.completed_at = Some(Utc::now());
            progress.downloaded_from = Some(storage_id.to_string());
            let record = progress.transfer_mut(storage_id, TransferDirection::Download);
            record.bytes_transferred = bytes;
            record.total_bytes = bytes;
            record.finish(TransferStatus::Succeeded, None);
            progress.save(&dir)?;
            info!(package, storage = storage_id, "package downloaded");
        }
        Ok(outcome)
    }

    /// Expand a built package's archive into `dest` for one budget.
    pub fn expand(&self, name: &str, dest: &Path) -> Result<ExpandOutcome> {
        let _guard = self.acquire()?;
        let dir = self.package_dir(name);
        let mut progress = BuildProgress::load(&dir)?;
        if !progress.archive_built {
            return Err(BalerError::Other(format!("package {name} has no finished archive")));
        }
        fs::create_dir_all(dest)?;
        let outcome = expand_archive(
            &dir.join(ARCHIVE_FILE),
            dest,
            &dir.join("checkpoints").join("expand.json"),
            self.limits,
            false,
        )?;
        match &outcome {
            ExpandOutcome::Complete(state) | ExpandOutcome::Stopped(state) => {
                progress.expand_state = Some(state.clone());
                progress.save(&dir)?;
            }
            ExpandOutcome::Error(_) => {}
        }
        Ok(outcome)
    }

    /// Force-release a named build lock left by a dead invocation.
    pub fn break_lock(&self) -> Result<bool> {
        self.lock.break_lock()
    }
}
