//! One chunk job per build phase. Each runner resumes from the phase's
//! checkpoint, works for the given budget and folds its results into the
//! progress on completion. Progress persistence and checkpoint removal are
//! left to the driver.

use std::fs::File;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::debug;

use super::progress::{BuildProgress, Phase};
use crate::archive::{
    ArchiveCreateState, ArchiveUnit, ArchiveUnitIterator, ArchiveWriter, ARCHIVE_FILE,
};
use crate::chunking::persist::atomic_write;
use crate::chunking::{
    ActionError, ByteRangeIterator, CheckpointBackend, CheckpointRecord, ChunkFailure, ChunkLimits,
    ChunkOutcome, ChunkingManager, FailureKind, FileBackend, Persistence, SeekableIterator,
    StopReason,
};
use crate::config::BalerConfig;
use crate::database::{
    DatabaseExportState, DatabaseIterator, DatabaseSource, DatabaseUnit, ScriptWriter,
    DATABASE_FILE,
};
use crate::error::{BalerError, Result};
use crate::installer::{
    combined_digest, file_digest, hash_segment, write_manifest, ArchiveManifest, InstallerManifest,
    InstallerState, INSTALLER_FILE, MANIFEST_VERSION,
};
use crate::scan::{
    read_inventory, Filters, InventoryWriter, ScanPosition, ScanState, WalkIterator,
    INVENTORY_FILE,
};
use crate::transfer::CANCEL_FILE;

/// Live progress of the archive phase, rewritten with every checkpoint.
pub const STATUS_FILE: &str = "status.json";

/// How one invocation of a phase ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseRun {
    Complete,
    Stopped(StopReason),
    Failed(ChunkFailure),
}

pub(crate) struct PhaseContext<'a> {
    pub config: &'a BalerConfig,
    pub dir: &'a Path,
    pub limits: ChunkLimits,
    pub database: Option<&'a dyn DatabaseSource>,
}

pub fn checkpoint_path(dir: &Path, phase: Phase) -> PathBuf {
    dir.join("checkpoints").join(format!("{phase}.json"))
}

/// Drop the checkpoint of `phase`. Missing checkpoints are fine.
pub fn remove_checkpoint(dir: &Path, phase: Phase) -> Result<()> {
    FileBackend::new(checkpoint_path(dir, phase)).remove()
}

fn cancel_probe(dir: &Path) -> impl Fn() -> bool + 'static {
    let marker = dir.join(CANCEL_FILE);
    move || marker.exists()
}

/// Map errors raised while setting a phase up onto chunk failures, so the
/// driver's retry accounting covers them too.
fn setup_failure(err: BalerError) -> Result<PhaseRun> {
    let kind = if matches!(err, BalerError::StaleCheckpoint(_)) {
        FailureKind::Seek
    } else if matches!(
        err,
        BalerError::Io(_) | BalerError::InvalidFormat(_) | BalerError::Other(_)
    ) {
        FailureKind::Action
    } else {
        return Err(err);
    };
    Ok(PhaseRun::Failed(ChunkFailure {
        kind,
        message: err.to_string(),
        location: None,
        retry_after: None,
    }))
}

fn settle<I, E>(manager: &ChunkingManager<I, E>, outcome: ChunkOutcome) -> PhaseRun
where
    I: SeekableIterator,
    E: Serialize + serde::de::DeserializeOwned + Clone,
{
    match outcome {
        ChunkOutcome::Complete => PhaseRun::Complete,
        ChunkOutcome::Stopped(reason) => {
            debug!(processed = manager.processed(), ?reason, "phase paused");
            PhaseRun::Stopped(reason)
        }
        ChunkOutcome::Error(failure) => PhaseRun::Failed(failure),
    }
}

fn source_roots(progress: &BuildProgress) -> Vec<PathBuf> {
    progress.sources.iter().map(PathBuf::from).collect()
}

pub(crate) fn run_scan(ctx: &PhaseContext<'_>, progress: &mut BuildProgress) -> Result<PhaseRun> {
    match scan(ctx, progress) {
        Err(e) => setup_failure(e),
        ok => ok,
    }
}

fn scan(ctx: &PhaseContext<'_>, progress: &mut BuildProgress) -> Result<PhaseRun> {
    let roots = source_roots(progress);
    let filters = Filters::from_config(ctx.config, &progress.instance_filters);
    let mut store: Persistence<ScanState, ScanPosition> =
        Persistence::file(checkpoint_path(ctx.dir, Phase::Scan));
    let state = store
        .load_record()?
        .map(|r| r.extra_data.clone())
        .unwrap_or_else(|| ScanState::new(filters.clone()));

    let mut writer = InventoryWriter::open(
        &ctx.dir.join(INVENTORY_FILE),
        &state,
        &roots,
        ctx.config.scan.big_file_threshold_bytes()?,
    )?;
    let iterator = WalkIterator::new(roots, filters, &ctx.config.exclude_patterns)?;
    let mut manager = ChunkingManager::new(Phase::Scan.as_str(), iterator, store, state, ctx.limits)
        .with_cancel_probe(cancel_probe(ctx.dir));
    let outcome = manager.start(false, |_, entry, state| {
        writer.record(entry, state).map_err(ActionError::from)
    });
    writer.sync()?;

    if outcome.is_complete() {
        let report = manager.extra().report();
        progress.expected_bytes = report.total_bytes;
        progress.scan = Some(report);
        progress.scan_done = true;
    }
    Ok(settle(&manager, outcome))
}

#[derive(Serialize)]
struct ArchiveStatus<'a> {
    phase: Phase,
    package: &'a str,
    archive_offset: u64,
    bytes_written: u64,
    expected_bytes: u64,
    files: u64,
    dirs: u64,
    position: Option<&'a ArchiveUnit>,
}

pub(crate) fn run_archive(ctx: &PhaseContext<'_>, progress: &mut BuildProgress) -> Result<PhaseRun> {
    match archive(ctx, progress) {
        Err(e) => setup_failure(e),
        ok => ok,
    }
}

fn archive(ctx: &PhaseContext<'_>, progress: &mut BuildProgress) -> Result<PhaseRun> {
    let status_path = ctx.dir.join(STATUS_FILE);
    let package = progress.name.clone();
    let expected_bytes = progress.expected_bytes;
    let mut store = Persistence::file(checkpoint_path(ctx.dir, Phase::Archive)).with_mirror(
        move |record: &CheckpointRecord<ArchiveCreateState, ArchiveUnit>| {
            let status = ArchiveStatus {
                phase: Phase::Archive,
                package: &package,
                archive_offset: record.extra_data.archive_offset,
                bytes_written: record.extra_data.bytes_written,
                expected_bytes,
                files: record.extra_data.file_index,
                dirs: record.extra_data.dir_index,
                position: record.position.as_ref(),
            };
            atomic_write(&status_path, &serde_json::to_vec_pretty(&status)?)
        },
    );
    let mut state = store
        .load_record()?
        .map(|r| r.extra_data.clone())
        .unwrap_or_default();

    let roots = source_roots(progress);
    let entries = read_inventory(&ctx.dir.join(INVENTORY_FILE))?;
    let mut writer = ArchiveWriter::open(
        &ctx.dir.join(ARCHIVE_FILE),
        roots.clone(),
        &mut state,
        progress.created_at.timestamp(),
    )?;
    let iterator = ArchiveUnitIterator::new(entries, roots, ctx.config.archive.glob_size_bytes()?);
    let mut manager =
        ChunkingManager::new(Phase::Archive.as_str(), iterator, store, state, ctx.limits)
            .with_cancel_probe(cancel_probe(ctx.dir));
    let outcome = manager.start(false, |_, item, state| {
        writer.write_unit(item, state).map_err(ActionError::from)
    });
    writer.sync()?;

    let state = manager.extra();
    progress.processed_bytes = state.bytes_written;
    if outcome.is_complete() {
        if !state.footer_written {
            return Ok(PhaseRun::Failed(ChunkFailure {
                kind: FailureKind::Action,
                message: "archive finished without a footer".into(),
                location: None,
                retry_after: None,
            }));
        }
        progress.create_state = state.clone();
        progress.archive_built = true;
    }
    Ok(settle(&manager, outcome))
}

pub(crate) fn run_database(ctx: &PhaseContext<'_>, progress: &mut BuildProgress) -> Result<PhaseRun> {
    match database(ctx, progress) {
        Err(e) => setup_failure(e),
        ok => ok,
    }
}

fn database(ctx: &PhaseContext<'_>, progress: &mut BuildProgress) -> Result<PhaseRun> {
    let mut store: Persistence<DatabaseExportState, DatabaseUnit> =
        Persistence::file(checkpoint_path(ctx.dir, Phase::Database));
    let mut state = store
        .load_record()?
        .map(|r| r.extra_data.clone())
        .unwrap_or_default();

    let source = ctx.database;
    let source_name = source.map_or_else(|| "none".to_string(), |s| s.name());
    let mut writer = ScriptWriter::open(&ctx.dir.join(DATABASE_FILE), &source_name, &mut state)?;
    let iterator = DatabaseIterator::new(source, ctx.config.database.batch_rows)?;
    let mut manager =
        ChunkingManager::new(Phase::Database.as_str(), iterator, store, state, ctx.limits)
            .with_cancel_probe(cancel_probe(ctx.dir));
    let outcome = manager.start(false, |_, item, state| match source {
        Some(source) => writer
            .write_unit(source, item, state)
            .map_err(ActionError::from),
        None => Ok(()),
    });
    writer.sync()?;

    if outcome.is_complete() {
        progress.database = manager.extra().clone();
        progress.database_script_built = true;
    }
    Ok(settle(&manager, outcome))
}

pub(crate) fn run_installer(ctx: &PhaseContext<'_>, progress: &mut BuildProgress) -> Result<PhaseRun> {
    match installer(ctx, progress) {
        Err(e) => setup_failure(e),
        ok => ok,
    }
}

fn installer(ctx: &PhaseContext<'_>, progress: &mut BuildProgress) -> Result<PhaseRun> {
    let archive_path = ctx.dir.join(ARCHIVE_FILE);
    let mut store: Persistence<InstallerState, u64> =
        Persistence::file(checkpoint_path(ctx.dir, Phase::Installer));
    let state = match store.load_record()? {
        Some(record) => record.extra_data.clone(),
        None => InstallerState {
            segment_size: ctx.config.installer.segment_size_bytes()?,
            segment_hashes: Vec::new(),
        },
    };
    let segment_size = state.segment_size.max(1);

    let mut archive = File::open(&archive_path)?;
    let size = archive.metadata()?.len();
    let mut manager = ChunkingManager::new(
        Phase::Installer.as_str(),
        ByteRangeIterator::new(size, segment_size),
        store,
        state,
        ctx.limits,
    )
    .with_cancel_probe(cancel_probe(ctx.dir));
    let outcome = manager.start(false, |_, &(offset, len), state| {
        let digest = hash_segment(&mut archive, offset, len)?;
        state.segment_hashes.push(digest);
        Ok(())
    });

    if outcome.is_complete() {
        let state = manager.extra();
        let manifest = InstallerManifest {
            format_version: MANIFEST_VERSION,
            package_id: progress.id.to_hex(),
            package_name: progress.name.clone(),
            label: progress.label.clone(),
            created_at: progress.created_at,
            archive: ArchiveManifest {
                name: ARCHIVE_FILE.to_string(),
                size,
                segment_size,
                digest: combined_digest(&state.segment_hashes)?,
                segments: state.segment_hashes.clone(),
            },
            database: file_digest(&ctx.dir.join(DATABASE_FILE))?,
            dirs: progress.create_state.dir_index,
            files: progress.create_state.file_index,
            bytes: progress.create_state.bytes_written,
        };
        write_manifest(&ctx.dir.join(INSTALLER_FILE), &manifest)?;
        progress.installer_built = true;
    }
    Ok(settle(&manager, outcome))
}
