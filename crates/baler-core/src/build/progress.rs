use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use baler_types::PackageId;

use crate::archive::{ArchiveCreateState, ArchiveExpandState};
use crate::chunking::persist::atomic_write;
use crate::database::DatabaseExportState;
use crate::error::{BalerError, Result};
use crate::scan::{InstanceFilters, ScanReport};
use crate::transfer::{TransferDirection, TransferRecord};

pub const PROGRESS_FILE: &str = "progress.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    Building,
    Built,
    Failed,
}

/// Build phases, in the only order they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Initialize,
    Scan,
    Archive,
    Database,
    Installer,
    Complete,
}

impl Phase {
    pub fn next(self) -> Phase {
        match self {
            Phase::Initialize => Phase::Scan,
            Phase::Scan => Phase::Archive,
            Phase::Archive => Phase::Database,
            Phase::Database => Phase::Installer,
            Phase::Installer | Phase::Complete => Phase::Complete,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Initialize => "initialize",
            Phase::Scan => "scan",
            Phase::Archive => "archive",
            Phase::Database => "database",
            Phase::Installer => "installer",
            Phase::Complete => "complete",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything known about one package, persisted as `progress.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildProgress {
    pub id: PackageId,
    pub name: String,
    pub label: String,
    pub status: BuildStatus,
    pub phase: Phase,
    pub scan_done: bool,
    pub archive_built: bool,
    pub database_script_built: bool,
    pub installer_built: bool,
    pub retries: u32,
    pub failed: bool,
    pub last_error: Option<String>,
    pub expected_bytes: u64,
    pub processed_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Seconds spent per phase across invocations.
    #[serde(default)]
    pub phase_durations: BTreeMap<Phase, f64>,
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub instance_filters: InstanceFilters,
    #[serde(default)]
    pub scan: Option<ScanReport>,
    #[serde(default)]
    pub create_state: ArchiveCreateState,
    #[serde(default)]
    pub database: DatabaseExportState,
    #[serde(default)]
    pub expand_state: Option<ArchiveExpandState>,
    #[serde(default)]
    pub transfers: Vec<TransferRecord>,
    /// Storage this package was downloaded from, if it was not built here.
    #[serde(default)]
    pub downloaded_from: Option<String>,
}

impl BuildProgress {
    pub fn new(id: PackageId, label: &str, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            name: id.package_name(label, created_at),
            label: label.to_string(),
            status: BuildStatus::Building,
            phase: Phase::Initialize,
            scan_done: false,
            archive_built: false,
            database_script_built: false,
            installer_built: false,
            retries: 0,
            failed: false,
            last_error: None,
            expected_bytes: 0,
            processed_bytes: 0,
            created_at,
            started_at: None,
            completed_at: None,
            phase_durations: BTreeMap::new(),
            sources: Vec::new(),
            instance_filters: InstanceFilters::default(),
            scan: None,
            create_state: ArchiveCreateState::default(),
            database: DatabaseExportState::default(),
            expand_state: None,
            transfers: Vec::new(),
            downloaded_from: None,
        }
    }

    /// Terminal: failed, or every artifact has been produced.
    pub fn has_completed(&self) -> bool {
        self.failed || (self.installer_built && self.archive_built && self.database_script_built)
    }

    /// Same identity, every phase undone.
    pub fn reset(&self) -> Self {
        let mut fresh = Self::new(self.id, &self.label, self.created_at);
        fresh.name = self.name.clone();
        fresh.sources = self.sources.clone();
        fresh.instance_filters = self.instance_filters.clone();
        fresh
    }

    pub fn add_phase_duration(&mut self, phase: Phase, secs: f64) {
        *self.phase_durations.entry(phase).or_insert(0.0) += secs;
    }

    pub fn transfer(&self, storage_id: &str, direction: TransferDirection) -> Option<&TransferRecord> {
        self.transfers
            .iter()
            .find(|t| t.storage_id == storage_id && t.direction == direction)
    }

    /// Record for `storage_id`, created as pending when missing.
    pub fn transfer_mut(&mut self, storage_id: &str, direction: TransferDirection) -> &mut TransferRecord {
        let index = match self
            .transfers
            .iter()
            .position(|t| t.storage_id == storage_id && t.direction == direction)
        {
            Some(index) => index,
            None => {
                self.transfers.push(TransferRecord::new(storage_id, direction));
                self.transfers.len() - 1
            }
        };
        &mut self.transfers[index]
    }

    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(PROGRESS_FILE);
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BalerError::PackageNotFound(dir.display().to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&data)?)
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        let data = serde_json::to_vec_pretty(self)?;
        atomic_write(&dir.join(PROGRESS_FILE), &data)
    }
}
