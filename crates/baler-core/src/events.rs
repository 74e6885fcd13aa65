use tracing::{info, warn};

use baler_storage::StorageBackend;

use crate::build::{BuildProgress, Phase};
use crate::error::{BalerError, Result};
use crate::transfer::TransferRecord;

/// Notifications raised by the build driver and transfer orchestrators.
///
/// Every method has a no-op default so implementors only override what they
/// observe. `validate_upload_target` is the one hook that can veto work.
pub trait BuildEvents: Send + Sync {
    fn phase_completed(&self, _progress: &BuildProgress, _phase: Phase) {}

    fn build_failed(&self, _progress: &BuildProgress, _error: &str) {}

    fn transfer_completed(&self, _progress: &BuildProgress, _record: &TransferRecord) {}

    fn transfer_failed(&self, _progress: &BuildProgress, _record: &TransferRecord) {}

    fn transfer_cancelled(&self, _progress: &BuildProgress, _record: &TransferRecord) {}

    /// Accept or reject `target` before an upload starts.
    fn validate_upload_target(
        &self,
        progress: &BuildProgress,
        target: &dyn StorageBackend,
        package_size: u64,
    ) -> Result<()> {
        default_upload_validation(progress, target, package_size)
    }
}

/// Rejects uploading a package back to the storage it came from, targets
/// without valid credentials, and targets without room for the package.
pub fn default_upload_validation(
    progress: &BuildProgress,
    target: &dyn StorageBackend,
    package_size: u64,
) -> Result<()> {
    if progress.downloaded_from.as_deref() == Some(target.id()) {
        return Err(BalerError::TransferRejected(format!(
            "package {} was downloaded from '{}'",
            progress.name,
            target.id()
        )));
    }
    if !target.is_authorized() {
        return Err(BalerError::Unauthorized(target.id().to_string()));
    }
    if let Some(available) = target.free_space()? {
        if available < package_size {
            return Err(BalerError::InsufficientSpace {
                storage: target.id().to_string(),
                needed: package_size,
                available,
            });
        }
    }
    Ok(())
}

/// Events that do nothing beyond the default validation.
pub struct NoEvents;

impl BuildEvents for NoEvents {}

/// Events written to the log.
pub struct LogEvents;

impl BuildEvents for LogEvents {
    fn phase_completed(&self, progress: &BuildProgress, phase: Phase) {
        info!(package = %progress.name, ?phase, "phase completed");
    }

    fn build_failed(&self, progress: &BuildProgress, error: &str) {
        warn!(package = %progress.name, retries = progress.retries, error, "build failed");
    }

    fn transfer_completed(&self, progress: &BuildProgress, record: &TransferRecord) {
        info!(
            package = %progress.name,
            storage = %record.storage_id,
            bytes = record.bytes_transferred,
            "transfer completed"
        );
    }

    fn transfer_failed(&self, progress: &BuildProgress, record: &TransferRecord) {
        warn!(
            package = %progress.name,
            storage = %record.storage_id,
            error = record.error.as_deref().unwrap_or("-"),
            "transfer failed"
        );
    }

    fn transfer_cancelled(&self, progress: &BuildProgress, record: &TransferRecord) {
        info!(package = %progress.name, storage = %record.storage_id, "transfer cancelled");
    }
}
