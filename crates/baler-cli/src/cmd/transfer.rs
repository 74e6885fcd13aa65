use baler_core::error::BalerError;
use baler_core::transfer::{DownloadOutcome, TransferStatus};
use baler_core::Engine;

use super::CmdResult;
use crate::format::{format_bytes, format_progress, format_time, format_transfer};

/// `package`, or the newest package in the backup dir.
fn package_or_newest(engine: &Engine, package: Option<&str>) -> Result<String, BalerError> {
    match package {
        Some(name) => Ok(name.to_string()),
        None => engine
            .status(None)?
            .map(|p| p.name)
            .ok_or_else(|| BalerError::PackageNotFound("no packages in backup dir".into())),
    }
}

pub(crate) fn run_upload(engine: &Engine, storage: &str, package: Option<&str>) -> CmdResult {
    let name = package_or_newest(engine, package)?;
    let record = engine.upload(&name, storage)?;
    println!("{name}: {}", format_transfer(&record));
    match record.status {
        TransferStatus::Succeeded => Ok(()),
        TransferStatus::Failed => Err(format!(
            "upload of {name} to '{storage}' failed: {}",
            record.error.as_deref().unwrap_or("unknown error")
        )
        .into()),
        TransferStatus::Backoff { until } => {
            println!("Storage is rate limited; retry after {}.", format_time(until));
            Ok(())
        }
        TransferStatus::Cancelled => Ok(()),
        TransferStatus::Pending | TransferStatus::Running => {
            println!("Run `baler upload {storage} {name}` again to continue.");
            Ok(())
        }
    }
}

pub(crate) fn run_download(engine: &Engine, storage: &str, package: &str) -> CmdResult {
    match engine.download(storage, package)? {
        DownloadOutcome::Complete { bytes } => {
            println!("Downloaded {package} from '{storage}' ({})", format_bytes(bytes));
            Ok(())
        }
        DownloadOutcome::Stopped { bytes, total } => {
            println!("Downloaded {}", format_progress(bytes, total));
            println!("Run `baler download {storage} {package}` again to continue.");
            Ok(())
        }
        DownloadOutcome::Backoff { until } => {
            println!("Storage is rate limited; retry after {}.", format_time(until));
            Ok(())
        }
        DownloadOutcome::Cancelled => {
            println!("Download cancelled.");
            Ok(())
        }
        DownloadOutcome::Failed(message) => {
            Err(format!("download of {package} from '{storage}' failed: {message}").into())
        }
    }
}

pub(crate) fn run_cancel(engine: &Engine, package: Option<&str>, storage: Option<&str>) -> CmdResult {
    match storage {
        Some(storage) => {
            let name = package_or_newest(engine, package)?;
            if engine.cancel_transfer(&name, storage)? {
                println!("Cancelled upload of {name} to '{storage}'.");
            } else {
                println!("No running upload of {name} to '{storage}'.");
            }
        }
        None => {
            let marker = engine.request_cancel(package)?;
            println!("Cancel requested: {}", marker.display());
        }
    }
    Ok(())
}
