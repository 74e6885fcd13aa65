//! The installer phase: segment hashes of the archive and the package
//! manifest `installer.json`.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use blake2::{Blake2s256, Digest};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::archive::ARCHIVE_FILE;
use crate::chunking::persist::atomic_write;
use crate::database::DATABASE_FILE;
use crate::error::{BalerError, Result};

pub const INSTALLER_FILE: &str = "installer.json";
pub const MANIFEST_VERSION: u32 = 1;

/// Extra data of the installer job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallerState {
    /// Segment size the hashes were computed with.
    pub segment_size: u64,
    /// Hex Blake2s-256 of each completed segment, in order.
    pub segment_hashes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveManifest {
    pub name: String,
    pub size: u64,
    pub segment_size: u64,
    pub segments: Vec<String>,
    /// Blake2s-256 over the concatenated raw segment digests.
    pub digest: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDigest {
    pub name: String,
    pub size: u64,
    pub digest: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallerManifest {
    pub format_version: u32,
    pub package_id: String,
    pub package_name: String,
    pub label: String,
    pub created_at: DateTime<Utc>,
    pub archive: ArchiveManifest,
    pub database: FileDigest,
    pub dirs: u64,
    pub files: u64,
    pub bytes: u64,
}

/// Hex Blake2s-256 of `len` bytes of `file` at `offset`.
pub fn hash_segment(file: &mut File, offset: u64, len: u64) -> Result<String> {
    file.seek(SeekFrom::Start(offset))?;
    let mut hasher = Blake2s256::new();
    let copied = std::io::copy(&mut (&mut *file).take(len), &mut hasher)?;
    if copied != len {
        return Err(BalerError::InvalidFormat(format!(
            "segment at {offset} is {copied} bytes, expected {len}"
        )));
    }
    Ok(hex::encode(hasher.finalize()))
}

pub fn combined_digest(segments: &[String]) -> Result<String> {
    let mut hasher = Blake2s256::new();
    for segment in segments {
        let raw = hex::decode(segment)
            .map_err(|e| BalerError::InvalidFormat(format!("bad segment digest: {e}")))?;
        hasher.update(&raw);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Streaming digest of a whole file.
pub fn file_digest(path: &Path) -> Result<FileDigest> {
    let mut file = File::open(path)?;
    let mut hasher = Blake2s256::new();
    let size = std::io::copy(&mut file, &mut hasher)?;
    Ok(FileDigest {
        name: path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default(),
        size,
        digest: hex::encode(hasher.finalize()),
    })
}

pub fn write_manifest(path: &Path, manifest: &InstallerManifest) -> Result<()> {
    let data = serde_json::to_vec_pretty(manifest)?;
    atomic_write(path, &data)
}

pub fn read_manifest(path: &Path) -> Result<InstallerManifest> {
    let data = std::fs::read(path)?;
    let manifest: InstallerManifest = serde_json::from_slice(&data)?;
    if manifest.format_version != MANIFEST_VERSION {
        return Err(BalerError::InvalidFormat(format!(
            "unsupported manifest version {}",
            manifest.format_version
        )));
    }
    Ok(manifest)
}

/// Check the archive and database script in `dir` against its manifest.
pub fn verify_package(dir: &Path) -> Result<InstallerManifest> {
    let manifest = read_manifest(&dir.join(INSTALLER_FILE))?;

    let archive_path = dir.join(ARCHIVE_FILE);
    let mut archive = File::open(&archive_path)?;
    let size = archive.metadata()?.len();
    if size != manifest.archive.size {
        return Err(BalerError::InvalidFormat(format!(
            "archive is {size} bytes, manifest says {}",
            manifest.archive.size
        )));
    }
    let step = manifest.archive.segment_size.max(1);
    let mut offset = 0u64;
    for (index, expected) in manifest.archive.segments.iter().enumerate() {
        let len = step.min(size.saturating_sub(offset));
        if hash_segment(&mut archive, offset, len)? != *expected {
            return Err(BalerError::InvalidFormat(format!(
                "archive segment {index} does not match its digest"
            )));
        }
        offset += len;
    }
    if offset != size || combined_digest(&manifest.archive.segments)? != manifest.archive.digest {
        return Err(BalerError::InvalidFormat("archive digest mismatch".into()));
    }

    let database = file_digest(&dir.join(DATABASE_FILE))?;
    if database.digest != manifest.database.digest || database.size != manifest.database.size {
        return Err(BalerError::InvalidFormat(
            "database script does not match its digest".into(),
        ));
    }
    debug!(package = %manifest.package_name, "package verified");
    Ok(manifest)
}
