use std::fs::{Metadata, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// The metadata the archive records for every entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetadataSummary {
    pub mode: u32,
    /// Modification time in unix seconds.
    pub mtime: i64,
    pub device: u64,
    pub size: u64,
}

pub fn summarize_metadata(metadata: &Metadata) -> MetadataSummary {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;

        MetadataSummary {
            mode: metadata.mode() & 0o7777,
            mtime: metadata.mtime(),
            device: metadata.dev(),
            size: metadata.len(),
        }
    }

    #[cfg(not(unix))]
    {
        let readonly = metadata.permissions().readonly();
        let mode = match (metadata.is_dir(), readonly) {
            (true, true) => 0o555,
            (true, false) => 0o755,
            (false, true) => 0o444,
            (false, false) => 0o644,
        };
        let mtime = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        MetadataSummary {
            mode,
            mtime,
            device: 0,
            size: metadata.len(),
        }
    }
}

pub fn apply_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
    }

    #[cfg(not(unix))]
    {
        let mut perms = std::fs::metadata(path)?.permissions();
        perms.set_readonly((mode & 0o200) == 0);
        std::fs::set_permissions(path, perms)
    }
}

/// Set the modification time of a regular file.
pub fn set_file_mtime(path: &Path, secs: i64) -> std::io::Result<()> {
    let time = if secs >= 0 {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs as u64)
    } else {
        SystemTime::UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs())
    };
    let file = OpenOptions::new().write(true).open(path)?;
    file.set_modified(time)
}

/// Returns `true` for I/O errors safe to skip (permission denied, not found).
pub fn is_soft_io_error(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::PermissionDenied | std::io::ErrorKind::NotFound
    )
}

/// Hex of the raw bytes of a path that is not valid UTF-8, so it can be
/// stored in JSON without loss. `None` for UTF-8 paths.
pub fn non_utf8_hex(path: &Path) -> Option<String> {
    if path.to_str().is_some() {
        return None;
    }
    #[cfg(unix)]
    {
        use std::os::unix::ffi::OsStrExt;
        Some(hex::encode(path.as_os_str().as_bytes()))
    }

    #[cfg(not(unix))]
    {
        None
    }
}

/// Inverse of [`non_utf8_hex`].
pub fn path_from_hex(encoded: &str) -> Option<PathBuf> {
    #[cfg(unix)]
    {
        use std::os::unix::ffi::OsStringExt;
        let bytes = hex::decode(encoded).ok()?;
        Some(PathBuf::from(std::ffi::OsString::from_vec(bytes)))
    }

    #[cfg(not(unix))]
    {
        let _ = encoded;
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_file_mtime_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.txt");
        std::fs::write(&path, b"hello").unwrap();

        let target_secs: i64 = 1_700_000_000;
        set_file_mtime(&path, target_secs).unwrap();

        let meta = std::fs::metadata(&path).unwrap();
        assert_eq!(summarize_metadata(&meta).mtime, target_secs);
    }

    #[test]
    fn soft_errors() {
        let denied = std::io::Error::from(std::io::ErrorKind::PermissionDenied);
        let other = std::io::Error::other("boom");
        assert!(is_soft_io_error(&denied));
        assert!(!is_soft_io_error(&other));
    }

    #[cfg(unix)]
    #[test]
    fn non_utf8_paths_survive_hex() {
        use std::os::unix::ffi::OsStrExt;

        assert_eq!(non_utf8_hex(Path::new("docs/a.txt")), None);
        let raw = Path::new(std::ffi::OsStr::from_bytes(b"docs/b\xff.txt"));
        let encoded = non_utf8_hex(raw).unwrap();
        assert_eq!(path_from_hex(&encoded).unwrap(), raw);
        assert_eq!(path_from_hex("zz"), None);
    }
}
