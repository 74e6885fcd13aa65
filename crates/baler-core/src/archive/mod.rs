//! The `.balr` container: a header followed by directory, file, glob and
//! footer records, all little-endian.
//!
//! ```text
//! header  "BALR" version:u16 created:i64
//! 'D'     path_len:u32 path mtime:i64 mode:u32
//! 'F'     path_len:u32 path size:u64 mtime:i64 mode:u32
//! 'G'     len:u32 blake2s-256:[u8;32] data
//! 'E'     dirs:u64 files:u64 bytes:u64
//! ```

pub mod create;
pub mod expand;

use std::io::{ErrorKind, Read, Write};
use std::path::{Component, Path, PathBuf};

use blake2::{Blake2s256, Digest};

use crate::error::{BalerError, Result};

pub use create::{ArchiveCreateState, ArchiveItem, ArchiveUnit, ArchiveUnitIterator, ArchiveWriter};
pub use expand::{
    expand_archive, ArchiveExpandState, ArchiveRecordIterator, ExpandOutcome, Expander,
};

pub const ARCHIVE_FILE: &str = "archive.balr";
pub const MAGIC: &[u8; 4] = b"BALR";
pub const FORMAT_VERSION: u16 = 1;
pub const HEADER_LEN: u64 = 4 + 2 + 8;

const TAG_DIR: u8 = b'D';
const TAG_FILE: u8 = b'F';
const TAG_GLOB: u8 = b'G';
const TAG_END: u8 = b'E';

const MAX_PATH_LEN: u32 = 64 * 1024;
/// Upper bound on one glob's payload, guarding allocations on corrupt input.
pub const MAX_GLOB_LEN: u32 = 256 * 1024 * 1024;

pub type GlobDigest = [u8; 32];

pub fn glob_digest(data: &[u8]) -> GlobDigest {
    Blake2s256::digest(data).into()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Dir {
        path: String,
        mtime: i64,
        mode: u32,
    },
    File {
        path: String,
        size: u64,
        mtime: i64,
        mode: u32,
    },
    Glob {
        digest: GlobDigest,
        data: Vec<u8>,
    },
    End {
        dirs: u64,
        files: u64,
        bytes: u64,
    },
}

impl Record {
    pub fn encoded_len(&self) -> u64 {
        1 + match self {
            Record::Dir { path, .. } => 4 + path.len() as u64 + 8 + 4,
            Record::File { path, .. } => 4 + path.len() as u64 + 8 + 8 + 4,
            Record::Glob { data, .. } => 4 + 32 + data.len() as u64,
            Record::End { .. } => 24,
        }
    }

    /// Serialize the record. Fails when a path or glob is longer than the
    /// reader accepts.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.encoded_len() as usize);
        match self {
            Record::Dir { path, mtime, mode } => {
                buf.push(TAG_DIR);
                buf.extend_from_slice(&length_prefix(path.len(), MAX_PATH_LEN, "path")?);
                buf.extend_from_slice(path.as_bytes());
                buf.extend_from_slice(&mtime.to_le_bytes());
                buf.extend_from_slice(&mode.to_le_bytes());
            }
            Record::File {
                path,
                size,
                mtime,
                mode,
            } => {
                buf.push(TAG_FILE);
                buf.extend_from_slice(&length_prefix(path.len(), MAX_PATH_LEN, "path")?);
                buf.extend_from_slice(path.as_bytes());
                buf.extend_from_slice(&size.to_le_bytes());
                buf.extend_from_slice(&mtime.to_le_bytes());
                buf.extend_from_slice(&mode.to_le_bytes());
            }
            Record::Glob { digest, data } => {
                buf.push(TAG_GLOB);
                buf.extend_from_slice(&length_prefix(data.len(), MAX_GLOB_LEN, "glob")?);
                buf.extend_from_slice(digest);
                buf.extend_from_slice(data);
            }
            Record::End { dirs, files, bytes } => {
                buf.push(TAG_END);
                buf.extend_from_slice(&dirs.to_le_bytes());
                buf.extend_from_slice(&files.to_le_bytes());
                buf.extend_from_slice(&bytes.to_le_bytes());
            }
        }
        Ok(buf)
    }

    /// Read the next record; `Ok(None)` at a clean end of input.
    pub fn read_from<R: Read>(r: &mut R) -> Result<Option<Record>> {
        let mut tag = [0u8; 1];
        match r.read_exact(&mut tag) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let record = match tag[0] {
            TAG_DIR => {
                let path = read_path(r)?;
                Record::Dir {
                    path,
                    mtime: i64::from_le_bytes(read_array(r)?),
                    mode: u32::from_le_bytes(read_array(r)?),
                }
            }
            TAG_FILE => {
                let path = read_path(r)?;
                Record::File {
                    path,
                    size: u64::from_le_bytes(read_array(r)?),
                    mtime: i64::from_le_bytes(read_array(r)?),
                    mode: u32::from_le_bytes(read_array(r)?),
                }
            }
            TAG_GLOB => {
                let len = u32::from_le_bytes(read_array(r)?);
                if len > MAX_GLOB_LEN {
                    return Err(BalerError::InvalidFormat(format!(
                        "glob length {len} exceeds limit"
                    )));
                }
                let digest: GlobDigest = read_array(r)?;
                let mut data = vec![0u8; len as usize];
                r.read_exact(&mut data).map_err(truncated)?;
                Record::Glob { digest, data }
            }
            TAG_END => Record::End {
                dirs: u64::from_le_bytes(read_array(r)?),
                files: u64::from_le_bytes(read_array(r)?),
                bytes: u64::from_le_bytes(read_array(r)?),
            },
            other => {
                return Err(BalerError::InvalidFormat(format!(
                    "unknown record tag 0x{other:02x}"
                )))
            }
        };
        Ok(Some(record))
    }
}

pub fn write_header<W: Write>(w: &mut W, created: i64) -> Result<()> {
    w.write_all(MAGIC)?;
    w.write_all(&FORMAT_VERSION.to_le_bytes())?;
    w.write_all(&created.to_le_bytes())?;
    Ok(())
}

/// Validate the header and return its creation time.
pub fn read_header<R: Read>(r: &mut R) -> Result<i64> {
    let magic: [u8; 4] = read_array(r)?;
    if &magic != MAGIC {
        return Err(BalerError::InvalidFormat("not a baler archive".into()));
    }
    let version = u16::from_le_bytes(read_array(r)?);
    if version != FORMAT_VERSION {
        return Err(BalerError::InvalidFormat(format!(
            "unsupported archive version {version}"
        )));
    }
    Ok(i64::from_le_bytes(read_array(r)?))
}

fn truncated(e: std::io::Error) -> BalerError {
    if e.kind() == ErrorKind::UnexpectedEof {
        BalerError::InvalidFormat("truncated archive record".into())
    } else {
        BalerError::Io(e)
    }
}

fn read_array<const N: usize, R: Read>(r: &mut R) -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    r.read_exact(&mut buf).map_err(truncated)?;
    Ok(buf)
}

fn length_prefix(len: usize, max: u32, what: &str) -> Result<[u8; 4]> {
    match u32::try_from(len) {
        Ok(len) if len <= max => Ok(len.to_le_bytes()),
        _ => Err(BalerError::InvalidFormat(format!(
            "{what} length {len} exceeds limit {max}"
        ))),
    }
}

fn read_path<R: Read>(r: &mut R) -> Result<String> {
    let len = u32::from_le_bytes(read_array(r)?);
    if len == 0 || len > MAX_PATH_LEN {
        return Err(BalerError::InvalidFormat(format!("invalid path length {len}")));
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf).map_err(truncated)?;
    String::from_utf8(buf).map_err(|_| BalerError::InvalidFormat("path is not UTF-8".into()))
}

/// Join an archive path under `dest`, rejecting anything that could escape it.
pub fn safe_join(dest: &Path, archive_path: &str) -> Result<PathBuf> {
    if archive_path.contains('\\') {
        return Err(BalerError::InvalidFormat(format!(
            "unsafe archive path '{archive_path}'"
        )));
    }
    let mut out = dest.to_path_buf();
    for component in Path::new(archive_path).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => {
                return Err(BalerError::InvalidFormat(format!(
                    "unsafe archive path '{archive_path}'"
                )))
            }
        }
    }
    if out == dest {
        return Err(BalerError::InvalidFormat("empty archive path".into()));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoded_len_matches_encoding() {
        let records = [
            Record::Dir {
                path: "site".into(),
                mtime: 7,
                mode: 0o755,
            },
            Record::File {
                path: "site/a.txt".into(),
                size: 3,
                mtime: -1,
                mode: 0o644,
            },
            Record::Glob {
                digest: glob_digest(b"abc"),
                data: b"abc".to_vec(),
            },
            Record::End {
                dirs: 1,
                files: 1,
                bytes: 3,
            },
        ];
        let mut stream = Vec::new();
        for r in &records {
            let bytes = r.encode().unwrap();
            assert_eq!(bytes.len() as u64, r.encoded_len());
            stream.extend_from_slice(&bytes);
        }
        let mut cursor = std::io::Cursor::new(stream);
        for r in &records {
            assert_eq!(Record::read_from(&mut cursor).unwrap().as_ref(), Some(r));
        }
        assert_eq!(Record::read_from(&mut cursor).unwrap(), None);
    }

    #[test]
    fn truncated_and_unknown_records_are_invalid() {
        let mut bytes = Record::Dir {
            path: "x".into(),
            mtime: 0,
            mode: 0,
        }
        .encode()
        .unwrap();
        bytes.truncate(bytes.len() - 2);
        assert!(matches!(
            Record::read_from(&mut bytes.as_slice()),
            Err(BalerError::InvalidFormat(_))
        ));
        assert!(matches!(
            Record::read_from(&mut &b"Z"[..]),
            Err(BalerError::InvalidFormat(_))
        ));
    }

    #[test]
    fn oversized_lengths_are_refused_on_encode() {
        assert!(length_prefix(MAX_GLOB_LEN as usize, MAX_GLOB_LEN, "glob").is_ok());
        assert!(matches!(
            length_prefix(MAX_GLOB_LEN as usize + 1, MAX_GLOB_LEN, "glob"),
            Err(BalerError::InvalidFormat(_))
        ));
        let long_path = Record::File {
            path: "a".repeat(MAX_PATH_LEN as usize + 1),
            size: 0,
            mtime: 0,
            mode: 0,
        };
        assert!(long_path.encode().is_err());
    }

    #[test]
    fn header_is_checked() {
        let mut buf = Vec::new();
        write_header(&mut buf, 1_700_000_000).unwrap();
        assert_eq!(buf.len() as u64, HEADER_LEN);
        assert_eq!(read_header(&mut buf.as_slice()).unwrap(), 1_700_000_000);
        buf[0] = b'X';
        assert!(read_header(&mut buf.as_slice()).is_err());
    }

    #[test]
    fn safe_join_rejects_escapes() {
        let dest = Path::new("/restore");
        assert_eq!(
            safe_join(dest, "site/a.txt").unwrap(),
            PathBuf::from("/restore/site/a.txt")
        );
        assert!(safe_join(dest, "../etc/passwd").is_err());
        assert!(safe_join(dest, "/etc/passwd").is_err());
        assert!(safe_join(dest, "a\\b").is_err());
        assert!(safe_join(dest, ".").is_err());
    }
}
