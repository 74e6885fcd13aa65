use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

/// An 8-byte package identifier (random).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PackageId(pub [u8; 8]);

impl PackageId {
    /// Generate a random package ID.
    pub fn generate() -> Self {
        let mut buf = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut buf);
        PackageId(buf)
    }

    /// Hex-encode the full package ID.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a PackageId from a 16-character hex string.
    pub fn from_hex(hex_str: &str) -> std::result::Result<Self, String> {
        let bytes = hex::decode(hex_str).map_err(|e| format!("invalid hex: {e}"))?;
        if bytes.len() != 8 {
            return Err(format!("expected 8 bytes, got {}", bytes.len()));
        }
        let mut arr = [0u8; 8];
        arr.copy_from_slice(&bytes);
        Ok(PackageId(arr))
    }

    /// Directory / object name of a package: `<name>_<YYYYmmddHHMMSS>_<hex>`.
    ///
    /// The timestamp sorts lexicographically so newer packages list last.
    pub fn package_name(&self, label: &str, created: DateTime<Utc>) -> String {
        format!("{label}_{}_{}", created.format("%Y%m%d%H%M%S"), self.to_hex())
    }

    /// Extract the hex id suffix from a package name built by [`Self::package_name`].
    pub fn from_package_name(name: &str) -> Option<Self> {
        let (_, hex_part) = name.rsplit_once('_')?;
        Self::from_hex(hex_part).ok()
    }
}

impl fmt::Debug for PackageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PackageId({})", self.to_hex())
    }
}

impl fmt::Display for PackageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}
