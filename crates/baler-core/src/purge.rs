use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDateTime, Utc};
use tracing::{debug, info, warn};

use baler_storage::StorageBackend;
use baler_types::PackageId;

use crate::error::Result;

/// Outcome of one retention pass over a storage target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub kept: Vec<String>,
    pub deleted: Vec<String>,
    /// `(object, error)` for every delete that failed.
    pub failed: Vec<(String, String)>,
}

/// Creation time encoded in a package name (`<label>_<YYYYmmddHHMMSS>_<hex>`).
pub fn package_created(name: &str) -> Option<DateTime<Utc>> {
    PackageId::from_package_name(name)?;
    let mut parts = name.rsplitn(3, '_');
    parts.next()?;
    let stamp = parts.next()?;
    parts.next()?;
    NaiveDateTime::parse_from_str(stamp, "%Y%m%d%H%M%S")
        .ok()
        .map(|t| t.and_utc())
}

/// Package names on `storage`, newest first, with their objects.
pub fn list_remote_packages(
    storage: &dyn StorageBackend,
) -> Result<Vec<(String, DateTime<Utc>, Vec<String>)>> {
    let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for object in storage.list("")? {
        let Some((package, _)) = object.split_once('/') else {
            continue;
        };
        groups
            .entry(package.to_string())
            .or_default()
            .push(object.clone());
    }

    let mut packages = Vec::new();
    for (name, objects) in groups {
        match package_created(&name) {
            Some(created) => packages.push((name, created, objects)),
            None => debug!(storage = storage.id(), name, "ignoring foreign object group"),
        }
    }
    packages.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0.cmp(&a.0)));
    Ok(packages)
}

/// Delete packages on `storage` beyond the newest `max_kept`.
///
/// Packages named in `keep` always survive and count toward the limit.
/// `max_kept <= 0` means unlimited. Failed deletes are collected in the
/// report; the pass continues with the remaining objects.
pub fn purge_old_backups(
    storage: &dyn StorageBackend,
    keep: &[String],
    max_kept: i64,
) -> Result<PurgeReport> {
    let mut report = PurgeReport::default();
    if max_kept <= 0 {
        debug!(storage = storage.id(), "retention unlimited, nothing to purge");
        return Ok(report);
    }
    let max_kept = max_kept as usize;

    let packages = list_remote_packages(storage)?;
    let mut kept = 0usize;
    for (name, _, _) in &packages {
        if keep.contains(name) {
            kept += 1;
            report.kept.push(name.clone());
        }
    }

    for (name, _, objects) in packages {
        if keep.contains(&name) {
            continue;
        }
        if kept < max_kept {
            kept += 1;
            report.kept.push(name);
            continue;
        }

        let mut clean = true;
        for object in objects {
            if let Err(e) = storage.delete(&object) {
                warn!(storage = storage.id(), object, error = %e, "purge delete failed");
                report.failed.push((object, e.to_string()));
                clean = false;
            }
        }
        if clean {
            info!(storage = storage.id(), package = %name, "purged old package");
            report.deleted.push(name);
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creation_time_is_parsed_from_the_name() {
        let created = package_created("site_20240102030405_0011223344556677").unwrap();
        assert_eq!(created.to_rfc3339(), "2024-01-02T03:04:05+00:00");
        assert_eq!(
            package_created("my-site_20240102030405_0011223344556677"),
            Some(created)
        );
        assert!(package_created("site_2024_0011223344556677").is_none());
        assert!(package_created("site_20240102030405_zz").is_none());
        assert!(package_created(".uploads").is_none());
    }
}
