use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::BalerConfig;

/// One kind of filter (directories, files or extensions) split by where each
/// value came from, plus what the scan could not handle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterScope {
    /// Always excluded by the engine itself (e.g. the backup directory).
    pub core: Vec<String>,
    /// From the configuration file.
    pub global: Vec<String>,
    /// Given for this one build.
    pub instance: Vec<String>,
    /// First unreadable paths met while scanning, capped.
    pub unreadable: Vec<String>,
    /// Paths whose names are not valid UTF-8, capped.
    pub unknown: Vec<String>,
    /// True number of unreadable paths, including those not retained.
    pub unreadable_count: u64,
}

impl FilterScope {
    /// All exclusion values regardless of provenance.
    pub fn excluded(&self) -> impl Iterator<Item = &str> {
        self.core
            .iter()
            .chain(&self.global)
            .chain(&self.instance)
            .map(String::as_str)
    }

    pub fn push_unreadable(&mut self, path: String, max: usize) {
        self.unreadable_count += 1;
        if self.unreadable.len() < max {
            self.unreadable.push(path);
        }
    }

    pub fn push_unknown(&mut self, path: String, max: usize) {
        if self.unknown.len() < max {
            self.unknown.push(path);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filters {
    pub dirs: FilterScope,
    pub files: FilterScope,
    pub exts: FilterScope,
    pub max_unreadable: usize,
}

impl Default for Filters {
    fn default() -> Self {
        Self {
            dirs: FilterScope::default(),
            files: FilterScope::default(),
            exts: FilterScope::default(),
            max_unreadable: 100,
        }
    }
}

/// Per-build exclusions layered over the configured ones.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceFilters {
    pub dirs: Vec<String>,
    pub files: Vec<String>,
    pub exts: Vec<String>,
}

impl Filters {
    pub fn from_config(config: &BalerConfig, instance: &InstanceFilters) -> Self {
        let mut filters = Filters {
            max_unreadable: config.filters.max_unreadable,
            ..Filters::default()
        };

        let backup_dir = config.backup_dir();
        filters
            .dirs
            .core
            .push(backup_dir.to_string_lossy().to_string());
        if let Ok(canonical) = std::fs::canonicalize(&backup_dir) {
            let canonical = canonical.to_string_lossy().to_string();
            if !filters.dirs.core.contains(&canonical) {
                filters.dirs.core.push(canonical);
            }
        }

        filters.dirs.global = config.filters.dirs.clone();
        filters.files.global = config.filters.files.clone();
        filters.exts.global = config.filters.exts.iter().map(|e| normalize_ext(e)).collect();
        filters.dirs.instance = instance.dirs.clone();
        filters.files.instance = instance.files.clone();
        filters.exts.instance = instance.exts.iter().map(|e| normalize_ext(e)).collect();
        filters
    }

    pub fn excludes_dir(&self, abs: &Path) -> bool {
        self.dirs.excluded().any(|d| abs.starts_with(d))
    }

    pub fn excludes_file(&self, abs: &Path) -> bool {
        if self.files.excluded().any(|f| abs == Path::new(f)) {
            return true;
        }
        let Some(ext) = abs.extension().and_then(|e| e.to_str()) else {
            return false;
        };
        let ext = ext.to_ascii_lowercase();
        self.exts.excluded().any(|e| e == ext)
    }

    pub fn record_unreadable(&mut self, path: &Path, is_dir: bool) {
        let max = self.max_unreadable;
        let scope = if is_dir { &mut self.dirs } else { &mut self.files };
        scope.push_unreadable(path.to_string_lossy().to_string(), max);
    }

    pub fn record_unknown(&mut self, path: &Path, is_dir: bool) {
        let max = self.max_unreadable;
        let scope = if is_dir { &mut self.dirs } else { &mut self.files };
        scope.push_unknown(path.to_string_lossy().to_string(), max);
    }

    pub fn unreadable_total(&self) -> u64 {
        self.dirs.unreadable_count + self.files.unreadable_count
    }
}

fn normalize_ext(ext: &str) -> String {
    ext.trim().trim_start_matches('.').to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unreadable_list_is_capped_but_counted() {
        let mut filters = Filters {
            max_unreadable: 2,
            ..Filters::default()
        };
        for i in 0..5 {
            filters.record_unreadable(Path::new(&format!("/data/f{i}")), false);
        }
        filters.record_unreadable(Path::new("/data/d"), true);
        assert_eq!(filters.files.unreadable, vec!["/data/f0", "/data/f1"]);
        assert_eq!(filters.files.unreadable_count, 5);
        assert_eq!(filters.unreadable_total(), 6);
    }

    #[test]
    fn excludes_by_dir_file_and_extension() {
        let mut config = BalerConfig::new("/backups", vec!["/srv".into()]);
        config.filters.dirs = vec!["/srv/cache".into()];
        config.filters.exts = vec![".LOG".into()];
        let instance = InstanceFilters {
            files: vec!["/srv/secret.txt".into()],
            ..InstanceFilters::default()
        };
        let filters = Filters::from_config(&config, &instance);

        assert!(filters.excludes_dir(Path::new("/backups")));
        assert!(filters.excludes_dir(Path::new("/srv/cache/a")));
        assert!(!filters.excludes_dir(Path::new("/srv/cached")));
        assert!(filters.excludes_file(Path::new("/srv/app.log")));
        assert!(filters.excludes_file(Path::new("/srv/secret.txt")));
        assert!(!filters.excludes_file(Path::new("/srv/app.txt")));
        assert_eq!(filters.exts.global, vec!["log"]);
        assert_eq!(filters.files.instance, vec!["/srv/secret.txt"]);
    }
}
