use std::env::VarError;
use std::fmt;
use std::path::{Path, PathBuf};

use baler_storage::paths::{config_dir, expand_tilde};

use super::types::BalerConfig;
use crate::error::{BalerError, Result};

/// Expand `${VAR}` and `${VAR:-default}` placeholders in raw config text.
fn expand_env_placeholders(input: &str, path: &Path) -> Result<String> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(open) = rest.find("${") {
        out.push_str(&rest[..open]);
        let at = input.len() - rest.len() + open;
        let body = &rest[open + 2..];
        let close = body
            .find('}')
            .ok_or_else(|| placeholder_error(path, input, at, "unterminated environment placeholder"))?;
        let value = lookup_placeholder(&body[..close]).map_err(|msg| placeholder_error(path, input, at, msg))?;
        out.push_str(&value);
        rest = &body[close + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Value of one placeholder body, or why it cannot be resolved.
fn lookup_placeholder(token: &str) -> std::result::Result<String, String> {
    let (name, default) = match token.split_once(":-") {
        Some((name, default)) => (name, Some(default)),
        None => (token, None),
    };
    let valid_name = !name.is_empty()
        && name.char_indices().all(|(i, c)| {
            c == '_' || if i == 0 { c.is_ascii_alphabetic() } else { c.is_ascii_alphanumeric() }
        });
    if !valid_name {
        return Err(format!("invalid environment placeholder '{token}'"));
    }

    match (std::env::var(name), default) {
        (Ok(value), Some(default)) if value.is_empty() => Ok(default.to_string()),
        (Ok(value), _) => Ok(value),
        (Err(VarError::NotPresent), Some(default)) => Ok(default.to_string()),
        (Err(VarError::NotPresent), None) => Err(format!("environment variable '{name}' is not set")),
        (Err(VarError::NotUnicode(_)), _) => {
            Err(format!("environment variable '{name}' is not valid UTF-8"))
        }
    }
}

fn placeholder_error(path: &Path, input: &str, at: usize, message: impl fmt::Display) -> BalerError {
    let before = &input[..at];
    let line = before.matches('\n').count() + 1;
    let column = before.rsplit('\n').next().map_or(0, |l| l.chars().count()) + 1;
    BalerError::Config(format!(
        "invalid config '{}': {message} at line {line}, column {column}",
        path.display()
    ))
}

/// Parse config text, expanding placeholders and `~`, then validate it.
pub fn parse_config(contents: &str, path: &Path) -> Result<BalerConfig> {
    let expanded = expand_env_placeholders(contents, path)?;
    let mut config: BalerConfig = serde_yaml::from_str(&expanded)
        .map_err(|e| BalerError::Config(format!("invalid config '{}': {e}", path.display())))?;

    config.backup_dir = expand_tilde(&config.backup_dir);
    for source in &mut config.sources {
        *source = expand_tilde(source);
    }
    for storage in &mut config.storages {
        storage.path = expand_tilde(&storage.path);
    }
    if let Some(db) = config.database.sqlite.as_mut() {
        *db = expand_tilde(db);
    }

    config.validate()?;
    Ok(config)
}

/// Load, expand and validate a config file.
pub fn load_config(path: &Path) -> Result<BalerConfig> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| BalerError::Config(format!("cannot read '{}': {e}", path.display())))?;
    parse_config(&contents, path)
}

/// Tracks where the config file was found.
#[derive(Debug, Clone)]
pub enum ConfigSource {
    /// Explicitly passed via `--config`.
    CliArg(PathBuf),
    /// Set via the `BALER_CONFIG` env var.
    EnvVar(PathBuf),
    /// Found by searching standard locations.
    SearchOrder { path: PathBuf, level: &'static str },
}

impl ConfigSource {
    pub fn path(&self) -> &Path {
        match self {
            ConfigSource::CliArg(p) => p,
            ConfigSource::EnvVar(p) => p,
            ConfigSource::SearchOrder { path, .. } => path,
        }
    }
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigSource::CliArg(p) => write!(f, "{} (--config)", p.display()),
            ConfigSource::EnvVar(p) => write!(f, "{} (BALER_CONFIG)", p.display()),
            ConfigSource::SearchOrder { path, level } => {
                write!(f, "{} ({})", path.display(), level)
            }
        }
    }
}

/// Returns search locations in priority order: project, then user.
pub fn default_config_search_paths() -> Vec<(PathBuf, &'static str)> {
    let mut paths = vec![(PathBuf::from("baler.yaml"), "project")];
    if let Some(base) = config_dir().filter(|p| p.is_absolute()) {
        paths.push((base.join("baler").join("config.yaml"), "user"));
    }
    paths
}

/// Resolve which config file to use.
///
/// Priority: CLI arg > `BALER_CONFIG` env var > first existing file from search paths.
pub fn resolve_config_path(cli_config: Option<&str>) -> Option<ConfigSource> {
    if let Some(path) = cli_config {
        return Some(ConfigSource::CliArg(PathBuf::from(path)));
    }

    if let Ok(val) = std::env::var("BALER_CONFIG") {
        if !val.is_empty() {
            return Some(ConfigSource::EnvVar(PathBuf::from(val)));
        }
    }

    default_config_search_paths()
        .into_iter()
        .find(|(path, _)| path.exists())
        .map(|(path, level)| ConfigSource::SearchOrder { path, level })
}

/// Returns a minimal YAML config template suitable for bootstrapping.
pub fn minimal_config_template() -> &'static str {
    r#"# baler configuration file

backup_dir: /var/backups/baler

sources:
  - /srv/www

# --- Common optional settings (uncomment as needed) ---

# exclude_patterns:
#   - "*.tmp"
#   - "cache/**"
#
# database:
#   sqlite: /srv/www/data/site.db
#
# chunk:
#   time_budget: "25s"
#
# storages:
#   - id: nas
#     kind: local
#     path: /mnt/nas/baler
#     max_kept: 5
#
# build:
#   upload_to: [nas]
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::Mutex;

    // Tests that mutate process-global state (env vars, CWD) must be serialized.
    static GLOBAL_STATE: Mutex<()> = Mutex::new(());

    /// RAII guard to set an env var and restore its previous value on drop.
    struct EnvGuard {
        key: &'static str,
        prev: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &'static str, val: &str) -> Self {
            let prev = std::env::var(key).ok();
            std::env::set_var(key, val);
            Self { key, prev }
        }

        fn unset(key: &'static str) -> Self {
            let prev = std::env::var(key).ok();
            std::env::remove_var(key);
            Self { key, prev }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            match &self.prev {
                Some(v) => std::env::set_var(self.key, v),
                None => std::env::remove_var(self.key),
            }
        }
    }

    fn parse(yaml: &str) -> Result<BalerConfig> {
        parse_config(yaml, Path::new("test.yaml"))
    }

    #[test]
    fn test_search_paths_order() {
        let paths = default_config_search_paths();
        assert_eq!(paths[0].1, "project");
        if paths.len() == 2 {
            assert_eq!(paths[1].1, "user");
        }
    }

    #[test]
    fn test_resolve_cli_arg_wins() {
        let source = resolve_config_path(Some("/tmp/override.yaml")).unwrap();
        assert!(matches!(source, ConfigSource::CliArg(_)));
        assert_eq!(source.path(), Path::new("/tmp/override.yaml"));
    }

    #[test]
    fn test_resolve_env_var() {
        let _lock = GLOBAL_STATE.lock().unwrap();
        let _guard = EnvGuard::set("BALER_CONFIG", "/tmp/env-config.yaml");
        let source = resolve_config_path(None).unwrap();
        assert!(matches!(source, ConfigSource::EnvVar(_)));
        assert_eq!(source.path(), Path::new("/tmp/env-config.yaml"));
    }

    #[test]
    fn test_resolve_search_finds_project() {
        let _lock = GLOBAL_STATE.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("baler.yaml"), "backup_dir: /tmp/b\n").unwrap();

        let original = std::env::current_dir().unwrap();
        std::env::set_current_dir(dir.path()).unwrap();
        let _env_guard = EnvGuard::set("BALER_CONFIG", "");

        let result = resolve_config_path(None);
        std::env::set_current_dir(original).unwrap();

        assert!(matches!(
            result.unwrap(),
            ConfigSource::SearchOrder {
                level: "project",
                ..
            }
        ));
    }

    #[test]
    fn test_minimal_template_is_valid() {
        let cfg = parse(minimal_config_template()).unwrap();
        assert_eq!(cfg.backup_dir, "/var/backups/baler");
        assert_eq!(cfg.sources, vec!["/srv/www"]);
        assert_eq!(cfg.label, "backup");
        assert_eq!(
            cfg.chunk.time_budget().unwrap(),
            Some(std::time::Duration::from_secs(25))
        );
    }

    #[test]
    fn test_load_config_missing_file() {
        assert!(matches!(
            load_config(Path::new("/nonexistent/path/config.yaml")),
            Err(BalerError::Config(_))
        ));
    }

    #[test]
    fn test_full_config_parses() {
        let cfg = parse(
            r#"
installation_id: site-a
backup_dir: /tmp/backups
label: nightly
sources: [/srv/a, /srv/b]
exclude_patterns: ["*.log"]
filters:
  dirs: [/srv/a/cache]
  exts: [tmp]
  max_unreadable: 5
archive:
  glob_size: 64KiB
installer:
  segment_size: 1048576
chunk:
  time_budget: null
  max_iterations: 50
  throttle: 10ms
lock:
  mode: file
storages:
  - id: nas
    kind: local
    path: /tmp/nas
    max_kept: 3
build:
  upload_to: [nas]
  max_retries: 1
"#,
        )
        .unwrap();
        assert_eq!(cfg.installation_id(), "site-a");
        assert_eq!(cfg.archive.glob_size_bytes().unwrap(), 64 * 1024);
        assert_eq!(cfg.installer.segment_size_bytes().unwrap(), 1 << 20);
        let limits = cfg.chunk.limits().unwrap();
        assert_eq!(limits.time_budget, None);
        assert_eq!(limits.max_iterations, 50);
        assert_eq!(limits.throttle, Some(std::time::Duration::from_millis(10)));
        assert_eq!(cfg.lock.mode, super::super::LockModeConfig::File);
        assert_eq!(cfg.storages[0].max_kept, 3);
        assert_eq!(cfg.filters.max_unreadable, 5);
    }

    #[test]
    fn test_rejects_unknown_fields_and_bad_refs() {
        assert!(parse("backup_dir: /b\nsources: [/s]\nbogus: 1\n").is_err());
        assert!(parse("backup_dir: /b\nsources: []\n").is_err());
        assert!(parse("backup_dir: /b\nsources: [/s]\nbuild:\n  upload_to: [nope]\n").is_err());
        assert!(parse("backup_dir: /b\nsources: [/x/www, /y/www]\n").is_err());
        assert!(parse("backup_dir: /b\nsources: [/s]\narchive:\n  glob_size: 0\n").is_err());
    }

    #[test]
    fn test_glob_size_is_bounded_by_the_archive_reader() {
        let cfg = parse("backup_dir: /b\nsources: [/s]\narchive:\n  glob_size: 256MiB\n").unwrap();
        assert_eq!(
            cfg.archive.glob_size_bytes().unwrap(),
            u64::from(crate::archive::MAX_GLOB_LEN)
        );
        let err = parse("backup_dir: /b\nsources: [/s]\narchive:\n  glob_size: 300MiB\n")
            .unwrap_err()
            .to_string();
        assert!(err.contains("archive.glob_size must be at most"), "{err}");
    }

    #[test]
    fn test_env_expand_default_and_missing() {
        let _lock = GLOBAL_STATE.lock().unwrap();
        let _unset = EnvGuard::unset("BALER_TEST_BACKUP_DIR");
        let cfg =
            parse("backup_dir: ${BALER_TEST_BACKUP_DIR:-/tmp/default}\nsources: [/s]\n").unwrap();
        assert_eq!(cfg.backup_dir, "/tmp/default");

        let err = parse("backup_dir: ${BALER_TEST_BACKUP_DIR}\nsources: [/s]\n").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("BALER_TEST_BACKUP_DIR"), "{msg}");
        assert!(msg.contains("line 1"), "{msg}");

        let _set = EnvGuard::set("BALER_TEST_BACKUP_DIR", "/tmp/from-env");
        let cfg = parse("backup_dir: ${BALER_TEST_BACKUP_DIR}\nsources: [/s]\n").unwrap();
        assert_eq!(cfg.backup_dir, "/tmp/from-env");
    }

    #[test]
    fn test_env_expand_rejects_bad_tokens() {
        assert!(parse("backup_dir: ${}\nsources: [/s]\n").is_err());
        assert!(parse("backup_dir: ${1BAD}\nsources: [/s]\n").is_err());
        assert!(parse("backup_dir: ${OPEN\nsources: [/s]\n").is_err());
    }
}
