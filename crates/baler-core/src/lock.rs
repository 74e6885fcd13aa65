use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use blake2::{Blake2s256, Digest};
use chrono::{Duration, Utc};
use fs4::FileExt;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{BalerError, Result};

const DEFAULT_STALE_LOCK_SECS: i64 = 6 * 60 * 60; // 6 hours

static FILE_LOCK_RELIABLE: OnceLock<bool> = OnceLock::new();

/// Table holding named locks inside a SQLite database.
pub const LOCK_TABLE: &str = "baler_locks";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Probe the filesystem once and pick `File` or `Named`.
    Auto,
    File,
    Named,
}

impl From<crate::config::LockModeConfig> for LockMode {
    fn from(mode: crate::config::LockModeConfig) -> Self {
        match mode {
            crate::config::LockModeConfig::Auto => LockMode::Auto,
            crate::config::LockModeConfig::File => LockMode::File,
            crate::config::LockModeConfig::Named => LockMode::Named,
        }
    }
}

/// A lock identified by name, held outside the filesystem's advisory locks
/// (a database named lock, a create-new marker, ...).
pub trait NamedLockProvider: Send + Sync {
    /// Take the lock without waiting. `Ok(false)` when someone else holds it.
    fn try_acquire(&self, name: &str) -> Result<bool>;

    fn release(&self, name: &str) -> Result<()>;

    /// Drop the lock regardless of its holder. Returns whether one existed.
    fn force_release(&self, name: &str) -> Result<bool>;

    fn describe(&self) -> String;
}

/// Lock holder recorded inside a marker file.
#[derive(Debug, Serialize, Deserialize)]
struct LockEntry {
    hostname: String,
    pid: u32,
    time: String,
}

/// Named locks as `create_new` marker files. Works where `flock` is a no-op
/// (some network filesystems) because exclusive creation still is atomic.
pub struct MarkerLockProvider {
    dir: PathBuf,
    stale_after: Duration,
}

impl MarkerLockProvider {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            stale_after: Duration::seconds(DEFAULT_STALE_LOCK_SECS),
        }
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    fn marker_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.named"))
    }

    /// Remove a marker older than the stale threshold. A holder killed
    /// without cleanup would otherwise block every later invocation.
    fn remove_if_stale(&self, path: &Path) -> Result<()> {
        let Ok(data) = fs::read(path) else {
            return Ok(());
        };
        let Ok(entry) = serde_json::from_slice::<LockEntry>(&data) else {
            return Ok(());
        };
        let Ok(time) = chrono::DateTime::parse_from_rfc3339(&entry.time) else {
            return Ok(());
        };
        if Utc::now().signed_duration_since(time) > self.stale_after {
            warn!(
                lock = %path.display(),
                hostname = %entry.hostname,
                pid = entry.pid,
                "removing stale named lock"
            );
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

impl NamedLockProvider for MarkerLockProvider {
    fn try_acquire(&self, name: &str) -> Result<bool> {
        fs::create_dir_all(&self.dir)?;
        let path = self.marker_path(name);
        self.remove_if_stale(&path)?;

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        let entry = LockEntry {
            hostname: crate::platform::hostname(),
            pid: std::process::id(),
            time: Utc::now().to_rfc3339(),
        };
        serde_json::to_writer(&mut file, &entry)?;
        file.sync_all()?;
        Ok(true)
    }

    fn release(&self, name: &str) -> Result<()> {
        self.force_release(name).map(|_| ())
    }

    fn force_release(&self, name: &str) -> Result<bool> {
        match fs::remove_file(self.marker_path(name)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn describe(&self) -> String {
        format!("marker locks in {}", self.dir.display())
    }
}

fn lock_db_err(e: rusqlite::Error) -> BalerError {
    BalerError::Other(format!("sqlite lock: {e}"))
}

/// Named locks as rows of a SQLite database, claimed inside an immediate
/// transaction so SQLite itself serializes competing claims. The connection
/// and table are created on first use.
pub struct SqliteLockProvider {
    path: PathBuf,
    token: String,
    stale_after: Duration,
    conn: Mutex<Option<Connection>>,
}

impl SqliteLockProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            token: format!("{:016x}", rand::random::<u64>()),
            stale_after: Duration::seconds(DEFAULT_STALE_LOCK_SECS),
            conn: Mutex::new(None),
        }
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let mut slot = self
            .conn
            .lock()
            .map_err(|_| BalerError::Other("sqlite lock connection poisoned".into()))?;
        let conn = match slot.take() {
            Some(conn) => conn,
            None => open_lock_db(&self.path).map_err(lock_db_err)?,
        };
        f(slot.insert(conn)).map_err(lock_db_err)
    }
}

fn open_lock_db(path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {LOCK_TABLE} (
            name TEXT PRIMARY KEY,
            token TEXT NOT NULL,
            hostname TEXT NOT NULL,
            pid INTEGER NOT NULL,
            acquired_at INTEGER NOT NULL
        )"
    ))?;
    Ok(conn)
}

impl NamedLockProvider for SqliteLockProvider {
    fn try_acquire(&self, name: &str) -> Result<bool> {
        let now = Utc::now().timestamp();
        let stale_secs = self.stale_after.num_seconds();
        self.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let holder: Option<(String, i64, i64)> = tx
                .query_row(
                    &format!("SELECT hostname, pid, acquired_at FROM {LOCK_TABLE} WHERE name = ?1"),
                    [name],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;
            if let Some((hostname, pid, acquired_at)) = holder {
                if now - acquired_at <= stale_secs {
                    return Ok(false);
                }
                warn!(lock = name, %hostname, pid, "taking over stale named lock");
            }
            tx.execute(
                &format!(
                    "INSERT OR REPLACE INTO {LOCK_TABLE} (name, token, hostname, pid, acquired_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5)"
                ),
                rusqlite::params![
                    name,
                    self.token,
                    crate::platform::hostname(),
                    std::process::id(),
                    now
                ],
            )?;
            tx.commit()?;
            Ok(true)
        })
    }

    /// Only drops the row while this provider still holds it.
    fn release(&self, name: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                &format!("DELETE FROM {LOCK_TABLE} WHERE name = ?1 AND token = ?2"),
                [name, self.token.as_str()],
            )
        })
        .map(|_| ())
    }

    fn force_release(&self, name: &str) -> Result<bool> {
        let removed = self.with_conn(|conn| {
            conn.execute(&format!("DELETE FROM {LOCK_TABLE} WHERE name = ?1"), [name])
        })?;
        Ok(removed > 0)
    }

    fn describe(&self) -> String {
        format!("sqlite locks in {}", self.path.display())
    }
}

#[derive(Debug)]
enum GuardKind {
    /// The open, exclusively locked file. Closing it releases the lock.
    File(#[allow(dead_code)] File),
    Named,
}

/// An acquired build lock. Released on drop.
pub struct LockGuard {
    kind: GuardKind,
    name: String,
    provider: Option<Arc<dyn NamedLockProvider>>,
}

impl LockGuard {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> LockMode {
        match self.kind {
            GuardKind::File(_) => LockMode::File,
            GuardKind::Named => LockMode::Named,
        }
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("name", &self.name)
            .field("mode", &self.mode())
            .finish()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let (GuardKind::Named, Some(provider)) = (&self.kind, &self.provider) {
            if let Err(e) = provider.release(&self.name) {
                warn!(lock = %self.name, error = %e, "failed to release named lock");
            }
        }
    }
}

/// Cross-invocation mutual exclusion for one installation's builds.
pub struct BuildLock {
    dir: PathBuf,
    name: String,
    mode: LockMode,
    named: Option<Arc<dyn NamedLockProvider>>,
}

impl BuildLock {
    pub fn new(backup_dir: &Path, installation_id: &str, mode: LockMode) -> Self {
        Self {
            dir: backup_dir.to_path_buf(),
            name: lock_name(installation_id),
            mode,
            named: None,
        }
    }

    pub fn with_named_provider(mut self, provider: Arc<dyn NamedLockProvider>) -> Self {
        self.named = Some(provider);
        self
    }

    /// `<backup_dir>/lock_<hash>.lck`. The file is never deleted.
    pub fn file_path(&self) -> PathBuf {
        self.dir.join(format!("{}.lck", self.name))
    }

    /// Mode actually used, resolving `Auto` through the cached probe.
    pub fn effective_mode(&self) -> Result<LockMode> {
        match self.mode {
            LockMode::Auto => {
                if file_lock_reliable(&self.dir)? {
                    Ok(LockMode::File)
                } else if self.named.is_some() {
                    Ok(LockMode::Named)
                } else {
                    warn!(
                        dir = %self.dir.display(),
                        "file locks look unreliable and no named lock is configured; using file lock"
                    );
                    Ok(LockMode::File)
                }
            }
            mode => Ok(mode),
        }
    }

    /// Take the lock without waiting; [`BalerError::Locked`] when held elsewhere.
    pub fn try_acquire(&self) -> Result<LockGuard> {
        match self.effective_mode()? {
            LockMode::Named => self.acquire_named(),
            _ => self.acquire_file(),
        }
    }

    fn acquire_file(&self) -> Result<LockGuard> {
        fs::create_dir_all(&self.dir)?;
        let path = self.file_path();
        let file = open_lock_file(&path)?;
        match file.try_lock_exclusive() {
            Ok(()) => {
                debug!(lock = %path.display(), "build lock acquired");
                Ok(LockGuard {
                    kind: GuardKind::File(file),
                    name: self.name.clone(),
                    provider: None,
                })
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                Err(BalerError::Locked(path.display().to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn acquire_named(&self) -> Result<LockGuard> {
        let provider = self
            .named
            .clone()
            .ok_or_else(|| BalerError::Config("named lock mode without a provider".into()))?;
        if !provider.try_acquire(&self.name)? {
            return Err(BalerError::Locked(format!(
                "{} ({})",
                self.name,
                provider.describe()
            )));
        }
        debug!(lock = %self.name, provider = %provider.describe(), "named build lock acquired");
        Ok(LockGuard {
            kind: GuardKind::Named,
            name: self.name.clone(),
            provider: Some(provider),
        })
    }

    /// Force-release a named lock left by a dead invocation.
    ///
    /// File locks are released by the OS when their holder exits, so there
    /// is nothing to break in file mode.
    pub fn break_lock(&self) -> Result<bool> {
        match self.effective_mode()? {
            LockMode::Named => {
                let provider = self.named.as_ref().ok_or_else(|| {
                    BalerError::Config("named lock mode without a provider".into())
                })?;
                let removed = provider.force_release(&self.name)?;
                if removed {
                    info!(lock = %self.name, "named build lock released");
                }
                Ok(removed)
            }
            _ => Err(BalerError::UnsupportedBackend(
                "file locks are released by the OS when their holder exits".into(),
            )),
        }
    }
}

/// `lock_<first 16 hex chars of blake2s(installation_id)>`.
pub fn lock_name(installation_id: &str) -> String {
    let digest = Blake2s256::digest(installation_id.as_bytes());
    let hex = hex::encode(digest);
    format!("lock_{}", &hex[..16])
}

fn open_lock_file(path: &Path) -> Result<File> {
    Ok(OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)?)
}

/// Whether exclusive advisory locks on files in `dir` actually exclude.
///
/// Two independent opens of the same probe file must not both obtain an
/// exclusive lock. The first answer is cached for the life of the process.
pub fn file_lock_reliable(dir: &Path) -> Result<bool> {
    if let Some(reliable) = FILE_LOCK_RELIABLE.get() {
        return Ok(*reliable);
    }
    let reliable = probe_file_lock(dir)?;
    Ok(*FILE_LOCK_RELIABLE.get_or_init(|| reliable))
}

/// Uncached probe behind [`file_lock_reliable`].
pub fn probe_file_lock(dir: &Path) -> Result<bool> {
    fs::create_dir_all(dir)?;
    let path = dir.join(format!(".lock-probe-{}", std::process::id()));
    let first = open_lock_file(&path)?;
    let second = open_lock_file(&path)?;

    let reliable = match first.try_lock_exclusive() {
        Ok(()) => match second.try_lock_exclusive() {
            Ok(()) => false,
            Err(e) if e.kind() == ErrorKind::WouldBlock => true,
            Err(e) => {
                debug!(error = %e, "lock probe: second lock failed unexpectedly");
                true
            }
        },
        Err(e) => {
            debug!(error = %e, "lock probe: file locks unavailable");
            false
        }
    };
    drop(second);
    drop(first);
    let _ = fs::remove_file(&path);

    if reliable {
        debug!(dir = %dir.display(), "file locks are reliable");
    } else {
        warn!(dir = %dir.display(), "file locks do not exclude; prefer named locks");
    }
    Ok(reliable)
}
