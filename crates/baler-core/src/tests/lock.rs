use std::sync::Arc;

use chrono::{Duration, Utc};

use crate::build::NAMED_LOCK_DIR;
use crate::config::LockModeConfig;
use crate::database::{DatabaseSource, SqliteSource};
use crate::error::BalerError;
use crate::lock::{
    lock_name, probe_file_lock, BuildLock, LockMode, MarkerLockProvider, NamedLockProvider,
    SqliteLockProvider, LOCK_TABLE,
};
use crate::scan::InstanceFilters;
use crate::testutil::{make_tree, test_config};
use crate::Engine;

#[test]
fn lock_name_is_stable_and_short() {
    let a = lock_name("site-a");
    assert_eq!(a, lock_name("site-a"));
    assert_ne!(a, lock_name("site-b"));
    assert!(a.starts_with("lock_"));
    assert_eq!(a.len(), "lock_".len() + 16);
}

#[test]
fn local_filesystem_locks_are_reliable() {
    let dir = tempfile::tempdir().unwrap();
    assert!(probe_file_lock(dir.path()).unwrap());
}

#[test]
fn second_file_lock_is_rejected_until_released() {
    let dir = tempfile::tempdir().unwrap();
    let lock = BuildLock::new(dir.path(), "site", LockMode::File);
    let guard = lock.try_acquire().unwrap();
    assert_eq!(guard.mode(), LockMode::File);
    assert!(lock.file_path().exists());

    let err = BuildLock::new(dir.path(), "site", LockMode::File)
        .try_acquire()
        .unwrap_err();
    assert!(matches!(err, BalerError::Locked(_)), "unexpected error: {err}");

    drop(guard);
    lock.try_acquire().unwrap();
    assert!(lock.file_path().exists(), "lock file is never deleted");
}

#[test]
fn installations_lock_independently() {
    let dir = tempfile::tempdir().unwrap();
    let _a = BuildLock::new(dir.path(), "a", LockMode::File)
        .try_acquire()
        .unwrap();
    let _b = BuildLock::new(dir.path(), "b", LockMode::File)
        .try_acquire()
        .unwrap();
}

#[test]
fn named_lock_excludes_and_releases_on_drop() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(MarkerLockProvider::new(dir.path().join("named")));
    let lock = BuildLock::new(dir.path(), "site", LockMode::Named).with_named_provider(provider.clone());

    let guard = lock.try_acquire().unwrap();
    assert_eq!(guard.mode(), LockMode::Named);
    assert!(matches!(lock.try_acquire(), Err(BalerError::Locked(_))));

    drop(guard);
    let again = lock.try_acquire().unwrap();
    drop(again);
    assert!(!provider.force_release(&lock_name("site")).unwrap());
}

#[test]
fn named_mode_without_provider_is_a_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let lock = BuildLock::new(dir.path(), "site", LockMode::Named);
    assert!(matches!(lock.try_acquire(), Err(BalerError::Config(_))));
}

#[test]
fn break_lock_frees_a_leaked_named_lock() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(MarkerLockProvider::new(dir.path().join("named")));
    let lock = BuildLock::new(dir.path(), "site", LockMode::Named).with_named_provider(provider);

    std::mem::forget(lock.try_acquire().unwrap());
    assert!(matches!(lock.try_acquire(), Err(BalerError::Locked(_))));

    assert!(lock.break_lock().unwrap());
    assert!(!lock.break_lock().unwrap());
    lock.try_acquire().unwrap();
}

#[test]
fn break_lock_is_refused_in_file_mode() {
    let dir = tempfile::tempdir().unwrap();
    let lock = BuildLock::new(dir.path(), "site", LockMode::File);
    assert!(matches!(
        lock.break_lock(),
        Err(BalerError::UnsupportedBackend(_))
    ));
}

#[test]
fn stale_marker_is_taken_over() {
    let dir = tempfile::tempdir().unwrap();
    let markers = dir.path().join("named");
    std::fs::create_dir_all(&markers).unwrap();
    let name = lock_name("site");
    let old = (Utc::now() - Duration::hours(7)).to_rfc3339();
    std::fs::write(
        markers.join(format!("{name}.named")),
        format!(r#"{{"hostname":"old","pid":1,"time":"{old}"}}"#),
    )
    .unwrap();

    let provider = MarkerLockProvider::new(&markers);
    assert!(provider.try_acquire(&name).unwrap());
    assert!(!provider.try_acquire(&name).unwrap());

    let short = MarkerLockProvider::new(&markers).with_stale_after(Duration::zero());
    std::thread::sleep(std::time::Duration::from_millis(5));
    assert!(short.try_acquire(&name).unwrap());
}

#[test]
fn sqlite_named_lock_excludes_a_second_holder() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("site.db");
    let first = SqliteLockProvider::new(&db);
    let second = SqliteLockProvider::new(&db);
    let name = lock_name("site");

    assert!(first.try_acquire(&name).unwrap());
    assert!(!second.try_acquire(&name).unwrap());
    assert!(!first.try_acquire(&name).unwrap());
    assert!(second.try_acquire(&lock_name("other")).unwrap());

    // Only the holder's release frees the row.
    second.release(&name).unwrap();
    assert!(!second.try_acquire(&name).unwrap());
    first.release(&name).unwrap();
    assert!(second.try_acquire(&name).unwrap());

    assert!(first.force_release(&name).unwrap());
    assert!(!first.force_release(&name).unwrap());
}

#[test]
fn stale_sqlite_lock_is_taken_over() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("site.db");
    let name = lock_name("site");
    let holder = SqliteLockProvider::new(&db);
    assert!(holder.try_acquire(&name).unwrap());

    let conn = rusqlite::Connection::open(&db).unwrap();
    let old = (Utc::now() - Duration::hours(7)).timestamp();
    conn.execute(
        &format!("UPDATE {LOCK_TABLE} SET acquired_at = ?1 WHERE name = ?2"),
        rusqlite::params![old, name],
    )
    .unwrap();

    let next = SqliteLockProvider::new(&db);
    assert!(next.try_acquire(&name).unwrap());
    // The previous holder can no longer drop the new claim.
    holder.release(&name).unwrap();
    assert!(!holder.try_acquire(&name).unwrap());
}

#[test]
fn configured_database_holds_the_named_build_lock() {
    let tmp = tempfile::tempdir().unwrap();
    let src = make_tree(tmp.path());
    let db = tmp.path().join("app.db");
    rusqlite::Connection::open(&db)
        .unwrap()
        .execute_batch("CREATE TABLE posts (id INTEGER PRIMARY KEY, title TEXT);")
        .unwrap();
    let named_engine = || {
        let mut config = test_config(&tmp.path().join("b"), &[&src]);
        config.lock.mode = LockModeConfig::Named;
        config.database.sqlite = Some(db.to_string_lossy().to_string());
        Engine::from_config(config).unwrap()
    };

    let engine = named_engine();
    let held = engine.build_lock().try_acquire().unwrap();
    assert_eq!(held.mode(), LockMode::Named);
    let err = named_engine()
        .start_build(InstanceFilters::default())
        .unwrap_err();
    assert!(matches!(&err, BalerError::Locked(msg) if msg.contains("sqlite")), "{err}");
    assert!(!tmp.path().join("b").join(NAMED_LOCK_DIR).exists());

    // The lock table never leaks into the export.
    assert_eq!(SqliteSource::open(&db).unwrap().tables().unwrap(), vec!["posts"]);
    drop(held);
    named_engine().start_build(InstanceFilters::default()).unwrap();
}
