use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use baler_core::archive::ExpandOutcome;
use baler_core::chunking::ChunkLimits;
use baler_core::config::{load_config, BalerConfig};
use baler_core::scan::InstanceFilters;
use baler_core::transfer::{DownloadOutcome, TransferDirection, TransferStatus};
use baler_core::{BuildStatus, Engine};

fn make_site(root: &Path) -> PathBuf {
    let src = root.join("www");
    fs::create_dir_all(src.join("assets/img")).unwrap();
    fs::create_dir_all(src.join("cache")).unwrap();
    fs::write(src.join("index.php"), b"<?php echo 'hi';").unwrap();
    fs::write(src.join("assets/app.css"), b"body { margin: 0 }").unwrap();
    let image: Vec<u8> = (0..50_000u32).map(|i| (i * 31 % 251) as u8).collect();
    fs::write(src.join("assets/img/logo.png"), image).unwrap();
    fs::write(src.join("cache/page.tmp"), b"stale").unwrap();
    src
}

fn make_database(path: &Path) {
    let conn = rusqlite::Connection::open(path).unwrap();
    conn.execute_batch(
        "CREATE TABLE posts (id INTEGER PRIMARY KEY, title TEXT, body BLOB);
         INSERT INTO posts VALUES (1, 'first', x'00ff');
         INSERT INTO posts VALUES (2, 'it''s second', NULL);
         INSERT INTO posts VALUES (3, 'third', x'');",
    )
    .unwrap();
}

fn snapshot(root: &Path) -> BTreeMap<String, Option<Vec<u8>>> {
    let mut out = BTreeMap::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(&dir).unwrap() {
            let path = entry.unwrap().path();
            let rel = path.strip_prefix(root).unwrap().to_string_lossy().to_string();
            if path.is_dir() {
                out.insert(rel, None);
                stack.push(path);
            } else {
                out.insert(rel, Some(fs::read(&path).unwrap()));
            }
        }
    }
    out
}

fn write_config(dir: &Path, backup_dir: &Path, src: &Path, db: &Path, nas: &Path) -> BalerConfig {
    let path = dir.join("baler.yaml");
    fs::write(
        &path,
        format!(
            r#"
installation_id: lifecycle
backup_dir: {backup}
label: www
sources: [{src}]
filters:
  exts: [tmp]
archive:
  glob_size: 4KiB
database:
  sqlite: {db}
  batch_rows: 2
installer:
  segment_size: 8KiB
chunk:
  time_budget: null
lock:
  mode: file
storages:
  - id: nas
    kind: local
    path: {nas}
    max_kept: 2
build:
  upload_to: [nas]
"#,
            backup = backup_dir.display(),
            src = src.display(),
            db = db.display(),
            nas = nas.display(),
        ),
    )
    .unwrap();
    load_config(&path).unwrap()
}

#[test]
fn build_upload_download_and_expand() {
    let tmp = tempfile::tempdir().unwrap();
    let src = make_site(tmp.path());
    let db = tmp.path().join("site.db");
    make_database(&db);
    let nas = tmp.path().join("nas");
    fs::create_dir_all(&nas).unwrap();

    let config = write_config(tmp.path(), &tmp.path().join("backups"), &src, &db, &nas);
    let engine = Engine::from_config(config)
        .unwrap()
        .with_limits(ChunkLimits::unbounded().with_max_iterations(3));

    let mut invocations = 0;
    let name = loop {
        invocations += 1;
        assert!(invocations < 1000, "build does not finish");
        let report = engine.run(InstanceFilters::default()).unwrap();
        assert!(report.error.is_none(), "build error: {:?}", report.error);
        if report.status != BuildStatus::Built {
            continue;
        }
        let progress = engine.status(Some(&report.package)).unwrap().unwrap();
        match progress.transfer("nas", TransferDirection::Upload) {
            Some(upload) if upload.status == TransferStatus::Succeeded => {
                assert_eq!(upload.bytes_transferred, upload.total_bytes);
                break report.package;
            }
            _ => {}
        }
    };
    assert!(invocations > 3, "only {invocations} invocations");

    let script = fs::read_to_string(engine.package_dir(&name).join("database.sql")).unwrap();
    assert!(script.contains("'it''s second'"));
    assert!(script.contains("X'00ff'"));

    // A second installation pulls the package back down.
    let other_dir = tmp.path().join("other");
    fs::create_dir_all(&other_dir).unwrap();
    let other = Engine::from_config(write_config(
        &other_dir,
        &other_dir.join("backups"),
        &src,
        &db,
        &nas,
    ))
    .unwrap()
    .with_limits(ChunkLimits::unbounded().with_max_iterations(2));

    let mut rounds = 0;
    loop {
        rounds += 1;
        assert!(rounds < 1000, "download does not finish");
        match other.download("nas", &name).unwrap() {
            DownloadOutcome::Complete { .. } => break,
            DownloadOutcome::Stopped { .. } => {}
            outcome => panic!("download stopped with {outcome:?}"),
        }
    }
    let pulled = other.status(Some(&name)).unwrap().unwrap();
    assert_eq!(pulled.status, BuildStatus::Built);
    assert_eq!(pulled.downloaded_from.as_deref(), Some("nas"));

    let restore = tmp.path().join("restore");
    let mut rounds = 0;
    loop {
        rounds += 1;
        assert!(rounds < 1000, "expand does not finish");
        match other.expand(&name, &restore).unwrap() {
            ExpandOutcome::Complete(_) => break,
            ExpandOutcome::Stopped(_) => {}
            ExpandOutcome::Error(failure) => panic!("expand failed: {failure}"),
        }
    }

    let mut expected = snapshot(&src);
    expected.remove("cache/page.tmp");
    assert_eq!(snapshot(&restore.join("www")), expected);
}
