use crate::purge::{list_remote_packages, purge_old_backups};
use crate::scan::InstanceFilters;
use crate::testutil::{make_tree, memory_engine, storage_entry, test_config, MemoryStorage};

const OLD: &str = "site_20240101000000_0000000000000001";
const MID: &str = "site_20240201000000_0000000000000002";
const NEW: &str = "site_20240301000000_0000000000000003";

fn seeded() -> MemoryStorage {
    let storage = MemoryStorage::new("mem");
    for name in [OLD, MID, NEW] {
        storage.put_object(&format!("{name}/archive.balr"), b"a");
        storage.put_object(&format!("{name}/installer.json"), b"i");
    }
    storage.put_object("notes/readme.txt", b"not a package");
    storage.put_object("loose-file", b"x");
    storage
}

#[test]
fn packages_are_listed_newest_first() {
    let storage = seeded();
    let listed: Vec<String> = list_remote_packages(&storage)
        .unwrap()
        .into_iter()
        .map(|(name, _, objects)| {
            assert_eq!(objects.len(), 2);
            name
        })
        .collect();
    assert_eq!(listed, vec![NEW, MID, OLD]);
}

#[test]
fn keeps_newest_and_is_idempotent() {
    let storage = seeded();
    let report = purge_old_backups(&storage, &[], 2).unwrap();
    assert_eq!(report.kept, vec![NEW, MID]);
    assert_eq!(report.deleted, vec![OLD]);
    assert!(report.failed.is_empty());
    assert!(storage.object(&format!("{OLD}/archive.balr")).is_none());
    assert!(storage.object("notes/readme.txt").is_some());
    assert!(storage.object("loose-file").is_some());

    let again = purge_old_backups(&storage, &[], 2).unwrap();
    assert!(again.deleted.is_empty());
    assert_eq!(again.kept, vec![NEW, MID]);
}

#[test]
fn kept_packages_count_toward_the_limit() {
    let storage = seeded();
    let report = purge_old_backups(&storage, &[OLD.to_string()], 2).unwrap();
    assert_eq!(report.kept, vec![OLD, NEW]);
    assert_eq!(report.deleted, vec![MID]);
}

#[test]
fn non_positive_limit_keeps_everything() {
    let storage = seeded();
    for limit in [0, -1] {
        let report = purge_old_backups(&storage, &[], limit).unwrap();
        assert!(report.deleted.is_empty());
        assert!(report.kept.is_empty());
    }
    assert_eq!(list_remote_packages(&storage).unwrap().len(), 3);
}

#[test]
fn failed_deletes_are_collected() {
    let storage = seeded();
    storage.fail_delete(&format!("{OLD}/installer.json"));
    let report = purge_old_backups(&storage, &[], 1).unwrap();
    assert_eq!(report.deleted, vec![MID]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, format!("{OLD}/installer.json"));
    assert!(storage.object(&format!("{OLD}/archive.balr")).is_none());
    assert!(storage.object(&format!("{OLD}/installer.json")).is_some());
}

#[test]
fn upload_applies_retention() {
    let tmp = tempfile::tempdir().unwrap();
    let src = make_tree(tmp.path());
    let storage = seeded();
    let mut config = test_config(&tmp.path().join("b"), &[&src]);
    config.storages = vec![storage_entry("mem", &tmp.path().join("unused"), 2)];
    config.build.upload_to = vec!["mem".into()];
    let engine = memory_engine(config, &storage);

    let name = engine.run(InstanceFilters::default()).unwrap().package;
    let names: Vec<String> = list_remote_packages(&storage)
        .unwrap()
        .into_iter()
        .map(|(n, _, _)| n)
        .collect();
    assert_eq!(names, vec![name.clone(), NEW.to_string()]);

    let report = engine.purge("mem", &[], Some(1)).unwrap();
    assert_eq!(report.deleted, vec![NEW]);
    assert_eq!(report.kept, vec![name]);
}
