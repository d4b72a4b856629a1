use openraft::{SnapshotMeta, StoredMembership};
use raftkv::replicator::*;
use raftkv::StoreError;
use std::io::Write;
use tempfile::TempDir;

fn meta(id: &str) -> SnapshotMeta<NodeIdType, KvNode> {
    SnapshotMeta {
        last_log_id: None,
        last_membership: StoredMembership::default(),
        snapshot_id: id.to_string(),
    }
}

fn write_snapshot(store: &FileSnapshotStore, id: &str, data: &[u8]) {
    let mut sink = store.create(&meta(id)).unwrap();
    sink.write_all(data).unwrap();
    sink.close().unwrap();
}

#[test]
fn test_retain_must_be_positive() {
    let dir = TempDir::new().unwrap();
    assert!(matches!(
        FileSnapshotStore::new(dir.path(), 0),
        Err(StoreError::Config(_))
    ));
}

#[test]
fn test_close_makes_snapshot_visible() {
    let dir = TempDir::new().unwrap();
    let store = FileSnapshotStore::new(dir.path(), 3).unwrap();
    assert!(store.latest().unwrap().is_none());

    write_snapshot(&store, "s1", b"payload");

    let (record, data) = store.latest().unwrap().unwrap();
    assert_eq!(record.meta.snapshot_id, "s1");
    assert_eq!(record.size, 7);
    assert_eq!(data, b"payload");
}

#[test]
fn test_cancel_discards_snapshot() {
    let dir = TempDir::new().unwrap();
    let store = FileSnapshotStore::new(dir.path(), 3).unwrap();

    let mut sink = store.create(&meta("s1")).unwrap();
    sink.write_all(b"partial").unwrap();
    sink.cancel().unwrap();

    assert!(store.list().unwrap().is_empty());
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[test]
fn test_dropped_sink_is_cancelled() {
    let dir = TempDir::new().unwrap();
    let store = FileSnapshotStore::new(dir.path(), 3).unwrap();

    {
        let mut sink = store.create(&meta("s1")).unwrap();
        sink.write_all(b"partial").unwrap();
    }

    assert!(store.list().unwrap().is_empty());
}

#[test]
fn test_reaps_beyond_retain() {
    let dir = TempDir::new().unwrap();
    let store = FileSnapshotStore::new(dir.path(), 2).unwrap();

    for i in 1..=4 {
        write_snapshot(&store, &format!("s{}", i), format!("data-{}", i).as_bytes());
    }

    let ids: Vec<String> = store
        .list()
        .unwrap()
        .into_iter()
        .map(|s| s.meta.snapshot_id)
        .collect();
    assert_eq!(ids, vec!["s4", "s3"]);
    assert_eq!(store.latest().unwrap().unwrap().1, b"data-4");
}

#[test]
fn test_reopen_keeps_order_and_drops_tmp() {
    let dir = TempDir::new().unwrap();
    {
        let store = FileSnapshotStore::new(dir.path(), 3).unwrap();
        write_snapshot(&store, "s1", b"one");
        let mut abandoned = store.create(&meta("s2")).unwrap();
        abandoned.write_all(b"two").unwrap();
        std::mem::forget(abandoned);
    }

    let store = FileSnapshotStore::new(dir.path(), 3).unwrap();
    assert_eq!(store.list().unwrap().len(), 1);

    write_snapshot(&store, "s3", b"three");
    let (record, data) = store.latest().unwrap().unwrap();
    assert_eq!(record.meta.snapshot_id, "s3");
    assert_eq!(data, b"three");
}
