use raftkv::replicator::*;
use raftkv::store::{LocalStore, MemoryStore};
use raftkv::{Result, StoreError};
use std::io::{self, Cursor, Write};
use std::sync::Arc;
use tempfile::TempDir;

fn new_fsm(dir: &TempDir, name: &str) -> (Arc<MemoryStore>, Fsm) {
    let store = Arc::new(MemoryStore::new());
    let fsm = Fsm::new(store.clone(), dir.path().join(name).join("events.log")).unwrap();
    (store, fsm)
}

fn set_entry(key: &str, value: &str) -> Vec<u8> {
    Command::set(key.as_bytes(), value.as_bytes())
        .encode()
        .unwrap()
        .0
}

struct VecSink {
    data: Vec<u8>,
    closed: bool,
    cancelled: bool,
}

impl VecSink {
    fn new() -> Self {
        Self {
            data: Vec::new(),
            closed: false,
            cancelled: false,
        }
    }
}

impl Write for VecSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.data.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SnapshotSink for VecSink {
    fn id(&self) -> &str {
        "vec"
    }

    fn cancel(&mut self) -> io::Result<()> {
        self.cancelled = true;
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        self.closed = true;
        Ok(())
    }
}

struct FailingSink {
    cancelled: bool,
    closed: bool,
}

impl Write for FailingSink {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::Error::other("disk full"))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SnapshotSink for FailingSink {
    fn id(&self) -> &str {
        "failing"
    }

    fn cancel(&mut self) -> io::Result<()> {
        self.cancelled = true;
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        self.closed = true;
        Ok(())
    }
}

struct BrokenStore;

impl LocalStore for BrokenStore {
    fn get(&self, _key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    fn set(&self, _key: &[u8], _value: &[u8]) -> Result<()> {
        Err(StoreError::Io(io::Error::other("store offline")))
    }

    fn flush(&self) -> Result<()> {
        Err(StoreError::Io(io::Error::other("store offline")))
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[test]
fn test_apply_set() {
    let dir = TempDir::new().unwrap();
    let (store, fsm) = new_fsm(&dir, "a");

    fsm.apply(&set_entry("k", "v")).unwrap();

    assert_eq!(store.get(b"k").unwrap(), Some(b"v".to_vec()));
    assert!(std::fs::metadata(fsm.events_path()).unwrap().len() > 0);
}

#[test]
fn test_same_entries_same_state() {
    let dir = TempDir::new().unwrap();
    let (store_a, fsm_a) = new_fsm(&dir, "a");
    let (store_b, fsm_b) = new_fsm(&dir, "b");

    let entries = vec![
        set_entry("x", "1"),
        set_entry("y", "2"),
        set_entry("x", "3"),
        vec![9, 9, 9],
        set_entry("z", ""),
    ];
    for entry in &entries {
        let a = fsm_a.apply(entry);
        let b = fsm_b.apply(entry);
        assert_eq!(a.is_ok(), b.is_ok());
    }

    assert_eq!(store_a.dump(), store_b.dump());
    assert_eq!(store_a.get(b"x").unwrap(), Some(b"3".to_vec()));
    assert_eq!(store_a.len(), 3);
}

#[test]
fn test_corrupt_entry_leaves_store_untouched() {
    let dir = TempDir::new().unwrap();
    let (store, fsm) = new_fsm(&dir, "a");

    assert!(matches!(fsm.apply(&[]), Err(StoreError::Codec(_))));
    assert!(matches!(fsm.apply(&[5, 1]), Err(StoreError::UnknownRequestType(5))));
    assert!(store.is_empty());
    assert_eq!(std::fs::metadata(fsm.events_path()).unwrap().len(), 0);
}

#[test]
fn test_local_store_failure_is_not_io() {
    let dir = TempDir::new().unwrap();
    let fsm = Fsm::new(Arc::new(BrokenStore), dir.path().join("events.log")).unwrap();

    assert!(matches!(
        fsm.apply(&set_entry("k", "v")),
        Err(StoreError::Storage(_))
    ));
}

#[test]
fn test_sync_reports_local_store_flush_failure() {
    let dir = TempDir::new().unwrap();
    let fsm = Fsm::new(Arc::new(BrokenStore), dir.path().join("events.log")).unwrap();
    assert!(matches!(fsm.sync(), Err(StoreError::Storage(_))));

    let (_, fsm) = new_fsm(&dir, "a");
    fsm.apply(&set_entry("k", "v")).unwrap();
    fsm.sync().unwrap();
}

#[test]
fn test_snapshot_restore_roundtrip() {
    let dir = TempDir::new().unwrap();
    let (_, fsm) = new_fsm(&dir, "source");
    fsm.apply(&set_entry("a", "1")).unwrap();
    fsm.apply(&set_entry("b", "2")).unwrap();
    fsm.apply(&set_entry("a", "3")).unwrap();

    let snapshot = fsm.snapshot().unwrap();
    let mut sink = VecSink::new();
    snapshot.persist(&mut sink).unwrap();
    assert!(sink.closed);
    assert!(!sink.cancelled);

    let (restored_store, restored) = new_fsm(&dir, "target");
    restored.apply(&set_entry("stale", "x")).unwrap();
    let count = restored.restore(Cursor::new(sink.data)).unwrap();

    assert_eq!(count, 3);
    assert_eq!(restored_store.get(b"a").unwrap(), Some(b"3".to_vec()));
    assert_eq!(restored_store.get(b"b").unwrap(), Some(b"2".to_vec()));

    // The restored event log is the snapshot's, so it snapshots identically.
    assert_eq!(
        restored.snapshot().unwrap().as_bytes(),
        snapshot.as_bytes()
    );
}

#[test]
fn test_snapshot_is_point_in_time() {
    let dir = TempDir::new().unwrap();
    let (_, fsm) = new_fsm(&dir, "a");
    fsm.apply(&set_entry("a", "1")).unwrap();

    let snapshot = fsm.snapshot().unwrap();
    fsm.apply(&set_entry("b", "2")).unwrap();

    let (store, other) = new_fsm(&dir, "b");
    other.restore(Cursor::new(snapshot.into_bytes())).unwrap();
    assert_eq!(store.get(b"a").unwrap(), Some(b"1".to_vec()));
    assert_eq!(store.get(b"b").unwrap(), None);
}

#[test]
fn test_failed_persist_cancels_sink() {
    let dir = TempDir::new().unwrap();
    let (_, fsm) = new_fsm(&dir, "a");
    fsm.apply(&set_entry("a", "1")).unwrap();

    let mut sink = FailingSink {
        cancelled: false,
        closed: false,
    };
    let result = fsm.snapshot().unwrap().persist(&mut sink);

    assert!(matches!(result, Err(StoreError::Snapshot(_))));
    assert!(sink.cancelled);
    assert!(!sink.closed);
}

#[test]
fn test_restore_rejects_truncated_snapshot() {
    let dir = TempDir::new().unwrap();
    let (_, fsm) = new_fsm(&dir, "a");
    fsm.apply(&set_entry("a", "1")).unwrap();
    let mut bytes = fsm.snapshot().unwrap().into_bytes();
    bytes.truncate(bytes.len() - 1);

    let (_, other) = new_fsm(&dir, "b");
    assert!(matches!(
        other.restore(Cursor::new(bytes)),
        Err(StoreError::Snapshot(_))
    ));
}
