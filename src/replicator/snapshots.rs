use crate::error::{Result, StoreError};
use crate::replicator::storage::{KvNode, NodeIdType};
use chrono::{DateTime, Utc};
use openraft::SnapshotMeta;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

const META_FILE: &str = "meta.json";
const STATE_FILE: &str = "state.bin";
const TMP_SUFFIX: &str = ".tmp";

/// Destination for snapshot bytes. A sink is either closed, making the
/// snapshot visible, or cancelled, discarding everything written so far.
pub trait SnapshotSink: Write + Send {
    fn id(&self) -> &str;
    fn cancel(&mut self) -> io::Result<()>;
    fn close(&mut self) -> io::Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredSnapshot {
    pub seq: u64,
    pub meta: SnapshotMeta<NodeIdType, KvNode>,
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

/// One directory per snapshot generation, keeping the newest `retain`.
pub struct FileSnapshotStore {
    dir: PathBuf,
    retain: usize,
    seq: AtomicU64,
}

impl FileSnapshotStore {
    pub fn new<P: AsRef<Path>>(dir: P, retain: usize) -> Result<Self> {
        if retain == 0 {
            return Err(StoreError::Config(
                "snapshot retain count must be at least 1".to_string(),
            ));
        }
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if is_tmp(&path) {
                warn!("Removing incomplete snapshot {:?}", path);
                let _ = fs::remove_dir_all(&path);
            }
        }

        let store = Self {
            dir,
            retain,
            seq: AtomicU64::new(0),
        };
        let last_seq = store.list()?.first().map(|s| s.seq).unwrap_or(0);
        store.seq.store(last_seq, Ordering::SeqCst);
        Ok(store)
    }

    pub fn create(&self, meta: &SnapshotMeta<NodeIdType, KvNode>) -> Result<FileSnapshotSink> {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let name = format!("{:020}-{}", seq, meta.snapshot_id);
        let final_path = self.dir.join(&name);
        let tmp_path = self.dir.join(format!("{}{}", name, TMP_SUFFIX));

        fs::create_dir_all(&tmp_path)?;
        let file = File::create(tmp_path.join(STATE_FILE))?;

        debug!("Creating snapshot {} in {:?}", name, tmp_path);

        Ok(FileSnapshotSink {
            id: meta.snapshot_id.clone(),
            dir: self.dir.clone(),
            retain: self.retain,
            final_path,
            tmp_path,
            file: Some(file),
            record: StoredSnapshot {
                seq,
                meta: meta.clone(),
                size: 0,
                created_at: Utc::now(),
            },
            done: false,
        })
    }

    /// Stored snapshots, newest first.
    pub fn list(&self) -> Result<Vec<StoredSnapshot>> {
        list_snapshots(&self.dir)
    }

    pub fn latest(&self) -> Result<Option<(StoredSnapshot, Vec<u8>)>> {
        let Some(record) = self.list()?.into_iter().next() else {
            return Ok(None);
        };
        let path = self.dir.join(snapshot_dir_name(&record));
        let data = fs::read(path.join(STATE_FILE)).map_err(|e| {
            StoreError::Snapshot(format!("failed to read snapshot {}: {}", record.meta.snapshot_id, e))
        })?;
        Ok(Some((record, data)))
    }
}

pub struct FileSnapshotSink {
    id: String,
    dir: PathBuf,
    retain: usize,
    final_path: PathBuf,
    tmp_path: PathBuf,
    file: Option<File>,
    record: StoredSnapshot,
    done: bool,
}

impl Write for FileSnapshotSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::other("snapshot sink already finished"))?;
        let n = file.write(buf)?;
        self.record.size += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl SnapshotSink for FileSnapshotSink {
    fn id(&self) -> &str {
        &self.id
    }

    fn cancel(&mut self) -> io::Result<()> {
        if self.done {
            return Ok(());
        }
        self.done = true;
        self.file.take();
        warn!("Cancelling snapshot {}", self.id);
        match fs::remove_dir_all(&self.tmp_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn close(&mut self) -> io::Result<()> {
        if self.done {
            return Ok(());
        }
        self.done = true;

        let Some(mut file) = self.file.take() else {
            return Err(io::Error::other("snapshot sink already finished"));
        };
        file.flush()?;
        file.sync_all()?;
        drop(file);

        let meta = serde_json::to_vec_pretty(&self.record)?;
        fs::write(self.tmp_path.join(META_FILE), meta)?;
        fs::rename(&self.tmp_path, &self.final_path)?;

        info!(
            "Snapshot {} stored ({} bytes, seq {})",
            self.id, self.record.size, self.record.seq
        );

        reap(&self.dir, self.retain)
    }
}

impl Drop for FileSnapshotSink {
    fn drop(&mut self) {
        if !self.done {
            let _ = self.cancel();
        }
    }
}

fn is_tmp(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.ends_with(TMP_SUFFIX))
        .unwrap_or(false)
}

fn snapshot_dir_name(record: &StoredSnapshot) -> String {
    format!("{:020}-{}", record.seq, record.meta.snapshot_id)
}

fn list_snapshots(dir: &Path) -> Result<Vec<StoredSnapshot>> {
    let mut snapshots = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_dir() || is_tmp(&path) {
            continue;
        }
        let meta_path = path.join(META_FILE);
        let data = match fs::read(&meta_path) {
            Ok(data) => data,
            Err(e) => {
                warn!("Skipping snapshot without metadata {:?}: {}", path, e);
                continue;
            }
        };
        match serde_json::from_slice::<StoredSnapshot>(&data) {
            Ok(record) => snapshots.push(record),
            Err(e) => warn!("Skipping unreadable snapshot metadata {:?}: {}", meta_path, e),
        }
    }
    snapshots.sort_by(|a, b| b.seq.cmp(&a.seq));
    Ok(snapshots)
}

fn reap(dir: &Path, retain: usize) -> io::Result<()> {
    let snapshots = list_snapshots(dir).map_err(|e| io::Error::other(e.to_string()))?;
    for record in snapshots.iter().skip(retain) {
        let path = dir.join(snapshot_dir_name(record));
        debug!("Reaping snapshot {:?}", path);
        fs::remove_dir_all(&path)?;
    }
    Ok(())
}
