use crate::error::{Result, StoreError};
use crate::replicator::log_entry::Command;
use crate::replicator::snapshots::SnapshotSink;
use crate::store::LocalStore;
use parking_lot::RwLock;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Applies committed entries to the local store and keeps an append-only
/// record of them, which is what snapshots carry and restores replay.
///
/// Event log records are `[u32 big-endian length][encoded entry]`.
pub struct Fsm {
    store: Arc<dyn LocalStore>,
    events_path: PathBuf,
    log_lock: RwLock<()>,
}

impl Fsm {
    pub fn new<P: AsRef<Path>>(store: Arc<dyn LocalStore>, events_path: P) -> Result<Self> {
        let events_path = events_path.as_ref().to_path_buf();
        if let Some(parent) = events_path.parent() {
            fs::create_dir_all(parent)?;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&events_path)?;

        Ok(Self {
            store,
            events_path,
            log_lock: RwLock::new(()),
        })
    }

    pub fn events_path(&self) -> &Path {
        &self.events_path
    }

    /// Decode and apply one entry. Malformed entries and local store
    /// failures leave the event log untouched. `StoreError::Io` is reserved
    /// for the event log itself failing.
    pub fn apply(&self, data: &[u8]) -> Result<()> {
        self.apply_command(data)?;
        self.append(data)?;
        Ok(())
    }

    fn apply_command(&self, data: &[u8]) -> Result<()> {
        match Command::decode(data)? {
            Command::Set(req) => self
                .store
                .set(&req.key, &req.value)
                .map_err(|e| match e {
                    StoreError::Io(io) => StoreError::Storage(io.to_string()),
                    other => other,
                }),
        }
    }

    fn append(&self, data: &[u8]) -> Result<()> {
        let _guard = self.log_lock.write();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.events_path)?;
        write_record(&mut file, data)?;
        Ok(())
    }

    /// Flush the local store, then fsync the event log. Entries applied
    /// before this returns survive a crash.
    pub fn sync(&self) -> Result<()> {
        self.store.flush().map_err(|e| match e {
            StoreError::Io(io) => StoreError::Storage(io.to_string()),
            other => other,
        })?;
        let _guard = self.log_lock.read();
        File::open(&self.events_path)?.sync_data()?;
        Ok(())
    }

    /// Point-in-time copy of the event log. Holding the returned value does
    /// not block later applies.
    pub fn snapshot(&self) -> Result<FsmSnapshot> {
        let _guard = self.log_lock.read();
        let data = fs::read(&self.events_path)
            .map_err(|e| StoreError::Snapshot(format!("failed to read event log: {}", e)))?;
        debug!("Captured event log snapshot ({} bytes)", data.len());
        Ok(FsmSnapshot { data })
    }

    /// Replace the event log with the entries in `reader` and apply each of
    /// them to the local store, in order. Returns the number of entries.
    pub fn restore<R: Read>(&self, reader: R) -> Result<usize> {
        let _guard = self.log_lock.write();

        let tmp_path = self.events_path.with_extension("restore");
        let count = match self.replay(reader, &tmp_path) {
            Ok(count) => count,
            Err(e) => {
                let _ = fs::remove_file(&tmp_path);
                return Err(e);
            }
        };
        fs::rename(&tmp_path, &self.events_path)?;

        info!("Restored {} entries from snapshot", count);
        Ok(count)
    }

    fn replay<R: Read>(&self, reader: R, out_path: &Path) -> Result<usize> {
        let mut out = BufWriter::new(File::create(out_path)?);
        let mut reader = BufReader::new(reader);
        let mut count = 0usize;

        while let Some(record) = read_record(&mut reader)
            .map_err(|e| StoreError::Snapshot(format!("corrupt snapshot record {}: {}", count, e)))?
        {
            match self.apply_command(&record) {
                Ok(()) => {}
                Err(e @ (StoreError::Codec(_) | StoreError::UnknownRequestType(_))) => {
                    warn!("Skipping entry {} during restore: {}", count, e);
                    continue;
                }
                Err(e) => return Err(e),
            }
            write_record(&mut out, &record)?;
            count += 1;
        }

        out.flush()?;
        out.into_inner()
            .map_err(|e| StoreError::Io(e.into_error()))?
            .sync_all()?;
        Ok(count)
    }
}

pub struct FsmSnapshot {
    data: Vec<u8>,
}

impl FsmSnapshot {
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// Stream the captured bytes into `sink`. A failed write cancels the
    /// sink so no partial snapshot becomes visible.
    pub fn persist(&self, sink: &mut dyn SnapshotSink) -> Result<()> {
        if let Err(e) = sink.write_all(&self.data).and_then(|_| sink.flush()) {
            warn!("Snapshot {} write failed, cancelling: {}", sink.id(), e);
            let _ = sink.cancel();
            return Err(StoreError::Snapshot(e.to_string()));
        }
        sink.close()
            .map_err(|e| StoreError::Snapshot(format!("failed to close snapshot sink: {}", e)))
    }
}

fn write_record<W: Write>(w: &mut W, data: &[u8]) -> io::Result<()> {
    let len = u32::try_from(data.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "entry too large"))?;
    w.write_all(&len.to_be_bytes())?;
    w.write_all(data)
}

fn read_record<R: Read>(r: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < len_buf.len() {
        let n = r.read(&mut len_buf[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "truncated record header",
            ));
        }
        filled += n;
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut data = vec![0u8; len];
    r.read_exact(&mut data)?;
    Ok(Some(data))
}
