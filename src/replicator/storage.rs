use crate::error::{Result, StoreError};
use crate::replicator::log_entry::{ApplyResult, LogEntry};
use crate::replicator::snapshots::{FileSnapshotStore, SnapshotSink};
use crate::replicator::state_machine::Fsm;
use openraft::storage::{Adaptor, LogState, RaftStorage};
use openraft::{
    Entry, EntryPayload, ErrorSubject, ErrorVerb, LogId, OptionalSend, RaftLogReader,
    RaftSnapshotBuilder, Snapshot, SnapshotMeta, StorageError, StoredMembership, Vote,
};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::io::{Cursor, Write};
use std::ops::{Bound, RangeBounds};
use std::path::Path;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub type NodeIdType = u64;

openraft::declare_raft_types!(
    pub TypeConfig:
        D = LogEntry,
        R = ApplyResult,
        Node = KvNode,
);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct KvNode {
    pub name: String,
    pub rpc_addr: String,
}

impl KvNode {
    pub fn new(name: impl Into<String>, rpc_addr: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rpc_addr: rpc_addr.into(),
        }
    }
}

impl std::fmt::Display for KvNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.name, self.rpc_addr)
    }
}

/// Raft node ids are integers; names map onto them with 64-bit FNV-1a so
/// every node derives the same id for the same name.
pub fn node_id_for(name: &str) -> NodeIdType {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    name.bytes()
        .fold(OFFSET, |hash, b| (hash ^ b as u64).wrapping_mul(PRIME))
}

const KEY_VOTE: &[u8] = b"vote";
const KEY_LAST_PURGED: &[u8] = b"last_purged";
const KEY_LAST_APPLIED: &[u8] = b"last_applied";
const KEY_MEMBERSHIP: &[u8] = b"membership";

fn storage_err(subject: ErrorSubject<NodeIdType>, verb: ErrorVerb, e: impl ToString) -> StorageError<NodeIdType> {
    StorageError::from_io_error(subject, verb, std::io::Error::other(e.to_string()))
}

fn logs_err(verb: ErrorVerb, e: impl ToString) -> StorageError<NodeIdType> {
    storage_err(ErrorSubject::Logs, verb, e)
}

fn sm_err(verb: ErrorVerb, e: impl ToString) -> StorageError<NodeIdType> {
    storage_err(ErrorSubject::StateMachine, verb, e)
}

/// Raft log, vote and state machine bookkeeping in sled; applied data goes
/// through the [`Fsm`], snapshots into a [`FileSnapshotStore`].
#[derive(Clone)]
pub struct SledStorage {
    db: sled::Db,
    log_tree: sled::Tree,
    meta_tree: sled::Tree,
    fsm: Arc<Fsm>,
    snapshots: Arc<FileSnapshotStore>,
    /// Held for writing while a batch is applied, for reading while a
    /// snapshot captures `last_applied` with the event log.
    apply_lock: Arc<RwLock<()>>,
}

impl SledStorage {
    pub fn new<P: AsRef<Path>>(
        path: P,
        fsm: Arc<Fsm>,
        snapshots: Arc<FileSnapshotStore>,
    ) -> Result<Self> {
        let db = sled::open(path)?;
        let log_tree = db.open_tree("raft_log")?;
        let meta_tree = db.open_tree("raft_meta")?;

        Ok(Self {
            db,
            log_tree,
            meta_tree,
            fsm,
            snapshots,
            apply_lock: Arc::new(RwLock::new(())),
        })
    }

    fn log_key(index: u64) -> [u8; 8] {
        index.to_be_bytes()
    }

    /// Whether a previous run left any raft state behind. Bootstrapping is
    /// only allowed on a node without it.
    pub fn has_existing_state(&self) -> Result<bool> {
        if self.meta_tree.contains_key(KEY_VOTE)? || self.meta_tree.contains_key(KEY_LAST_PURGED)? {
            return Ok(true);
        }
        if !self.log_tree.is_empty() {
            return Ok(true);
        }
        Ok(!self.snapshots.list()?.is_empty())
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    fn get_meta<T: serde::de::DeserializeOwned>(&self, key: &[u8]) -> Option<T> {
        self.meta_tree
            .get(key)
            .ok()
            .flatten()
            .and_then(|v| bincode::deserialize(&v).ok())
    }

    fn set_meta<T: Serialize>(&self, key: &[u8], value: &T) -> Result<()> {
        let data = bincode::serialize(value)?;
        self.meta_tree.insert(key, data)?;
        Ok(())
    }

    fn get_last_applied(&self) -> Option<LogId<NodeIdType>> {
        self.get_meta(KEY_LAST_APPLIED)
    }

    fn get_last_purged(&self) -> Option<LogId<NodeIdType>> {
        self.get_meta(KEY_LAST_PURGED)
    }

    fn get_membership(&self) -> StoredMembership<NodeIdType, KvNode> {
        self.meta_tree
            .get(KEY_MEMBERSHIP)
            .ok()
            .flatten()
            .and_then(|v| serde_json::from_slice(&v).ok())
            .unwrap_or_default()
    }

    fn set_membership(&self, membership: &StoredMembership<NodeIdType, KvNode>) -> Result<()> {
        let data = serde_json::to_vec(membership)?;
        self.meta_tree.insert(KEY_MEMBERSHIP, data)?;
        Ok(())
    }

    fn decode_entry(value: &[u8]) -> Result<Entry<TypeConfig>, StorageError<NodeIdType>> {
        serde_json::from_slice(value).map_err(|e| logs_err(ErrorVerb::Read, e))
    }

    fn remove_log_range<R: RangeBounds<[u8; 8]>>(&self, range: R) -> Result<(), StorageError<NodeIdType>> {
        let keys: Vec<_> = self
            .log_tree
            .range(range)
            .keys()
            .collect::<Result<_, _>>()
            .map_err(|e| logs_err(ErrorVerb::Read, e))?;
        for key in keys {
            self.log_tree
                .remove(key)
                .map_err(|e| logs_err(ErrorVerb::Delete, e))?;
        }
        Ok(())
    }
}

impl RaftLogReader<TypeConfig> for SledStorage {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + OptionalSend>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<NodeIdType>> {
        let start = match range.start_bound() {
            Bound::Included(&s) => s,
            Bound::Excluded(&s) => s + 1,
            Bound::Unbounded => 0,
        };

        let mut entries = Vec::new();
        for item in self.log_tree.range(Self::log_key(start)..) {
            let (key, value) = item.map_err(|e| logs_err(ErrorVerb::Read, e))?;
            let key: [u8; 8] = key
                .as_ref()
                .try_into()
                .map_err(|_| logs_err(ErrorVerb::Read, "malformed log key"))?;
            let index = u64::from_be_bytes(key);
            if !range.contains(&index) {
                break;
            }
            entries.push(Self::decode_entry(&value)?);
        }

        Ok(entries)
    }
}

impl RaftSnapshotBuilder<TypeConfig> for SledStorage {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<NodeIdType>> {
        let (last_applied, last_membership, fsm_snapshot) = {
            let _applied = self.apply_lock.read();
            let fsm_snapshot = self
                .fsm
                .snapshot()
                .map_err(|e| storage_err(ErrorSubject::Snapshot(None), ErrorVerb::Read, e))?;
            (self.get_last_applied(), self.get_membership(), fsm_snapshot)
        };

        let snapshot_id = format!(
            "{}-{}",
            last_applied.map(|l| l.index).unwrap_or(0),
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );

        let meta = SnapshotMeta {
            last_log_id: last_applied,
            last_membership,
            snapshot_id,
        };

        let write_err = |e: StoreError| {
            storage_err(ErrorSubject::Snapshot(Some(meta.signature())), ErrorVerb::Write, e)
        };
        let mut sink = self.snapshots.create(&meta).map_err(write_err)?;
        fsm_snapshot.persist(&mut sink).map_err(write_err)?;

        info!(
            "Built snapshot {} ({} bytes)",
            meta.snapshot_id,
            fsm_snapshot.as_bytes().len()
        );

        Ok(Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(fsm_snapshot.into_bytes())),
        })
    }
}

impl RaftStorage<TypeConfig> for SledStorage {
    type LogReader = Self;
    type SnapshotBuilder = Self;

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, StorageError<NodeIdType>> {
        let last_purged = self.get_last_purged();

        let last_log_id = match self
            .log_tree
            .last()
            .map_err(|e| logs_err(ErrorVerb::Read, e))?
        {
            Some((_, value)) => Some(Self::decode_entry(&value)?.log_id),
            None => None,
        };

        Ok(LogState {
            last_purged_log_id: last_purged,
            last_log_id: last_log_id.or(last_purged),
        })
    }

    async fn save_vote(&mut self, vote: &Vote<NodeIdType>) -> Result<(), StorageError<NodeIdType>> {
        let vote_err = |e: StoreError| storage_err(ErrorSubject::Vote, ErrorVerb::Write, e);
        self.set_meta(KEY_VOTE, vote).map_err(vote_err)?;
        self.meta_tree
            .flush()
            .map_err(|e| storage_err(ErrorSubject::Vote, ErrorVerb::Write, e))?;
        Ok(())
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<NodeIdType>>, StorageError<NodeIdType>> {
        Ok(self.get_meta(KEY_VOTE))
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        self.clone()
    }

    async fn append_to_log<I>(&mut self, entries: I) -> Result<(), StorageError<NodeIdType>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + OptionalSend,
    {
        for entry in entries {
            let key = Self::log_key(entry.log_id.index);
            let value = serde_json::to_vec(&entry).map_err(|e| logs_err(ErrorVerb::Write, e))?;
            self.log_tree
                .insert(key, value)
                .map_err(|e| logs_err(ErrorVerb::Write, e))?;
        }
        self.log_tree
            .flush()
            .map_err(|e| logs_err(ErrorVerb::Write, e))?;
        Ok(())
    }

    async fn delete_conflict_logs_since(
        &mut self,
        log_id: LogId<NodeIdType>,
    ) -> Result<(), StorageError<NodeIdType>> {
        debug!("Deleting conflicting logs since {}", log_id);
        self.remove_log_range(Self::log_key(log_id.index)..)
    }

    async fn purge_logs_upto(
        &mut self,
        log_id: LogId<NodeIdType>,
    ) -> Result<(), StorageError<NodeIdType>> {
        debug!("Purging logs up to {}", log_id);
        self.set_meta(KEY_LAST_PURGED, &log_id)
            .map_err(|e| logs_err(ErrorVerb::Write, e))?;
        self.remove_log_range(..=Self::log_key(log_id.index))
    }

    async fn last_applied_state(
        &mut self,
    ) -> Result<
        (
            Option<LogId<NodeIdType>>,
            StoredMembership<NodeIdType, KvNode>,
        ),
        StorageError<NodeIdType>,
    > {
        Ok((self.get_last_applied(), self.get_membership()))
    }

    async fn apply_to_state_machine(
        &mut self,
        entries: &[Entry<TypeConfig>],
    ) -> Result<Vec<ApplyResult>, StorageError<NodeIdType>> {
        let _applying = self.apply_lock.write();
        let mut results = Vec::with_capacity(entries.len());
        let mut membership = None;

        for entry in entries {
            let result = match &entry.payload {
                EntryPayload::Blank => ApplyResult::ok(),
                EntryPayload::Normal(req) => match self.fsm.apply(req.as_bytes()) {
                    Ok(()) => ApplyResult::ok(),
                    Err(e @ (StoreError::Io(_) | StoreError::Storage(_))) => {
                        return Err(sm_err(ErrorVerb::Write, e))
                    }
                    Err(e) => {
                        warn!("Rejected entry {}: {}", entry.log_id, e);
                        ApplyResult::err(e.to_string())
                    }
                },
                EntryPayload::Membership(mem) => {
                    membership = Some(StoredMembership::new(Some(entry.log_id), mem.clone()));
                    ApplyResult::ok()
                }
            };
            results.push(result);
        }

        let Some(last) = entries.last() else {
            return Ok(results);
        };

        // The local store and event log must be durable before last_applied
        // moves past the entries that wrote them.
        self.fsm.sync().map_err(|e| sm_err(ErrorVerb::Write, e))?;
        if let Some(membership) = &membership {
            self.set_membership(membership)
                .map_err(|e| sm_err(ErrorVerb::Write, e))?;
        }
        self.set_meta(KEY_LAST_APPLIED, &last.log_id)
            .map_err(|e| sm_err(ErrorVerb::Write, e))?;
        self.meta_tree
            .flush()
            .map_err(|e| sm_err(ErrorVerb::Write, e))?;

        Ok(results)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        self.clone()
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<Cursor<Vec<u8>>>, StorageError<NodeIdType>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<NodeIdType, KvNode>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<NodeIdType>> {
        let data = snapshot.into_inner();
        let read_err =
            |e: StoreError| storage_err(ErrorSubject::Snapshot(Some(meta.signature())), ErrorVerb::Read, e);
        let write_err =
            |e: StoreError| storage_err(ErrorSubject::Snapshot(Some(meta.signature())), ErrorVerb::Write, e);

        let _applying = self.apply_lock.write();
        let restored = self.fsm.restore(Cursor::new(&data)).map_err(read_err)?;
        self.fsm.sync().map_err(write_err)?;

        let mut sink = self.snapshots.create(meta).map_err(write_err)?;
        if let Err(e) = sink.write_all(&data) {
            let _ = sink.cancel();
            return Err(write_err(StoreError::Io(e)));
        }
        sink.close().map_err(|e| write_err(StoreError::Io(e)))?;

        if let Some(log_id) = meta.last_log_id {
            self.set_meta(KEY_LAST_APPLIED, &log_id)
                .map_err(|e| sm_err(ErrorVerb::Write, e))?;
        }
        self.set_membership(&meta.last_membership)
            .map_err(|e| sm_err(ErrorVerb::Write, e))?;
        self.meta_tree
            .flush()
            .map_err(|e| sm_err(ErrorVerb::Write, e))?;

        info!(
            "Installed snapshot {} ({} entries replayed)",
            meta.snapshot_id, restored
        );
        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, StorageError<NodeIdType>> {
        let latest = self
            .snapshots
            .latest()
            .map_err(|e| storage_err(ErrorSubject::Snapshot(None), ErrorVerb::Read, e))?;

        Ok(latest.map(|(record, data)| Snapshot {
            meta: record.meta,
            snapshot: Box::new(Cursor::new(data)),
        }))
    }
}

pub type SledAdaptorLogStore = Adaptor<TypeConfig, SledStorage>;
pub type SledAdaptorStateMachine = Adaptor<TypeConfig, SledStorage>;

pub fn create_storage(storage: SledStorage) -> (SledAdaptorLogStore, SledAdaptorStateMachine) {
    Adaptor::new(storage)
}
