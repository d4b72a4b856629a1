use crate::error::{Result, StoreError};
use crate::membership::Handler;
use crate::raft_api::PeerServer;
use crate::replicator::log_entry::Command;
use crate::replicator::network::PeerNetworkFactory;
use crate::replicator::snapshots::FileSnapshotStore;
use crate::replicator::state_machine::Fsm;
use crate::replicator::storage::{create_storage, node_id_for, KvNode, NodeIdType, SledStorage, TypeConfig};
use crate::replicator::stream::StreamLayer;
use crate::store::LocalStore;
use crate::types::{ServerDescriptor, StatusResponse};
use async_trait::async_trait;
use openraft::error::{ClientWriteError, RaftError};
use openraft::{ChangeMembers, Config, Membership, Raft, RaftMetrics, SnapshotPolicy};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub type KvRaft = Raft<TypeConfig>;

const LEADER_POLL_INTERVAL: Duration = Duration::from_secs(1);
const RAFT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

pub struct StorageConfig {
    pub node_name: String,
    /// Address peers and clients use to reach this node.
    pub rpc_addr: String,
    pub data_dir: PathBuf,
    pub bootstrap: bool,
    pub raft: Config,
    pub apply_timeout: Duration,
    pub dial_timeout: Duration,
    pub rpc_timeout: Duration,
    pub max_pool: usize,
    pub snapshot_retain: usize,
}

impl StorageConfig {
    pub fn new(
        node_name: impl Into<String>,
        rpc_addr: impl Into<String>,
        data_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            rpc_addr: rpc_addr.into(),
            data_dir: data_dir.into(),
            bootstrap: false,
            raft: default_raft_config(),
            apply_timeout: Duration::from_secs(30),
            dial_timeout: Duration::from_secs(10),
            rpc_timeout: Duration::from_secs(30),
            max_pool: 5,
            snapshot_retain: 3,
        }
    }
}

pub fn default_raft_config() -> Config {
    Config {
        heartbeat_interval: 500,
        election_timeout_min: 1500,
        election_timeout_max: 3000,
        snapshot_policy: SnapshotPolicy::LogsSinceLast(5000),
        ..Default::default()
    }
}

/// Replicated key-value storage: writes go through raft, reads are served
/// from the local store.
pub struct DistributedStorage {
    config: StorageConfig,
    node_id: NodeIdType,
    raft: KvRaft,
    storage: SledStorage,
    store: Arc<dyn LocalStore>,
    layer: Arc<StreamLayer>,
    peer_server: Mutex<Option<PeerServer>>,
    closed: AtomicBool,
}

impl DistributedStorage {
    pub async fn new(
        config: StorageConfig,
        store: Arc<dyn LocalStore>,
        layer: StreamLayer,
    ) -> Result<Self> {
        let node_id = node_id_for(&config.node_name);
        let raft_dir = config.data_dir.join("raft");
        std::fs::create_dir_all(&raft_dir)?;

        let fsm = Arc::new(Fsm::new(store.clone(), raft_dir.join("events.log"))?);
        let snapshots = Arc::new(FileSnapshotStore::new(
            raft_dir.join("snapshots"),
            config.snapshot_retain,
        )?);
        let storage = SledStorage::new(raft_dir.join("db"), fsm, snapshots)?;
        let has_state = storage.has_existing_state()?;

        let layer = Arc::new(layer);
        let network = PeerNetworkFactory::new(
            layer.clone(),
            config.max_pool,
            config.dial_timeout,
            config.rpc_timeout,
        );

        let raft_config = Arc::new(
            config
                .raft
                .clone()
                .validate()
                .map_err(|e| StoreError::Config(format!("invalid raft config: {}", e)))?,
        );
        let (log_store, state_machine) = create_storage(storage.clone());
        let raft = Raft::new(node_id, raft_config, network, log_store, state_machine)
            .await
            .map_err(|e| StoreError::Raft(e.to_string()))?;

        let peer_server = PeerServer::spawn(raft.clone(), layer.clone());

        if config.bootstrap && !has_state {
            let mut members = BTreeMap::new();
            members.insert(node_id, KvNode::new(&config.node_name, &config.rpc_addr));
            raft.initialize(members)
                .await
                .map_err(|e| StoreError::Raft(format!("bootstrap failed: {}", e)))?;
            info!("Bootstrapped cluster with {} at {}", config.node_name, config.rpc_addr);
        } else if config.bootstrap {
            info!("Existing raft state found, skipping bootstrap");
        }

        info!(
            "Distributed storage for {} (raft id {}) at {:?}",
            config.node_name, node_id, raft_dir
        );

        Ok(Self {
            config,
            node_id,
            raft,
            storage,
            store,
            layer,
            peer_server: Mutex::new(Some(peer_server)),
            closed: AtomicBool::new(false),
        })
    }

    pub fn raft(&self) -> &KvRaft {
        &self.raft
    }

    pub fn node_id(&self) -> NodeIdType {
        self.node_id
    }

    pub fn node_name(&self) -> &str {
        &self.config.node_name
    }

    pub fn rpc_addr(&self) -> &str {
        &self.config.rpc_addr
    }

    fn metrics(&self) -> RaftMetrics<NodeIdType, KvNode> {
        self.raft.metrics().borrow().clone()
    }

    fn membership(&self) -> Membership<NodeIdType, KvNode> {
        self.raft
            .metrics()
            .borrow()
            .membership_config
            .membership()
            .clone()
    }

    pub fn is_leader(&self) -> bool {
        self.metrics().current_leader == Some(self.node_id)
    }

    /// RPC address of the current leader, if one is known.
    pub fn leader_addr(&self) -> Option<String> {
        let metrics = self.metrics();
        let leader = metrics.current_leader?;
        metrics
            .membership_config
            .membership()
            .get_node(&leader)
            .map(|node| node.rpc_addr.clone())
    }

    fn ensure_leader(&self) -> Result<()> {
        if self.is_leader() {
            Ok(())
        } else {
            Err(StoreError::NotLeader {
                leader: self.leader_addr(),
            })
        }
    }

    pub async fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let entry = Command::set(key, value).encode()?;
        let resp = tokio::time::timeout(self.config.apply_timeout, self.raft.client_write(entry))
            .await
            .map_err(|_| StoreError::ApplyTimeout(self.config.apply_timeout))?
            .map_err(write_err)?;
        resp.data.into_result()
    }

    /// Local read; may trail the leader.
    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.store
            .get(key)?
            .ok_or_else(|| StoreError::NotFound(String::from_utf8_lossy(key).into_owned()))
    }

    pub async fn join(&self, name: &str, rpc_addr: &str) -> Result<()> {
        tokio::time::timeout(self.config.apply_timeout, self.add_voter(name, rpc_addr))
            .await
            .map_err(|_| StoreError::ApplyTimeout(self.config.apply_timeout))?
    }

    async fn add_voter(&self, name: &str, rpc_addr: &str) -> Result<()> {
        self.ensure_leader()?;

        let id = node_id_for(name);
        let membership = self.membership();
        let voters: BTreeSet<NodeIdType> = membership.voter_ids().collect();

        let mut stale_voters = BTreeSet::new();
        let mut stale_learners = BTreeSet::new();
        let mut learner_already = false;
        for (nid, node) in membership.nodes() {
            let same_id = *nid == id;
            let same_addr = node.rpc_addr == rpc_addr;
            if same_id && same_addr {
                if voters.contains(nid) {
                    debug!("{} at {} is already a voter", name, rpc_addr);
                    return Ok(());
                }
                learner_already = true;
            } else if same_id || same_addr {
                if voters.contains(nid) {
                    stale_voters.insert(*nid);
                } else {
                    stale_learners.insert(*nid);
                }
            }
        }

        if !stale_voters.is_empty() {
            info!("Removing voters {:?} conflicting with {} at {}", stale_voters, name, rpc_addr);
            self.raft
                .change_membership(ChangeMembers::RemoveVoters(stale_voters), false)
                .await
                .map_err(write_err)?;
        }
        if !stale_learners.is_empty() {
            info!("Removing learners {:?} conflicting with {} at {}", stale_learners, name, rpc_addr);
            self.raft
                .change_membership(ChangeMembers::RemoveNodes(stale_learners), false)
                .await
                .map_err(write_err)?;
        }

        if !learner_already {
            self.raft
                .add_learner(id, KvNode::new(name, rpc_addr), true)
                .await
                .map_err(write_err)?;
        }
        self.raft
            .change_membership(ChangeMembers::AddVoterIds(BTreeSet::from([id])), false)
            .await
            .map_err(write_err)?;

        info!("Added {} at {} as voter", name, rpc_addr);
        Ok(())
    }

    pub async fn leave(&self, name: &str) -> Result<()> {
        let id = node_id_for(name);
        let membership = self.membership();
        if membership.get_node(&id).is_none() {
            debug!("{} is not a member, nothing to remove", name);
            return Ok(());
        }
        self.ensure_leader()?;

        let is_voter = membership.voter_ids().any(|v| v == id);
        let change = if is_voter {
            ChangeMembers::RemoveVoters(BTreeSet::from([id]))
        } else {
            ChangeMembers::RemoveNodes(BTreeSet::from([id]))
        };

        tokio::time::timeout(self.config.apply_timeout, self.raft.change_membership(change, false))
            .await
            .map_err(|_| StoreError::ApplyTimeout(self.config.apply_timeout))?
            .map_err(write_err)?;

        info!("Removed {} from the cluster", name);
        Ok(())
    }

    pub async fn wait_for_leader(&self, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        let mut ticker = tokio::time::interval(LEADER_POLL_INTERVAL);

        loop {
            tokio::select! {
                _ = &mut deadline => return Err(StoreError::LeaderTimeout(timeout)),
                _ = ticker.tick() => {
                    if let Some(leader) = self.metrics().current_leader {
                        debug!("Leader is raft node {}", leader);
                        return Ok(());
                    }
                }
            }
        }
    }

    pub fn get_servers(&self) -> Vec<ServerDescriptor> {
        let leader_addr = self.leader_addr();
        let mut servers: Vec<ServerDescriptor> = self
            .membership()
            .nodes()
            .map(|(_, node)| ServerDescriptor {
                id: node.name.clone(),
                rpc_addr: node.rpc_addr.clone(),
                is_leader: leader_addr.as_deref() == Some(node.rpc_addr.as_str()),
            })
            .collect();
        servers.sort_by(|a, b| a.id.cmp(&b.id));
        servers
    }

    pub fn status(&self) -> StatusResponse {
        let metrics = self.metrics();
        StatusResponse {
            node_name: self.config.node_name.clone(),
            rpc_addr: self.config.rpc_addr.clone(),
            is_leader: metrics.current_leader == Some(self.node_id),
            leader: self.leader_addr(),
            term: metrics.current_term,
            last_applied: metrics.last_applied.map(|id| id.index),
        }
    }

    /// Stop raft, the peer listener and the stream layer, then flush and
    /// close the stores. Later calls are no-ops.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        match tokio::time::timeout(RAFT_SHUTDOWN_TIMEOUT, self.raft.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Raft shutdown failed: {}", e),
            Err(_) => warn!("Raft shutdown timed out after {:?}", RAFT_SHUTDOWN_TIMEOUT),
        }

        let peer_server = self.peer_server.lock().take();
        if let Some(server) = peer_server {
            server.stop().await;
        }
        self.layer.close();

        self.storage.flush()?;
        self.store.close()?;
        info!("Distributed storage for {} closed", self.config.node_name);
        Ok(())
    }
}

fn write_err(e: RaftError<NodeIdType, ClientWriteError<NodeIdType, KvNode>>) -> StoreError {
    match e {
        RaftError::APIError(ClientWriteError::ForwardToLeader(fwd)) => StoreError::NotLeader {
            leader: fwd.leader_node.map(|node| node.rpc_addr),
        },
        other => StoreError::Raft(other.to_string()),
    }
}

#[async_trait]
impl Handler for DistributedStorage {
    async fn join(&self, name: &str, rpc_addr: &str) -> Result<()> {
        DistributedStorage::join(self, name, rpc_addr).await
    }

    async fn leave(&self, name: &str) -> Result<()> {
        DistributedStorage::leave(self, name).await
    }
}
