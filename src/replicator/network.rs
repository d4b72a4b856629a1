use crate::error::{Result, StoreError};
use crate::replicator::storage::{KvNode, NodeIdType, TypeConfig};
use crate::replicator::stream::{PeerConn, StreamLayer};
use openraft::error::{InstallSnapshotError, NetworkError, RPCError, RaftError, RemoteError};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

#[derive(Debug, Serialize, Deserialize)]
pub enum PeerRequest {
    AppendEntries(AppendEntriesRequest<TypeConfig>),
    Vote(VoteRequest<NodeIdType>),
    InstallSnapshot(InstallSnapshotRequest<TypeConfig>),
}

#[derive(Debug, Serialize, Deserialize)]
pub enum PeerResponse {
    AppendEntries(std::result::Result<AppendEntriesResponse<NodeIdType>, RaftError<NodeIdType>>),
    Vote(std::result::Result<VoteResponse<NodeIdType>, RaftError<NodeIdType>>),
    InstallSnapshot(
        std::result::Result<
            InstallSnapshotResponse<NodeIdType>,
            RaftError<NodeIdType, InstallSnapshotError>,
        >,
    ),
}

pub async fn write_frame<W, T>(w: &mut W, msg: &T) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
    T: Serialize,
{
    let body = serde_json::to_vec(msg)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(StoreError::Codec(format!("frame too large: {} bytes", body.len())));
    }
    w.write_all(&(body.len() as u32).to_be_bytes()).await?;
    w.write_all(&body).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_frame<R, T>(r: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin + ?Sized,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(StoreError::Codec(format!("frame too large: {} bytes", len)));
    }
    let mut body = vec![0u8; len];
    r.read_exact(&mut body).await?;
    Ok(serde_json::from_slice(&body)?)
}

/// Idle peer connections keyed by address.
struct ConnPool {
    idle: Mutex<HashMap<String, Vec<PeerConn>>>,
    max_idle: usize,
}

impl ConnPool {
    fn new(max_idle: usize) -> Self {
        Self {
            idle: Mutex::new(HashMap::new()),
            max_idle,
        }
    }

    fn take(&self, addr: &str) -> Option<PeerConn> {
        self.idle.lock().get_mut(addr).and_then(|conns| conns.pop())
    }

    fn put(&self, addr: &str, conn: PeerConn) {
        let mut idle = self.idle.lock();
        let conns = idle.entry(addr.to_string()).or_default();
        if conns.len() < self.max_idle {
            conns.push(conn);
        }
    }
}

#[derive(Clone)]
pub struct PeerNetworkFactory {
    layer: Arc<StreamLayer>,
    pool: Arc<ConnPool>,
    dial_timeout: Duration,
    rpc_timeout: Duration,
}

impl PeerNetworkFactory {
    pub fn new(
        layer: Arc<StreamLayer>,
        max_pool: usize,
        dial_timeout: Duration,
        rpc_timeout: Duration,
    ) -> Self {
        Self {
            layer,
            pool: Arc::new(ConnPool::new(max_pool)),
            dial_timeout,
            rpc_timeout,
        }
    }
}

pub struct PeerNetwork {
    target: NodeIdType,
    target_addr: String,
    layer: Arc<StreamLayer>,
    pool: Arc<ConnPool>,
    dial_timeout: Duration,
    rpc_timeout: Duration,
}

impl PeerNetwork {
    async fn roundtrip(&self, conn: &mut PeerConn, req: &PeerRequest) -> Result<PeerResponse> {
        tokio::time::timeout(self.rpc_timeout, async {
            write_frame(&mut *conn, req).await?;
            read_frame(&mut *conn).await
        })
        .await
        .map_err(|_| {
            StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("rpc to {} timed out", self.target_addr),
            ))
        })?
    }

    /// Send one request, reusing an idle connection when there is one. A
    /// pooled connection that fails is discarded and the request is retried
    /// once on a fresh dial.
    async fn call(&self, req: PeerRequest) -> Result<PeerResponse> {
        if let Some(mut conn) = self.pool.take(&self.target_addr) {
            match self.roundtrip(&mut conn, &req).await {
                Ok(resp) => {
                    self.pool.put(&self.target_addr, conn);
                    return Ok(resp);
                }
                Err(e) => debug!("Pooled connection to {} failed, redialing: {}", self.target_addr, e),
            }
        }

        let mut conn = self.layer.dial(&self.target_addr, self.dial_timeout).await?;
        let resp = self.roundtrip(&mut conn, &req).await?;
        self.pool.put(&self.target_addr, conn);
        Ok(resp)
    }

    fn unexpected<E: std::error::Error>(&self, what: &str) -> RPCError<NodeIdType, KvNode, E> {
        RPCError::Network(NetworkError::new(&StoreError::Codec(format!(
            "unexpected response to {} from {}",
            what, self.target_addr
        ))))
    }
}

fn network_err<E: std::error::Error>(e: StoreError) -> RPCError<NodeIdType, KvNode, E> {
    RPCError::Network(NetworkError::new(&e))
}

impl RaftNetworkFactory<TypeConfig> for PeerNetworkFactory {
    type Network = PeerNetwork;

    async fn new_client(&mut self, target: NodeIdType, node: &KvNode) -> Self::Network {
        PeerNetwork {
            target,
            target_addr: node.rpc_addr.clone(),
            layer: self.layer.clone(),
            pool: self.pool.clone(),
            dial_timeout: self.dial_timeout,
            rpc_timeout: self.rpc_timeout,
        }
    }
}

impl RaftNetwork<TypeConfig> for PeerNetwork {
    async fn append_entries(
        &mut self,
        req: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> std::result::Result<
        AppendEntriesResponse<NodeIdType>,
        RPCError<NodeIdType, KvNode, RaftError<NodeIdType>>,
    > {
        match self.call(PeerRequest::AppendEntries(req)).await.map_err(network_err)? {
            PeerResponse::AppendEntries(resp) => {
                resp.map_err(|e| RPCError::RemoteError(RemoteError::new(self.target, e)))
            }
            _ => Err(self.unexpected("append_entries")),
        }
    }

    async fn install_snapshot(
        &mut self,
        req: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> std::result::Result<
        InstallSnapshotResponse<NodeIdType>,
        RPCError<NodeIdType, KvNode, RaftError<NodeIdType, InstallSnapshotError>>,
    > {
        match self.call(PeerRequest::InstallSnapshot(req)).await.map_err(network_err)? {
            PeerResponse::InstallSnapshot(resp) => {
                resp.map_err(|e| RPCError::RemoteError(RemoteError::new(self.target, e)))
            }
            _ => Err(self.unexpected("install_snapshot")),
        }
    }

    async fn vote(
        &mut self,
        req: VoteRequest<NodeIdType>,
        _option: RPCOption,
    ) -> std::result::Result<
        VoteResponse<NodeIdType>,
        RPCError<NodeIdType, KvNode, RaftError<NodeIdType>>,
    > {
        match self.call(PeerRequest::Vote(req)).await.map_err(network_err)? {
            PeerResponse::Vote(resp) => {
                resp.map_err(|e| RPCError::RemoteError(RemoteError::new(self.target, e)))
            }
            _ => Err(self.unexpected("vote")),
        }
    }
}
