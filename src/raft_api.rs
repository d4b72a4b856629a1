use crate::error::StoreError;
use crate::replicator::{read_frame, write_frame, KvRaft, PeerConn, PeerRequest, PeerResponse, StreamLayer};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Accept loop feeding inbound consensus connections into the local raft.
pub struct PeerServer {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl PeerServer {
    pub fn spawn(raft: KvRaft, layer: Arc<StreamLayer>) -> Self {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            info!("Peer RPC server listening on {}", layer.local_addr());
            loop {
                tokio::select! {
                    accepted = layer.accept_incoming() => match accepted {
                        Ok(incoming) => {
                            let raft = raft.clone();
                            tokio::spawn(async move {
                                let peer = incoming.peer_addr();
                                match incoming.establish().await {
                                    Ok(conn) => serve_conn(raft, conn, peer).await,
                                    Err(e) => warn!("Rejected peer connection from {}: {}", peer, e),
                                }
                            });
                        }
                        Err(StoreError::Closed) => break,
                        Err(e) => warn!("Rejected peer connection: {}", e),
                    },
                    _ = shutdown_rx.changed() => break,
                }
            }
            debug!("Peer RPC server stopped");
        });

        Self { shutdown_tx, handle }
    }

    pub async fn stop(self) {
        self.shutdown_tx.send_replace(true);
        let _ = self.handle.await;
    }
}

async fn serve_conn(raft: KvRaft, mut conn: PeerConn, peer: SocketAddr) {
    loop {
        let req: PeerRequest = match read_frame(&mut conn).await {
            Ok(req) => req,
            Err(StoreError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                debug!("Peer {} closed connection", peer);
                return;
            }
            Err(e) => {
                warn!("Bad frame from peer {}: {}", peer, e);
                return;
            }
        };

        let resp = handle_request(&raft, req).await;

        if let Err(e) = write_frame(&mut conn, &resp).await {
            debug!("Failed to respond to peer {}: {}", peer, e);
            return;
        }
    }
}

async fn handle_request(raft: &KvRaft, req: PeerRequest) -> PeerResponse {
    match req {
        PeerRequest::AppendEntries(req) => PeerResponse::AppendEntries(raft.append_entries(req).await),
        PeerRequest::Vote(req) => PeerResponse::Vote(raft.vote(req).await),
        PeerRequest::InstallSnapshot(req) => {
            PeerResponse::InstallSnapshot(raft.install_snapshot(req).await)
        }
    }
}
