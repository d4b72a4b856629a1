use crate::api::create_router;
use crate::config::NodeConfig;
use crate::error::{Result as StoreResult, StoreError};
use crate::membership::{Handler, Member, Membership, MembershipConfig, RPC_ADDR_TAG};
use crate::mux::{Mux, SubListener};
use crate::replicator::{DistributedStorage, StorageConfig, StreamLayer, RAFT_RPC};
use crate::store::{LocalStore, SledStore};
use crate::tls::TlsMaterial;
use crate::types::{ServerDescriptor, StatusResponse};
use anyhow::Result;
use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

const BOOTSTRAP_LEADER_WAIT: Duration = Duration::from_secs(3);

/// One node: the multiplexed port, replicated storage, gossip membership
/// and the client RPC surface.
pub struct Server {
    node_name: String,
    rpc_addr: String,
    storage: Arc<DistributedStorage>,
    membership: Membership,
    mux: Mutex<Mux>,
    rpc_task: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
    closed: tokio::sync::Mutex<bool>,
}

impl Server {
    pub async fn start(config: NodeConfig) -> Result<Arc<Self>> {
        let node_name = config.effective_node_name();
        let tls = TlsMaterial::from_settings(&config.tls)?;

        let mut mux = Mux::bind(&config.rpc_bind_addr()).await?;
        let rpc_addr = format!("{}:{}", config.advertise_host(), mux.local_addr().port());
        let raft_listener = mux.match_first_byte(RAFT_RPC);
        let rpc_listener = mux.any();
        mux.serve()?;

        info!("Starting {} with rpc address {}", node_name, rpc_addr);

        let storage = match Self::setup_storage(&config, &node_name, &rpc_addr, raft_listener, tls.as_ref()).await {
            Ok(storage) => storage,
            Err(e) => {
                mux.close();
                return Err(e);
            }
        };

        let membership = match Self::setup_membership(&config, &node_name, &rpc_addr, storage.clone()).await {
            Ok(membership) => membership,
            Err(e) => {
                let _ = storage.close().await;
                mux.close();
                return Err(e);
            }
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = Arc::new(Self {
            node_name,
            rpc_addr,
            storage,
            membership,
            mux: Mutex::new(mux),
            rpc_task: Mutex::new(None),
            shutdown_tx,
            closed: tokio::sync::Mutex::new(false),
        });

        let rpc_tls = match (&tls, config.tls.rpc) {
            (Some(tls), true) => Some(TlsAcceptor::from(tls.server.clone())),
            _ => None,
        };
        let task = serve_rpc(create_router(server.clone()), rpc_listener, rpc_tls, shutdown_rx);
        *server.rpc_task.lock() = Some(task);

        info!("{} ready", server.node_name);
        Ok(server)
    }

    async fn setup_storage(
        config: &NodeConfig,
        node_name: &str,
        rpc_addr: &str,
        raft_listener: SubListener,
        tls: Option<&TlsMaterial>,
    ) -> Result<Arc<DistributedStorage>> {
        std::fs::create_dir_all(&config.data_dir)?;
        let store: Arc<dyn LocalStore> = Arc::new(SledStore::open(config.data_dir.join("store"))?);

        let mut layer = StreamLayer::new(raft_listener);
        if let (Some(tls), true) = (tls, config.tls.peer) {
            layer = layer
                .with_server_tls(tls.server.clone())
                .with_client_tls(tls.client.clone(), config.tls.server_name.clone());
        }

        let mut storage_config = StorageConfig::new(node_name, rpc_addr, &config.data_dir);
        storage_config.bootstrap = config.bootstrap;
        storage_config.raft = config.raft.to_raft_config();
        storage_config.apply_timeout = config.raft.apply_timeout();
        storage_config.max_pool = config.raft.max_pool;
        storage_config.snapshot_retain = config.raft.snapshot_retain;

        let storage = Arc::new(DistributedStorage::new(storage_config, store, layer).await?);

        if config.bootstrap {
            if let Err(e) = storage.wait_for_leader(BOOTSTRAP_LEADER_WAIT).await {
                let _ = storage.close().await;
                return Err(e.into());
            }
        }
        Ok(storage)
    }

    async fn setup_membership(
        config: &NodeConfig,
        node_name: &str,
        rpc_addr: &str,
        storage: Arc<DistributedStorage>,
    ) -> Result<Membership> {
        let mut membership_config =
            MembershipConfig::new(node_name, &config.bind_addr).with_tag(RPC_ADDR_TAG, rpc_addr);
        membership_config.start_join_addrs = config.start_join_addrs.clone();
        membership_config.gossip_interval = Duration::from_millis(config.gossip.interval_ms);
        membership_config.fanout = config.gossip.fanout;
        membership_config.failure_timeout = Duration::from_millis(config.gossip.failure_timeout_ms);
        membership_config.reap_timeout = Duration::from_secs(config.gossip.reap_timeout_secs);
        membership_config.join_timeout = Duration::from_secs(config.gossip.join_timeout_secs);
        membership_config.reconcile_interval =
            Duration::from_secs(config.gossip.reconcile_interval_secs);

        let bind_ip_unspecified = config
            .bind_addr
            .parse::<SocketAddr>()
            .map(|addr| addr.ip().is_unspecified() && addr.port() != 0)
            .unwrap_or(false);
        if bind_ip_unspecified {
            let port = config.bind_addr.rsplit_once(':').map(|(_, p)| p).unwrap_or_default();
            membership_config.advertise_addr = format!("{}:{}", config.advertise_host(), port).parse().ok();
        }

        let handler: Arc<dyn Handler> = storage;
        Ok(Membership::new(handler, membership_config).await?)
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// Advertised address of the multiplexed port.
    pub fn rpc_addr(&self) -> &str {
        &self.rpc_addr
    }

    pub fn gossip_addr(&self) -> SocketAddr {
        self.membership.local_addr()
    }

    pub fn storage(&self) -> &Arc<DistributedStorage> {
        &self.storage
    }

    pub fn membership(&self) -> &Membership {
        &self.membership
    }

    pub fn get(&self, key: &[u8]) -> StoreResult<Vec<u8>> {
        self.storage.get(key)
    }

    pub async fn set(&self, key: &[u8], value: &[u8]) -> StoreResult<()> {
        self.storage.set(key, value).await
    }

    pub fn get_servers(&self) -> Vec<ServerDescriptor> {
        self.storage.get_servers()
    }

    pub fn status(&self) -> StatusResponse {
        self.storage.status()
    }

    pub fn members(&self) -> Vec<Member> {
        self.membership.members()
    }

    /// Leave the cluster, close storage, then release the port. Safe to
    /// call more than once.
    pub async fn close(&self) -> StoreResult<()> {
        let mut closed = self.closed.lock().await;
        if *closed {
            return Ok(());
        }
        *closed = true;

        info!("Shutting down {}", self.node_name);

        if let Err(e) = self.membership.leave().await {
            warn!("Failed to leave gossip cluster: {}", e);
        }

        self.shutdown_tx.send_replace(true);
        let rpc_task = self.rpc_task.lock().take();
        if let Some(task) = rpc_task {
            task.abort();
        }

        self.storage.close().await?;
        self.mux.lock().close();

        info!("{} stopped", self.node_name);
        Ok(())
    }
}

fn serve_rpc(
    router: Router,
    listener: SubListener,
    tls: Option<TlsAcceptor>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Client RPC listening on {}", listener.local_addr());
        loop {
            let (stream, peer) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(StoreError::Closed) => break,
                    Err(e) => {
                        warn!("RPC accept failed: {}", e);
                        continue;
                    }
                },
                _ = shutdown_rx.changed() => break,
            };

            let router = router.clone();
            let tls = tls.clone();
            tokio::spawn(async move {
                let service = TowerToHyperService::new(router);
                let builder = auto::Builder::new(TokioExecutor::new());
                let result = match tls {
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(stream) => builder.serve_connection(TokioIo::new(stream), service).await,
                        Err(e) => {
                            debug!("TLS handshake with client {} failed: {}", peer, e);
                            return;
                        }
                    },
                    None => builder.serve_connection(TokioIo::new(stream), service).await,
                };
                if let Err(e) = result {
                    debug!("RPC connection from {} ended: {}", peer, e);
                }
            });
        }
        listener.close();
        debug!("Client RPC server stopped");
    })
}
