use crate::error::{Result, StoreError};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Tag carrying the member's client/consensus address.
pub const RPC_ADDR_TAG: &str = "rpc_addr";

const MAX_DATAGRAM: usize = 64 * 1024;
/// Membership events buffered between the gossip loop and the handler.
const EVENT_QUEUE: usize = 256;

/// Receiver of membership changes. Errors are logged by the caller and
/// otherwise ignored.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn join(&self, name: &str, rpc_addr: &str) -> Result<()>;
    async fn leave(&self, name: &str) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberStatus {
    Alive,
    Left,
    /// Locally detected; never gossiped.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub name: String,
    pub addr: SocketAddr,
    pub tags: BTreeMap<String, String>,
    pub heartbeat: u64,
    pub status: MemberStatus,
}

impl Member {
    pub fn rpc_addr(&self) -> Option<&str> {
        self.tags.get(RPC_ADDR_TAG).map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Join,
    Leave,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberEvent {
    pub kind: EventKind,
    pub name: String,
    pub rpc_addr: String,
}

impl MemberEvent {
    fn new(kind: EventKind, member: &Member) -> Self {
        Self {
            kind,
            name: member.name.clone(),
            rpc_addr: member.rpc_addr().unwrap_or_default().to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MembershipConfig {
    pub node_name: String,
    pub bind_addr: String,
    /// Address other members should use to reach this node's gossip
    /// socket; defaults to the bound address.
    pub advertise_addr: Option<SocketAddr>,
    pub tags: BTreeMap<String, String>,
    pub start_join_addrs: Vec<String>,
    pub gossip_interval: Duration,
    pub fanout: usize,
    pub failure_timeout: Duration,
    pub reap_timeout: Duration,
    pub join_timeout: Duration,
    pub reconcile_interval: Duration,
}

impl MembershipConfig {
    pub fn new(node_name: impl Into<String>, bind_addr: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            bind_addr: bind_addr.into(),
            advertise_addr: None,
            tags: BTreeMap::new(),
            start_join_addrs: Vec::new(),
            gossip_interval: Duration::from_millis(200),
            fanout: 3,
            failure_timeout: Duration::from_secs(5),
            reap_timeout: Duration::from_secs(30),
            join_timeout: Duration::from_secs(5),
            reconcile_interval: Duration::from_secs(10),
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SyncMessage {
    from: String,
    members: Vec<Member>,
    reply: bool,
}

struct Entry {
    member: Member,
    last_progress: Instant,
    status_changed: Instant,
}

pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<MemberEvent>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn recv(&mut self) -> Option<MemberEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<MemberEvent> {
        self.rx.try_recv().ok()
    }
}

#[derive(Default)]
struct Subscribers {
    next_id: AtomicU64,
    senders: Mutex<HashMap<u64, mpsc::Sender<MemberEvent>>>,
}

impl Subscribers {
    fn subscribe(&self, capacity: usize) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.senders.lock().insert(id, tx);
        Subscription { id, rx }
    }

    fn unsubscribe(&self, id: u64) -> bool {
        self.senders.lock().remove(&id).is_some()
    }

    fn publish(&self, event: &MemberEvent) {
        let mut senders = self.senders.lock();
        senders.retain(|id, tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(subscriber = *id, "Subscriber queue full, dropping {:?} for {}", event.kind, event.name);
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}

struct Gossip {
    name: String,
    config: MembershipConfig,
    socket: UdpSocket,
    members: Mutex<HashMap<String, Entry>>,
    events: mpsc::Sender<MemberEvent>,
}

impl Gossip {
    fn emit(&self, kind: EventKind, member: &Member) {
        info!("Member {} {:?} ({})", member.name, kind, member.addr);
        match self.events.try_send(MemberEvent::new(kind, member)) {
            Ok(()) | Err(mpsc::error::TrySendError::Closed(_)) => {}
            Err(mpsc::error::TrySendError::Full(event)) => warn!(
                "Membership event queue full, dropping {:?} for {}",
                event.kind, event.name
            ),
        }
    }

    fn snapshot(&self) -> Vec<Member> {
        self.members
            .lock()
            .values()
            .filter(|e| e.member.status != MemberStatus::Failed)
            .map(|e| e.member.clone())
            .collect()
    }

    fn encode(&self, reply: bool) -> Result<Vec<u8>> {
        let msg = SyncMessage {
            from: self.name.clone(),
            members: self.snapshot(),
            reply,
        };
        Ok(serde_json::to_vec(&msg)?)
    }

    fn alive_peers(&self) -> Vec<Member> {
        self.members
            .lock()
            .values()
            .filter(|e| e.member.name != self.name && e.member.status == MemberStatus::Alive)
            .map(|e| e.member.clone())
            .collect()
    }

    /// Peers that left or were declared failed and whose tombstones have
    /// not expired yet.
    fn departed_peers(&self) -> Vec<Member> {
        self.members
            .lock()
            .values()
            .filter(|e| e.member.name != self.name && e.member.status != MemberStatus::Alive)
            .map(|e| e.member.clone())
            .collect()
    }

    /// One gossip round: bump our heartbeat, expire silent peers, drop old
    /// tombstones and pick the peers to push to.
    fn tick(&self, now: Instant) -> Vec<SocketAddr> {
        let mut members = self.members.lock();

        if let Some(local) = members.get_mut(&self.name) {
            local.member.heartbeat += 1;
            local.last_progress = now;
        }

        let mut failed = Vec::new();
        for entry in members.values_mut() {
            if entry.member.name == self.name || entry.member.status != MemberStatus::Alive {
                continue;
            }
            if now.duration_since(entry.last_progress) > self.config.failure_timeout {
                entry.member.status = MemberStatus::Failed;
                entry.status_changed = now;
                failed.push(entry.member.clone());
            }
        }

        members.retain(|name, entry| {
            let keep = name == &self.name
                || entry.member.status == MemberStatus::Alive
                || now.duration_since(entry.status_changed) <= self.config.reap_timeout;
            if !keep {
                debug!("Reaping member {}", name);
            }
            keep
        });

        let mut peers: Vec<SocketAddr> = members
            .values()
            .filter(|e| e.member.name != self.name && e.member.status == MemberStatus::Alive)
            .map(|e| e.member.addr)
            .collect();
        drop(members);

        for member in &failed {
            warn!("Member {} failed, no heartbeat for {:?}", member.name, self.config.failure_timeout);
            self.emit(EventKind::Leave, member);
        }

        peers.shuffle(&mut rand::thread_rng());
        peers.truncate(self.config.fanout);
        peers
    }

    fn merge(&self, msg: SyncMessage, src: SocketAddr, now: Instant) {
        let mut events = Vec::new();
        {
            let mut members = self.members.lock();
            for mut remote in msg.members {
                if remote.status == MemberStatus::Failed {
                    continue;
                }
                if remote.name == msg.from {
                    remote.addr = src;
                }

                if remote.name == self.name {
                    if let Some(local) = members.get_mut(&self.name) {
                        if remote.status != MemberStatus::Alive
                            && remote.heartbeat >= local.member.heartbeat
                            && local.member.status == MemberStatus::Alive
                        {
                            debug!("Refuting claim that {} left", self.name);
                            local.member.heartbeat = remote.heartbeat + 1;
                        }
                    }
                    continue;
                }

                match members.get_mut(&remote.name) {
                    None => {
                        if remote.status == MemberStatus::Alive {
                            events.push((EventKind::Join, remote.clone()));
                        }
                        members.insert(
                            remote.name.clone(),
                            Entry {
                                member: remote,
                                last_progress: now,
                                status_changed: now,
                            },
                        );
                    }
                    Some(entry) if remote.heartbeat > entry.member.heartbeat => {
                        let was_alive = entry.member.status == MemberStatus::Alive;
                        let is_alive = remote.status == MemberStatus::Alive;
                        if was_alive != is_alive {
                            entry.status_changed = now;
                            let kind = if is_alive { EventKind::Join } else { EventKind::Leave };
                            events.push((kind, remote.clone()));
                        }
                        entry.member = remote;
                        entry.last_progress = now;
                    }
                    Some(entry) => {
                        if entry.member.name == msg.from && entry.member.addr != src {
                            entry.member.addr = src;
                        }
                    }
                }
            }
        }

        for (kind, member) in &events {
            self.emit(*kind, member);
        }
    }

    async fn send(&self, addr: SocketAddr, bytes: &[u8]) {
        if let Err(e) = self.socket.send_to(bytes, addr).await {
            debug!("Gossip send to {} failed: {}", addr, e);
        }
    }

    async fn handle_datagram(&self, data: &[u8], src: SocketAddr) {
        let msg: SyncMessage = match serde_json::from_slice(data) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("Ignoring malformed gossip from {}: {}", src, e);
                return;
            }
        };
        let reply = msg.reply;
        self.merge(msg, src, Instant::now());

        if reply {
            match self.encode(false) {
                Ok(bytes) => self.send(src, &bytes).await,
                Err(e) => warn!("Failed to encode gossip reply: {}", e),
            }
        }
    }

    async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.gossip_interval);
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = ticker.tick() => {
                    let targets = self.tick(Instant::now());
                    if targets.is_empty() {
                        continue;
                    }
                    match self.encode(true) {
                        Ok(bytes) => {
                            for addr in targets {
                                self.send(addr, &bytes).await;
                            }
                        }
                        Err(e) => warn!("Failed to encode gossip: {}", e),
                    }
                }
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((n, src)) => self.handle_datagram(&buf[..n], src).await,
                    Err(e) => debug!("Gossip receive failed: {}", e),
                },
            }
        }
        debug!("Gossip loop for {} stopped", self.name);
    }
}

async fn dispatch(handler: &dyn Handler, event: &MemberEvent) {
    let result = match event.kind {
        EventKind::Join => {
            if event.rpc_addr.is_empty() {
                warn!("Member {} has no {} tag, not joining it", event.name, RPC_ADDR_TAG);
                return;
            }
            handler.join(&event.name, &event.rpc_addr).await
        }
        EventKind::Leave => handler.leave(&event.name).await,
    };

    match result {
        Ok(()) => debug!("Handled {:?} for {}", event.kind, event.name),
        Err(e) if e.is_not_leader() => {
            debug!("Skipping {:?} for {} on follower: {}", event.kind, event.name, e)
        }
        Err(e) => error!("Failed to handle {:?} for {}: {}", event.kind, event.name, e),
    }
}

async fn run_dispatcher(
    gossip: Arc<Gossip>,
    handler: Arc<dyn Handler>,
    subscribers: Arc<Subscribers>,
    mut events_rx: mpsc::Receiver<MemberEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let interval = gossip.config.reconcile_interval;
    let mut reconcile = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            event = events_rx.recv() => {
                let Some(event) = event else { break };
                subscribers.publish(&event);
                dispatch(handler.as_ref(), &event).await;
            }
            _ = reconcile.tick() => {
                // Replays refused or dropped events.
                for member in gossip.alive_peers() {
                    let event = MemberEvent::new(EventKind::Join, &member);
                    dispatch(handler.as_ref(), &event).await;
                }
                for member in gossip.departed_peers() {
                    let event = MemberEvent::new(EventKind::Leave, &member);
                    dispatch(handler.as_ref(), &event).await;
                }
            }
        }
    }
}

/// Gossip-based cluster membership. Join and leave events for other
/// members are delivered to the registered [`Handler`] and to any
/// subscribers.
pub struct Membership {
    gossip: Arc<Gossip>,
    subscribers: Arc<Subscribers>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl Membership {
    pub async fn new(handler: Arc<dyn Handler>, config: MembershipConfig) -> Result<Self> {
        let socket = UdpSocket::bind(&config.bind_addr).await.map_err(|e| {
            StoreError::Membership(format!("failed to bind gossip socket {}: {}", config.bind_addr, e))
        })?;
        let local_addr = config.advertise_addr.unwrap_or(socket.local_addr()?);

        let now = Instant::now();
        let local = Member {
            name: config.node_name.clone(),
            addr: local_addr,
            tags: config.tags.clone(),
            // Starting from wall-clock millis lets a restarted node outrank
            // its own tombstone.
            heartbeat: chrono::Utc::now().timestamp_millis().max(1) as u64,
            status: MemberStatus::Alive,
        };
        let mut members = HashMap::new();
        members.insert(
            local.name.clone(),
            Entry {
                member: local,
                last_progress: now,
                status_changed: now,
            },
        );

        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        let (shutdown_tx, _) = watch::channel(false);
        let seeds = config.start_join_addrs.clone();
        let join_timeout = config.join_timeout;

        let gossip = Arc::new(Gossip {
            name: config.node_name.clone(),
            config,
            socket,
            members: Mutex::new(members),
            events: events_tx,
        });
        let subscribers = Arc::new(Subscribers::default());

        let tasks = vec![
            tokio::spawn(gossip.clone().run(shutdown_tx.subscribe())),
            tokio::spawn(run_dispatcher(
                gossip.clone(),
                handler,
                subscribers.clone(),
                events_rx,
                shutdown_tx.subscribe(),
            )),
        ];

        let membership = Self {
            gossip,
            subscribers,
            shutdown_tx,
            tasks: Mutex::new(tasks),
            stopped: AtomicBool::new(false),
        };

        info!("Gossip for {} listening on {}", membership.gossip.name, local_addr);

        if !seeds.is_empty() {
            if let Err(e) = membership.join_seeds(&seeds, join_timeout).await {
                membership.shutdown().await;
                return Err(e);
            }
        }

        Ok(membership)
    }

    async fn join_seeds(&self, seeds: &[String], timeout: Duration) -> Result<()> {
        let mut targets = Vec::new();
        for seed in seeds {
            match tokio::net::lookup_host(seed.as_str()).await {
                Ok(addrs) => targets.extend(addrs.filter(|a| *a != self.local_addr())),
                Err(e) => warn!("Failed to resolve seed {}: {}", seed, e),
            }
        }
        if targets.is_empty() {
            return Err(StoreError::Membership(format!(
                "none of the seeds {:?} could be resolved",
                seeds
            )));
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let bytes = self.gossip.encode(true)?;
            for addr in &targets {
                self.gossip.send(*addr, &bytes).await;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;

            if !self.gossip.alive_peers().is_empty() {
                info!("Joined cluster through {:?}", seeds);
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(StoreError::Membership(format!(
                    "no seed of {:?} answered within {:?}",
                    seeds, timeout
                )));
            }
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.gossip
            .members
            .lock()
            .get(&self.gossip.name)
            .map(|e| e.member.addr)
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)))
    }

    pub fn name(&self) -> &str {
        &self.gossip.name
    }

    /// Every known member, this node included, sorted by name.
    pub fn members(&self) -> Vec<Member> {
        let mut members: Vec<Member> = self
            .gossip
            .members
            .lock()
            .values()
            .map(|e| e.member.clone())
            .collect();
        members.sort_by(|a, b| a.name.cmp(&b.name));
        members
    }

    pub fn subscribe(&self, capacity: usize) -> Subscription {
        self.subscribers.subscribe(capacity)
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        self.subscribers.unsubscribe(id)
    }

    /// Tell the cluster this node is going away, then stop gossiping.
    pub async fn leave(&self) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Ok(());
        }

        let peers = self.gossip.alive_peers();
        {
            let mut members = self.gossip.members.lock();
            if let Some(local) = members.get_mut(&self.gossip.name) {
                local.member.status = MemberStatus::Left;
                local.member.heartbeat += 1;
            }
        }

        let bytes = self.gossip.encode(false)?;
        for peer in &peers {
            self.gossip.send(peer.addr, &bytes).await;
        }
        info!("{} left the cluster ({} peers notified)", self.gossip.name, peers.len());

        self.shutdown().await;
        Ok(())
    }

    /// Stop without announcing; peers will eventually see this node fail.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown_tx.send_replace(true);
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
            let _ = task.await;
        }
    }
}

impl Drop for Membership {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
    }
}
