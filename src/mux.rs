use crate::error::{Result, StoreError};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Connections a sub-listener queues before the mux starts dropping them.
pub const SUB_LISTENER_BACKLOG: usize = 128;
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);

pub type Routed = (TcpStream, SocketAddr);

/// Connections routed to one protocol by the [`Mux`]. The routing byte is
/// only peeked, so it is still the first byte a consumer reads.
pub struct SubListener {
    rx: Mutex<mpsc::Receiver<Routed>>,
    local_addr: SocketAddr,
    closed: watch::Sender<bool>,
}

impl SubListener {
    fn new(rx: mpsc::Receiver<Routed>, local_addr: SocketAddr, closed: watch::Sender<bool>) -> Self {
        Self {
            rx: Mutex::new(rx),
            local_addr,
            closed,
        }
    }

    pub async fn accept(&self) -> Result<Routed> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Err(StoreError::Closed);
        }
        let mut rx = self.rx.lock().await;
        tokio::select! {
            conn = rx.recv() => conn.ok_or(StoreError::Closed),
            _ = closed.wait_for(|c| *c) => Err(StoreError::Closed),
        }
    }

    /// Stop accepting. Queued connections are dropped and the mux drops
    /// any further ones routed here.
    pub fn close(&self) {
        self.closed.send_replace(true);
        if let Ok(mut rx) = self.rx.try_lock() {
            rx.close();
            while rx.try_recv().is_ok() {}
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

struct Route {
    tx: mpsc::Sender<Routed>,
    closed: watch::Receiver<bool>,
}

impl Route {
    fn channel(local_addr: SocketAddr) -> (Self, SubListener) {
        let (tx, rx) = mpsc::channel(SUB_LISTENER_BACKLOG);
        let (closed_tx, closed) = watch::channel(false);
        (Self { tx, closed }, SubListener::new(rx, local_addr, closed_tx))
    }

    fn deliver(&self, stream: TcpStream, peer: SocketAddr) {
        if *self.closed.borrow() {
            debug!("Sub-listener closed, dropping connection from {}", peer);
            return;
        }
        match self.tx.try_send((stream, peer)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Sub-listener backlog full, dropping connection from {}", peer)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Sub-listener gone, dropping connection from {}", peer)
            }
        }
    }
}

struct Routes {
    by_first_byte: Vec<(u8, Route)>,
    fallback: Option<Route>,
    read_timeout: Duration,
}

impl Routes {
    async fn dispatch(&self, stream: TcpStream, peer: SocketAddr) {
        let mut buf = [0u8; 1];
        let n = match tokio::time::timeout(self.read_timeout, stream.peek(&mut buf)).await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                debug!("Failed to read first byte from {}: {}", peer, e);
                return;
            }
            Err(_) => {
                debug!("Timed out waiting for first byte from {}", peer);
                return;
            }
        };
        if n == 0 {
            debug!("Connection from {} closed before sending data", peer);
            return;
        }

        let target = self
            .by_first_byte
            .iter()
            .find(|(byte, _)| *byte == buf[0])
            .map(|(_, route)| route)
            .or(self.fallback.as_ref());

        match target {
            Some(route) => route.deliver(stream, peer),
            None => debug!("No route for connection from {} (first byte {:#04x})", peer, buf[0]),
        }
    }
}

/// Splits one TCP listener into sub-listeners keyed on the first byte of
/// each connection, with an optional catch-all.
pub struct Mux {
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    by_first_byte: Vec<(u8, Route)>,
    fallback: Option<Route>,
    read_timeout: Duration,
    shutdown_tx: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl Mux {
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Self::new(listener)
    }

    pub fn new(listener: TcpListener) -> Result<Self> {
        let local_addr = listener.local_addr()?;
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            listener: Some(listener),
            local_addr,
            by_first_byte: Vec::new(),
            fallback: None,
            read_timeout: DEFAULT_READ_TIMEOUT,
            shutdown_tx,
            handle: None,
        })
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn match_first_byte(&mut self, byte: u8) -> SubListener {
        let (route, listener) = Route::channel(self.local_addr);
        self.by_first_byte.push((byte, route));
        listener
    }

    /// Catch-all for connections no other matcher claimed.
    pub fn any(&mut self) -> SubListener {
        let (route, listener) = Route::channel(self.local_addr);
        self.fallback = Some(route);
        listener
    }

    /// Start routing. Matchers registered after this call are never fed.
    pub fn serve(&mut self) -> Result<()> {
        let listener = self
            .listener
            .take()
            .ok_or_else(|| StoreError::Config("mux already serving".to_string()))?;

        let routes = Arc::new(Routes {
            by_first_byte: std::mem::take(&mut self.by_first_byte),
            fallback: self.fallback.take(),
            read_timeout: self.read_timeout,
        });
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let local_addr = self.local_addr;

        self.handle = Some(tokio::spawn(async move {
            info!("Mux serving on {}", local_addr);
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            let routes = routes.clone();
                            tokio::spawn(async move {
                                routes.dispatch(stream, peer).await;
                            });
                        }
                        Err(e) => {
                            warn!("Mux accept failed: {}", e);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    },
                    _ = shutdown_rx.changed() => break,
                }
            }
            info!("Mux on {} stopped", local_addr);
        }));

        Ok(())
    }

    pub fn close(&mut self) {
        self.shutdown_tx.send_replace(true);
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
        self.by_first_byte.clear();
        self.fallback = None;
        self.listener = None;
    }
}

impl Drop for Mux {
    fn drop(&mut self) {
        self.close();
    }
}
