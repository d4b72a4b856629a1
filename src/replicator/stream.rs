use crate::error::{Result, StoreError};
use crate::mux::SubListener;
use rustls::pki_types::ServerName;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::debug;

/// First byte of every consensus connection on the shared port.
pub const RAFT_RPC: u8 = 1;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

pub trait PeerIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> PeerIo for T {}

/// A consensus connection, plain TCP or TLS-wrapped.
pub type PeerConn = Box<dyn PeerIo>;

struct ClientTls {
    connector: TlsConnector,
    server_name: Option<String>,
}

/// Consensus transport over the multiplexed port. Outbound connections are
/// tagged with [`RAFT_RPC`]; inbound ones come from the mux sub-listener
/// and must carry the same tag.
pub struct StreamLayer {
    listener: SubListener,
    server_tls: Option<TlsAcceptor>,
    client_tls: Option<ClientTls>,
}

impl StreamLayer {
    pub fn new(listener: SubListener) -> Self {
        Self {
            listener,
            server_tls: None,
            client_tls: None,
        }
    }

    pub fn with_server_tls(mut self, config: Arc<rustls::ServerConfig>) -> Self {
        self.server_tls = Some(TlsAcceptor::from(config));
        self
    }

    /// `server_name` overrides the name checked against the peer's
    /// certificate; by default the host part of the dialed address is used.
    pub fn with_client_tls(
        mut self,
        config: Arc<rustls::ClientConfig>,
        server_name: Option<String>,
    ) -> Self {
        self.client_tls = Some(ClientTls {
            connector: TlsConnector::from(config),
            server_name,
        });
        self
    }

    pub fn is_tls(&self) -> bool {
        self.server_tls.is_some() || self.client_tls.is_some()
    }

    pub async fn dial(&self, addr: &str, timeout: Duration) -> Result<PeerConn> {
        let dial_err = |source: io::Error| StoreError::Dial {
            addr: addr.to_string(),
            source,
        };

        let mut stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| dial_err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")))?
            .map_err(dial_err)?;
        let _ = stream.set_nodelay(true);
        stream.write_all(&[RAFT_RPC]).await.map_err(dial_err)?;

        let Some(tls) = &self.client_tls else {
            return Ok(Box::new(stream));
        };

        let name = tls
            .server_name
            .clone()
            .unwrap_or_else(|| host_of(addr).to_string());
        let server_name = ServerName::try_from(name)
            .map_err(|e| StoreError::Tls(format!("invalid server name for {}: {}", addr, e)))?;

        let stream = tokio::time::timeout(timeout, tls.connector.connect(server_name, stream))
            .await
            .map_err(|_| dial_err(io::Error::new(io::ErrorKind::TimedOut, "tls handshake timed out")))?
            .map_err(dial_err)?;
        Ok(Box::new(stream))
    }

    /// Take the next inbound connection off the sub-listener without doing
    /// any I/O on it. The marker check and TLS handshake happen in
    /// [`Incoming::establish`], so a stalled peer only holds up its own task.
    pub async fn accept_incoming(&self) -> Result<Incoming> {
        let (stream, peer) = self.listener.accept().await?;
        Ok(Incoming {
            stream,
            peer,
            acceptor: self.server_tls.clone(),
        })
    }

    pub async fn accept(&self) -> Result<(PeerConn, SocketAddr)> {
        let incoming = self.accept_incoming().await?;
        let peer = incoming.peer_addr();
        Ok((incoming.establish().await?, peer))
    }

    pub fn close(&self) {
        self.listener.close();
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }
}

/// Inbound connection whose marker byte and TLS handshake are still pending.
pub struct Incoming {
    stream: TcpStream,
    peer: SocketAddr,
    acceptor: Option<TlsAcceptor>,
}

impl Incoming {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub async fn establish(self) -> Result<PeerConn> {
        let Self {
            mut stream,
            peer,
            acceptor,
        } = self;

        let mut marker = [0u8; 1];
        tokio::time::timeout(HANDSHAKE_TIMEOUT, stream.read_exact(&mut marker))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "no marker byte"))??;
        if marker[0] != RAFT_RPC {
            return Err(StoreError::ProtocolMismatch(marker[0]));
        }
        let _ = stream.set_nodelay(true);

        let Some(acceptor) = acceptor else {
            return Ok(Box::new(stream));
        };

        debug!("TLS handshake with peer {}", peer);
        let stream = tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream))
            .await
            .map_err(|_| StoreError::Tls(format!("handshake with {} timed out", peer)))?
            .map_err(|e| StoreError::Tls(format!("handshake with {} failed: {}", peer, e)))?;
        Ok(Box::new(stream))
    }
}

fn host_of(addr: &str) -> &str {
    let host = addr.rsplit_once(':').map(|(h, _)| h).unwrap_or(addr);
    host.trim_start_matches('[').trim_end_matches(']')
}

