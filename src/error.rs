use std::time::Duration;
use thiserror::Error;

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("key not found: {0}")]
    NotFound(String),

    /// Writes and membership changes are only accepted by the leader.
    #[error("not the leader, leader is {}", .leader.as_deref().unwrap_or("unknown"))]
    NotLeader { leader: Option<String> },

    #[error("apply timed out after {0:?}")]
    ApplyTimeout(Duration),

    #[error("no leader elected within {0:?}")]
    LeaderTimeout(Duration),

    /// The state machine rejected a committed entry.
    #[error("apply failed: {0}")]
    Apply(String),

    #[error("failed to dial {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("not a raft rpc connection (first byte {0:#04x})")]
    ProtocolMismatch(u8),

    #[error("unknown request type {0}")]
    UnknownRequestType(u8),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("raft error: {0}")]
    Raft(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("snapshot error: {0}")]
    Snapshot(String),

    #[error("membership error: {0}")]
    Membership(String),

    #[error("tls error: {0}")]
    Tls(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("closed")]
    Closed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub fn is_not_leader(&self) -> bool {
        matches!(self, StoreError::NotLeader { .. })
    }
}

impl From<sled::Error> for StoreError {
    fn from(e: sled::Error) -> Self {
        StoreError::Storage(e.to_string())
    }
}

impl From<bincode::Error> for StoreError {
    fn from(e: bincode::Error) -> Self {
        StoreError::Codec(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Codec(e.to_string())
    }
}
