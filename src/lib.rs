pub mod api;
pub mod config;
pub mod error;
pub mod membership;
pub mod mux;
pub mod raft_api;
pub mod replicator;
pub mod server;
pub mod store;
pub mod tls;
pub mod types;

pub use api::create_router;
pub use config::NodeConfig;
pub use error::{Result, StoreError};
pub use membership::{Handler, Membership, MembershipConfig};
pub use replicator::{DistributedStorage, StorageConfig};
pub use server::Server;
pub use store::{LocalStore, MemoryStore, SledStore};
pub use types::*;
