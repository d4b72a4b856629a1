mod distributed;
mod log_entry;
mod network;
mod snapshots;
mod state_machine;
mod storage;
mod stream;

pub use distributed::*;
pub use log_entry::*;
pub use network::*;
pub use snapshots::*;
pub use state_machine::*;
pub use storage::*;
pub use stream::*;
