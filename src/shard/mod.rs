//! Shard module
//!
//! One [`Shard`] per gateway connection, each driven by its own task, plus
//! the [`ShardManager`] that owns a fleet of them.

mod handle;
mod manager;
mod queue;
mod runner;
mod session;
mod state;
pub mod transport;

pub use handle::{Shard, ShardContext, ShardStatus};
pub use manager::{should_reshard, ShardManager};
pub use queue::OfflineQueue;
pub use session::{gateway_url, HeartbeatState, HeartbeatTimer, SessionState};
pub use state::{ShardSnapshot, ShardStage, ShardState};
pub use transport::{SocketCommand, SocketConnection, SocketEndpoint, SocketEvent, Transport, WsTransport};
