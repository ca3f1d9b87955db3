//! Arrakis Shards - sharded Discord gateway transport
//!
//! Keeps a fleet of gateway connections alive for one bot:
//! - handshake, heartbeating and session resume per shard
//! - per-shard send rate limiting and a process-wide connect gate
//! - live resharding with a generation cutover
//! - dispatch hand-off to an [`EventSink`] (NATS JetStream in production)

pub mod config;
pub mod error;
pub mod events;
pub mod gateway;
pub mod health;
pub mod metrics;
pub mod nats;
pub mod providers;
pub mod ratelimit;
pub mod shard;

pub use config::{GatewayConfig, ManagerOptions, RateLimitOptions, ReshardingOptions, ShardOptions};
pub use error::GatewayError;
pub use events::{EventSink, LogSink};
pub use metrics::GatewayMetrics;
pub use providers::{GatewayInfo, GatewayInfoProvider, PresenceProvider, TwilightInfoProvider};
pub use ratelimit::{ConnectGate, RateLimitBucket};
pub use shard::{Shard, ShardManager, ShardStage, ShardStatus, Transport, WsTransport};
