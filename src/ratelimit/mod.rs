//! Outbound pacing: per-shard frame bucket and process-wide connect gate

mod bucket;
mod gate;

pub use bucket::{safe_capacity, RateLimitBucket, DEFAULT_HEARTBEAT_INTERVAL};
pub use gate::ConnectGate;
