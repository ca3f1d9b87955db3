//! Where dispatches go once a shard has them

use crate::gateway::GatewayPayload;
use tracing::info;

/// Receives every dispatch-class payload, READY and RESUMED included.
///
/// Called from the shard's event loop, so implementations must not block.
pub trait EventSink: Send + Sync + 'static {
    fn handle_payload(&self, shard_id: u32, payload: GatewayPayload);
}

impl<F> EventSink for F
where
    F: Fn(u32, GatewayPayload) + Send + Sync + 'static,
{
    fn handle_payload(&self, shard_id: u32, payload: GatewayPayload) {
        self(shard_id, payload)
    }
}

/// Logs dispatches instead of forwarding them (local testing mode)
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl EventSink for LogSink {
    fn handle_payload(&self, shard_id: u32, payload: GatewayPayload) {
        info!(
            shard_id,
            event_type = payload.event_name().unwrap_or("unknown"),
            seq = payload.s,
            "Dispatch received (no NATS configured)"
        );
    }
}
