//! Dispatch sink that publishes to NATS
//!
//! Shards hand dispatches over synchronously; a single background task
//! publishes them in the order they arrived.

use super::publisher::NatsPublisher;
use crate::events::serialize::{serialize_dispatch, GatewayEvent};
use crate::events::EventSink;
use crate::gateway::GatewayPayload;
use crate::metrics::GatewayMetrics;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub struct NatsSink {
    events: mpsc::UnboundedSender<GatewayEvent>,
}

impl NatsSink {
    /// Start the publishing task. It ends once the sink is dropped and the
    /// backlog is drained.
    pub fn spawn(publisher: Arc<NatsPublisher>, metrics: GatewayMetrics) -> (Self, JoinHandle<()>) {
        let (events, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_publisher(publisher, metrics, rx));
        (Self { events }, task)
    }
}

impl EventSink for NatsSink {
    fn handle_payload(&self, shard_id: u32, payload: GatewayPayload) {
        match serialize_dispatch(&payload, shard_id) {
            Some(event) => {
                if self.events.send(event).is_err() {
                    warn!(shard_id, "NATS publisher stopped; dropping dispatch");
                }
            }
            None => debug!(
                shard_id,
                event_type = payload.event_name().unwrap_or("unknown"),
                "Dispatch not forwarded to NATS"
            ),
        }
    }
}

async fn run_publisher(
    publisher: Arc<NatsPublisher>,
    metrics: GatewayMetrics,
    mut events: mpsc::UnboundedReceiver<GatewayEvent>,
) {
    while let Some(event) = events.recv().await {
        let start = Instant::now();
        match publisher.publish_event(&event).await {
            Ok(()) => metrics.record_route_success(event.shard_id, start.elapsed()),
            Err(e) => {
                metrics.record_route_failure(event.shard_id);
                metrics.record_error(event.shard_id, e.error_type_label());
            }
        }
        metrics.set_nats_connected(publisher.is_connected());
    }
    debug!("NATS publisher task stopped");
}
