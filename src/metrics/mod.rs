//! Prometheus metrics module
//!
//! The `metrics` macros are no-ops until a recorder is installed, so a
//! [`GatewayMetrics::detached`] collector is safe to use in tests.

use crate::error::GatewayError;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;
use std::time::Duration;

/// Gateway metrics collector
#[derive(Clone, Default)]
pub struct GatewayMetrics {
    handle: Option<Arc<PrometheusHandle>>,
}

impl GatewayMetrics {
    /// Install the global Prometheus recorder and return a rendering handle
    pub fn install() -> Result<Self, GatewayError> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .map_err(|e| GatewayError::Config(format!("failed to install Prometheus recorder: {e}")))?;

        Self::register_metrics();

        Ok(Self {
            handle: Some(Arc::new(handle)),
        })
    }

    /// Collector that records into whatever recorder is installed, if any
    pub fn detached() -> Self {
        Self { handle: None }
    }

    /// Register metric descriptions
    fn register_metrics() {
        describe_counter!(
            "gateway_events_received_total",
            Unit::Count,
            "Total payloads received from the gateway"
        );
        describe_counter!(
            "gateway_dispatches_forwarded_total",
            Unit::Count,
            "Dispatches handed to the event sink"
        );
        describe_counter!(
            "gateway_dispatches_dropped_total",
            Unit::Count,
            "Dispatches dropped because their shard set is not active"
        );
        describe_counter!(
            "gateway_events_routed_total",
            Unit::Count,
            "Total events routed to NATS"
        );
        describe_counter!(
            "gateway_route_failures_total",
            Unit::Count,
            "Failed event routes to NATS"
        );
        describe_counter!("gateway_errors_total", Unit::Count, "Total gateway errors");
        describe_counter!(
            "gateway_closes_total",
            Unit::Count,
            "Socket closes by close policy"
        );
        describe_counter!(
            "gateway_reshards_total",
            Unit::Count,
            "Completed resharding cutovers"
        );

        describe_histogram!(
            "gateway_event_route_duration_seconds",
            Unit::Seconds,
            "Time to route event to NATS"
        );
        describe_histogram!(
            "gateway_heartbeat_latency_seconds",
            Unit::Seconds,
            "Heartbeat round trip"
        );

        describe_gauge!(
            "gateway_shards_ready",
            Unit::Count,
            "Number of shards in ready state"
        );
        describe_gauge!(
            "gateway_shards_total",
            Unit::Count,
            "Fleet size currently in service"
        );
        describe_gauge!(
            "gateway_nats_connected",
            Unit::Count,
            "NATS connection status (1=connected, 0=disconnected)"
        );
    }

    /// Record a payload received
    pub fn record_event(&self, shard_id: u32, event_type: &str) {
        counter!(
            "gateway_events_received_total",
            "shard_id" => shard_id.to_string(),
            "event_type" => event_type.to_lowercase()
        )
        .increment(1);
    }

    /// Record a dispatch handed to (or withheld from) the sink
    pub fn record_dispatch(&self, shard_id: u32, forwarded: bool) {
        let name = if forwarded {
            "gateway_dispatches_forwarded_total"
        } else {
            "gateway_dispatches_dropped_total"
        };
        counter!(name, "shard_id" => shard_id.to_string()).increment(1);
    }

    /// Record successful route to NATS
    pub fn record_route_success(&self, shard_id: u32, duration: Duration) {
        counter!(
            "gateway_events_routed_total",
            "shard_id" => shard_id.to_string()
        )
        .increment(1);

        histogram!(
            "gateway_event_route_duration_seconds",
            "shard_id" => shard_id.to_string()
        )
        .record(duration.as_secs_f64());
    }

    /// Record failed route
    pub fn record_route_failure(&self, shard_id: u32) {
        counter!(
            "gateway_route_failures_total",
            "shard_id" => shard_id.to_string()
        )
        .increment(1);
    }

    /// Record gateway error
    pub fn record_error(&self, shard_id: u32, error_type: &'static str) {
        counter!(
            "gateway_errors_total",
            "shard_id" => shard_id.to_string(),
            "error_type" => error_type
        )
        .increment(1);
    }

    /// Record a socket close and the policy applied to it
    pub fn record_close(&self, shard_id: u32, code: u16, policy: &'static str) {
        counter!(
            "gateway_closes_total",
            "shard_id" => shard_id.to_string(),
            "code" => code.to_string(),
            "policy" => policy
        )
        .increment(1);
    }

    /// Record an acknowledged heartbeat
    pub fn record_heartbeat(&self, shard_id: u32, latency: Option<Duration>) {
        if let Some(latency) = latency {
            histogram!(
                "gateway_heartbeat_latency_seconds",
                "shard_id" => shard_id.to_string()
            )
            .record(latency.as_secs_f64());
        }
    }

    /// Record a completed resharding cutover
    pub fn record_reshard(&self, total_shards: u32) {
        counter!("gateway_reshards_total").increment(1);
        self.set_total_shards(total_shards);
    }

    /// Set shards ready count
    pub fn set_shards_ready(&self, count: usize) {
        gauge!("gateway_shards_ready").set(count as f64);
    }

    /// Set the fleet size in service
    pub fn set_total_shards(&self, total: u32) {
        gauge!("gateway_shards_total").set(f64::from(total));
    }

    /// Set NATS connection status
    pub fn set_nats_connected(&self, connected: bool) {
        gauge!("gateway_nats_connected").set(if connected { 1.0 } else { 0.0 });
    }

    /// Render metrics in Prometheus format; empty when no recorder is installed
    pub fn render(&self) -> String {
        self.handle
            .as_ref()
            .map(|handle| handle.render())
            .unwrap_or_default()
    }
}
