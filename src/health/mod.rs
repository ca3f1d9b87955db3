//! Health check endpoints

use crate::metrics::GatewayMetrics;
use crate::nats::{NatsPublisher, PublishStats};
use crate::shard::{ShardManager, ShardStage};
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub total_shards: u32,
}

/// Readiness check response
#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    pub ready: bool,
    pub total_shards: u32,
    pub shards_owned: usize,
    pub shards_ready: usize,
    pub nats_connected: bool,
    pub events_received: u64,
    /// Absent when running without NATS
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nats: Option<PublishStats>,
}

/// Per-shard view for `/shards`
#[derive(Debug, Serialize)]
pub struct ShardResponse {
    pub shard_id: u32,
    pub stage: ShardStage,
    pub latency_ms: Option<u64>,
    pub resumable: bool,
    pub sequence: Option<u64>,
    pub queued: usize,
    pub events_received: u64,
    pub reconnects: u64,
}

/// Application state for health endpoints
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<ShardManager>,
    pub nats: Option<Arc<NatsPublisher>>,
    pub metrics: GatewayMetrics,
}

/// Create the health check router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/shards", get(shards_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Health endpoint - always returns 200 if process is running
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        total_shards: state.manager.total_shards(),
    })
}

/// Readiness endpoint - returns 200 if at least one shard is ready
async fn ready_handler(State(state): State<AppState>) -> impl IntoResponse {
    let shard_state = state.manager.state();
    let shards_ready = shard_state.as_ref().map_or(0, |s| s.ready_shards());
    let shards_owned = shard_state.as_ref().map_or(0, |s| s.shard_count());
    let events_received = shard_state.as_ref().map_or(0, |s| s.total_events_received());
    let nats_connected = state.nats.as_ref().map_or(true, |n| n.is_connected());
    let nats = state.nats.as_ref().map(|n| n.stats());

    let is_ready = shards_ready > 0 && nats_connected;

    let response = ReadyResponse {
        ready: is_ready,
        total_shards: state.manager.total_shards(),
        shards_owned,
        shards_ready,
        nats_connected,
        events_received,
        nats,
    };

    if is_ready {
        (StatusCode::OK, Json(response))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response))
    }
}

/// Shards endpoint - live status of every owned shard
async fn shards_handler(State(state): State<AppState>) -> impl IntoResponse {
    let counters = state
        .manager
        .state()
        .map(|s| s.snapshot())
        .unwrap_or_default();

    let shards: Vec<ShardResponse> = state
        .manager
        .shards()
        .iter()
        .map(|shard| {
            let status = shard.status();
            let counter = counters.iter().find(|c| c.shard_id == shard.id());
            ShardResponse {
                shard_id: shard.id(),
                stage: status.stage,
                latency_ms: status.latency.map(|l| l.as_millis() as u64),
                resumable: status.resumable,
                sequence: status.sequence,
                queued: status.queued,
                events_received: counter.map_or(0, |c| c.events_received),
                reconnects: counter.map_or(0, |c| c.reconnects),
            }
        })
        .collect();

    Json(shards)
}

/// Metrics endpoint - returns Prometheus format metrics
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    // Update current metrics
    if let Some(shard_state) = state.manager.state() {
        state.metrics.set_shards_ready(shard_state.ready_shards());
    }

    if let Some(ref nats) = state.nats {
        state.metrics.set_nats_connected(nats.is_connected());
    }

    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        state.metrics.render(),
    )
}
