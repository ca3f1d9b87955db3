//! Shard state tracking
//!
//! Fleet-wide view of every shard's stage and counters, read by the health
//! endpoints. Each shard writes only its own entry.

use dashmap::DashMap;
use serde::Serialize;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Protocol stage of a shard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardStage {
    /// No socket and no connect attempt in flight
    Idle,
    /// Waiting for the connect gate or the socket handshake
    Connecting,
    /// Socket open, Hello not yet received
    AwaitingHello,
    /// Identify sent, waiting for READY
    Identifying,
    /// Resume sent, waiting for RESUMED
    Resuming,
    /// Session established and dispatching
    Ready,
    /// Close in progress
    Closing,
    /// Stopped after a terminal error
    Dead,
}

impl ShardStage {
    /// Socket is open in this stage
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            Self::AwaitingHello | Self::Identifying | Self::Resuming | Self::Ready
        )
    }

    /// Returns true if the shard is healthy
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Ready | Self::Resuming)
    }

    /// Returns true if the shard is ready to receive events
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }
}

/// State for a single shard
#[derive(Debug)]
pub struct ShardStateEntry {
    pub stage: ShardStage,
    pub events_received: AtomicU64,
    pub reconnects: AtomicU64,
    pub latency: Option<Duration>,
    pub last_heartbeat: Option<Instant>,
    pub ready_at: Option<Instant>,
}

impl Default for ShardStateEntry {
    fn default() -> Self {
        Self {
            stage: ShardStage::Idle,
            events_received: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            latency: None,
            last_heartbeat: None,
            ready_at: None,
        }
    }
}

/// Point-in-time copy of one entry
#[derive(Debug, Clone, Serialize)]
pub struct ShardSnapshot {
    pub shard_id: u32,
    pub stage: ShardStage,
    pub events_received: u64,
    pub reconnects: u64,
    pub latency_ms: Option<u64>,
}

/// Shared state across all shards of one fleet
#[derive(Debug, Clone)]
pub struct ShardState {
    inner: Arc<ShardStateInner>,
}

#[derive(Debug)]
struct ShardStateInner {
    shards: DashMap<u32, ShardStateEntry>,
    total_shards: u32,
}

impl ShardState {
    /// Create a tracker for the owned `shard_ids` of a `total_shards` fleet
    pub fn new(shard_ids: Range<u32>, total_shards: u32) -> Self {
        let shards = DashMap::new();
        for shard_id in shard_ids {
            shards.insert(shard_id, ShardStateEntry::default());
        }

        Self {
            inner: Arc::new(ShardStateInner {
                shards,
                total_shards,
            }),
        }
    }

    /// Get total shards across the cluster
    pub fn total_shards(&self) -> u32 {
        self.inner.total_shards
    }

    /// Update shard stage
    pub fn set_stage(&self, shard_id: u32, stage: ShardStage) {
        if let Some(mut entry) = self.inner.shards.get_mut(&shard_id) {
            if stage == ShardStage::Ready && entry.stage != ShardStage::Ready {
                entry.ready_at = Some(Instant::now());
            }
            entry.stage = stage;
        }
    }

    /// Increment event received counter
    pub fn record_event(&self, shard_id: u32) {
        if let Some(entry) = self.inner.shards.get(&shard_id) {
            entry.events_received.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Increment reconnect counter
    pub fn record_reconnect(&self, shard_id: u32) {
        if let Some(entry) = self.inner.shards.get(&shard_id) {
            entry.reconnects.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record an acknowledged heartbeat
    pub fn record_heartbeat(&self, shard_id: u32, latency: Option<Duration>) {
        if let Some(mut entry) = self.inner.shards.get_mut(&shard_id) {
            entry.last_heartbeat = Some(Instant::now());
            entry.latency = latency;
        }
    }

    /// Get stage for a specific shard
    pub fn get_stage(&self, shard_id: u32) -> Option<ShardStage> {
        self.inner.shards.get(&shard_id).map(|e| e.stage)
    }

    /// Get total events received across all shards
    pub fn total_events_received(&self) -> u64 {
        self.inner
            .shards
            .iter()
            .map(|e| e.events_received.load(Ordering::Relaxed))
            .sum()
    }

    /// Get count of ready shards
    pub fn ready_shards(&self) -> usize {
        self.inner
            .shards
            .iter()
            .filter(|e| e.stage.is_ready())
            .count()
    }

    /// Get count of healthy shards (ready or resuming)
    pub fn healthy_shards(&self) -> usize {
        self.inner
            .shards
            .iter()
            .filter(|e| e.stage.is_healthy())
            .count()
    }

    /// Get shard count owned by this process
    pub fn shard_count(&self) -> usize {
        self.inner.shards.len()
    }

    /// Check if fleet is ready (at least one shard ready)
    pub fn is_ready(&self) -> bool {
        self.ready_shards() > 0
    }

    /// Check if fleet is fully healthy
    pub fn is_healthy(&self) -> bool {
        self.healthy_shards() == self.shard_count()
    }

    /// Copy of every entry, ordered by shard id
    pub fn snapshot(&self) -> Vec<ShardSnapshot> {
        let mut shards: Vec<ShardSnapshot> = self
            .inner
            .shards
            .iter()
            .map(|e| ShardSnapshot {
                shard_id: *e.key(),
                stage: e.stage,
                events_received: e.events_received.load(Ordering::Relaxed),
                reconnects: e.reconnects.load(Ordering::Relaxed),
                latency_ms: e.latency.map(|l| l.as_millis() as u64),
            })
            .collect();
        shards.sort_by_key(|s| s.shard_id);
        shards
    }
}
