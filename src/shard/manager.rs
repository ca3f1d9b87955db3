//! Shard fleet ownership and live resharding
//!
//! Every fleet gets a generation number. Shards forward dispatches through a
//! [`PayloadRouter`] stamped with their generation, and only the active
//! generation reaches the sink. A reshard builds the next generation next to
//! the current one, waits until all of it is ready, flips the active
//! generation and retires the old fleet.

use super::handle::{Shard, ShardContext};
use super::state::ShardState;
use super::transport::Transport;
use crate::config::{ManagerOptions, ReshardingOptions, ShardOptions};
use crate::error::GatewayError;
use crate::events::EventSink;
use crate::gateway::close_code::{RESHARDED, SHUTDOWN};
use crate::gateway::GatewayPayload;
use crate::metrics::GatewayMetrics;
use crate::ratelimit::ConnectGate;
use futures_util::future::try_join_all;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Slack on top of the connect-gate schedule when waiting for a new fleet
const READY_GRACE: Duration = Duration::from_secs(120);

/// How long a retired shard gets to close its socket
const RETIRE_TIMEOUT: Duration = Duration::from_secs(10);

/// Whether `recommended` drifted from `current` by more than `percentage`
/// percent of `current`
pub fn should_reshard(current: u32, recommended: u32, percentage: f64) -> bool {
    if current == 0 {
        return recommended > 0;
    }
    let drift = f64::from(current.abs_diff(recommended)) / f64::from(current) * 100.0;
    drift > percentage
}

/// How long a reshard waits for `total_shards` new shards to report ready
fn ready_deadline(spawn_shard_delay: Duration, total_shards: u32) -> Duration {
    spawn_shard_delay
        .saturating_mul(total_shards)
        .saturating_add(READY_GRACE)
}

/// The dispatch sink as seen by one generation of shards
struct PayloadRouter {
    sink: Arc<dyn EventSink>,
    active: Arc<AtomicU64>,
    generation: u64,
    metrics: GatewayMetrics,
}

impl EventSink for PayloadRouter {
    fn handle_payload(&self, shard_id: u32, payload: GatewayPayload) {
        let forwarded = self.active.load(Ordering::Acquire) == self.generation;
        self.metrics.record_dispatch(shard_id, forwarded);
        if forwarded {
            self.sink.handle_payload(shard_id, payload);
        } else {
            debug!(
                shard_id,
                generation = self.generation,
                event_type = payload.event_name().unwrap_or("unknown"),
                "Dropping dispatch from inactive shard set"
            );
        }
    }
}

/// One set of shards built for a given total
#[derive(Default)]
struct Fleet {
    generation: u64,
    total_shards: u32,
    range: Range<u32>,
    shards: BTreeMap<u32, Shard>,
    tasks: Vec<JoinHandle<()>>,
    state: Option<ShardState>,
}

/// Owns the shards of this process
pub struct ShardManager {
    options: ManagerOptions,
    shard_options: Arc<ShardOptions>,
    gate: Arc<ConnectGate>,
    transport: Arc<dyn Transport>,
    sink: Arc<dyn EventSink>,
    metrics: GatewayMetrics,
    active_generation: Arc<AtomicU64>,
    next_generation: AtomicU64,
    fleet: RwLock<Fleet>,
    /// Serializes spawn, cutover and shutdown
    lifecycle: tokio::sync::Mutex<()>,
    shutdown_tx: broadcast::Sender<()>,
    resharder: Mutex<Option<JoinHandle<()>>>,
    terminal_tx: mpsc::UnboundedSender<(u32, GatewayError)>,
    terminal_rx: Mutex<Option<mpsc::UnboundedReceiver<(u32, GatewayError)>>>,
}

impl ShardManager {
    pub fn new(
        options: ManagerOptions,
        transport: Arc<dyn Transport>,
        sink: Arc<dyn EventSink>,
        metrics: GatewayMetrics,
    ) -> Result<Self, GatewayError> {
        options.validate()?;

        let (shutdown_tx, _) = broadcast::channel(1);
        let (terminal_tx, terminal_rx) = mpsc::unbounded_channel();
        let range = options.shard_range();

        Ok(Self {
            shard_options: Arc::new(options.shard.clone()),
            gate: Arc::new(ConnectGate::new(options.spawn_shard_delay)),
            fleet: RwLock::new(Fleet {
                total_shards: options.total_shards,
                range,
                ..Fleet::default()
            }),
            options,
            transport,
            sink,
            metrics,
            active_generation: Arc::new(AtomicU64::new(0)),
            next_generation: AtomicU64::new(1),
            lifecycle: tokio::sync::Mutex::new(()),
            shutdown_tx,
            resharder: Mutex::new(None),
            terminal_tx,
            terminal_rx: Mutex::new(Some(terminal_rx)),
        })
    }

    /// Shards that stopped with a terminal error. Can be taken once.
    ///
    /// The manager never restarts such a shard; deciding whether the
    /// process should go down is up to the caller.
    pub fn take_terminal_errors(&self) -> Option<mpsc::UnboundedReceiver<(u32, GatewayError)>> {
        self.terminal_rx.lock().take()
    }

    /// Create and connect the configured shard range.
    ///
    /// Connects run one after another through the connect gate, so this
    /// takes roughly `spawn_shard_delay` per shard. Starts the resharding
    /// loop when configured.
    pub async fn spawn(self: &Arc<Self>) -> Result<(), GatewayError> {
        let _lifecycle = self.lifecycle.lock().await;
        if !self.fleet.read().shards.is_empty() {
            return Err(GatewayError::Config("shards are already spawned".to_string()));
        }

        let total_shards = self.options.total_shards;
        let range = self.options.shard_range();
        info!(
            total_shards,
            shard_start = range.start,
            shard_end = range.end,
            spawn_delay_ms = self.options.spawn_shard_delay.as_millis() as u64,
            "Spawning shards"
        );

        let fleet = self.build_fleet(total_shards, range);
        self.active_generation.store(fleet.generation, Ordering::Release);
        let shards: Vec<Shard> = fleet.shards.values().cloned().collect();
        *self.fleet.write() = fleet;
        self.metrics.set_total_shards(total_shards);

        if let Some(resharding) = self.options.resharding.clone() {
            self.start_resharding(resharding);
        }

        connect_all(&shards).await;
        Ok(())
    }

    fn build_fleet(&self, total_shards: u32, range: Range<u32>) -> Fleet {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let state = ShardState::new(range.clone(), total_shards);
        let router: Arc<dyn EventSink> = Arc::new(PayloadRouter {
            sink: Arc::clone(&self.sink),
            active: Arc::clone(&self.active_generation),
            generation,
            metrics: self.metrics.clone(),
        });
        let ctx = ShardContext {
            gate: Arc::clone(&self.gate),
            transport: Arc::clone(&self.transport),
            sink: router,
            state: state.clone(),
            metrics: self.metrics.clone(),
        };

        let mut shards = BTreeMap::new();
        let mut tasks = Vec::with_capacity(range.len());
        for shard_id in range.clone() {
            let (shard, task) =
                Shard::spawn(shard_id, total_shards, Arc::clone(&self.shard_options), ctx.clone());
            tasks.push(tokio::spawn(supervise(
                shard_id,
                generation,
                task,
                self.terminal_tx.clone(),
            )));
            shards.insert(shard_id, shard);
        }

        debug!(generation, total_shards, shards = shards.len(), "Built shard set");
        Fleet {
            generation,
            total_shards,
            range,
            shards,
            tasks,
            state: Some(state),
        }
    }

    /// Replace the fleet with one sized for `total_shards`.
    ///
    /// Dispatches from the new set are dropped until every new shard is
    /// ready; then forwarding switches over in one step and the old set is
    /// closed with the resharded code. On failure the new set is torn down
    /// and the old one keeps serving.
    pub async fn reshard(&self, total_shards: u32) -> Result<(), GatewayError> {
        let _lifecycle = self.lifecycle.lock().await;

        if !self.options.owns_all_shards() {
            return Err(GatewayError::ReshardFailed {
                total_shards,
                reason: "this process owns only part of the fleet".to_string(),
            });
        }
        if total_shards == 0 {
            return Err(GatewayError::ReshardFailed {
                total_shards,
                reason: "total_shards must be at least 1".to_string(),
            });
        }

        let previous_total = self.fleet.read().total_shards;
        info!(from = previous_total, to = total_shards, "Resharding");

        let fleet = self.build_fleet(total_shards, 0..total_shards);
        let shards: Vec<Shard> = fleet.shards.values().cloned().collect();

        let deadline = ready_deadline(self.options.spawn_shard_delay, total_shards);
        let ready = tokio::time::timeout(deadline, async {
            connect_all(&shards).await;
            try_join_all(shards.iter().map(Shard::wait_until_ready)).await
        })
        .await;

        let failure = match ready {
            Ok(Ok(_)) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some(format!("new shards not ready within {}s", deadline.as_secs())),
        };
        if let Some(reason) = failure {
            warn!(total_shards, reason, "Abandoning reshard");
            retire(fleet, SHUTDOWN, "reshard abandoned").await;
            return Err(GatewayError::ReshardFailed {
                total_shards,
                reason,
            });
        }

        self.active_generation.store(fleet.generation, Ordering::Release);
        let retired = std::mem::replace(&mut *self.fleet.write(), fleet);
        self.metrics.record_reshard(total_shards);
        info!(
            from = previous_total,
            to = total_shards,
            generation = self.generation(),
            "Reshard cut over"
        );

        retire(retired, RESHARDED, "resharded").await;
        Ok(())
    }

    /// Poll sizing guidance once and reshard if it drifted far enough.
    ///
    /// Returns whether a reshard happened.
    pub async fn check_resharding(&self, resharding: &ReshardingOptions) -> Result<bool, GatewayError> {
        let info = resharding.info.get_info().await?;
        let current = self.total_shards();
        let recommended = info.recommended_shards;

        if !should_reshard(current, recommended, resharding.percentage) {
            debug!(current, recommended, "Shard count within threshold");
            return Ok(false);
        }
        if !self.options.owns_all_shards() {
            warn!(current, recommended, "Resharding needed but this process owns a partial range");
            return Ok(false);
        }
        let remaining = info.session_start_limit.remaining;
        if remaining < u64::from(recommended) {
            warn!(
                current,
                recommended,
                remaining,
                reset_after_ms = info.session_start_limit.reset_after,
                "Not enough identify budget to reshard"
            );
            return Ok(false);
        }

        self.reshard(recommended).await?;
        Ok(true)
    }

    fn start_resharding(self: &Arc<Self>, resharding: ReshardingOptions) {
        let manager = Arc::downgrade(self);
        let shutdown = self.shutdown_tx.subscribe();
        info!(
            interval_ms = resharding.interval.as_millis() as u64,
            percentage = resharding.percentage,
            "Resharding checks enabled"
        );
        let task = tokio::spawn(run_resharding(manager, resharding, shutdown));
        if let Some(previous) = self.resharder.lock().replace(task) {
            previous.abort();
        }
    }

    /// Close every shard with the shutdown code and stop resharding
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        if let Some(resharder) = self.resharder.lock().take() {
            resharder.abort();
        }

        let _lifecycle = self.lifecycle.lock().await;
        let fleet = {
            let mut current = self.fleet.write();
            let total_shards = current.total_shards;
            let range = current.range.clone();
            std::mem::replace(
                &mut *current,
                Fleet {
                    total_shards,
                    range,
                    ..Fleet::default()
                },
            )
        };
        info!(shards = fleet.shards.len(), "Shutting down shards");
        retire(fleet, SHUTDOWN, "shutdown").await;
    }

    /// Fleet size currently in service
    pub fn total_shards(&self) -> u32 {
        self.fleet.read().total_shards
    }

    /// Shard indices owned by this process
    pub fn shard_range(&self) -> Range<u32> {
        self.fleet.read().range.clone()
    }

    /// Generation whose dispatches reach the sink
    pub fn generation(&self) -> u64 {
        self.active_generation.load(Ordering::Acquire)
    }

    pub fn shard(&self, shard_id: u32) -> Option<Shard> {
        self.fleet.read().shards.get(&shard_id).cloned()
    }

    /// Active shards ordered by index
    pub fn shards(&self) -> Vec<Shard> {
        self.fleet.read().shards.values().cloned().collect()
    }

    /// State registry of the active fleet
    pub fn state(&self) -> Option<ShardState> {
        self.fleet.read().state.clone()
    }

    pub fn metrics(&self) -> &GatewayMetrics {
        &self.metrics
    }
}

/// Connect shards one at a time, in index order
async fn connect_all(shards: &[Shard]) {
    for shard in shards {
        if let Err(e) = shard.connect().await {
            warn!(shard_id = shard.id(), error = %e, "Initial connect failed");
        }
    }
}

/// Close and stop every shard of `fleet`, then wait for their loops
async fn retire(fleet: Fleet, code: u16, reason: &str) {
    for shard in fleet.shards.values() {
        if let Err(e) = shard.shutdown(code, reason) {
            debug!(shard_id = shard.id(), error = %e, "Shard already stopped");
        }
    }
    drop(fleet.shards);

    for task in fleet.tasks {
        if tokio::time::timeout(RETIRE_TIMEOUT, task).await.is_err() {
            warn!(generation = fleet.generation, "Shard did not stop in time");
        }
    }
}

/// Log how a shard loop ended and surface terminal errors
async fn supervise(
    shard_id: u32,
    generation: u64,
    task: JoinHandle<Result<(), GatewayError>>,
    terminal: mpsc::UnboundedSender<(u32, GatewayError)>,
) {
    match task.await {
        Ok(Ok(())) => debug!(shard_id, generation, "Shard task finished"),
        Ok(Err(e)) => {
            error!(shard_id, generation, error = %e, "Shard stopped with a terminal error");
            let _ = terminal.send((shard_id, e));
        }
        Err(e) => error!(shard_id, generation, error = %e, "Shard task panicked"),
    }
}

async fn run_resharding(
    manager: Weak<ShardManager>,
    resharding: ReshardingOptions,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticks = interval_at(Instant::now() + resharding.interval, resharding.interval);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticks.tick() => {}
            _ = shutdown.recv() => break,
        }
        let Some(manager) = manager.upgrade() else {
            break;
        };
        if let Err(e) = manager.check_resharding(&resharding).await {
            warn!(error = %e, error_type = e.error_type_label(), "Resharding check failed");
        }
    }
    debug!("Resharding loop stopped");
}
