//! Per-connection send throttle
//!
//! The gateway disconnects clients that send more than 120 frames per
//! minute. The bucket hands out tokens for that window minus headroom for
//! the heartbeats that must always get through, and refills only on its own
//! periodic tick.

use crate::config::RateLimitOptions;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Heartbeat interval assumed until the gateway announces the real one
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(41_250);

/// Tokens available to ordinary traffic within one window.
///
/// `max - ceil(window / heartbeat) * 2`, never below zero.
pub fn safe_capacity(max_requests: u32, window: Duration, heartbeat_interval: Duration) -> u32 {
    let heartbeat_ms = heartbeat_interval.as_millis();
    if heartbeat_ms == 0 {
        return 0;
    }
    let reserved = window.as_millis().div_ceil(heartbeat_ms) * 2;
    u32::try_from(u128::from(max_requests).saturating_sub(reserved)).unwrap_or(0)
}

struct BucketState {
    max_requests: u32,
    capacity: u32,
    remaining: u32,
    /// Frames counted in the current window, forced ones included
    used: u32,
    waiters: VecDeque<oneshot::Sender<()>>,
}

struct BucketInner {
    window: Duration,
    state: Mutex<BucketState>,
}

impl BucketInner {
    fn refill(&self) {
        let mut state = self.state.lock();
        state.remaining = state.capacity;
        state.used = 0;
        while state.remaining > 0 {
            let Some(waiter) = state.waiters.pop_front() else {
                break;
            };
            // A dropped receiver gave up waiting; its token stays in the bucket
            if waiter.send(()).is_ok() {
                state.remaining -= 1;
                state.used += 1;
            }
        }
    }
}

/// Token counter throttling one shard's outbound frames
pub struct RateLimitBucket {
    inner: Arc<BucketInner>,
    ticker: JoinHandle<()>,
}

impl RateLimitBucket {
    /// Create a full bucket and start its reset tick.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(options: RateLimitOptions, heartbeat_interval: Duration) -> Self {
        let capacity = safe_capacity(
            options.max_requests_per_tick,
            options.reset_interval,
            heartbeat_interval,
        );
        let inner = Arc::new(BucketInner {
            window: options.reset_interval,
            state: Mutex::new(BucketState {
                max_requests: options.max_requests_per_tick,
                capacity,
                remaining: capacity,
                used: 0,
                waiters: VecDeque::new(),
            }),
        });
        let ticker = tokio::spawn(run_ticker(Arc::downgrade(&inner), options.reset_interval));
        Self { inner, ticker }
    }

    /// Take one token.
    ///
    /// Ordinary frames wait for the next reset once the bucket is empty.
    /// Forced frames (heartbeat, identify, resume) are counted but never wait.
    pub async fn process(&self, force: bool) {
        let waiter = {
            let mut state = self.inner.state.lock();
            state.used += 1;
            if state.remaining > 0 {
                state.remaining -= 1;
                return;
            }
            if force {
                return;
            }
            state.used -= 1;
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            rx
        };
        let _ = waiter.await;
    }

    /// Re-derive capacity for a newly announced heartbeat interval.
    ///
    /// Remaining tokens are only ever lowered here; raising them is the
    /// reset tick's job.
    pub fn recalibrate(&self, heartbeat_interval: Duration) {
        let mut state = self.inner.state.lock();
        state.capacity = safe_capacity(state.max_requests, self.inner.window, heartbeat_interval);
        state.remaining = state.remaining.min(state.capacity);
    }

    pub fn capacity(&self) -> u32 {
        self.inner.state.lock().capacity
    }

    pub fn remaining(&self) -> u32 {
        self.inner.state.lock().remaining
    }

    /// Frames counted in the current window, forced ones included
    pub fn used(&self) -> u32 {
        self.inner.state.lock().used
    }

    /// Callers currently suspended for a token
    pub fn waiting(&self) -> usize {
        self.inner
            .state
            .lock()
            .waiters
            .iter()
            .filter(|w| !w.is_closed())
            .count()
    }
}

impl Drop for RateLimitBucket {
    fn drop(&mut self) {
        self.ticker.abort();
    }
}

async fn run_ticker(inner: Weak<BucketInner>, window: Duration) {
    let mut ticks = interval_at(Instant::now() + window, window);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticks.tick().await;
        match inner.upgrade() {
            Some(inner) => inner.refill(),
            None => break,
        }
    }
}
