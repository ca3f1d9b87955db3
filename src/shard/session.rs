//! Per-shard session and heartbeat bookkeeping

use crate::gateway::versioned_url;
use std::future;
use std::time::Duration;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::warn;

/// What the shard needs to resume a session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionState {
    /// Last sequence number seen on any inbound payload
    pub resume_sequence: Option<u64>,
    pub session_id: Option<String>,
    /// Host to reconnect to for resuming, as announced by READY
    pub resume_url: Option<String>,
}

impl SessionState {
    /// Session id, resume host and sequence are all known
    pub fn resumable(&self) -> bool {
        self.session_id.is_some() && self.resume_url.is_some() && self.resume_sequence.is_some()
    }

    /// Forget everything; the next connect identifies from scratch
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Drop the session but keep the resume host, after a non-resumable
    /// invalid session
    pub fn invalidate(&mut self) {
        self.session_id = None;
        self.resume_sequence = None;
    }

    /// URL the next connect should use
    pub fn gateway_url(&self, base: &str, version: u8) -> String {
        gateway_url(self.resume_url.as_deref(), base, version)
    }
}

/// Resume host if one is known and parses, else `base`, with the API
/// version pinned
pub fn gateway_url(resume_url: Option<&str>, base: &str, version: u8) -> String {
    if let Some(resume_url) = resume_url {
        match versioned_url(resume_url, version) {
            Ok(url) => return url.into(),
            Err(e) => warn!(resume_url, error = %e, "Ignoring unparsable resume URL"),
        }
    }
    versioned_url(base, version)
        .map(String::from)
        .unwrap_or_else(|_| base.to_string())
}

/// Liveness tracking for one connection
#[derive(Debug)]
pub struct HeartbeatState {
    /// Announced by Hello; `None` until then
    pub interval: Option<Duration>,
    /// The last heartbeat we sent was acknowledged
    pub ack_received: bool,
    pub last_sent_at: Option<Instant>,
    pub last_ack_at: Option<Instant>,
    pub timer: HeartbeatTimer,
}

impl Default for HeartbeatState {
    fn default() -> Self {
        Self {
            interval: None,
            ack_received: true,
            last_sent_at: None,
            last_ack_at: None,
            timer: HeartbeatTimer::default(),
        }
    }
}

impl HeartbeatState {
    /// Fresh state for a new connection; cancels the timer
    pub fn reset(&mut self) {
        self.timer.cancel();
        *self = Self::default();
    }

    pub fn mark_sent(&mut self) {
        self.ack_received = false;
        self.last_sent_at = Some(Instant::now());
    }

    pub fn mark_acked(&mut self) {
        self.ack_received = true;
        self.last_ack_at = Some(Instant::now());
    }

    /// Round trip of the last acknowledged heartbeat; `None` means unknown
    pub fn latency(&self) -> Option<Duration> {
        match (self.last_sent_at, self.last_ack_at) {
            (Some(sent), Some(acked)) if acked >= sent => Some(acked - sent),
            _ => None,
        }
    }
}

/// The single periodic heartbeat timer of a shard
#[derive(Debug, Default)]
pub struct HeartbeatTimer {
    interval: Option<Interval>,
}

impl HeartbeatTimer {
    /// Start ticking every `period`, first tick one period from now.
    ///
    /// Replaces any running timer. `period` must be non-zero.
    pub fn arm(&mut self, period: Duration) {
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.interval = Some(interval);
    }

    /// Stop the timer; returns whether one was running
    pub fn cancel(&mut self) -> bool {
        self.interval.take().is_some()
    }

    pub fn is_armed(&self) -> bool {
        self.interval.is_some()
    }

    pub fn period(&self) -> Option<Duration> {
        self.interval.as_ref().map(Interval::period)
    }

    /// Resolves on the next tick; never resolves while disarmed
    pub async fn tick(&mut self) {
        match &mut self.interval {
            Some(interval) => {
                interval.tick().await;
            }
            None => future::pending().await,
        }
    }
}
