//! Public handle to a running shard

use super::runner::ShardRunner;
use super::session::gateway_url;
use super::state::{ShardStage, ShardState};
use super::transport::Transport;
use crate::config::ShardOptions;
use crate::error::GatewayError;
use crate::events::EventSink;
use crate::metrics::GatewayMetrics;
use crate::ratelimit::ConnectGate;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

pub(crate) enum ShardCommand {
    Connect {
        opened: Option<oneshot::Sender<Result<(), GatewayError>>>,
    },
    Send {
        force: bool,
        frame: String,
        done: oneshot::Sender<Result<(), GatewayError>>,
    },
    Identify,
    Resume,
    Heartbeat {
        requested: bool,
    },
    Close {
        code: u16,
        reason: String,
        done: oneshot::Sender<()>,
    },
    Shutdown {
        code: u16,
        reason: String,
    },
}

/// Collaborators shared by every shard of a fleet
#[derive(Clone)]
pub struct ShardContext {
    pub gate: Arc<ConnectGate>,
    pub transport: Arc<dyn Transport>,
    pub sink: Arc<dyn EventSink>,
    pub state: ShardState,
    pub metrics: GatewayMetrics,
}

/// Snapshot of a shard, refreshed after every event the shard handles
#[derive(Debug, Clone, PartialEq)]
pub struct ShardStatus {
    pub stage: ShardStage,
    /// A socket is open (not necessarily authenticated)
    pub open: bool,
    /// Last heartbeat round trip; `None` while unknown
    pub latency: Option<Duration>,
    pub heartbeat_interval: Option<Duration>,
    pub resumable: bool,
    pub sequence: Option<u64>,
    pub session_id: Option<String>,
    pub resume_url: Option<String>,
    /// Frames waiting in the offline queue
    pub queued: usize,
}

impl Default for ShardStatus {
    fn default() -> Self {
        Self {
            stage: ShardStage::Idle,
            open: false,
            latency: None,
            heartbeat_interval: None,
            resumable: false,
            sequence: None,
            session_id: None,
            resume_url: None,
            queued: 0,
        }
    }
}

/// Cheaply cloneable handle to one shard's event loop.
///
/// The loop stops once every handle is dropped, after
/// [`Shard::shutdown`], or on a terminal error.
#[derive(Clone)]
pub struct Shard {
    id: u32,
    total: u32,
    options: Arc<ShardOptions>,
    commands: mpsc::UnboundedSender<ShardCommand>,
    status: watch::Receiver<ShardStatus>,
}

impl fmt::Debug for Shard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shard")
            .field("id", &self.id)
            .field("total", &self.total)
            .field("status", &*self.status.borrow())
            .finish()
    }
}

impl Shard {
    /// Start the event loop for shard `id` of `total`. The shard stays idle
    /// until [`Shard::connect`] is called.
    ///
    /// The returned task resolves when the loop stops, with the terminal
    /// error if there was one.
    pub fn spawn(
        id: u32,
        total: u32,
        options: Arc<ShardOptions>,
        ctx: ShardContext,
    ) -> (Self, JoinHandle<Result<(), GatewayError>>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ShardStatus::default());

        let runner = ShardRunner::new(id, total, Arc::clone(&options), ctx, command_rx, status_tx);
        let task = tokio::spawn(runner.run());

        let shard = Self {
            id,
            total,
            options,
            commands: command_tx,
            status: status_rx,
        };
        (shard, task)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    fn command(&self, command: ShardCommand) -> Result<(), GatewayError> {
        self.commands
            .send(command)
            .map_err(|_| GatewayError::ShardClosed { shard_id: self.id })
    }

    /// Wait for a connect turn and open a socket.
    ///
    /// Resolves once the socket is open, or with `NotConnected` if this
    /// attempt failed (the shard keeps retrying on its own). No-op when a
    /// socket is already open.
    pub async fn connect(&self) -> Result<(), GatewayError> {
        let (opened, rx) = oneshot::channel();
        self.command(ShardCommand::Connect { opened: Some(opened) })?;
        rx.await
            .map_err(|_| GatewayError::ShardClosed { shard_id: self.id })?
    }

    /// Serialize and send `message`.
    ///
    /// Resolves when the frame was written. While the socket is down the
    /// frame waits in the offline queue until the session is ready again.
    /// Forced frames skip the rate limit and jump ahead of queued ones.
    pub async fn send<T: Serialize + ?Sized>(&self, force: bool, message: &T) -> Result<(), GatewayError> {
        let frame = serde_json::to_string(message).map_err(GatewayError::Encode)?;
        let (done, rx) = oneshot::channel();
        self.command(ShardCommand::Send { force, frame, done })?;
        rx.await
            .map_err(|_| GatewayError::NotConnected { shard_id: self.id })?
    }

    pub fn identify(&self) -> Result<(), GatewayError> {
        self.command(ShardCommand::Identify)
    }

    /// Resume the held session, falling back to identify when there is none
    pub fn resume(&self) -> Result<(), GatewayError> {
        self.command(ShardCommand::Resume)
    }

    /// Send a heartbeat. An unrequested one closes the socket as zombied if
    /// the previous beat is still unacknowledged.
    pub fn heartbeat(&self, requested: bool) -> Result<(), GatewayError> {
        self.command(ShardCommand::Heartbeat { requested })
    }

    /// Close the socket with `code`. What happens next follows the code's
    /// close policy, exactly as if the gateway had sent it.
    pub async fn close(&self, code: u16, reason: impl Into<String>) -> Result<(), GatewayError> {
        let (done, rx) = oneshot::channel();
        self.command(ShardCommand::Close {
            code,
            reason: reason.into(),
            done,
        })?;
        rx.await
            .map_err(|_| GatewayError::ShardClosed { shard_id: self.id })
    }

    /// Close with `code` and stop the event loop
    pub fn shutdown(&self, code: u16, reason: impl Into<String>) -> Result<(), GatewayError> {
        self.command(ShardCommand::Shutdown {
            code,
            reason: reason.into(),
        })
    }

    pub fn status(&self) -> ShardStatus {
        self.status.borrow().clone()
    }

    pub fn stage(&self) -> ShardStage {
        self.status.borrow().stage
    }

    pub fn latency(&self) -> Option<Duration> {
        self.status.borrow().latency
    }

    pub fn is_open(&self) -> bool {
        self.status.borrow().open
    }

    pub fn resumable(&self) -> bool {
        self.status.borrow().resumable
    }

    /// URL the next connect will use
    pub fn current_gateway_url(&self) -> String {
        let resume_url = self.status.borrow().resume_url.clone();
        gateway_url(resume_url.as_deref(), &self.options.url, self.options.version)
    }

    /// Resolve with the first status matching `predicate`, checking the
    /// current one first. Fails once the loop has stopped without a match.
    pub async fn wait_for(
        &self,
        mut predicate: impl FnMut(&ShardStatus) -> bool,
    ) -> Result<ShardStatus, GatewayError> {
        let mut status = self.status.clone();
        status
            .wait_for(|s| predicate(s))
            .await
            .map(|s| (*s).clone())
            .map_err(|_| GatewayError::ShardClosed { shard_id: self.id })
    }

    /// Resolve once the shard reaches `Ready`; fails if it stops first
    pub async fn wait_until_ready(&self) -> Result<(), GatewayError> {
        let status = self
            .wait_for(|s| s.stage.is_ready() || s.stage == ShardStage::Dead)
            .await?;
        if status.stage.is_ready() {
            Ok(())
        } else {
            Err(GatewayError::ShardClosed { shard_id: self.id })
        }
    }
}
