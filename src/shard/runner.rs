//! Shard event loop
//!
//! One task per shard owns all protocol state. Commands from [`Shard`]
//! handles, connect completions, socket events and heartbeat ticks are
//! serialized through a single `select!`, so nothing here needs a lock.
//!
//! [`Shard`]: super::Shard

use super::handle::{ShardCommand, ShardContext, ShardStatus};
use super::queue::OfflineQueue;
use super::session::{HeartbeatState, SessionState};
use super::state::ShardStage;
use super::transport::{SocketCommand, SocketConnection, SocketEvent};
use crate::config::ShardOptions;
use crate::error::GatewayError;
use crate::gateway::close_code::{
    self, ABNORMAL_CLOSURE, RECONNECT_REQUESTED, SHUTDOWN, ZOMBIED_CONNECTION,
};
use crate::gateway::inflate::{decode_binary, decode_text};
use crate::gateway::redact::redact;
use crate::gateway::{
    classify, ClosePolicy, GatewayPayload, Hello, Identify, OpCode, OutgoingPayload, ReadySession,
    Resume,
};
use crate::ratelimit::{RateLimitBucket, DEFAULT_HEARTBEAT_INTERVAL};
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Level};

type ConnectFuture = BoxFuture<'static, Result<SocketConnection, GatewayError>>;
type Completion = oneshot::Sender<Result<(), GatewayError>>;

/// A serialized frame on its way out
pub(crate) struct Outbound {
    frame: String,
    done: Option<Completion>,
}

impl Outbound {
    pub(crate) fn new(frame: String, done: Option<Completion>) -> Self {
        Self { frame, done }
    }
}

/// Open socket plus the writer task pacing frames onto it
struct ActiveSocket {
    commands: mpsc::Sender<SocketCommand>,
    events: mpsc::Receiver<SocketEvent>,
    forced: mpsc::UnboundedSender<Outbound>,
    normal: mpsc::UnboundedSender<Outbound>,
    writer: JoinHandle<()>,
}

impl ActiveSocket {
    fn open(connection: SocketConnection, bucket: Arc<RateLimitBucket>) -> Self {
        let (forced, forced_rx) = mpsc::unbounded_channel();
        let (normal, normal_rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(run_writer(
            bucket,
            forced_rx,
            normal_rx,
            connection.commands.clone(),
        ));
        Self {
            commands: connection.commands,
            events: connection.events,
            forced,
            normal,
            writer,
        }
    }

    /// Hand a frame to the writer. A frame the writer can no longer take
    /// is dropped, which fails its completion.
    fn send(&self, force: bool, outbound: Outbound) {
        let queue = if force { &self.forced } else { &self.normal };
        let _ = queue.send(outbound);
    }

    async fn close(self, code: u16, reason: String) {
        self.writer.abort();
        let _ = self.commands.send(SocketCommand::Close { code, reason }).await;
    }
}

impl Drop for ActiveSocket {
    fn drop(&mut self) {
        self.writer.abort();
    }
}

/// Drain the forced and normal queues onto the socket.
///
/// Forced frames are counted by the bucket but never wait, and keep flowing
/// while a normal frame is parked on the bucket.
async fn run_writer(
    bucket: Arc<RateLimitBucket>,
    mut forced: mpsc::UnboundedReceiver<Outbound>,
    mut normal: mpsc::UnboundedReceiver<Outbound>,
    socket: mpsc::Sender<SocketCommand>,
) {
    loop {
        tokio::select! {
            biased;
            Some(outbound) = forced.recv() => {
                bucket.process(true).await;
                if !write_frame(&socket, outbound).await {
                    break;
                }
            }
            Some(outbound) = normal.recv() => {
                {
                    let acquire = bucket.process(false);
                    tokio::pin!(acquire);
                    loop {
                        tokio::select! {
                            biased;
                            Some(urgent) = forced.recv() => {
                                bucket.process(true).await;
                                if !write_frame(&socket, urgent).await {
                                    return;
                                }
                            }
                            () = &mut acquire => break,
                        }
                    }
                }
                if !write_frame(&socket, outbound).await {
                    break;
                }
            }
            else => break,
        }
    }
}

async fn write_frame(socket: &mpsc::Sender<SocketCommand>, outbound: Outbound) -> bool {
    let Outbound { frame, done } = outbound;
    // A dropped `done` reports the frame as unsent
    let written = socket.send(SocketCommand::Text(frame)).await.is_ok();
    if written {
        if let Some(done) = done {
            let _ = done.send(Ok(()));
        }
    }
    written
}

pub(crate) struct ShardRunner {
    id: u32,
    total: u32,
    options: Arc<ShardOptions>,
    ctx: ShardContext,
    commands: mpsc::UnboundedReceiver<ShardCommand>,
    status: watch::Sender<ShardStatus>,
    stage: ShardStage,
    session: SessionState,
    heartbeat: HeartbeatState,
    bucket: Arc<RateLimitBucket>,
    offline: OfflineQueue<Outbound>,
    socket: Option<ActiveSocket>,
    connecting: Option<ConnectFuture>,
    connect_waiters: Vec<Completion>,
    terminal: Option<GatewayError>,
    stopping: bool,
}

impl ShardRunner {
    pub(crate) fn new(
        id: u32,
        total: u32,
        options: Arc<ShardOptions>,
        ctx: ShardContext,
        commands: mpsc::UnboundedReceiver<ShardCommand>,
        status: watch::Sender<ShardStatus>,
    ) -> Self {
        let bucket = Arc::new(RateLimitBucket::new(
            options.ratelimit,
            DEFAULT_HEARTBEAT_INTERVAL,
        ));
        Self {
            id,
            total,
            options,
            ctx,
            commands,
            status,
            stage: ShardStage::Idle,
            session: SessionState::default(),
            heartbeat: HeartbeatState::default(),
            bucket,
            offline: OfflineQueue::default(),
            socket: None,
            connecting: None,
            connect_waiters: Vec::new(),
            terminal: None,
            stopping: false,
        }
    }

    pub(crate) async fn run(mut self) -> Result<(), GatewayError> {
        debug!(shard_id = self.id, total_shards = self.total, "Shard task started");

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => self.shutdown(SHUTDOWN, "all shard handles dropped").await,
                },
                result = wait_connect(&mut self.connecting) => self.on_connected(result),
                event = next_event(&mut self.socket) => self.on_socket_event(event).await,
                () = self.heartbeat.timer.tick() => self.heartbeat(false).await,
            }

            self.publish();

            if let Some(error) = self.terminal.take() {
                self.ctx.metrics.record_error(self.id, error.error_type_label());
                return Err(error);
            }
            if self.stopping {
                info!(shard_id = self.id, "Shard stopped");
                return Ok(());
            }
        }
    }

    async fn handle_command(&mut self, command: ShardCommand) {
        match command {
            ShardCommand::Connect { opened } => self.connect(opened),
            ShardCommand::Send { force, frame, done } => {
                self.enqueue(force, Outbound::new(frame, Some(done)))
            }
            ShardCommand::Identify => self.identify(),
            ShardCommand::Resume => self.resume(),
            ShardCommand::Heartbeat { requested } => self.heartbeat(requested).await,
            ShardCommand::Close { code, reason, done } => {
                self.close(code, reason).await;
                let _ = done.send(());
            }
            ShardCommand::Shutdown { code, reason } => self.shutdown(code, &reason).await,
        }
    }

    /// Start a gated connection attempt unless one is open or in flight
    fn connect(&mut self, opened: Option<Completion>) {
        if self.socket.is_some() {
            if let Some(opened) = opened {
                let _ = opened.send(Ok(()));
            }
            return;
        }
        if let Some(opened) = opened {
            self.connect_waiters.push(opened);
        }
        if self.connecting.is_some() || self.stopping {
            return;
        }

        let url = self.session.gateway_url(&self.options.url, self.options.version);
        info!(shard_id = self.id, url, "Connecting to gateway");
        self.stage = ShardStage::Connecting;

        let gate = Arc::clone(&self.ctx.gate);
        let transport = Arc::clone(&self.ctx.transport);
        self.connecting = Some(Box::pin(async move {
            gate.wait().await;
            transport.connect(url).await
        }));
    }

    fn on_connected(&mut self, result: Result<SocketConnection, GatewayError>) {
        self.connecting = None;
        match result {
            Ok(connection) => {
                self.heartbeat.reset();
                self.socket = Some(ActiveSocket::open(connection, Arc::clone(&self.bucket)));
                self.stage = ShardStage::AwaitingHello;
                debug!(shard_id = self.id, "Socket open, waiting for Hello");
                for opened in self.connect_waiters.drain(..) {
                    let _ = opened.send(Ok(()));
                }
            }
            Err(e) => {
                warn!(shard_id = self.id, error = %e, "Failed to open gateway socket");
                self.ctx.metrics.record_error(self.id, e.error_type_label());
                self.fail_connect_waiters();
                self.on_closed(ABNORMAL_CLOSURE, &e.to_string());
            }
        }
    }

    fn fail_connect_waiters(&mut self) {
        for opened in self.connect_waiters.drain(..) {
            let _ = opened.send(Err(GatewayError::NotConnected { shard_id: self.id }));
        }
    }

    async fn on_socket_event(&mut self, event: SocketEvent) {
        let decoded = match event {
            SocketEvent::Text(text) => decode_text(&text),
            SocketEvent::Binary(bytes) => decode_binary(&bytes),
            SocketEvent::Error(e) => {
                warn!(shard_id = self.id, error = e, "Gateway socket error");
                self.ctx.metrics.record_error(self.id, "transport");
                return;
            }
            SocketEvent::Closed { code, reason } => {
                self.on_closed(code, &reason);
                return;
            }
        };

        match decoded {
            Ok(payload) => self.on_payload(payload).await,
            Err(e) => {
                error!(shard_id = self.id, error = %e, "Dropping undecodable gateway frame");
                self.ctx.metrics.record_error(self.id, e.error_type_label());
            }
        }
    }

    async fn on_payload(&mut self, payload: GatewayPayload) {
        if let Some(seq) = payload.s {
            self.session.resume_sequence = Some(seq);
        }
        self.ctx.state.record_event(self.id);

        match payload.opcode() {
            Some(OpCode::Dispatch) => self.on_dispatch(payload),
            Some(OpCode::Hello) => self.on_hello(&payload).await,
            Some(OpCode::HeartbeatAck) => {
                self.ctx.metrics.record_event(self.id, "heartbeat_ack");
                self.heartbeat.mark_acked();
                let latency = self.heartbeat.latency();
                self.ctx.state.record_heartbeat(self.id, latency);
                self.ctx.metrics.record_heartbeat(self.id, latency);
            }
            Some(OpCode::Heartbeat) => {
                self.ctx.metrics.record_event(self.id, "heartbeat");
                self.heartbeat(true).await;
            }
            Some(OpCode::Reconnect) => {
                self.ctx.metrics.record_event(self.id, "reconnect");
                info!(shard_id = self.id, "Gateway requested a reconnect");
                self.close(RECONNECT_REQUESTED, "gateway requested reconnect".to_string())
                    .await;
            }
            Some(OpCode::InvalidSession) => {
                self.ctx.metrics.record_event(self.id, "invalid_session");
                let resumable = payload.d.as_bool().unwrap_or(false);
                self.on_invalid_session(resumable).await;
            }
            _ => debug!(shard_id = self.id, op = payload.op, "Ignoring unhandled opcode"),
        }
    }

    async fn on_hello(&mut self, payload: &GatewayPayload) {
        self.ctx.metrics.record_event(self.id, "hello");
        let interval = match Hello::deserialize(&payload.d) {
            Ok(hello) if hello.heartbeat_interval > 0 => {
                Duration::from_millis(hello.heartbeat_interval)
            }
            Ok(_) => {
                error!(shard_id = self.id, "Hello announced a zero heartbeat interval");
                return;
            }
            Err(e) => {
                error!(shard_id = self.id, error = %e, "Malformed Hello payload");
                return;
            }
        };

        debug!(
            shard_id = self.id,
            heartbeat_interval_ms = interval.as_millis() as u64,
            "Received Hello"
        );
        self.heartbeat.timer.cancel();
        self.heartbeat.interval = Some(interval);
        self.bucket.recalibrate(interval);

        self.heartbeat(false).await;
        if self.socket.is_none() {
            return;
        }
        self.heartbeat.timer.arm(interval);

        if self.session.resumable() {
            self.resume();
        } else {
            self.identify();
        }
    }

    async fn on_invalid_session(&mut self, resumable: bool) {
        if resumable && self.session.resumable() {
            info!(shard_id = self.id, "Session invalidated but resumable; resuming");
            self.resume();
        } else if resumable {
            let violation = GatewayError::ProtocolViolation {
                shard_id: self.id,
                detail: "invalid session flagged resumable but no session is held".to_string(),
            };
            error!(shard_id = self.id, error = %violation, "Stopping shard");
            self.shutdown(SHUTDOWN, "protocol violation").await;
            self.stage = ShardStage::Dead;
            self.terminal = Some(violation);
        } else {
            info!(shard_id = self.id, "Session invalidated; identifying again");
            self.session.invalidate();
            self.identify();
        }
    }

    fn on_dispatch(&mut self, payload: GatewayPayload) {
        let event = payload.event_name().unwrap_or("UNKNOWN");
        self.ctx.metrics.record_event(self.id, event);

        match event {
            "READY" => {
                match ReadySession::deserialize(&payload.d) {
                    Ok(ready) => {
                        info!(shard_id = self.id, session_id = %ready.session_id, "Shard ready");
                        self.session.session_id = Some(ready.session_id);
                        self.session.resume_url = ready.resume_gateway_url;
                    }
                    Err(e) => error!(shard_id = self.id, error = %e, "READY carried no usable session"),
                }
                self.on_session_ready();
            }
            "RESUMED" => {
                info!(
                    shard_id = self.id,
                    seq = self.session.resume_sequence,
                    "Shard resumed"
                );
                self.on_session_ready();
            }
            _ => {}
        }

        self.ctx.sink.handle_payload(self.id, payload);
    }

    /// Session is usable: flush whatever was queued while offline
    fn on_session_ready(&mut self) {
        self.stage = ShardStage::Ready;
        let Some(socket) = &self.socket else {
            return;
        };
        if !self.offline.is_empty() {
            debug!(shard_id = self.id, queued = self.offline.len(), "Flushing offline queue");
        }
        for (force, outbound) in self.offline.drain() {
            socket.send(force, outbound);
        }
    }

    async fn heartbeat(&mut self, requested: bool) {
        if self.socket.is_none() {
            debug!(shard_id = self.id, "Skipping heartbeat, socket is closed");
            return;
        }
        if !requested && !self.heartbeat.ack_received {
            warn!(shard_id = self.id, "Previous heartbeat was never acknowledged");
            self.close(ZOMBIED_CONNECTION, "heartbeat was not acknowledged".to_string())
                .await;
            return;
        }

        self.heartbeat.mark_sent();
        let seq = self.session.resume_sequence;
        self.send_payload(true, &OutgoingPayload::new(OpCode::Heartbeat, seq));
    }

    fn identify(&mut self) {
        let presence = self
            .options
            .presence
            .as_ref()
            .and_then(|provider| provider.presence(self.id, self.options.worker_id));
        let identify = Identify {
            token: self.options.token.clone(),
            intents: self.options.intents.bits(),
            shard: [self.id, self.total],
            properties: self.options.properties.clone(),
            compress: self.options.compress.then_some(true),
            presence,
        };

        if self.socket.is_some() {
            self.stage = ShardStage::Identifying;
        }
        info!(shard_id = self.id, total_shards = self.total, "Identifying");
        self.send_payload(true, &OutgoingPayload::new(OpCode::Identify, identify));
    }

    fn resume(&mut self) {
        let (Some(session_id), Some(seq)) =
            (self.session.session_id.clone(), self.session.resume_sequence)
        else {
            debug!(shard_id = self.id, "Nothing to resume, identifying instead");
            self.identify();
            return;
        };

        if self.socket.is_some() {
            self.stage = ShardStage::Resuming;
        }
        info!(shard_id = self.id, seq, "Resuming session");
        let resume = Resume {
            token: self.options.token.clone(),
            session_id,
            seq,
        };
        self.send_payload(true, &OutgoingPayload::new(OpCode::Resume, resume));
    }

    fn send_payload<T: Serialize>(&mut self, force: bool, payload: &T) {
        match serde_json::to_string(payload) {
            Ok(frame) => self.enqueue(force, Outbound::new(frame, None)),
            Err(e) => error!(shard_id = self.id, error = %e, "Failed to serialize payload"),
        }
    }

    fn enqueue(&mut self, force: bool, outbound: Outbound) {
        if tracing::enabled!(Level::DEBUG) {
            debug!(
                shard_id = self.id,
                force,
                payload = %redact(&outbound.frame, &self.options.token),
                "Sending payload"
            );
        }
        match &self.socket {
            Some(socket) => socket.send(force, outbound),
            None => self.offline.push(force, outbound),
        }
    }

    /// Close the socket ourselves, then apply the policy for `code`
    async fn close(&mut self, code: u16, reason: String) {
        if let Some(socket) = self.socket.take() {
            self.stage = ShardStage::Closing;
            socket.close(code, reason.clone()).await;
        } else if self.connecting.take().is_some() {
            self.fail_connect_waiters();
        } else {
            warn!(shard_id = self.id, code, "Close requested but the shard is not connected");
            return;
        }
        self.on_closed(code, &reason);
    }

    /// The socket is gone; decide whether to come back
    fn on_closed(&mut self, code: u16, reason: &str) {
        self.socket = None;
        self.heartbeat.reset();

        let policy = classify(code);
        self.ctx.metrics.record_close(self.id, code, policy.label());
        let description = close_code::describe(code);

        match policy {
            ClosePolicy::Shutdown => {
                info!(shard_id = self.id, code, reason, description, "Shard closed");
                self.stage = ShardStage::Idle;
            }
            ClosePolicy::ResumableLoss => {
                info!(shard_id = self.id, code, reason, description, "Session lost, reconnecting");
                self.session.clear();
                self.reconnect();
            }
            ClosePolicy::Transient => {
                info!(shard_id = self.id, code, reason, description, "Connection lost, reconnecting");
                self.reconnect();
            }
            ClosePolicy::Fatal => {
                error!(shard_id = self.id, code, reason, description, "Gateway closed with a fatal code");
                self.stage = ShardStage::Dead;
                self.terminal = Some(GatewayError::FatalClose {
                    shard_id: self.id,
                    code,
                    reason: reason.to_string(),
                });
            }
        }
    }

    fn reconnect(&mut self) {
        self.stage = ShardStage::Idle;
        if self.stopping {
            return;
        }
        self.ctx.state.record_reconnect(self.id);
        self.connect(None);
    }

    /// Stop for good; the loop exits after this iteration
    async fn shutdown(&mut self, code: u16, reason: &str) {
        self.stopping = true;
        self.connecting = None;
        self.heartbeat.reset();
        if let Some(socket) = self.socket.take() {
            socket.close(code, reason.to_string()).await;
        }
        self.fail_connect_waiters();
        self.stage = ShardStage::Idle;
    }

    fn publish(&self) {
        self.ctx.state.set_stage(self.id, self.stage);
        let status = ShardStatus {
            stage: self.stage,
            open: self.socket.is_some(),
            latency: self.heartbeat.latency(),
            heartbeat_interval: self.heartbeat.interval,
            resumable: self.session.resumable(),
            sequence: self.session.resume_sequence,
            session_id: self.session.session_id.clone(),
            resume_url: self.session.resume_url.clone(),
            queued: self.offline.len(),
        };
        self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}

async fn wait_connect(connecting: &mut Option<ConnectFuture>) -> Result<SocketConnection, GatewayError> {
    match connecting {
        Some(attempt) => attempt.await,
        None => future::pending().await,
    }
}

async fn next_event(socket: &mut Option<ActiveSocket>) -> SocketEvent {
    match socket {
        Some(socket) => socket.events.recv().await.unwrap_or_else(|| SocketEvent::Closed {
            code: ABNORMAL_CLOSURE,
            reason: "socket dropped".to_string(),
        }),
        None => future::pending().await,
    }
}
