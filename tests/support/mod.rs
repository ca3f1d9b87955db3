//! In-memory gateway for driving shards without a network

#![allow(dead_code)]

use arrakis_shards::config::{GatewayConfig, ShardOptions};
use arrakis_shards::error::GatewayError;
use arrakis_shards::events::EventSink;
use arrakis_shards::gateway::GatewayPayload;
use arrakis_shards::metrics::GatewayMetrics;
use arrakis_shards::ratelimit::ConnectGate;
use arrakis_shards::shard::{
    ShardContext, ShardState, SocketCommand, SocketConnection, SocketEndpoint, SocketEvent, Transport,
};
use futures_util::future::BoxFuture;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub const TOKEN: &str = "MTIzNDU2Nzg5.Gh1jKl.abcdefghijklmnopqrstuvwxyz";

/// Long enough that the interval never fires during a test
pub const HEARTBEAT_MS: u64 = 600_000;

pub const GATE_DELAY: Duration = Duration::from_millis(10);

const WAIT: Duration = Duration::from_secs(5);

/// Hands every opened socket to the test as a [`MockGateway`]
pub struct MockTransport {
    opened: mpsc::UnboundedSender<MockGateway>,
}

impl MockTransport {
    pub fn new() -> (Arc<Self>, Connections) {
        let (opened, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { opened }), Connections { rx })
    }
}

impl Transport for MockTransport {
    fn connect(&self, url: String) -> BoxFuture<'static, Result<SocketConnection, GatewayError>> {
        let (connection, endpoint) = SocketConnection::pair(100);
        let _ = self.opened.send(MockGateway { url, endpoint });
        Box::pin(async move { Ok(connection) })
    }
}

pub struct Connections {
    rx: mpsc::UnboundedReceiver<MockGateway>,
}

impl Connections {
    pub async fn next(&mut self) -> MockGateway {
        tokio::time::timeout(WAIT, self.rx.recv())
            .await
            .expect("no connection attempt")
            .expect("transport dropped")
    }

    /// No connection attempt shows up within `within`
    pub async fn assert_none(&mut self, within: Duration) {
        if let Ok(Some(gateway)) = tokio::time::timeout(within, self.rx.recv()).await {
            panic!("unexpected connection to {}", gateway.url);
        }
    }
}

/// Server side of one socket
pub struct MockGateway {
    pub url: String,
    endpoint: SocketEndpoint,
}

impl MockGateway {
    pub async fn send(&self, payload: Value) {
        self.endpoint
            .events
            .send(SocketEvent::Text(payload.to_string()))
            .await
            .expect("shard dropped the socket");
    }

    pub async fn send_raw(&self, text: &str) {
        self.endpoint
            .events
            .send(SocketEvent::Text(text.to_string()))
            .await
            .expect("shard dropped the socket");
    }

    pub async fn hello(&self) {
        self.hello_with(HEARTBEAT_MS).await;
    }

    pub async fn hello_with(&self, heartbeat_interval_ms: u64) {
        self.send(json!({"op": 10, "d": {"heartbeat_interval": heartbeat_interval_ms}})).await;
    }

    pub async fn ack(&self) {
        self.send(json!({"op": 11})).await;
    }

    pub async fn dispatch(&self, event: &str, seq: u64, d: Value) {
        self.send(json!({"op": 0, "t": event, "s": seq, "d": d})).await;
    }

    pub async fn ready(&self, seq: u64, session_id: &str, resume_url: &str) {
        self.dispatch(
            "READY",
            seq,
            json!({"session_id": session_id, "resume_gateway_url": resume_url}),
        )
        .await;
    }

    /// Drop the connection from the server side
    pub async fn close(&self, code: u16) {
        self.endpoint
            .events
            .send(SocketEvent::Closed {
                code,
                reason: String::new(),
            })
            .await
            .expect("shard dropped the socket");
    }

    /// Next thing the shard wrote, heartbeats included
    pub async fn next_command(&mut self) -> SocketCommand {
        tokio::time::timeout(WAIT, self.endpoint.commands.recv())
            .await
            .expect("shard wrote nothing")
            .expect("socket channel closed")
    }

    /// Next frame, heartbeats included
    pub async fn next_any_frame(&mut self) -> Value {
        match self.next_command().await {
            SocketCommand::Text(text) => serde_json::from_str(&text).expect("shard wrote invalid JSON"),
            SocketCommand::Close { code, .. } => panic!("expected a frame, socket closed with {code}"),
        }
    }

    /// Next non-heartbeat frame
    pub async fn next_frame(&mut self) -> Value {
        loop {
            let frame = self.next_any_frame().await;
            if frame["op"] != 1 {
                return frame;
            }
        }
    }

    /// Skip frames until the shard closes this socket; returns the code
    pub async fn expect_close(&mut self) -> u16 {
        loop {
            if let SocketCommand::Close { code, .. } = self.next_command().await {
                return code;
            }
        }
    }

    /// Hello, then expect Identify for `shard`, then READY
    pub async fn handshake(&mut self, shard: [u32; 2], session_id: &str) {
        self.hello().await;
        let identify = self.next_frame().await;
        assert_eq!(identify["op"], 2);
        assert_eq!(identify["d"]["shard"], json!(shard));
        self.ready(1, session_id, "wss://resume.test").await;
    }
}

/// Sink that forwards every dispatch to the test
pub fn channel_sink() -> (Arc<dyn EventSink>, mpsc::UnboundedReceiver<(u32, GatewayPayload)>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let sink = move |shard_id: u32, payload: GatewayPayload| {
        let _ = tx.send((shard_id, payload));
    };
    (Arc::new(sink), rx)
}

pub async fn next_dispatch(rx: &mut mpsc::UnboundedReceiver<(u32, GatewayPayload)>) -> (u32, GatewayPayload) {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("no dispatch reached the sink")
        .expect("sink dropped")
}

pub fn shard_options() -> ShardOptions {
    ShardOptions::new(TOKEN, GatewayConfig::default_intents())
}

pub fn context(transport: Arc<MockTransport>, sink: Arc<dyn EventSink>, total: u32) -> ShardContext {
    ShardContext {
        gate: Arc::new(ConnectGate::new(GATE_DELAY)),
        transport,
        sink,
        state: ShardState::new(0..total, total),
        metrics: GatewayMetrics::detached(),
    }
}
