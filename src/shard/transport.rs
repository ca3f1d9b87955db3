//! Socket abstraction between a shard and the network
//!
//! A connected socket is a pair of channels. The shard pushes
//! [`SocketCommand`]s in and reads [`SocketEvent`]s out; whatever sits on
//! the other end owns the actual connection. Every connection ends with
//! exactly one [`SocketEvent::Closed`] unless the shard closed it first.

use crate::error::GatewayError;
use crate::gateway::close_code::{ABNORMAL_CLOSURE, NO_STATUS};
use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use std::io;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

/// Buffered frames per direction
pub const SOCKET_CHANNEL_SIZE: usize = 100;

/// Default time allowed for the WebSocket handshake
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Shard to socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketCommand {
    Text(String),
    /// Send a close frame and drop the connection
    Close { code: u16, reason: String },
}

/// Socket to shard
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    Text(String),
    Binary(Vec<u8>),
    /// The connection is gone; nothing follows
    Closed { code: u16, reason: String },
    /// Transport failure, always followed by `Closed`
    Error(String),
}

/// Shard side of an open socket
#[derive(Debug)]
pub struct SocketConnection {
    pub commands: mpsc::Sender<SocketCommand>,
    pub events: mpsc::Receiver<SocketEvent>,
}

/// Network side of an open socket
#[derive(Debug)]
pub struct SocketEndpoint {
    pub commands: mpsc::Receiver<SocketCommand>,
    pub events: mpsc::Sender<SocketEvent>,
}

impl SocketConnection {
    /// Linked pair of socket halves
    pub fn pair(capacity: usize) -> (SocketConnection, SocketEndpoint) {
        let (command_tx, command_rx) = mpsc::channel(capacity);
        let (event_tx, event_rx) = mpsc::channel(capacity);
        (
            SocketConnection {
                commands: command_tx,
                events: event_rx,
            },
            SocketEndpoint {
                commands: command_rx,
                events: event_tx,
            },
        )
    }
}

/// Opens sockets for shards
pub trait Transport: Send + Sync + 'static {
    /// Open a socket to `url`, resolving once the handshake completed
    fn connect(&self, url: String) -> BoxFuture<'static, Result<SocketConnection, GatewayError>>;
}

/// WebSocket transport over tokio-tungstenite
#[derive(Debug, Clone)]
pub struct WsTransport {
    connect_timeout: Duration,
}

impl Default for WsTransport {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl WsTransport {
    pub fn with_connect_timeout(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Transport for WsTransport {
    fn connect(&self, url: String) -> BoxFuture<'static, Result<SocketConnection, GatewayError>> {
        let connect_timeout = self.connect_timeout;
        Box::pin(async move {
            let (stream, _) = tokio::time::timeout(connect_timeout, connect_async(url.as_str()))
                .await
                .map_err(|_| {
                    GatewayError::Transport(tungstenite::Error::Io(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "timed out opening gateway socket",
                    )))
                })??;

            debug!(url, "Gateway socket open");
            let (connection, endpoint) = SocketConnection::pair(SOCKET_CHANNEL_SIZE);
            tokio::spawn(pump(stream, endpoint));
            Ok(connection)
        })
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Shuttle frames between the WebSocket and the shard's channels
async fn pump(stream: WsStream, mut endpoint: SocketEndpoint) {
    let (mut write, mut read) = stream.split();

    loop {
        tokio::select! {
            command = endpoint.commands.recv() => match command {
                Some(SocketCommand::Text(text)) => {
                    if let Err(e) = write.send(Message::Text(text)).await {
                        fail(&endpoint, e).await;
                        break;
                    }
                }
                Some(SocketCommand::Close { code, reason }) => {
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: reason.into(),
                    };
                    let _ = write.send(Message::Close(Some(frame))).await;
                    break;
                }
                // Shard let go of the socket without saying why
                None => {
                    let _ = write.close().await;
                    break;
                }
            },
            message = read.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    if endpoint.events.send(SocketEvent::Text(text)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Binary(bytes))) => {
                    if endpoint.events.send(SocketEvent::Binary(bytes)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|f| (u16::from(f.code), f.reason.into_owned()))
                        .unwrap_or((NO_STATUS, String::new()));
                    let _ = endpoint.events.send(SocketEvent::Closed { code, reason }).await;
                    break;
                }
                // Ping/pong are answered by tungstenite itself
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    fail(&endpoint, e).await;
                    break;
                }
                None => {
                    let _ = endpoint
                        .events
                        .send(SocketEvent::Closed {
                            code: ABNORMAL_CLOSURE,
                            reason: "stream ended".to_string(),
                        })
                        .await;
                    break;
                }
            },
        }
    }
}

/// Surface a transport failure as an error followed by an abnormal close
async fn fail(endpoint: &SocketEndpoint, error: tungstenite::Error) {
    warn!(error = %error, "Gateway socket failed");
    let reason = error.to_string();
    let _ = endpoint.events.send(SocketEvent::Error(reason.clone())).await;
    let _ = endpoint
        .events
        .send(SocketEvent::Closed {
            code: ABNORMAL_CLOSURE,
            reason,
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pair_links_both_directions() {
        let (mut connection, mut endpoint) = SocketConnection::pair(4);

        connection
            .commands
            .send(SocketCommand::Text("out".to_string()))
            .await
            .unwrap();
        assert_eq!(
            endpoint.commands.recv().await,
            Some(SocketCommand::Text("out".to_string()))
        );

        endpoint
            .events
            .send(SocketEvent::Binary(vec![1, 2]))
            .await
            .unwrap();
        assert_eq!(connection.events.recv().await, Some(SocketEvent::Binary(vec![1, 2])));
    }

    #[tokio::test]
    async fn refused_connection_is_a_transport_error() {
        let transport = WsTransport::with_connect_timeout(Duration::from_secs(5));
        let result = transport.connect("ws://127.0.0.1:1/?v=10".to_string()).await;
        assert!(matches!(result, Err(GatewayError::Transport(_))));
    }
}
