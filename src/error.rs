//! Domain error types for the shard transport
//!
//! main.rs is the ONLY module allowed to use anyhow::Result (process boundary).
//! All library code returns Result<T, GatewayError>.

use thiserror::Error;

/// Gateway transport errors
///
/// Every variant carries structured context fields for diagnostics.
/// On-call engineers can pattern-match on the variant to understand
/// the failure mode without parsing error message strings.
///
/// Example log output:
/// ```text
/// GatewayError::FatalClose { shard_id: 3, code: 4014, reason: "Disallowed intent(s)." }
/// → "shard 3 closed with fatal code 4014: Disallowed intent(s)."
/// ```
#[derive(Error, Debug)]
pub enum GatewayError {
    /// The gateway closed the connection with a code that must not be retried
    #[error("shard {shard_id} closed with fatal code {code}: {reason}")]
    FatalClose {
        shard_id: u32,
        code: u16,
        reason: String,
    },

    /// The remote service broke the protocol contract
    #[error("shard {shard_id} protocol violation: {detail}")]
    ProtocolViolation { shard_id: u32, detail: String },

    /// Inbound frame was not valid JSON for a gateway payload
    #[error("failed to decode gateway payload")]
    Decode(#[from] serde_json::Error),

    /// Outbound message could not be serialized to a JSON frame
    #[error("failed to encode outbound payload")]
    Encode(#[source] serde_json::Error),

    /// Inbound binary frame could not be inflated
    #[error("failed to inflate compressed frame")]
    Decompress(#[source] std::io::Error),

    /// WebSocket transport failure
    #[error("websocket transport error")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    /// Frame could not be written because the socket is gone
    #[error("shard {shard_id} is not connected")]
    NotConnected { shard_id: u32 },

    /// The shard's event loop has stopped and no longer accepts commands
    #[error("shard {shard_id} event loop has stopped")]
    ShardClosed { shard_id: u32 },

    /// Resharding was abandoned before cutover
    #[error("resharding to {total_shards} shards failed: {reason}")]
    ReshardFailed { total_shards: u32, reason: String },

    /// Gateway sizing lookup failed
    #[error("gateway info lookup failed")]
    GatewayInfo(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// NATS publish failed for a specific subject
    #[error("NATS publish failed for subject '{subject}'")]
    NatsPublishFailed {
        subject: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// NATS connection failed
    #[error("NATS connection failed")]
    NatsConnectionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Configuration error (environment variable missing or invalid)
    #[error("configuration error: {0}")]
    Config(String),

    /// Shard ID overflow: u64 value exceeds u32::MAX (wire format boundary)
    #[error("shard ID overflow: {value} exceeds u32::MAX")]
    ShardIdOverflow { value: u64 },
}

impl GatewayError {
    /// Returns a static label string suitable for Prometheus metrics.
    ///
    /// Used as the `error_type` label on `gateway_errors_total` counter,
    /// enabling per-error-type monitoring and alerting.
    pub fn error_type_label(&self) -> &'static str {
        match self {
            Self::FatalClose { .. } => "fatal_close",
            Self::ProtocolViolation { .. } => "protocol_violation",
            Self::Decode(_) => "decode",
            Self::Encode(_) => "encode",
            Self::Decompress(_) => "decompress",
            Self::Transport(_) => "transport",
            Self::NotConnected { .. } => "not_connected",
            Self::ShardClosed { .. } => "shard_closed",
            Self::ReshardFailed { .. } => "reshard_failed",
            Self::GatewayInfo(_) => "gateway_info",
            Self::NatsPublishFailed { .. } => "nats_publish",
            Self::NatsConnectionFailed(_) => "nats_connection",
            Self::Config(_) => "config",
            Self::ShardIdOverflow { .. } => "shard_overflow",
        }
    }

    /// Terminal errors are surfaced to the operator instead of being retried.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::FatalClose { .. } | Self::ProtocolViolation { .. } | Self::Config(_)
        )
    }
}
