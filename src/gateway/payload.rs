//! Gateway wire payloads
//!
//! Every frame on the socket is a JSON object `{op, d, s, t}`. Inbound frames
//! are decoded into [`GatewayPayload`] with `d` left as raw JSON so the
//! dispatcher can forward it untouched; outbound frames are typed structs
//! wrapped in [`OutgoingPayload`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Gateway opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    Dispatch,
    Heartbeat,
    Identify,
    PresenceUpdate,
    VoiceStateUpdate,
    Resume,
    Reconnect,
    RequestGuildMembers,
    InvalidSession,
    Hello,
    HeartbeatAck,
}

impl OpCode {
    /// Numeric wire value
    pub const fn code(self) -> u8 {
        match self {
            Self::Dispatch => 0,
            Self::Heartbeat => 1,
            Self::Identify => 2,
            Self::PresenceUpdate => 3,
            Self::VoiceStateUpdate => 4,
            Self::Resume => 6,
            Self::Reconnect => 7,
            Self::RequestGuildMembers => 8,
            Self::InvalidSession => 9,
            Self::Hello => 10,
            Self::HeartbeatAck => 11,
        }
    }

    /// Parse a wire value, `None` for opcodes this client does not know
    pub const fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::Dispatch,
            1 => Self::Heartbeat,
            2 => Self::Identify,
            3 => Self::PresenceUpdate,
            4 => Self::VoiceStateUpdate,
            6 => Self::Resume,
            7 => Self::Reconnect,
            8 => Self::RequestGuildMembers,
            9 => Self::InvalidSession,
            10 => Self::Hello,
            11 => Self::HeartbeatAck,
            _ => return None,
        })
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.code())
    }
}

/// Inbound gateway frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayPayload {
    pub op: u8,
    #[serde(default)]
    pub d: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
}

impl GatewayPayload {
    /// Known opcode of this frame
    pub fn opcode(&self) -> Option<OpCode> {
        OpCode::from_code(self.op)
    }

    /// Dispatch event name (`READY`, `GUILD_CREATE`, ...)
    pub fn event_name(&self) -> Option<&str> {
        self.t.as_deref()
    }

    /// Build a dispatch frame, mostly useful for feeding sinks in tests
    pub fn dispatch(event: impl Into<String>, seq: u64, d: Value) -> Self {
        Self {
            op: OpCode::Dispatch.code(),
            d,
            s: Some(seq),
            t: Some(event.into()),
        }
    }
}

/// Outbound gateway frame
#[derive(Debug, Clone, Serialize)]
pub struct OutgoingPayload<T> {
    pub op: u8,
    pub d: T,
}

impl<T: Serialize> OutgoingPayload<T> {
    pub fn new(op: OpCode, d: T) -> Self {
        Self { op: op.code(), d }
    }
}

/// `d` of a Hello frame
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Hello {
    pub heartbeat_interval: u64,
}

/// The fields of a READY dispatch the transport cares about
#[derive(Debug, Clone, Deserialize)]
pub struct ReadySession {
    pub session_id: String,
    #[serde(default)]
    pub resume_gateway_url: Option<String>,
}

/// Client properties sent with Identify
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifyProperties {
    pub os: String,
    pub browser: String,
    pub device: String,
}

impl Default for IdentifyProperties {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            browser: env!("CARGO_PKG_NAME").to_string(),
            device: env!("CARGO_PKG_NAME").to_string(),
        }
    }
}

/// Presence attached to Identify
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceUpdate {
    pub since: Option<u64>,
    pub activities: Vec<Activity>,
    pub status: String,
    pub afk: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// `d` of an Identify frame
#[derive(Debug, Clone, Serialize)]
pub struct Identify {
    pub token: String,
    pub intents: u64,
    pub shard: [u32; 2],
    pub properties: IdentifyProperties,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compress: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence: Option<PresenceUpdate>,
}

/// `d` of a Resume frame
#[derive(Debug, Clone, Serialize)]
pub struct Resume {
    pub token: String,
    pub session_id: String,
    pub seq: u64,
}
