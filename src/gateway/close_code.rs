//! Close code triage
//!
//! Codes below 4000 are WebSocket-level, 3xxx are reserved for this client's
//! own closes, 4xxx come from the gateway.

/// Normal closure; the gateway uses it when it drops a session
pub const NORMAL_CLOSURE: u16 = 1000;
pub const GOING_AWAY: u16 = 1001;
/// No status code present in the close frame
pub const NO_STATUS: u16 = 1005;
/// Connection dropped without a close frame
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// Client is shutting the shard down for good
pub const SHUTDOWN: u16 = 3000;
/// The previous heartbeat was never acknowledged
pub const ZOMBIED_CONNECTION: u16 = 3010;
/// The gateway asked us to reconnect (opcode 7)
pub const RECONNECT_REQUESTED: u16 = 3024;
pub const TESTING_FINISHED: u16 = 3064;
/// The shard was retired by a resharding cutover
pub const RESHARDED: u16 = 3065;

pub const UNKNOWN_ERROR: u16 = 4000;
pub const UNKNOWN_OPCODE: u16 = 4001;
pub const DECODE_ERROR: u16 = 4002;
pub const NOT_AUTHENTICATED: u16 = 4003;
pub const AUTHENTICATION_FAILED: u16 = 4004;
pub const ALREADY_AUTHENTICATED: u16 = 4005;
pub const INVALID_SEQUENCE: u16 = 4007;
pub const RATE_LIMITED: u16 = 4008;
pub const SESSION_TIMED_OUT: u16 = 4009;
pub const INVALID_SHARD: u16 = 4010;
pub const SHARDING_REQUIRED: u16 = 4011;
pub const INVALID_API_VERSION: u16 = 4012;
pub const INVALID_INTENTS: u16 = 4013;
pub const DISALLOWED_INTENTS: u16 = 4014;

/// What a shard does after its socket closed with a given code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosePolicy {
    /// Deliberate close; stay down
    Shutdown,
    /// Session is gone: forget it and identify again
    ResumableLoss,
    /// Connection hiccup: reconnect and try to resume
    Transient,
    /// Credentials or configuration are wrong; retrying cannot help
    Fatal,
}

impl ClosePolicy {
    pub fn reconnects(self) -> bool {
        matches!(self, Self::ResumableLoss | Self::Transient)
    }

    /// Metric label
    pub fn label(self) -> &'static str {
        match self {
            Self::Shutdown => "shutdown",
            Self::ResumableLoss => "resumable_loss",
            Self::Transient => "transient",
            Self::Fatal => "fatal",
        }
    }
}

/// Classify a close code; unknown codes are treated as transient
pub fn classify(code: u16) -> ClosePolicy {
    match code {
        SHUTDOWN | TESTING_FINISHED | RESHARDED => ClosePolicy::Shutdown,
        NORMAL_CLOSURE | UNKNOWN_OPCODE | INVALID_SEQUENCE | SESSION_TIMED_OUT => {
            ClosePolicy::ResumableLoss
        }
        AUTHENTICATION_FAILED | INVALID_SHARD | SHARDING_REQUIRED | INVALID_API_VERSION
        | INVALID_INTENTS | DISALLOWED_INTENTS => ClosePolicy::Fatal,
        _ => ClosePolicy::Transient,
    }
}

/// Human readable name for logs
pub fn describe(code: u16) -> &'static str {
    match code {
        NORMAL_CLOSURE => "normal closure",
        GOING_AWAY => "going away",
        NO_STATUS => "no status",
        ABNORMAL_CLOSURE => "abnormal closure",
        SHUTDOWN => "shutdown",
        ZOMBIED_CONNECTION => "zombied connection",
        RECONNECT_REQUESTED => "reconnect requested",
        TESTING_FINISHED => "testing finished",
        RESHARDED => "resharded",
        UNKNOWN_ERROR => "unknown error",
        UNKNOWN_OPCODE => "unknown opcode",
        DECODE_ERROR => "decode error",
        NOT_AUTHENTICATED => "not authenticated",
        AUTHENTICATION_FAILED => "authentication failed",
        ALREADY_AUTHENTICATED => "already authenticated",
        INVALID_SEQUENCE => "invalid sequence",
        RATE_LIMITED => "rate limited",
        SESSION_TIMED_OUT => "session timed out",
        INVALID_SHARD => "invalid shard",
        SHARDING_REQUIRED => "sharding required",
        INVALID_API_VERSION => "invalid API version",
        INVALID_INTENTS => "invalid intents",
        DISALLOWED_INTENTS => "disallowed intents",
        _ => "unrecognized",
    }
}
