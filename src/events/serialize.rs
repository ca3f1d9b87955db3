//! Event serialization for message broker
//!
//! Converts raw dispatch payloads into JSON envelopes for NATS publishing.
//! The dispatch body is forwarded untouched in `data`; routing ids are
//! lifted out of it where the event carries them.

use crate::gateway::{GatewayPayload, OpCode};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

/// Generic gateway event payload
#[derive(Debug, Clone, Serialize)]
pub struct GatewayEvent {
    pub event_id: String,
    pub event_type: String,
    pub shard_id: u32,
    /// Gateway sequence number of the dispatch
    pub seq: Option<u64>,
    pub timestamp: u64,
    pub guild_id: Option<String>,
    pub channel_id: Option<String>,
    pub user_id: Option<String>,
    pub data: Value,
}

/// `GUILD_MEMBER_ADD` -> `guild.member_add`
pub fn event_type(name: &str) -> String {
    name.to_ascii_lowercase().replacen('_', ".", 1)
}

/// Serialize a dispatch payload to a GatewayEvent envelope
///
/// Returns None for payloads we don't forward to workers: non-dispatch
/// opcodes and the session lifecycle dispatches (READY, RESUMED).
pub fn serialize_dispatch(payload: &GatewayPayload, shard_id: u32) -> Option<GatewayEvent> {
    if payload.opcode() != Some(OpCode::Dispatch) {
        return None;
    }
    let name = payload.event_name()?;
    if matches!(name, "READY" | "RESUMED") {
        return None;
    }

    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default();

    let d = &payload.d;
    let guild_id = string_at(d, &["guild_id"]).or_else(|| {
        // Guild lifecycle events carry the guild itself
        if name.starts_with("GUILD_") && !name.starts_with("GUILD_MEMBER") {
            string_at(d, &["id"])
        } else {
            None
        }
    });
    let channel_id = string_at(d, &["channel_id"]);
    let user_id = string_at(d, &["user", "id"])
        .or_else(|| string_at(d, &["member", "user", "id"]))
        .or_else(|| string_at(d, &["author", "id"]))
        .or_else(|| string_at(d, &["user_id"]));

    Some(GatewayEvent {
        event_id: Uuid::new_v4().to_string(),
        event_type: event_type(name),
        shard_id,
        seq: payload.s,
        timestamp,
        guild_id,
        channel_id,
        user_id,
        data: d.clone(),
    })
}

fn string_at(value: &Value, path: &[&str]) -> Option<String> {
    path.iter()
        .try_fold(value, |v, key| v.get(key))?
        .as_str()
        .map(str::to_string)
}
