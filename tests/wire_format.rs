//! Wire format conformance tests
//!
//! Two contracts are pinned here: the frames shards write to the gateway,
//! and the envelope NATS consumers decode. A change to either breaks
//! something outside this crate, so a failure here needs a deliberate
//! decision, not a test update.

use arrakis_shards::events::serialize_dispatch;
use arrakis_shards::gateway::{
    Activity, GatewayPayload, Identify, IdentifyProperties, OpCode, OutgoingPayload,
    PresenceUpdate, Resume,
};
use arrakis_shards::nats::subject_for;
use serde_json::{json, Value};

/// Required envelope fields for every GatewayEvent.
const REQUIRED_ENVELOPE_FIELDS: &[&str] = &[
    "event_id",
    "event_type",
    "shard_id",
    "seq",
    "timestamp",
    "guild_id",
    "channel_id",
    "user_id",
    "data",
];

fn properties() -> IdentifyProperties {
    IdentifyProperties {
        os: "linux".to_string(),
        browser: "arrakis".to_string(),
        device: "arrakis".to_string(),
    }
}

/// Envelope with the per-publish fields blanked so it can be compared
fn envelope(payload: &GatewayPayload, shard_id: u32) -> Value {
    let event = serialize_dispatch(payload, shard_id).expect("dispatch should be forwarded");
    let mut value = serde_json::to_value(&event).unwrap();
    uuid::Uuid::parse_str(value["event_id"].as_str().unwrap()).expect("event_id must be a UUID");
    assert!(value["timestamp"].as_u64().unwrap() > 0);
    value["event_id"] = Value::Null;
    value["timestamp"] = Value::Null;
    value
}

#[test]
fn identify_frame_shape() {
    let frame = OutgoingPayload::new(
        OpCode::Identify,
        Identify {
            token: "token".to_string(),
            intents: 513,
            shard: [2, 8],
            properties: properties(),
            compress: None,
            presence: None,
        },
    );

    assert_eq!(
        serde_json::to_value(&frame).unwrap(),
        json!({
            "op": 2,
            "d": {
                "token": "token",
                "intents": 513,
                "shard": [2, 8],
                "properties": {"os": "linux", "browser": "arrakis", "device": "arrakis"}
            }
        })
    );
}

#[test]
fn identify_frame_with_compression_and_presence() {
    let frame = OutgoingPayload::new(
        OpCode::Identify,
        Identify {
            token: "token".to_string(),
            intents: 1,
            shard: [0, 1],
            properties: properties(),
            compress: Some(true),
            presence: Some(PresenceUpdate {
                since: None,
                activities: vec![Activity {
                    name: "the spice".to_string(),
                    kind: 3,
                    url: None,
                }],
                status: "online".to_string(),
                afk: false,
            }),
        },
    );

    let value = serde_json::to_value(&frame).unwrap();
    assert_eq!(value["d"]["compress"], true);
    assert_eq!(
        value["d"]["presence"],
        json!({
            "since": null,
            "activities": [{"name": "the spice", "type": 3}],
            "status": "online",
            "afk": false
        })
    );
}

#[test]
fn resume_and_heartbeat_frame_shapes() {
    let resume = OutgoingPayload::new(
        OpCode::Resume,
        Resume {
            token: "token".to_string(),
            session_id: "abc".to_string(),
            seq: 42,
        },
    );
    assert_eq!(
        serde_json::to_value(&resume).unwrap(),
        json!({"op": 6, "d": {"token": "token", "session_id": "abc", "seq": 42}})
    );

    let first_beat = OutgoingPayload::new(OpCode::Heartbeat, None::<u64>);
    assert_eq!(serde_json::to_value(&first_beat).unwrap(), json!({"op": 1, "d": null}));

    let beat = OutgoingPayload::new(OpCode::Heartbeat, Some(7u64));
    assert_eq!(serde_json::to_value(&beat).unwrap(), json!({"op": 1, "d": 7}));
}

#[test]
fn inbound_frames_tolerate_missing_fields() {
    let ack: GatewayPayload = serde_json::from_str(r#"{"op":11}"#).unwrap();
    assert_eq!(ack.opcode(), Some(OpCode::HeartbeatAck));
    assert_eq!(ack.d, Value::Null);
    assert_eq!(ack.s, None);

    let dispatch: GatewayPayload =
        serde_json::from_str(r#"{"op":0,"s":3,"t":"TYPING_START","d":{}}"#).unwrap();
    assert_eq!(dispatch.event_name(), Some("TYPING_START"));
    assert_eq!(dispatch.s, Some(3));
}

#[test]
fn guild_create_envelope() {
    let payload = GatewayPayload::dispatch(
        "GUILD_CREATE",
        12,
        json!({"id": "123456789012345678", "name": "Test Guild", "member_count": 42}),
    );

    assert_eq!(
        envelope(&payload, 3),
        json!({
            "event_id": null,
            "event_type": "guild.create",
            "shard_id": 3,
            "seq": 12,
            "timestamp": null,
            "guild_id": "123456789012345678",
            "channel_id": null,
            "user_id": null,
            "data": {"id": "123456789012345678", "name": "Test Guild", "member_count": 42}
        })
    );
}

#[test]
fn interaction_envelope_routes_to_commands() {
    let payload = GatewayPayload::dispatch(
        "INTERACTION_CREATE",
        5,
        json!({
            "id": "444444444444444444",
            "guild_id": "123456789012345678",
            "channel_id": "333333333333333333",
            "member": {"user": {"id": "987654321098765432"}},
            "token": "aW50ZXJhY3Rpb25fdG9rZW4"
        }),
    );

    let value = envelope(&payload, 0);
    assert_eq!(value["event_type"], "interaction.create");
    assert_eq!(value["guild_id"], "123456789012345678");
    assert_eq!(value["channel_id"], "333333333333333333");
    assert_eq!(value["user_id"], "987654321098765432");
    assert_eq!(value["data"], payload.d);

    let event = serialize_dispatch(&payload, 0).unwrap();
    assert_eq!(subject_for(&event), "commands.interaction");
}

#[test]
fn member_events_do_not_mistake_the_user_for_the_guild() {
    let payload = GatewayPayload::dispatch(
        "GUILD_MEMBER_ADD",
        9,
        json!({"guild_id": "1", "user": {"id": "2"}}),
    );
    let value = envelope(&payload, 0);
    assert_eq!(value["guild_id"], "1");
    assert_eq!(value["user_id"], "2");

    let event = serialize_dispatch(&payload, 0).unwrap();
    assert_eq!(subject_for(&event), "events.guild.member_add");
}

#[test]
fn every_envelope_has_required_fields() {
    let payloads = [
        GatewayPayload::dispatch("GUILD_DELETE", 1, json!({"id": "1", "unavailable": false})),
        GatewayPayload::dispatch("MESSAGE_CREATE", 2, json!({"channel_id": "3", "author": {"id": "4"}})),
        GatewayPayload::dispatch("TYPING_START", 3, json!({})),
    ];

    for payload in &payloads {
        let value = envelope(payload, 0);
        let obj = value.as_object().unwrap();
        for field in REQUIRED_ENVELOPE_FIELDS {
            assert!(
                obj.contains_key(*field),
                "{:?} envelope missing required field '{field}'",
                payload.event_name()
            );
        }
    }
}

#[test]
fn session_lifecycle_dispatches_are_not_published() {
    let ready = GatewayPayload::dispatch("READY", 1, json!({"session_id": "abc"}));
    let resumed = GatewayPayload::dispatch("RESUMED", 2, json!(null));
    let hello: GatewayPayload = serde_json::from_value(json!({"op": 10, "d": {"heartbeat_interval": 1}})).unwrap();

    assert!(serialize_dispatch(&ready, 0).is_none());
    assert!(serialize_dispatch(&resumed, 0).is_none());
    assert!(serialize_dispatch(&hello, 0).is_none());
}
