//! Shard lifecycle against an in-memory gateway

mod support;

use arrakis_shards::error::GatewayError;
use arrakis_shards::gateway::close_code::{RECONNECT_REQUESTED, ZOMBIED_CONNECTION};
use arrakis_shards::shard::{Shard, ShardStage, SocketCommand};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use support::*;
use tokio::time::Instant;

fn spawn_shard(
    id: u32,
    total: u32,
) -> (
    Shard,
    tokio::task::JoinHandle<Result<(), GatewayError>>,
    Connections,
    tokio::sync::mpsc::UnboundedReceiver<(u32, arrakis_shards::gateway::GatewayPayload)>,
) {
    let (transport, connections) = MockTransport::new();
    let (sink, dispatches) = channel_sink();
    let (shard, task) = Shard::spawn(id, total, Arc::new(shard_options()), context(transport, sink, total));
    (shard, task, connections, dispatches)
}

#[tokio::test]
async fn identifies_after_hello_and_forwards_dispatches() {
    let (shard, _task, mut connections, mut dispatches) = spawn_shard(1, 4);

    shard.connect().await.unwrap();
    let mut gateway = connections.next().await;
    assert_eq!(gateway.url, "wss://gateway.discord.gg/?v=10&encoding=json");

    gateway.hello().await;

    // The first beat goes out right away and carries no sequence yet
    assert_eq!(gateway.next_any_frame().await, json!({"op": 1, "d": null}));

    let identify = gateway.next_frame().await;
    assert_eq!(identify["op"], 2);
    assert_eq!(identify["d"]["token"], TOKEN);
    assert_eq!(identify["d"]["shard"], json!([1, 4]));
    assert!(identify["d"].get("compress").is_none());

    gateway.ready(1, "session-a", "wss://resume.test").await;
    shard.wait_until_ready().await.unwrap();

    gateway.dispatch("MESSAGE_CREATE", 5, json!({"id": "42"})).await;

    let (shard_id, ready) = next_dispatch(&mut dispatches).await;
    assert_eq!(shard_id, 1);
    assert_eq!(ready.event_name(), Some("READY"));
    let (_, message) = next_dispatch(&mut dispatches).await;
    assert_eq!(message.event_name(), Some("MESSAGE_CREATE"));
    assert_eq!(message.s, Some(5));

    let status = shard.wait_for(|s| s.sequence == Some(5)).await.unwrap();
    assert_eq!(status.session_id.as_deref(), Some("session-a"));
    assert_eq!(status.heartbeat_interval, Some(Duration::from_millis(HEARTBEAT_MS)));
    assert!(status.resumable);
}

#[tokio::test]
async fn resumes_on_the_resume_host_after_transient_loss() {
    let (shard, _task, mut connections, _dispatches) = spawn_shard(0, 1);

    shard.connect().await.unwrap();
    let mut gateway = connections.next().await;
    gateway.handshake([0, 1], "session-a").await;
    gateway.dispatch("MESSAGE_CREATE", 5, json!({})).await;
    shard.wait_for(|s| s.sequence == Some(5)).await.unwrap();

    gateway.close(1006).await;

    let mut gateway = connections.next().await;
    assert_eq!(gateway.url, "wss://resume.test/?v=10&encoding=json");

    gateway.hello().await;
    let resume = gateway.next_frame().await;
    assert_eq!(resume["op"], 6);
    assert_eq!(resume["d"]["session_id"], "session-a");
    assert_eq!(resume["d"]["seq"], 5);
    shard.wait_for(|s| s.stage == ShardStage::Resuming).await.unwrap();

    gateway.dispatch("RESUMED", 6, json!(null)).await;
    shard.wait_until_ready().await.unwrap();
    assert_eq!(shard.status().sequence, Some(6));
}

#[tokio::test]
async fn fatal_close_stops_the_shard() {
    let (shard, task, mut connections, _dispatches) = spawn_shard(0, 1);

    shard.connect().await.unwrap();
    let mut gateway = connections.next().await;
    gateway.hello().await;
    gateway.next_frame().await;
    gateway.close(4004).await;

    let result = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();
    match result {
        Err(GatewayError::FatalClose { shard_id, code, .. }) => {
            assert_eq!(shard_id, 0);
            assert_eq!(code, 4004);
        }
        other => panic!("expected a fatal close, got {other:?}"),
    }
    assert_eq!(shard.stage(), ShardStage::Dead);
    connections.assert_none(GATE_DELAY * 5).await;
}

#[tokio::test]
async fn session_timeout_starts_a_fresh_session() {
    let (shard, _task, mut connections, _dispatches) = spawn_shard(0, 1);

    shard.connect().await.unwrap();
    let mut gateway = connections.next().await;
    gateway.handshake([0, 1], "session-a").await;
    shard.wait_until_ready().await.unwrap();

    gateway.close(4009).await;

    let mut gateway = connections.next().await;
    assert_eq!(gateway.url, "wss://gateway.discord.gg/?v=10&encoding=json");
    gateway.hello().await;
    let frame = gateway.next_frame().await;
    assert_eq!(frame["op"], 2);
    assert_eq!(shard.status().session_id, None);
}

#[tokio::test]
async fn unacknowledged_heartbeat_closes_as_zombied() {
    let (shard, _task, mut connections, _dispatches) = spawn_shard(0, 1);

    shard.connect().await.unwrap();
    let mut gateway = connections.next().await;
    gateway.handshake([0, 1], "session-a").await;
    shard.wait_until_ready().await.unwrap();

    // The beat sent on Hello was never acknowledged
    shard.heartbeat(false).unwrap();
    assert_eq!(gateway.expect_close().await, ZOMBIED_CONNECTION);

    // Zombied connections keep the session
    let mut gateway = connections.next().await;
    gateway.hello().await;
    assert_eq!(gateway.next_frame().await["op"], 6);
}

#[tokio::test(start_paused = true)]
async fn missed_ack_closes_on_the_next_tick() {
    let (shard, _task, mut connections, _dispatches) = spawn_shard(0, 1);

    shard.connect().await.unwrap();
    let mut gateway = connections.next().await;
    gateway.hello_with(1000).await;
    assert_eq!(gateway.next_any_frame().await, json!({"op": 1, "d": null}));
    assert_eq!(gateway.next_any_frame().await["op"], 2);
    gateway.ready(1, "session-a", "wss://resume.test").await;
    shard.wait_until_ready().await.unwrap();

    let sent = Instant::now();
    loop {
        match gateway.next_command().await {
            SocketCommand::Close { code, .. } => {
                assert_eq!(code, ZOMBIED_CONNECTION);
                break;
            }
            SocketCommand::Text(text) => {
                let frame: serde_json::Value = serde_json::from_str(&text).unwrap();
                assert_ne!(frame["op"], 1, "beat sent while the previous one was unacknowledged");
            }
        }
    }
    assert_eq!(sent.elapsed(), Duration::from_millis(1000));
}

#[tokio::test(start_paused = true)]
async fn second_hello_replaces_the_heartbeat_timer() {
    let (shard, _task, mut connections, _dispatches) = spawn_shard(0, 1);

    shard.connect().await.unwrap();
    let mut gateway = connections.next().await;
    gateway.hello_with(1000).await;
    assert_eq!(gateway.next_any_frame().await["op"], 1);
    assert_eq!(gateway.next_any_frame().await["op"], 2);
    gateway.ack().await;
    shard.wait_for(|s| s.latency.is_some()).await.unwrap();

    gateway.hello_with(1500).await;
    assert_eq!(gateway.next_any_frame().await["op"], 1);
    let rearmed = Instant::now();
    gateway.ack().await;
    let status = shard
        .wait_for(|s| s.heartbeat_interval == Some(Duration::from_millis(1500)))
        .await
        .unwrap();
    assert!(status.open);

    // Only the 1500ms timer is left running
    let mut beats = Vec::new();
    while beats.len() < 3 {
        let frame = gateway.next_any_frame().await;
        if frame["op"] == 1 {
            beats.push(rearmed.elapsed());
            gateway.ack().await;
        }
    }
    assert_eq!(
        beats,
        vec![
            Duration::from_millis(1500),
            Duration::from_millis(3000),
            Duration::from_millis(4500),
        ]
    );
    assert!(shard.is_open());
}

#[tokio::test]
async fn acknowledged_heartbeat_keeps_the_socket() {
    let (shard, _task, mut connections, _dispatches) = spawn_shard(0, 1);

    shard.connect().await.unwrap();
    let mut gateway = connections.next().await;
    gateway.handshake([0, 1], "session-a").await;
    shard.wait_until_ready().await.unwrap();

    gateway.send(json!({"op": 11})).await;
    shard.wait_for(|s| s.latency.is_some()).await.unwrap();

    shard.heartbeat(false).unwrap();
    assert_eq!(gateway.next_any_frame().await, json!({"op": 1, "d": 1}));
    assert!(shard.is_open());
}

#[tokio::test]
async fn answers_requested_heartbeat_immediately() {
    let (shard, _task, mut connections, _dispatches) = spawn_shard(0, 1);

    shard.connect().await.unwrap();
    let mut gateway = connections.next().await;
    gateway.handshake([0, 1], "session-a").await;
    shard.wait_until_ready().await.unwrap();

    // Requested beats go out even while the previous one is unacknowledged
    gateway.send(json!({"op": 1, "d": null})).await;
    assert_eq!(gateway.next_any_frame().await, json!({"op": 1, "d": 1}));
    assert!(shard.is_open());
}

#[tokio::test]
async fn reconnect_request_closes_and_resumes() {
    let (shard, _task, mut connections, _dispatches) = spawn_shard(0, 1);

    shard.connect().await.unwrap();
    let mut gateway = connections.next().await;
    gateway.handshake([0, 1], "session-a").await;
    shard.wait_until_ready().await.unwrap();

    gateway.send(json!({"op": 7, "d": null})).await;
    assert_eq!(gateway.expect_close().await, RECONNECT_REQUESTED);

    let mut gateway = connections.next().await;
    gateway.hello().await;
    assert_eq!(gateway.next_frame().await["op"], 6);
}

#[tokio::test]
async fn non_resumable_invalid_session_identifies_again() {
    let (shard, _task, mut connections, _dispatches) = spawn_shard(0, 1);

    shard.connect().await.unwrap();
    let mut gateway = connections.next().await;
    gateway.handshake([0, 1], "session-a").await;
    shard.wait_until_ready().await.unwrap();

    gateway.send(json!({"op": 9, "d": false})).await;
    let frame = gateway.next_frame().await;
    assert_eq!(frame["op"], 2);
    let status = shard.wait_for(|s| s.stage == ShardStage::Identifying).await.unwrap();
    assert_eq!(status.session_id, None);
    assert!(status.open);
}

#[tokio::test]
async fn resumable_invalid_session_resumes() {
    let (shard, _task, mut connections, _dispatches) = spawn_shard(0, 1);

    shard.connect().await.unwrap();
    let mut gateway = connections.next().await;
    gateway.handshake([0, 1], "session-a").await;
    shard.wait_until_ready().await.unwrap();

    gateway.send(json!({"op": 9, "d": true})).await;
    let frame = gateway.next_frame().await;
    assert_eq!(frame["op"], 6);
    assert_eq!(frame["d"]["session_id"], "session-a");
    assert_eq!(frame["d"]["seq"], 1);

    let status = shard.wait_for(|s| s.stage == ShardStage::Resuming).await.unwrap();
    assert_eq!(status.session_id.as_deref(), Some("session-a"));
    assert!(status.open);
}

#[tokio::test]
async fn resumable_invalid_session_without_session_is_terminal() {
    let (shard, task, mut connections, _dispatches) = spawn_shard(0, 1);

    shard.connect().await.unwrap();
    let mut gateway = connections.next().await;
    gateway.hello().await;
    gateway.next_frame().await;

    gateway.send(json!({"op": 9, "d": true})).await;

    let result = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(GatewayError::ProtocolViolation { .. })));
}

#[tokio::test]
async fn undecodable_frames_are_skipped() {
    let (shard, _task, mut connections, mut dispatches) = spawn_shard(0, 1);

    shard.connect().await.unwrap();
    let mut gateway = connections.next().await;
    gateway.handshake([0, 1], "session-a").await;
    next_dispatch(&mut dispatches).await;

    gateway.send_raw("{not json").await;
    gateway.dispatch("TYPING_START", 2, json!({})).await;

    let (_, payload) = next_dispatch(&mut dispatches).await;
    assert_eq!(payload.event_name(), Some("TYPING_START"));
    assert!(shard.is_open());
}

#[tokio::test]
async fn offline_frames_flush_forced_first_once_ready() {
    let (shard, _task, mut connections, _dispatches) = spawn_shard(0, 1);

    let normal = {
        let shard = shard.clone();
        tokio::spawn(async move { shard.send(false, &json!({"op": 3, "d": "normal"})).await })
    };
    shard.wait_for(|s| s.queued == 1).await.unwrap();
    let forced = {
        let shard = shard.clone();
        tokio::spawn(async move { shard.send(true, &json!({"op": 3, "d": "forced"})).await })
    };
    shard.wait_for(|s| s.queued == 2).await.unwrap();

    shard.connect().await.unwrap();
    let mut gateway = connections.next().await;
    gateway.handshake([0, 1], "session-a").await;

    assert_eq!(gateway.next_frame().await["d"], "forced");
    assert_eq!(gateway.next_frame().await["d"], "normal");
    normal.await.unwrap().unwrap();
    forced.await.unwrap().unwrap();
    shard.wait_for(|s| s.queued == 0).await.unwrap();
}

#[tokio::test]
async fn unserializable_message_is_an_encode_error() {
    let (shard, _task, _connections, _dispatches) = spawn_shard(0, 1);

    // JSON object keys must be strings
    let message: HashMap<(u8, u8), u8> = HashMap::from([((1, 2), 3)]);
    let result = shard.send(false, &message).await;

    assert!(matches!(result, Err(GatewayError::Encode(_))), "got {result:?}");
    assert_eq!(result.unwrap_err().error_type_label(), "encode");
    assert_eq!(shard.status().queued, 0);
}

#[tokio::test]
async fn close_with_shutdown_code_stays_down() {
    let (shard, _task, mut connections, _dispatches) = spawn_shard(0, 1);

    shard.connect().await.unwrap();
    let mut gateway = connections.next().await;
    gateway.handshake([0, 1], "session-a").await;
    shard.wait_until_ready().await.unwrap();

    shard.close(3000, "done").await.unwrap();
    assert_eq!(gateway.expect_close().await, 3000);
    shard.wait_for(|s| s.stage == ShardStage::Idle && !s.open).await.unwrap();
    connections.assert_none(GATE_DELAY * 5).await;
}

#[tokio::test]
async fn shutdown_ends_the_event_loop() {
    let (shard, task, mut connections, _dispatches) = spawn_shard(0, 1);

    shard.connect().await.unwrap();
    let mut gateway = connections.next().await;
    gateway.hello().await;

    shard.shutdown(3000, "bye").unwrap();
    assert_eq!(gateway.expect_close().await, 3000);

    let result = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());
    assert!(matches!(
        shard.identify(),
        Err(GatewayError::ShardClosed { shard_id: 0 })
    ));
}
