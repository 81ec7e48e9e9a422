//! End-to-end exercise of `run_bridge`: a fake OneBot client connects over
//! the real WebSocket transport and drives the dispatch pipeline (§4.3,
//! §8). These scenarios intentionally avoid needing a working ACP agent —
//! command replies and the busy/mention rules all resolve before the
//! dispatcher ever touches the agent subprocess, and the "not connected"
//! case only needs the agent binary lookup to fail, which a nonexistent
//! command name guarantees without spawning anything.

use std::time::Duration;

use async_tungstenite::tokio::{connect_async, ConnectStream};
use async_tungstenite::tungstenite::Message;
use async_tungstenite::WebSocketStream;
use futures_util::{SinkExt, StreamExt};
use ncat_bridge::config::BridgeTomlConfig;
use ncat_bridge::run_bridge;
use serde_json::{json, Value};

type WsStream = WebSocketStream<ConnectStream>;

fn test_config() -> BridgeTomlConfig {
    let mut config = BridgeTomlConfig::default();
    config.server.host = "127.0.0.1".to_string();
    config.server.port = 0;
    config.agent.command = "ncat-bridge-test-nonexistent-agent-binary".to_string();
    config.ux.permission_timeout = 2.0;
    config.ux.thinking_notify_seconds = 0.0;
    config.ux.thinking_long_notify_seconds = 0.0;
    config
}

async fn connect(port: u16) -> WsStream {
    let (ws, _) = connect_async(format!("ws://127.0.0.1:{port}/"))
        .await
        .expect("websocket handshake with the bridge");
    ws
}

async fn send_json(ws: &mut WsStream, value: Value) {
    ws.send(Message::Text(value.to_string())).await.unwrap();
}

async fn recv_json(ws: &mut WsStream) -> Value {
    let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("timed out waiting for an outbound api call")
        .expect("websocket stream ended")
        .expect("websocket error");
    match msg {
        Message::Text(text) => serde_json::from_str(&text).unwrap(),
        other => panic!("unexpected frame: {other:?}"),
    }
}

async fn expect_silence(ws: &mut WsStream) {
    let result = tokio::time::timeout(Duration::from_millis(300), ws.next()).await;
    assert!(result.is_err(), "expected no outbound call, got {result:?}");
}

async fn ack(ws: &mut WsStream, api_call: &Value) {
    let echo = api_call["echo"].clone();
    send_json(ws, json!({"status": "ok", "retcode": 0, "data": {}, "echo": echo})).await;
}

fn lifecycle_connect(self_id: i64) -> Value {
    json!({
        "post_type": "meta_event",
        "meta_event_type": "lifecycle",
        "sub_type": "connect",
        "self_id": self_id,
    })
}

fn private_message(user_id: i64, text: &str) -> Value {
    json!({
        "post_type": "message",
        "message_type": "private",
        "user_id": user_id,
        "sender": {"nickname": "Alice"},
        "message": [{"type": "text", "data": {"text": text}}],
    })
}

fn group_message(group_id: i64, user_id: i64, text: &str, at_bot: Option<i64>) -> Value {
    let mut segments = Vec::new();
    if let Some(bot_id) = at_bot {
        segments.push(json!({"type": "at", "data": {"qq": bot_id.to_string()}}));
    }
    segments.push(json!({"type": "text", "data": {"text": text}}));
    json!({
        "post_type": "message",
        "message_type": "group",
        "user_id": user_id,
        "group_id": group_id,
        "group_name": "Test Group",
        "sender": {"nickname": "Bob"},
        "message": segments,
    })
}

#[tokio::test]
async fn help_command_replies_without_touching_the_agent() {
    let bridge = run_bridge(test_config()).await.unwrap();
    let port = bridge.local_addr().port();
    let mut ws = connect(port).await;

    send_json(&mut ws, lifecycle_connect(1)).await;
    send_json(&mut ws, private_message(111, "/help")).await;

    let call = recv_json(&mut ws).await;
    assert_eq!(call["action"], "send_private_msg");
    assert_eq!(call["params"]["user_id"], 111);
    let text = call["params"]["message"][0]["data"]["text"].as_str().unwrap();
    assert!(text.contains("/help"));
    assert!(text.contains("/new"));
    ack(&mut ws, &call).await;

    bridge.shutdown().await;
}

#[tokio::test]
async fn new_session_command_confirms_without_touching_the_agent() {
    let bridge = run_bridge(test_config()).await.unwrap();
    let port = bridge.local_addr().port();
    let mut ws = connect(port).await;

    send_json(&mut ws, lifecycle_connect(1)).await;
    send_json(&mut ws, private_message(111, "/new")).await;

    let call = recv_json(&mut ws).await;
    let text = call["params"]["message"][0]["data"]["text"].as_str().unwrap();
    assert_eq!(text, "New session created, AI context cleared.");
    ack(&mut ws, &call).await;

    bridge.shutdown().await;
}

#[tokio::test]
async fn stop_with_nothing_active_reports_no_active_thinking() {
    let bridge = run_bridge(test_config()).await.unwrap();
    let port = bridge.local_addr().port();
    let mut ws = connect(port).await;

    send_json(&mut ws, lifecycle_connect(1)).await;
    send_json(&mut ws, private_message(111, "/stop")).await;

    let call = recv_json(&mut ws).await;
    let text = call["params"]["message"][0]["data"]["text"].as_str().unwrap();
    assert_eq!(text, "No AI thinking is currently in progress.");
    ack(&mut ws, &call).await;

    bridge.shutdown().await;
}

#[tokio::test]
async fn group_message_without_mention_is_silently_dropped() {
    let bridge = run_bridge(test_config()).await.unwrap();
    let port = bridge.local_addr().port();
    let mut ws = connect(port).await;

    send_json(&mut ws, lifecycle_connect(999)).await;
    send_json(&mut ws, group_message(222, 111, "just chatting", None)).await;

    expect_silence(&mut ws).await;

    bridge.shutdown().await;
}

#[tokio::test]
async fn group_message_with_mention_is_dispatched_and_surfaces_agent_error() {
    let bridge = run_bridge(test_config()).await.unwrap();
    let port = bridge.local_addr().port();
    let mut ws = connect(port).await;

    send_json(&mut ws, lifecycle_connect(999)).await;
    send_json(&mut ws, group_message(222, 111, "hello there", Some(999))).await;

    let call = recv_json(&mut ws).await;
    assert_eq!(call["action"], "send_group_msg");
    assert_eq!(call["params"]["group_id"], 222);
    let text = call["params"]["message"][0]["data"]["text"].as_str().unwrap();
    assert_eq!(text, "Agent not connected, please try again later.");
    ack(&mut ws, &call).await;

    bridge.shutdown().await;
}

#[tokio::test]
async fn plain_private_message_surfaces_agent_not_connected() {
    let bridge = run_bridge(test_config()).await.unwrap();
    let port = bridge.local_addr().port();
    let mut ws = connect(port).await;

    send_json(&mut ws, lifecycle_connect(1)).await;
    send_json(&mut ws, private_message(111, "hello agent")).await;

    let call = recv_json(&mut ws).await;
    assert_eq!(call["action"], "send_private_msg");
    let text = call["params"]["message"][0]["data"]["text"].as_str().unwrap();
    assert_eq!(text, "Agent not connected, please try again later.");
    ack(&mut ws, &call).await;

    bridge.shutdown().await;
}

#[tokio::test]
async fn send_bypass_strips_prefix_and_still_hits_the_agent_path() {
    let bridge = run_bridge(test_config()).await.unwrap();
    let port = bridge.local_addr().port();
    let mut ws = connect(port).await;

    send_json(&mut ws, lifecycle_connect(1)).await;
    send_json(&mut ws, private_message(111, "/send /new this is not a command")).await;

    let call = recv_json(&mut ws).await;
    let text = call["params"]["message"][0]["data"]["text"].as_str().unwrap();
    // /send bypasses the command registry entirely, so this should hit the
    // (agent-not-connected) prompt path rather than the /new confirmation.
    assert_eq!(text, "Agent not connected, please try again later.");
    ack(&mut ws, &call).await;

    bridge.shutdown().await;
}

#[tokio::test]
async fn send_with_empty_body_reports_usage() {
    let bridge = run_bridge(test_config()).await.unwrap();
    let port = bridge.local_addr().port();
    let mut ws = connect(port).await;

    send_json(&mut ws, lifecycle_connect(1)).await;
    send_json(&mut ws, private_message(111, "/send ")).await;

    let call = recv_json(&mut ws).await;
    let text = call["params"]["message"][0]["data"]["text"].as_str().unwrap();
    assert!(text.starts_with("/send <text>"));
    ack(&mut ws, &call).await;

    bridge.shutdown().await;
}
