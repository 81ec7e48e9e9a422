//! OneBot 11 wire types: the JSON shapes exchanged with the QQ client over
//! the WebSocket transport.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One message segment (`{"type": ..., "data": {...}}`).
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Segment {
    #[serde(rename = "type")]
    pub seg_type: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Sender {
    pub card: Option<String>,
    pub nickname: Option<String>,
}

/// A `post_type == "message"` event.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct MessageEvent {
    pub message_type: String,
    pub user_id: i64,
    #[serde(default)]
    pub group_id: Option<i64>,
    #[serde(default)]
    pub group_name: Option<String>,
    #[serde(default)]
    pub sender: Option<Sender>,
    #[serde(default)]
    pub message: Vec<Segment>,
}

/// Top-level inbound frame: either a message event, a meta lifecycle
/// event, or something this bridge does not care about.
#[derive(Debug, Clone)]
pub enum InboundFrame {
    Message(MessageEvent),
    LifecycleConnect { self_id: i64 },
    ApiResult { echo: String, payload: Value },
    Ignored,
}

/// Parses a raw inbound WebSocket text frame into an [`InboundFrame`].
///
/// Unrecognized or malformed frames become [`InboundFrame::Ignored`] rather
/// than an error: the transport must stay up for unrelated traffic on the
/// same socket (e.g. heartbeat meta-events).
pub fn parse_inbound(raw: &str) -> InboundFrame {
    let value: Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(_) => return InboundFrame::Ignored,
    };

    if let Some(echo) = value.get("echo").and_then(Value::as_str) {
        if value.get("status").is_some() {
            return InboundFrame::ApiResult {
                echo: echo.to_string(),
                payload: value,
            };
        }
    }

    match value.get("post_type").and_then(Value::as_str) {
        Some("message") => match serde_json::from_value::<MessageEvent>(value) {
            Ok(event) => InboundFrame::Message(event),
            Err(_) => InboundFrame::Ignored,
        },
        Some("meta_event") => {
            let is_lifecycle_connect = value.get("meta_event_type").and_then(Value::as_str)
                == Some("lifecycle")
                && value.get("sub_type").and_then(Value::as_str) == Some("connect");
            if is_lifecycle_connect {
                if let Some(self_id) = value.get("self_id").and_then(Value::as_i64) {
                    return InboundFrame::LifecycleConnect { self_id };
                }
            }
            InboundFrame::Ignored
        }
        _ => InboundFrame::Ignored,
    }
}

/// Builds an outbound API call envelope: `{action, params, echo}`.
pub fn build_api_call(action: &str, params: Value, echo: &str) -> Value {
    serde_json::json!({
        "action": action,
        "params": params,
        "echo": echo,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_lifecycle_connect() {
        let raw = r#"{"post_type":"meta_event","meta_event_type":"lifecycle","sub_type":"connect","self_id":12345}"#;
        match parse_inbound(raw) {
            InboundFrame::LifecycleConnect { self_id } => assert_eq!(self_id, 12345),
            other => panic!("expected lifecycle connect, got {other:?}"),
        }
    }

    #[test]
    fn parses_message_event() {
        let raw = r#"{"post_type":"message","message_type":"private","user_id":1,"message":[{"type":"text","data":{"text":"hi"}}]}"#;
        match parse_inbound(raw) {
            InboundFrame::Message(event) => {
                assert_eq!(event.message_type, "private");
                assert_eq!(event.user_id, 1);
            }
            other => panic!("expected message event, got {other:?}"),
        }
    }

    #[test]
    fn parses_api_result_by_echo_and_status() {
        let raw = r#"{"status":"ok","retcode":0,"data":{},"echo":"7"}"#;
        match parse_inbound(raw) {
            InboundFrame::ApiResult { echo, .. } => assert_eq!(echo, "7"),
            other => panic!("expected api result, got {other:?}"),
        }
    }

    #[test]
    fn garbage_is_ignored() {
        assert!(matches!(parse_inbound("not json"), InboundFrame::Ignored));
        assert!(matches!(parse_inbound("{}"), InboundFrame::Ignored));
    }
}
