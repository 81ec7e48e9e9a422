//! ACP `Client` trait implementation: the peer-initiated side of the
//! JSON-RPC link (§4.7).
//!
//! Grounded on `ncat/acp_client.py`'s `NcatAcpClient` for the callback
//! shape, and on `opencloudtool-agentty`'s `AgenttyClient` for the Rust
//! `#[async_trait(?Send)] impl agent_client_protocol::Client` idiom.
//! Permission requests are routed through the [`PermissionBroker`] rather
//! than auto-approved, so a human in the chat decides.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use agent_client_protocol as acp;
use async_trait::async_trait;
use tracing::debug;

use crate::converter::ReplyPart;
use crate::permission::{PermissionBroker, PermissionOption, PermissionOptionKind, PermissionOutcome, ToolCallDescription};

pub type AccumulatorStore = Rc<RefCell<std::collections::HashMap<String, Vec<ReplyPart>>>>;

/// Implements the peer-initiated ACP methods for a single chat's connection.
///
/// Confined to the dedicated OS thread that owns the connection (see
/// `agent_process.rs`): the accumulator uses `Rc<RefCell<_>>` rather than
/// `Arc<Mutex<_>>` because nothing here ever crosses a thread boundary.
pub struct BridgeAcpClient {
    pub chat_id: String,
    pub accumulators: AccumulatorStore,
    pub permission_broker: Arc<PermissionBroker>,
}

fn to_permission_options(options: &[acp::PermissionOption]) -> Vec<PermissionOption> {
    options
        .iter()
        .map(|opt| PermissionOption {
            option_id: opt.option_id.0.to_string(),
            name: opt.name.clone(),
            kind: match opt.kind {
                acp::PermissionOptionKind::AllowOnce => PermissionOptionKind::AllowOnce,
                acp::PermissionOptionKind::AllowAlways => PermissionOptionKind::AllowAlways,
                acp::PermissionOptionKind::RejectOnce => PermissionOptionKind::RejectOnce,
                acp::PermissionOptionKind::RejectAlways => PermissionOptionKind::RejectAlways,
            },
        })
        .collect()
}

fn to_tool_call_description(tool_call: &acp::ToolCallUpdate) -> ToolCallDescription {
    ToolCallDescription {
        kind: tool_call.fields.kind.as_ref().map(|k| format!("{k:?}").to_lowercase()),
        title: tool_call.fields.title.clone(),
        raw_input: tool_call
            .fields
            .raw_input
            .as_ref()
            .map(|v| serde_json::to_string_pretty(v).unwrap_or_else(|_| v.to_string())),
    }
}

#[async_trait(?Send)]
impl agent_client_protocol::Client for BridgeAcpClient {
    async fn session_notification(
        &self,
        notification: acp::SessionNotification,
    ) -> acp::Result<()> {
        let session_id = notification.session_id.0.to_string();
        match notification.update {
            acp::SessionUpdate::AgentMessageChunk(chunk) => {
                if let Some(part) = content_block_to_reply_part(&chunk.content) {
                    self.accumulators
                        .borrow_mut()
                        .entry(session_id)
                        .or_default()
                        .push(part);
                }
            }
            acp::SessionUpdate::ToolCall(tool_call) => {
                debug!(session_id, title = %tool_call.title, "tool call started");
            }
            acp::SessionUpdate::ToolCallUpdate(update) => {
                debug!(session_id, status = ?update.fields.status, "tool call update");
            }
            acp::SessionUpdate::Plan(_) => {
                debug!(session_id, "agent plan update");
            }
            _ => {}
        }
        Ok(())
    }

    async fn request_permission(
        &self,
        request: acp::RequestPermissionRequest,
    ) -> acp::Result<acp::RequestPermissionResponse> {
        let session_id = request.session_id.0.to_string();
        let tool_call = to_tool_call_description(&request.tool_call);
        let options = to_permission_options(&request.options);

        let outcome = self
            .permission_broker
            .handle(&session_id, &self.chat_id, &tool_call, options)
            .await;

        let wire_outcome = match outcome {
            PermissionOutcome::Selected(option_id) => acp::RequestPermissionOutcome::Selected(
                acp::SelectedPermissionOutcome::new(acp::PermissionOptionId(option_id.into())),
            ),
            PermissionOutcome::Cancelled => acp::RequestPermissionOutcome::Cancelled,
        };

        Ok(acp::RequestPermissionResponse::new(wire_outcome))
    }
}

fn content_block_to_reply_part(block: &acp::ContentBlock) -> Option<ReplyPart> {
    match block {
        acp::ContentBlock::Text(text) => {
            if text.text.is_empty() {
                None
            } else {
                Some(ReplyPart::Text(text.text.clone()))
            }
        }
        acp::ContentBlock::Image(image) => Some(ReplyPart::Image {
            base64: image.data.clone(),
            mime: image.mime_type.clone(),
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct NoopNotifier;

    #[async_trait::async_trait]
    impl crate::permission::ChatNotifier for NoopNotifier {
        async fn notify(&self, _chat_id: &str, _text: &str) {}
    }

    fn client() -> BridgeAcpClient {
        BridgeAcpClient {
            chat_id: "private:1".to_string(),
            accumulators: Rc::new(RefCell::new(std::collections::HashMap::new())),
            permission_broker: Arc::new(PermissionBroker::new(NoopNotifier, Duration::from_secs(1), 500)),
        }
    }

    #[test]
    fn text_chunk_is_accumulated() {
        let c = client();
        c.accumulators
            .borrow_mut()
            .insert("s1".to_string(), Vec::new());
        let part = content_block_to_reply_part(&acp::ContentBlock::Text(acp::TextContent::new(
            "hello".to_string(),
        )));
        assert_eq!(part, Some(ReplyPart::Text("hello".to_string())));
    }

    #[test]
    fn empty_text_chunk_is_dropped() {
        let part = content_block_to_reply_part(&acp::ContentBlock::Text(acp::TextContent::new(
            String::new(),
        )));
        assert_eq!(part, None);
    }
}
