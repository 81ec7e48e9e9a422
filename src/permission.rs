//! Permission broker: bridges a synchronous ACP `request_permission` call
//! with an asynchronous chat reply, with "always" decision caching.
//!
//! Grounded on `ncat/permission.py`'s `PermissionBroker`: same cache shape
//! (`sessionId -> toolKind -> option`), same pending-per-chat map, same
//! timeout/cancel/resolve state machine. The Python side uses an
//! `asyncio.Future`; here a [`tokio::sync::oneshot`] channel plays the same
//! role.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::info;

/// One option offered by the agent for a permission request, order preserved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionOption {
    pub option_id: String,
    pub name: String,
    pub kind: PermissionOptionKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionOptionKind {
    AllowOnce,
    AllowAlways,
    RejectOnce,
    RejectAlways,
}

impl PermissionOptionKind {
    fn is_always(self) -> bool {
        matches!(self, PermissionOptionKind::AllowAlways | PermissionOptionKind::RejectAlways)
    }

    fn hint(self) -> &'static str {
        match self {
            PermissionOptionKind::AllowOnce => "allow once",
            PermissionOptionKind::AllowAlways => "always allow this kind for the session",
            PermissionOptionKind::RejectOnce => "reject once",
            PermissionOptionKind::RejectAlways => "always reject this kind for the session",
        }
    }
}

/// Description of the tool call the agent wants permission to run.
#[derive(Debug, Clone)]
pub struct ToolCallDescription {
    pub kind: Option<String>,
    pub title: Option<String>,
    pub raw_input: Option<String>,
}

/// Outcome returned to the ACP client callback, which translates it into
/// the wire-level `RequestPermissionResponse`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionOutcome {
    Selected(String),
    Cancelled,
}

struct PendingPermission {
    reply: oneshot::Sender<PermissionOption>,
    options: Vec<PermissionOption>,
}

struct BrokerState {
    always: HashMap<String, HashMap<Option<String>, PermissionOption>>,
    pending: HashMap<String, PendingPermission>,
}

/// Sends a formatted text message to a chat. Implemented by the transport
/// layer; kept as a trait so the broker can be unit tested without a real
/// WebSocket peer.
#[async_trait::async_trait]
pub trait ChatNotifier: Send + Sync {
    async fn notify(&self, chat_id: &str, text: &str);
}

pub struct PermissionBroker {
    notifier: Arc<dyn ChatNotifier>,
    timeout: Duration,
    raw_input_max_len: usize,
    state: Mutex<BrokerState>,
}

impl PermissionBroker {
    pub fn new(notifier: impl ChatNotifier + 'static, timeout: Duration, raw_input_max_len: usize) -> Self {
        Self {
            notifier: Arc::new(notifier),
            timeout,
            raw_input_max_len,
            state: Mutex::new(BrokerState {
                always: HashMap::new(),
                pending: HashMap::new(),
            }),
        }
    }

    /// Handles a permission request from the agent, dialoging with the chat
    /// if no cached "always" decision applies.
    pub async fn handle(
        &self,
        session_id: &str,
        chat_id: &str,
        tool_call: &ToolCallDescription,
        options: Vec<PermissionOption>,
    ) -> PermissionOutcome {
        if let Some(cached) = self
            .state
            .lock()
            .unwrap()
            .always
            .get(session_id)
            .and_then(|m| m.get(&tool_call.kind))
            .cloned()
        {
            info!(session_id, kind = ?tool_call.kind, "permission auto-resolved from always cache");
            return PermissionOutcome::Selected(cached.option_id);
        }

        let message = format_permission_message(tool_call, &options, self.timeout, self.raw_input_max_len);
        self.notifier.notify(chat_id, &message).await;

        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state.lock().unwrap();
            state.pending.insert(
                chat_id.to_string(),
                PendingPermission {
                    reply: tx,
                    options: options.clone(),
                },
            );
        }

        let selected = if self.timeout.is_zero() {
            rx.await.ok()
        } else {
            match tokio::time::timeout(self.timeout, rx).await {
                Ok(result) => result.ok(),
                Err(_) => {
                    self.state.lock().unwrap().pending.remove(chat_id);
                    self.notifier
                        .notify(
                            chat_id,
                            &format!(
                                "Permission request timed out after {}s, cancelling.",
                                self.timeout.as_secs()
                            ),
                        )
                        .await;
                    return PermissionOutcome::Cancelled;
                }
            }
        };
        self.state.lock().unwrap().pending.remove(chat_id);

        let Some(selected) = selected else {
            return PermissionOutcome::Cancelled;
        };

        if selected.kind.is_always() {
            let mut state = self.state.lock().unwrap();
            state
                .always
                .entry(session_id.to_string())
                .or_default()
                .insert(tool_call.kind.clone(), selected.clone());
            info!(session_id, kind = ?tool_call.kind, "cached always decision");
        }

        info!(chat_id, option = %selected.name, "permission resolved");
        PermissionOutcome::Selected(selected.option_id)
    }

    /// Whether a permission request is currently pending for this chat.
    pub fn has_pending(&self, chat_id: &str) -> bool {
        self.state.lock().unwrap().pending.contains_key(chat_id)
    }

    /// Resolves a pending request with the user's reply. `text` is expected
    /// to be a 1-based option index. Returns `false` if there was nothing
    /// pending or the text did not parse as a valid index (caller should
    /// show a hint in that case, not consume the message).
    pub fn try_resolve(&self, chat_id: &str, text: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        let Some(pending) = state.pending.get(chat_id) else {
            return false;
        };
        let Ok(index) = text.trim().parse::<usize>() else {
            return false;
        };
        if index < 1 || index > pending.options.len() {
            return false;
        }
        let selected = pending.options[index - 1].clone();
        let pending = state.pending.remove(chat_id).unwrap();
        let _ = pending.reply.send(selected);
        true
    }

    /// Cancels a pending request (e.g. on `/stop`); dropping the sender
    /// makes the awaiting `handle` call observe a closed channel.
    pub fn cancel_pending(&self, chat_id: &str) {
        if self.state.lock().unwrap().pending.remove(chat_id).is_some() {
            info!(chat_id, "pending permission cancelled");
        }
    }

    /// Clears the always-cache for a session, called on session close or `/new`.
    pub fn clear_session(&self, session_id: &str) {
        if self.state.lock().unwrap().always.remove(session_id).is_some() {
            info!(session_id, "cleared always-cache for session");
        }
    }
}

fn format_permission_message(
    tool_call: &ToolCallDescription,
    options: &[PermissionOption],
    timeout: Duration,
    raw_input_max_len: usize,
) -> String {
    let mut lines = Vec::new();

    let kind_label = tool_call
        .kind
        .as_ref()
        .map(|k| format!("[{k}] "))
        .unwrap_or_default();
    let title = tool_call.title.as_deref().unwrap_or("(unknown operation)");
    lines.push(format!("Agent requests permission to run:\n{kind_label}{title}"));

    if let Some(raw_input) = &tool_call.raw_input {
        let truncated = if raw_input_max_len > 0 && raw_input.len() > raw_input_max_len {
            format!("{}...(truncated)", &raw_input[..raw_input_max_len])
        } else {
            raw_input.clone()
        };
        lines.push(format!("Arguments:\n{truncated}"));
    }

    if !timeout.is_zero() {
        lines.push(format!(
            "\nReply with the option number ({}s until auto-cancel):",
            timeout.as_secs()
        ));
    } else {
        lines.push("\nReply with the option number:".to_string());
    }

    for (i, option) in options.iter().enumerate() {
        lines.push(format!("{}. {} ({})", i + 1, option.name, option.kind.hint()));
    }

    lines.join("\n")
}
