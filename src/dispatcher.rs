//! Orchestrates a single inbound chat message (§4.3).
//!
//! Grounded on `ncat/dispatcher.py`'s `Dispatcher.handle_event`: parse,
//! drop unmentioned group chatter, resolve a pending permission reply,
//! bypass via `/send`, try the command registry, check busy, and only
//! then hand off to the prompt runner.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::agent_manager::AgentManager;
use crate::command::{CommandDeps, CommandRegistry};
use crate::converter::{onebot_to_internal, ChatKind, ParsedMessage};
use crate::onebot::MessageEvent;
use crate::permission::PermissionBroker;
use crate::prompt_runner::PromptRunner;
use crate::transport::Transport;

const MSG_BUSY: &str = "Already thinking about your last message, use /stop to interrupt.";
const MSG_PERMISSION_HINT: &str =
    "A permission request is pending — reply with the option number to answer it.";
const MSG_SEND_USAGE: &str = "/send <text> - forward text to the agent verbatim (bypasses other ncat commands)";

/// Routes one parsed chat message through the dispatch pipeline described
/// in §4.3. Cheap to clone: every field is an `Arc`.
pub struct Dispatcher {
    command_registry: CommandRegistry,
    agent_manager: Arc<AgentManager>,
    permission_broker: Arc<PermissionBroker>,
    prompt_runner: Arc<PromptRunner>,
    transport: Arc<Transport>,
}

impl Dispatcher {
    pub fn new(
        agent_manager: Arc<AgentManager>,
        permission_broker: Arc<PermissionBroker>,
        prompt_runner: Arc<PromptRunner>,
        transport: Arc<Transport>,
    ) -> Arc<Self> {
        Arc::new(Self {
            command_registry: CommandRegistry::with_builtins(),
            agent_manager,
            permission_broker,
            prompt_runner,
            transport,
        })
    }

    /// Processes one inbound OneBot `message` event end to end.
    pub async fn dispatch(&self, event: MessageEvent) {
        let bot_id = self.transport.bot_id().unwrap_or_default();
        let parsed = onebot_to_internal(&event, bot_id);

        if parsed.kind == ChatKind::Group && !parsed.is_at_bot {
            return;
        }

        if self.permission_broker.has_pending(&parsed.chat_id) && !parsed.text.trim_start().starts_with('/') {
            if !self.permission_broker.try_resolve(&parsed.chat_id, &parsed.text) {
                let _ = self.transport.send_text(&parsed.chat_id, MSG_PERMISSION_HINT).await;
            }
            return;
        }

        if let Some(body) = parsed.text.strip_prefix("/send ") {
            let body = body.trim();
            if body.is_empty() {
                let _ = self.transport.send_text(&parsed.chat_id, MSG_SEND_USAGE).await;
                return;
            }
            let mut forwarded = parsed;
            forwarded.text = body.to_string();
            self.run_or_busy(forwarded).await;
            return;
        }

        if let Some(reply) = self.command_registry.execute(&parsed.text, &parsed.chat_id, self).await {
            if self.transport.send_text(&parsed.chat_id, &reply).await.is_err() {
                warn!(chat_id = %parsed.chat_id, "failed to deliver command reply");
            }
            return;
        }

        self.run_or_busy(parsed).await;
    }

    async fn run_or_busy(&self, parsed: ParsedMessage) {
        if self.prompt_runner.is_busy(&parsed.chat_id).await {
            let _ = self.transport.send_text(&parsed.chat_id, MSG_BUSY).await;
            return;
        }
        self.prompt_runner.clone().process(parsed).await;
    }
}

#[async_trait]
impl CommandDeps for Dispatcher {
    async fn start_new_session(&self, chat_id: &str, dir: Option<String>) {
        self.agent_manager.start_new_session(chat_id, dir).await;
    }

    async fn cancel(&self, chat_id: &str) -> bool {
        self.prompt_runner.cancel(chat_id).await
    }
}
