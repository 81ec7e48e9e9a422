//! Prompt lifecycle glue: single-flight per-chat task tracking, "thinking"
//! timers, and reply delivery (§4.11).
//!
//! Grounded on `ncat/prompt_runner.py`'s `PromptRunner.process()`: register
//! the chat's active task, start up to two deferred notifiers, build
//! content blocks, run the prompt, then cancel the timers and deliver
//! whatever came back (or the partial-plus-error shape on failure).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tracing::info;

use crate::agent_manager::AgentManager;
use crate::config::UxConfig;
use crate::converter::{ParsedMessage, ReplyPart};
use crate::error::AgentError;
use crate::image_fetcher::download_image;
use crate::permission::PermissionBroker;
use crate::prompt_builder::build_prompt_blocks;
use crate::transport::Transport;

const MSG_NO_USABLE_REPLY: &str = "(the agent did not return a usable reply)";
const MSG_THINKING_SHORT: &str = "Still thinking about that...";
const MSG_THINKING_LONG: &str = "Still working on it, this one is taking a while...";
const MSG_AGENT_NOT_CONNECTED: &str = "Agent not connected, please try again later.";

struct ActiveTask {
    task: AbortHandle,
    timers: Vec<AbortHandle>,
}

/// Owns one entry in `activeTasks[chatId]` per in-flight prompt and the
/// "thinking" timers that ride alongside it.
pub struct PromptRunner {
    agent_manager: Arc<AgentManager>,
    permission_broker: Arc<PermissionBroker>,
    transport: Arc<Transport>,
    http_client: reqwest::Client,
    ux: UxConfig,
    active: Mutex<HashMap<String, ActiveTask>>,
}

impl PromptRunner {
    pub fn new(
        agent_manager: Arc<AgentManager>,
        permission_broker: Arc<PermissionBroker>,
        transport: Arc<Transport>,
        http_client: reqwest::Client,
        ux: UxConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            agent_manager,
            permission_broker,
            transport,
            http_client,
            ux,
            active: Mutex::new(HashMap::new()),
        })
    }

    /// Whether a prompt is already in flight for this chat. The dispatcher
    /// must check this (and reply with the busy hint) before calling
    /// [`Self::process`]; `process` itself just re-checks to close the race.
    pub async fn is_busy(&self, chat_id: &str) -> bool {
        self.active.lock().await.contains_key(chat_id)
    }

    /// Starts processing `parsed` for its chat, spawning the actual prompt
    /// work so the dispatcher's own task returns promptly. No-ops if the
    /// chat is already busy (caller raced the busy check).
    ///
    /// The busy check and the reservation happen under one held lock so two
    /// concurrent calls for the same chat can't both pass the check before
    /// either inserts — the loser sees the winner's entry and returns.
    pub async fn process(self: Arc<Self>, parsed: ParsedMessage) {
        let chat_id = parsed.chat_id.clone();
        let mut active = self.active.lock().await;
        if active.contains_key(&chat_id) {
            return;
        }

        let this = self.clone();
        let join_handle = tokio::spawn(async move {
            this.run(parsed).await;
        });
        let task = join_handle.abort_handle();
        let timers = self.start_thinking_timers(&chat_id);
        active.insert(chat_id, ActiveTask { task, timers });
    }

    /// Cancels the chat's active prompt, if any: the pending permission (if
    /// one is mid-dialog), the task itself, and a best-effort ACP
    /// `session/cancel`. Returns `false` (a no-op) if nothing was active.
    pub async fn cancel(&self, chat_id: &str) -> bool {
        let removed = self.active.lock().await.remove(chat_id);
        let Some(active) = removed else {
            return false;
        };
        self.permission_broker.cancel_pending(chat_id);
        active.task.abort();
        for timer in &active.timers {
            timer.abort();
        }
        self.agent_manager.cancel(chat_id).await;
        true
    }

    fn start_thinking_timers(&self, chat_id: &str) -> Vec<AbortHandle> {
        let mut handles = Vec::new();
        if self.ux.thinking_notify_seconds > 0.0 {
            handles.push(self.spawn_timer(chat_id, self.ux.thinking_notify_seconds, MSG_THINKING_SHORT));
        }
        if self.ux.thinking_long_notify_seconds > 0.0 {
            handles.push(self.spawn_timer(chat_id, self.ux.thinking_long_notify_seconds, MSG_THINKING_LONG));
        }
        handles
    }

    fn spawn_timer(&self, chat_id: &str, delay_seconds: f64, message: &'static str) -> AbortHandle {
        let transport = self.transport.clone();
        let chat_id = chat_id.to_string();
        let delay = Duration::from_secs_f64(delay_seconds);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = transport.send_text(&chat_id, message).await;
        })
        .abort_handle()
    }

    async fn run(&self, parsed: ParsedMessage) {
        let chat_id = parsed.chat_id.clone();
        let outcome = self.run_prompt(&parsed).await;

        if let Some(active) = self.active.lock().await.remove(&chat_id) {
            for timer in &active.timers {
                timer.abort();
            }
        }

        match outcome {
            Ok(parts) if parts.is_empty() => {
                let _ = self.transport.send_text(&chat_id, MSG_NO_USABLE_REPLY).await;
            }
            Ok(parts) => {
                let _ = self.transport.send_content(&chat_id, &parts).await;
            }
            Err(AgentError::WithPartial { cause, partial_parts }) => {
                if !partial_parts.is_empty() {
                    let _ = self.transport.send_content(&chat_id, &partial_parts).await;
                }
                let _ = self
                    .transport
                    .send_text(&chat_id, &format!("Agent error, session closed: {cause}"))
                    .await;
                self.agent_manager.close_session(&chat_id).await;
            }
            Err(err) => {
                let _ = self.transport.send_text(&chat_id, &localized_message(&err)).await;
            }
        }
    }

    async fn run_prompt(&self, parsed: &ParsedMessage) -> Result<Vec<ReplyPart>, AgentError> {
        let supports_image = self.agent_manager.prepare(&parsed.chat_id).await?;

        let downloaded = if supports_image && !parsed.images.is_empty() {
            let timeout = Duration::from_secs_f64(self.ux.image_download_timeout);
            let downloads = parsed.images.iter().map(|image| {
                let client = self.http_client.clone();
                let url = image.url.clone();
                async move { download_image(&client, &url, timeout).await }
            });
            futures_util::future::join_all(downloads).await
        } else {
            vec![None; parsed.images.len()]
        };

        let blocks = build_prompt_blocks(parsed, &downloaded, supports_image);
        let outcome = self.agent_manager.send_prompt(&parsed.chat_id, blocks).await?;

        let text_chars: usize = outcome
            .parts
            .iter()
            .map(|part| match part {
                ReplyPart::Text(text) => text.len(),
                ReplyPart::Image { .. } => 0,
            })
            .sum();
        info!(
            chat_id = %parsed.chat_id,
            stop_reason = %outcome.stop_reason,
            text_chars,
            part_count = outcome.parts.len(),
            "prompt completed"
        );

        Ok(outcome.parts)
    }
}

fn localized_message(err: &AgentError) -> String {
    match err {
        AgentError::NotConnected(_) | AgentError::LaunchFailed(_) | AgentError::InitializeTimeout => {
            MSG_AGENT_NOT_CONNECTED.to_string()
        }
        AgentError::Protocol(_) => MSG_AGENT_NOT_CONNECTED.to_string(),
        AgentError::WithPartial { cause, .. } => format!("Agent error: {cause}"),
    }
}
