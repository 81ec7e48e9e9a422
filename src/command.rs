//! Registry of local slash-commands.
//!
//! Grounded on `ncat/command_system.py`'s `CommandRegistry` (ordered
//! `(pattern, handler, help_text, name)` declarations, auto-generated help
//! text) and `ncat/command.py`'s built-in registrations (`/new`, `/stop`,
//! `/send`, `/help`). Rust has no decorator-based registration, so handlers
//! are matched by command name against a fixed `match` rather than stored
//! as boxed closures — the dependency-injection role Python fills with
//! `**kwargs` is filled here by the `CommandDeps` trait.

use async_trait::async_trait;
use regex::Regex;

const MSG_NEW_SESSION: &str = "New session created, AI context cleared.";
const MSG_STOPPED: &str = "Current AI thinking interrupted.";
const MSG_NO_ACTIVE: &str = "No AI thinking is currently in progress.";
const MSG_HELP_FOOTER: &str = "Send plain text to talk to the AI.";

/// Dependencies injected into command handlers, analogous to the
/// `agent_manager`/`cancel_fn` kwargs the Python registry injects.
#[async_trait]
pub trait CommandDeps: Send + Sync {
    /// Sets the one-time cwd for the chat's next session, closes the
    /// current session, and disconnects the chat's agent connection.
    async fn start_new_session(&self, chat_id: &str, dir: Option<String>);
    /// Cancels the active prompt for a chat; `true` if one existed.
    async fn cancel(&self, chat_id: &str) -> bool;
}

struct CommandSpec {
    name: &'static str,
    pattern: Regex,
    help_text: &'static str,
}

/// Ordered registry of built-in commands with auto-generated help text.
pub struct CommandRegistry {
    header: &'static str,
    commands: Vec<CommandSpec>,
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl CommandRegistry {
    pub fn with_builtins() -> Self {
        let commands = vec![
            CommandSpec {
                name: "new",
                pattern: Regex::new(r"^/new(?:\s+(?P<dir>\S+))?$").unwrap(),
                help_text: "/new [dir] - create a new session (working directory decided by the agent gateway default)",
            },
            CommandSpec {
                name: "stop",
                pattern: Regex::new(r"^/stop$").unwrap(),
                help_text: "/stop - interrupt the current AI thinking",
            },
            CommandSpec {
                name: "send",
                pattern: Regex::new(r"^/send(?:\s+(?P<body>.*))?$").unwrap(),
                help_text: "/send <text> - forward text to the agent verbatim (bypasses other ncat commands)",
            },
            CommandSpec {
                name: "help",
                pattern: Regex::new(r"^/help$").unwrap(),
                help_text: "/help - show this help text",
            },
        ];
        Self {
            header: "ncat command list:\n\nBasics:",
            commands,
        }
    }

    pub fn generate_help_text(&self) -> String {
        let mut lines = vec![self.header.to_string()];
        lines.extend(self.commands.iter().map(|c| format!("  {}", c.help_text)));
        lines.join("\n")
    }

    /// Full help text including the trailing plain-text hint, matching
    /// `get_help_text()` in the Python source.
    pub fn full_help_text(&self) -> String {
        format!("{}\n\n{}", self.generate_help_text(), MSG_HELP_FOOTER)
    }

    /// Tries to match `text` against a registered command and execute it.
    /// Returns `Some(reply)` if a command matched (the dispatcher should
    /// send `reply` back to the chat and stop processing), `None` if no
    /// command matched at all.
    pub async fn execute<D: CommandDeps>(&self, text: &str, chat_id: &str, deps: &D) -> Option<String> {
        for cmd in &self.commands {
            let Some(caps) = cmd.pattern.captures(text) else {
                continue;
            };
            let reply = match cmd.name {
                "new" => {
                    let dir = caps.name("dir").map(|m| m.as_str().to_string());
                    deps.start_new_session(chat_id, dir).await;
                    MSG_NEW_SESSION.to_string()
                }
                "stop" => {
                    if deps.cancel(chat_id).await {
                        MSG_STOPPED.to_string()
                    } else {
                        MSG_NO_ACTIVE.to_string()
                    }
                }
                "send" => {
                    // The dispatcher strips "/send " and forwards to the
                    // prompt runner before the registry ever sees it; a
                    // match here only happens for bodiless or malformed
                    // invocations, so always show the usage hint.
                    self.full_help_text()
                }
                "help" => self.full_help_text(),
                _ => unreachable!("unregistered command name {}", cmd.name),
            };
            return Some(reply);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeDeps {
        new_session_calls: Mutex<Vec<(String, Option<String>)>>,
        cancel_result: AtomicBool,
    }

    #[async_trait]
    impl CommandDeps for FakeDeps {
        async fn start_new_session(&self, chat_id: &str, dir: Option<String>) {
            self.new_session_calls
                .lock()
                .unwrap()
                .push((chat_id.to_string(), dir));
        }

        async fn cancel(&self, _chat_id: &str) -> bool {
            self.cancel_result.load(Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn new_without_dir() {
        let registry = CommandRegistry::with_builtins();
        let deps = FakeDeps::default();
        let reply = registry.execute("/new", "private:1", &deps).await;
        assert_eq!(reply.as_deref(), Some(MSG_NEW_SESSION));
        assert_eq!(deps.new_session_calls.lock().unwrap()[0], ("private:1".to_string(), None));
    }

    #[tokio::test]
    async fn new_with_dir_captures_group() {
        let registry = CommandRegistry::with_builtins();
        let deps = FakeDeps::default();
        registry.execute("/new workdir", "private:1", &deps).await;
        assert_eq!(
            deps.new_session_calls.lock().unwrap()[0],
            ("private:1".to_string(), Some("workdir".to_string()))
        );
    }

    #[tokio::test]
    async fn stop_reports_no_active_when_cancel_returns_false() {
        let registry = CommandRegistry::with_builtins();
        let deps = FakeDeps::default();
        let reply = registry.execute("/stop", "private:1", &deps).await;
        assert_eq!(reply.as_deref(), Some(MSG_NO_ACTIVE));
    }

    #[tokio::test]
    async fn stop_reports_stopped_when_cancel_returns_true() {
        let registry = CommandRegistry::with_builtins();
        let deps = FakeDeps::default();
        deps.cancel_result.store(true, Ordering::SeqCst);
        let reply = registry.execute("/stop", "private:1", &deps).await;
        assert_eq!(reply.as_deref(), Some(MSG_STOPPED));
    }

    #[tokio::test]
    async fn help_includes_all_registered_commands() {
        let registry = CommandRegistry::with_builtins();
        let deps = FakeDeps::default();
        let reply = registry.execute("/help", "private:1", &deps).await.unwrap();
        assert!(reply.contains("/new"));
        assert!(reply.contains("/stop"));
        assert!(reply.contains("/send"));
        assert!(reply.contains("/help"));
    }

    #[tokio::test]
    async fn non_command_text_does_not_match() {
        let registry = CommandRegistry::with_builtins();
        let deps = FakeDeps::default();
        assert!(registry.execute("hello there", "private:1", &deps).await.is_none());
    }
}
