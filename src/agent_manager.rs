//! Per-chat agent connection pool (§4.6).
//!
//! Grounded on `ncat/agent_manager.py`'s `AgentManager`: one ACP connection
//! per chat, lazily established on first use, with a per-chat lock so two
//! concurrent inbound messages for the same chat cannot spawn two
//! subprocesses (`_get_or_create_connection`'s double-checked-locking
//! pattern). `/new <dir>` stashes a one-time cwd override consumed by the
//! *next* connection, matching `_next_session_cwd`.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::agent_process::{AgentProcess, PromptOutcome};
use crate::config::{AgentConfig, McpServerConfig};
use crate::error::AgentError;
use crate::permission::PermissionBroker;

struct Connection {
    process: AgentProcess,
    /// `None` once [`AgentManager::close_session`] has forgotten the ACP
    /// session while keeping the subprocess alive; recreated lazily on the
    /// next [`AgentManager::ensure_session`] call.
    session_id: Mutex<Option<String>>,
}

struct ManagerState {
    connections: HashMap<String, Arc<Connection>>,
    locks: HashMap<String, Arc<Mutex<()>>>,
    next_cwd: HashMap<String, Option<String>>,
}

/// Owns every chat's agent subprocess and ACP session, and mediates their
/// lazy creation.
pub struct AgentManager {
    agent_config: AgentConfig,
    mcp_servers: Vec<McpServerConfig>,
    permission_broker: Arc<PermissionBroker>,
    state: Mutex<ManagerState>,
}

impl AgentManager {
    pub fn new(
        agent_config: AgentConfig,
        mcp_servers: Vec<McpServerConfig>,
        permission_broker: Arc<PermissionBroker>,
    ) -> Self {
        Self {
            agent_config,
            mcp_servers,
            permission_broker,
            state: Mutex::new(ManagerState {
                connections: HashMap::new(),
                locks: HashMap::new(),
                next_cwd: HashMap::new(),
            }),
        }
    }

    /// Records a one-time cwd override for `chat_id`'s *next* session and
    /// drops the chat's current connection, so the next prompt starts a
    /// fresh agent rooted at `cwd` (or the configured default, if `None`).
    pub async fn start_new_session(&self, chat_id: &str, cwd: Option<String>) {
        let mut state = self.state.lock().await;
        state.next_cwd.insert(chat_id.to_string(), cwd);
        if let Some(connection) = state.connections.remove(chat_id) {
            drop(state);
            connection.process.shutdown().await;
            if let Some(session_id) = connection.session_id.lock().await.take() {
                self.permission_broker.clear_session(&session_id);
            }
        }
    }

    async fn chat_lock(&self, chat_id: &str) -> Arc<Mutex<()>> {
        let mut state = self.state.lock().await;
        state
            .locks
            .entry(chat_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Returns the chat's live connection, creating it (and the subprocess
    /// behind it) if this is the first use. Double-checked so a burst of
    /// concurrent messages for one chat converges on a single subprocess.
    /// Establishing the connection performs only the `initialize` handshake;
    /// the ACP session itself is created separately by
    /// [`Self::ensure_session`], since a connection can outlive a session
    /// across a [`Self::close_session`] call.
    async fn ensure_connection(&self, chat_id: &str) -> Result<Arc<Connection>, AgentError> {
        if let Some(connection) = self.state.lock().await.connections.get(chat_id).cloned() {
            return Ok(connection);
        }

        let lock = self.chat_lock(chat_id).await;
        let _guard = lock.lock().await;

        if let Some(connection) = self.state.lock().await.connections.get(chat_id).cloned() {
            return Ok(connection);
        }

        info!(chat_id, "launching agent for chat");
        let process =
            AgentProcess::spawn(chat_id.to_string(), &self.agent_config, self.permission_broker.clone())
                .await?;

        let connection = Arc::new(Connection { process, session_id: Mutex::new(None) });
        self.state
            .lock()
            .await
            .connections
            .insert(chat_id.to_string(), connection.clone());
        Ok(connection)
    }

    /// Ensures a connection exists and that it has a live ACP session,
    /// creating one (consuming the one-time `/new <dir>` cwd override if
    /// present) if the connection is fresh or was reset by
    /// [`Self::close_session`].
    async fn ensure_session(&self, chat_id: &str) -> Result<(Arc<Connection>, String), AgentError> {
        let connection = self.ensure_connection(chat_id).await?;
        let mut session_id = connection.session_id.lock().await;
        if let Some(existing) = session_id.as_ref() {
            return Ok((connection.clone(), existing.clone()));
        }

        let cwd = {
            let mut state = self.state.lock().await;
            state
                .next_cwd
                .remove(chat_id)
                .flatten()
                .unwrap_or_else(|| self.agent_config.cwd.clone())
        };
        let new_id = connection.process.new_session(cwd, self.mcp_servers.clone()).await?;
        *session_id = Some(new_id.clone());
        Ok((connection.clone(), new_id))
    }

    /// Ensures a connection exists for `chat_id`, returning whether the
    /// agent behind it supports image content blocks. Re-queries on every
    /// call (rather than caching across reconnects) since a freshly
    /// launched agent may advertise different capabilities than the one it
    /// replaced.
    pub async fn prepare(&self, chat_id: &str) -> Result<bool, AgentError> {
        let connection = self.ensure_connection(chat_id).await?;
        Ok(connection.process.supports_image())
    }

    /// Ensures a connection and session exist for `chat_id` and runs one
    /// `session/prompt` round-trip against it.
    pub async fn send_prompt(
        &self,
        chat_id: &str,
        blocks: Vec<agent_client_protocol::ContentBlock>,
    ) -> Result<PromptOutcome, AgentError> {
        let (connection, session_id) = self.ensure_session(chat_id).await?;
        connection.process.prompt(session_id, blocks).await
    }

    /// Sends `session/cancel` for the chat's live session. Returns `false`
    /// if there is no connection or no live session to cancel.
    pub async fn cancel(&self, chat_id: &str) -> bool {
        let connection = self.state.lock().await.connections.get(chat_id).cloned();
        let Some(connection) = connection else {
            return false;
        };
        let session_id = connection.session_id.lock().await.clone();
        match session_id {
            Some(session_id) => {
                connection.process.cancel(session_id).await;
                true
            }
            None => false,
        }
    }

    /// Forgets the chat's ACP session and clears its permission always-cache,
    /// but keeps the subprocess and connection alive for the next prompt to
    /// reuse (unlike [`Self::start_new_session`], which also disconnects).
    pub async fn close_session(&self, chat_id: &str) {
        let connection = self.state.lock().await.connections.get(chat_id).cloned();
        if let Some(connection) = connection {
            if let Some(session_id) = connection.session_id.lock().await.take() {
                self.permission_broker.clear_session(&session_id);
            }
        }
    }

    pub async fn disconnect_all(&self) {
        let connections: Vec<Arc<Connection>> = {
            let mut state = self.state.lock().await;
            state.connections.drain().map(|(_, v)| v).collect()
        };
        for connection in connections {
            connection.process.shutdown().await;
        }
        warn!("disconnected all agent connections");
    }
}
