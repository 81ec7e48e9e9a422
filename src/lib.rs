//! ncat-bridge: bridges a OneBot-11 WebSocket chat transport to an Agent
//! Client Protocol subprocess, one ACP session per chat (§1, §2).
//!
//! `run_bridge` wires the pieces together: [`transport::Transport`] accepts
//! the QQ client and demultiplexes inbound events, [`dispatcher::Dispatcher`]
//! runs the per-message pipeline (command match → busy check → prompt),
//! and [`agent_manager::AgentManager`] owns the per-chat ACP subprocesses
//! that [`prompt_runner::PromptRunner`] drives.

pub mod acp_client;
pub mod agent_manager;
pub mod agent_process;
pub mod command;
pub mod config;
pub mod converter;
pub mod dispatcher;
pub mod error;
pub mod image_fetcher;
pub mod logging;
pub mod onebot;
pub mod permission;
pub mod prompt_builder;
pub mod prompt_runner;
pub mod transport;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::agent_manager::AgentManager;
use crate::config::BridgeTomlConfig;
use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::permission::{ChatNotifier, PermissionBroker};
use crate::prompt_runner::PromptRunner;
use crate::transport::{Transport, TransportConfig, TransportEvent, TransportHandle};

/// Routes permission-broker chat messages through the live [`Transport`].
struct TransportNotifier {
    transport: Arc<Transport>,
}

#[async_trait]
impl ChatNotifier for TransportNotifier {
    async fn notify(&self, chat_id: &str, text: &str) {
        if let Err(err) = self.transport.send_text(chat_id, text).await {
            warn!(chat_id, error = %err, "failed to deliver permission message");
        }
    }
}

/// A running bridge: the transport's accept loop plus the dispatch loop
/// draining inbound events. Dropping or awaiting [`Self::shutdown`] stops
/// both and disconnects every agent subprocess.
pub struct Bridge {
    transport_handle: TransportHandle,
    dispatch_loop: tokio::task::JoinHandle<()>,
    agent_manager: Arc<AgentManager>,
    local_addr: SocketAddr,
}

impl Bridge {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting new connections, drains the dispatch loop, and
    /// disconnects every chat's agent subprocess.
    pub async fn shutdown(self) {
        self.transport_handle.shutdown().await;
        self.dispatch_loop.abort();
        self.agent_manager.disconnect_all().await;
        info!("bridge shut down");
    }
}

/// Builds every component from `config` and starts serving. Returns once
/// the transport is bound and listening; inbound events are then
/// dispatched in the background until [`Bridge::shutdown`] is called.
pub async fn run_bridge(config: BridgeTomlConfig) -> Result<Bridge> {
    let bind_addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .map_err(|err| error::BridgeError::Config(format!("invalid [server] host/port: {err}")))?;

    let (transport_handle, transport, mut events) = Transport::serve(TransportConfig {
        bind_addr,
        api_call_timeout: Duration::from_secs(10),
    })
    .await?;
    let local_addr = transport_handle.local_addr();
    info!(%local_addr, "transport listening");

    let permission_broker = Arc::new(PermissionBroker::new(
        TransportNotifier { transport: transport.clone() },
        Duration::from_secs_f64(config.ux.permission_timeout),
        config.ux.permission_raw_input_max_len,
    ));

    let agent_manager = Arc::new(AgentManager::new(
        config.agent.clone(),
        config.mcp.clone(),
        permission_broker.clone(),
    ));

    let http_client = reqwest::Client::new();
    let prompt_runner = PromptRunner::new(
        agent_manager.clone(),
        permission_broker.clone(),
        transport.clone(),
        http_client,
        config.ux.clone(),
    );

    let dispatcher = Dispatcher::new(
        agent_manager.clone(),
        permission_broker.clone(),
        prompt_runner,
        transport.clone(),
    );

    let dispatch_agent_manager = agent_manager.clone();
    let dispatch_loop = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::Message(message_event) => {
                    let dispatcher = dispatcher.clone();
                    tokio::spawn(async move {
                        dispatcher.dispatch(message_event).await;
                    });
                }
                TransportEvent::PeerDisconnected => {
                    warn!("transport peer disconnected, tearing down all agent connections");
                    dispatch_agent_manager.disconnect_all().await;
                }
            }
        }
    });

    Ok(Bridge { transport_handle, dispatch_loop, agent_manager, local_addr })
}
