//! One ACP subprocess and its client-role JSON-RPC connection, owned by a
//! dedicated OS thread (§4.5).
//!
//! Grounded on `ncat/agent_process.py`'s `AgentProcess.start()` for the
//! launch/handshake sequence, and on `opencloudtool-agentty`'s
//! `AcpSessionHandle` for the Rust shape: the `agent_client_protocol` futures
//! are `!Send`, so each connection lives on its own thread running a
//! single-threaded Tokio runtime plus a `LocalSet`, and talks to the rest of
//! the (multi-threaded) bridge through an `mpsc` command channel.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;

use agent_client_protocol as acp;
use tokio::sync::{mpsc, oneshot};
use tokio_util::compat::{TokioAsyncReadCompatExt as _, TokioAsyncWriteCompatExt as _};

use crate::acp_client::{AccumulatorStore, BridgeAcpClient};
use crate::config::{AgentConfig, McpServerConfig, McpTransport};
use crate::converter::ReplyPart;
use crate::error::AgentError;
use crate::permission::PermissionBroker;

const CLIENT_NAME: &str = "ncat-bridge";
const CLIENT_TITLE: &str = "ncat ACP Bridge";

/// Result of one `session/prompt` round-trip: the agent's stop reason plus
/// whatever reply parts were accumulated by the [`BridgeAcpClient`] callback
/// while the prompt was in flight.
pub struct PromptOutcome {
    pub stop_reason: String,
    pub parts: Vec<ReplyPart>,
}

enum Command {
    NewSession {
        cwd: String,
        mcp_servers: Vec<McpServerConfig>,
        reply_tx: oneshot::Sender<Result<String, AgentError>>,
    },
    Prompt {
        session_id: String,
        blocks: Vec<acp::ContentBlock>,
        reply_tx: oneshot::Sender<Result<PromptOutcome, AgentError>>,
    },
    Cancel {
        session_id: String,
    },
    Shutdown,
}

/// Handle to a live agent subprocess + ACP connection running on its own
/// thread. Cloning is not supported; one [`AgentProcess`] per chat.
pub struct AgentProcess {
    command_tx: mpsc::Sender<Command>,
    thread_handle: Option<std::thread::JoinHandle<()>>,
    supports_image: bool,
}

impl AgentProcess {
    /// Spawns the agent subprocess and performs the ACP `initialize`
    /// handshake, bounded by `config.initialize_timeout_seconds`.
    ///
    /// # Errors
    /// Returns [`AgentError::LaunchFailed`] if the executable cannot be
    /// resolved/spawned, or [`AgentError::InitializeTimeout`] /
    /// [`AgentError::Protocol`] if the handshake fails.
    pub async fn spawn(
        chat_id: String,
        config: &AgentConfig,
        permission_broker: Arc<PermissionBroker>,
    ) -> Result<Self, AgentError> {
        let resolved = resolve_executable(&config.command)
            .map_err(|err| AgentError::LaunchFailed(format!("{}: {err}", config.command)))?;

        let (command_tx, command_rx) = mpsc::channel::<Command>(32);
        let (ready_tx, ready_rx) = oneshot::channel::<Result<bool, AgentError>>();

        let command = config.command.clone();
        let args = config.args.clone();
        let cwd = config.cwd.clone();
        let env = config.env.clone();

        let thread_handle = std::thread::spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                Ok(rt) => rt,
                Err(err) => {
                    let _ = ready_tx.send(Err(AgentError::LaunchFailed(err.to_string())));
                    return;
                }
            };
            let local_set = tokio::task::LocalSet::new();
            local_set.block_on(&runtime, async move {
                run_session_thread(
                    chat_id,
                    resolved,
                    command,
                    args,
                    cwd,
                    env,
                    permission_broker,
                    command_rx,
                    ready_tx,
                )
                .await;
            });
        });

        let timeout = std::time::Duration::from_secs_f64(config.initialize_timeout_seconds.max(0.0));
        let supports_image = match tokio::time::timeout(timeout, ready_rx).await {
            Ok(Ok(Ok(supports_image))) => supports_image,
            Ok(Ok(Err(err))) => {
                let _ = command_tx.try_send(Command::Shutdown);
                return Err(err);
            }
            Ok(Err(_)) => {
                let _ = command_tx.try_send(Command::Shutdown);
                return Err(AgentError::Protocol("session thread dropped before ready".into()));
            }
            Err(_) => {
                let _ = command_tx.try_send(Command::Shutdown);
                return Err(AgentError::InitializeTimeout);
            }
        };

        Ok(Self {
            command_tx,
            thread_handle: Some(thread_handle),
            supports_image,
        })
    }

    pub fn supports_image(&self) -> bool {
        self.supports_image
    }

    /// Sends ACP `session/new`, returning the new session id.
    pub async fn new_session(
        &self,
        cwd: String,
        mcp_servers: Vec<McpServerConfig>,
    ) -> Result<String, AgentError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(Command::NewSession { cwd, mcp_servers, reply_tx })
            .await
            .map_err(|_| AgentError::NotConnected("agent session thread gone".into()))?;
        reply_rx
            .await
            .map_err(|_| AgentError::NotConnected("agent session thread dropped reply".into()))?
    }

    /// Sends ACP `session/prompt` and waits for the response; streaming
    /// updates are appended to the accumulator by [`BridgeAcpClient`] and
    /// drained here once the prompt settles.
    pub async fn prompt(
        &self,
        session_id: String,
        blocks: Vec<acp::ContentBlock>,
    ) -> Result<PromptOutcome, AgentError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(Command::Prompt { session_id, blocks, reply_tx })
            .await
            .map_err(|_| AgentError::NotConnected("agent session thread gone".into()))?;
        reply_rx
            .await
            .map_err(|_| AgentError::NotConnected("agent session thread dropped reply".into()))?
    }

    /// Sends ACP `session/cancel`. Best-effort: errors are swallowed since
    /// cancellation racing a prompt's natural completion is expected.
    pub async fn cancel(&self, session_id: String) {
        let _ = self.command_tx.send(Command::Cancel { session_id }).await;
    }

    pub async fn shutdown(&self) {
        let _ = self.command_tx.send(Command::Shutdown).await;
    }
}

impl Drop for AgentProcess {
    fn drop(&mut self) {
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

async fn run_session_thread(
    chat_id: String,
    resolved: ResolvedExecutable,
    command: String,
    args: Vec<String>,
    cwd: String,
    env: HashMap<String, String>,
    permission_broker: Arc<PermissionBroker>,
    mut command_rx: mpsc::Receiver<Command>,
    ready_tx: oneshot::Sender<Result<bool, AgentError>>,
) {
    let mut child = match spawn_child(&resolved, &args, &cwd, &env) {
        Ok(child) => child,
        Err(err) => {
            let _ = ready_tx.send(Err(AgentError::LaunchFailed(format!("{command}: {err}"))));
            return;
        }
    };

    let stdin = match child.stdin.take() {
        Some(s) => s,
        None => {
            let _ = ready_tx.send(Err(AgentError::Protocol("agent stdin not piped".into())));
            return;
        }
    };
    let stdout = match child.stdout.take() {
        Some(s) => s,
        None => {
            let _ = ready_tx.send(Err(AgentError::Protocol("agent stdout not piped".into())));
            return;
        }
    };

    let accumulators: AccumulatorStore = Rc::new(RefCell::new(HashMap::new()));
    let client = BridgeAcpClient {
        chat_id,
        accumulators: accumulators.clone(),
        permission_broker,
    };

    let (connection, io_future) = acp::ClientSideConnection::new(
        client,
        stdin.compat_write(),
        stdout.compat(),
        |future| {
            tokio::task::spawn_local(future);
        },
    );
    tokio::task::spawn_local(async move {
        let _ = io_future.await;
    });

    let init_request = acp::InitializeRequest::new(acp::ProtocolVersion::LATEST)
        .client_capabilities(acp::ClientCapabilities {
            fs: acp::FileSystemCapability {
                read_text_file: false,
                write_text_file: false,
                meta: None,
            },
            terminal: false,
            meta: None,
        })
        .client_info(acp::Implementation::new(CLIENT_NAME, env!("CARGO_PKG_VERSION")).title(CLIENT_TITLE));

    let supports_image = match connection.initialize(init_request).await {
        Ok(response) => response
            .agent_capabilities
            .prompt_capabilities
            .image
            .unwrap_or(false),
        Err(err) => {
            let _ = ready_tx.send(Err(AgentError::Protocol(err.to_string())));
            let _ = child.kill().await;
            return;
        }
    };

    if ready_tx.send(Ok(supports_image)).is_err() {
        let _ = child.kill().await;
        return;
    }

    loop {
        let Some(command) = command_rx.recv().await else {
            break;
        };
        match command {
            Command::NewSession { cwd, mcp_servers, reply_tx } => {
                let result = create_session(&connection, cwd, mcp_servers).await;
                let _ = reply_tx.send(result);
            }
            Command::Prompt { session_id, blocks, reply_tx } => {
                let result = run_prompt(&connection, &accumulators, session_id, blocks).await;
                let _ = reply_tx.send(result);
            }
            Command::Cancel { session_id } => {
                let _ = connection
                    .cancel(acp::CancelNotification::new(acp::SessionId(session_id.into())))
                    .await;
            }
            Command::Shutdown => break,
        }
    }

    let _ = child.kill().await;
    let _ = child.wait().await;
}

async fn create_session(
    connection: &acp::ClientSideConnection,
    cwd: String,
    mcp_servers: Vec<McpServerConfig>,
) -> Result<String, AgentError> {
    let cwd_path = if cwd.is_empty() { PathBuf::new() } else { PathBuf::from(cwd) };
    let request = acp::NewSessionRequest::new(cwd_path).mcp_servers(
        mcp_servers.iter().map(to_wire_mcp_server).collect::<Vec<_>>(),
    );
    let response = connection
        .new_session(request)
        .await
        .map_err(|err| AgentError::Protocol(err.to_string()))?;
    Ok(response.session_id.0.to_string())
}

fn to_wire_mcp_server(config: &McpServerConfig) -> acp::McpServer {
    match config.transport {
        McpTransport::Stdio => acp::McpServer::Stdio {
            name: config.name.clone(),
            command: PathBuf::from(config.command.clone().unwrap_or_default()),
            args: config.args.clone(),
            env: config
                .env
                .iter()
                .map(|(name, value)| acp::EnvVariable::new(name.clone(), value.clone()))
                .collect(),
        },
        McpTransport::Sse => acp::McpServer::Sse {
            name: config.name.clone(),
            url: config.url.clone().unwrap_or_default(),
            headers: Vec::new(),
        },
    }
}

async fn run_prompt(
    connection: &acp::ClientSideConnection,
    accumulators: &AccumulatorStore,
    session_id: String,
    blocks: Vec<acp::ContentBlock>,
) -> Result<PromptOutcome, AgentError> {
    accumulators.borrow_mut().insert(session_id.clone(), Vec::new());

    let request = acp::PromptRequest::new(acp::SessionId(session_id.clone().into()), blocks);
    let result = connection.prompt(request).await;

    match result {
        Ok(response) => {
            let parts = accumulators.borrow_mut().remove(&session_id).unwrap_or_default();
            Ok(PromptOutcome {
                stop_reason: format!("{:?}", response.stop_reason),
                parts,
            })
        }
        Err(err) => {
            let parts = accumulators.borrow_mut().remove(&session_id).unwrap_or_default();
            Err(AgentError::WithPartial { cause: err.to_string(), partial_parts: parts })
        }
    }
}

struct ResolvedExecutable {
    /// The program actually exec'd (`cmd` on Windows for `.cmd`/`.bat`
    /// wrappers, otherwise the resolved executable itself).
    program: PathBuf,
    /// Extra leading args before the caller's own `args` (`["/c", wrapper]`
    /// on Windows; empty otherwise).
    leading_args: Vec<String>,
}

fn resolve_executable(command: &str) -> Result<ResolvedExecutable, String> {
    let resolved = which::which(command).map_err(|err| err.to_string())?;

    let is_windows_script = cfg!(windows)
        && resolved
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("cmd") || ext.eq_ignore_ascii_case("bat"))
            .unwrap_or(false);

    if is_windows_script {
        Ok(ResolvedExecutable {
            program: PathBuf::from("cmd"),
            leading_args: vec!["/c".to_string(), resolved.to_string_lossy().into_owned()],
        })
    } else {
        Ok(ResolvedExecutable { program: resolved, leading_args: Vec::new() })
    }
}

fn spawn_child(
    resolved: &ResolvedExecutable,
    args: &[String],
    cwd: &str,
    env: &HashMap<String, String>,
) -> std::io::Result<tokio::process::Child> {
    let mut cmd = tokio::process::Command::new(&resolved.program);
    cmd.args(&resolved.leading_args);
    cmd.args(args);
    if !cwd.is_empty() {
        cmd.current_dir(cwd);
    }
    for (key, value) in env {
        cmd.env(key, value);
    }
    cmd.stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::null())
        .kill_on_drop(true)
        .spawn()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_executable_is_a_launch_error() {
        let err = resolve_executable("definitely-not-a-real-binary-xyz").unwrap_err();
        assert!(!err.is_empty());
    }

    #[test]
    fn mcp_stdio_server_maps_name_command_args() {
        let config = McpServerConfig {
            name: "fs".to_string(),
            transport: McpTransport::Stdio,
            command: Some("mcp-fs".to_string()),
            args: vec!["--root".to_string(), ".".to_string()],
            env: HashMap::new(),
            url: None,
        };
        match to_wire_mcp_server(&config) {
            acp::McpServer::Stdio { name, command, args, .. } => {
                assert_eq!(name, "fs");
                assert_eq!(command, PathBuf::from("mcp-fs"));
                assert_eq!(args, vec!["--root".to_string(), ".".to_string()]);
            }
            other => panic!("expected stdio server, got {other:?}"),
        }
    }

    #[test]
    fn mcp_sse_server_maps_url() {
        let config = McpServerConfig {
            name: "remote".to_string(),
            transport: McpTransport::Sse,
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            url: Some("https://example.com/sse".to_string()),
        };
        match to_wire_mcp_server(&config) {
            acp::McpServer::Sse { name, url, .. } => {
                assert_eq!(name, "remote");
                assert_eq!(url, "https://example.com/sse");
            }
            other => panic!("expected sse server, got {other:?}"),
        }
    }
}
