//! Shared error types for the bridge.

use std::fmt;

/// Top-level bridge result alias.
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Errors that can terminate the whole process (startup, transport).
#[derive(Debug)]
pub enum BridgeError {
    Io(std::io::Error),
    Config(String),
    Task(tokio::task::JoinError),
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeError::Io(err) => write!(f, "io error: {err}"),
            BridgeError::Config(msg) => write!(f, "config error: {msg}"),
            BridgeError::Task(err) => write!(f, "task join error: {err}"),
        }
    }
}

impl std::error::Error for BridgeError {}

impl From<std::io::Error> for BridgeError {
    fn from(value: std::io::Error) -> Self {
        BridgeError::Io(value)
    }
}

impl From<tokio::task::JoinError> for BridgeError {
    fn from(value: tokio::task::JoinError) -> Self {
        BridgeError::Task(value)
    }
}

/// Errors from the per-chat agent connection / prompt lifecycle.
///
/// Distinct from `BridgeError`: these never cross chat boundaries, they are
/// caught by the dispatcher and translated into a user-facing chat message.
#[derive(Debug)]
pub enum AgentError {
    /// `ensure_connection` failed, or the link is known to be closed.
    NotConnected(String),
    /// The configured agent executable could not be resolved or spawned.
    LaunchFailed(String),
    /// The ACP `initialize` handshake did not complete before the configured timeout.
    InitializeTimeout,
    /// A JSON-RPC framing or protocol-level error was observed on the link.
    Protocol(String),
    /// A prompt failed mid-stream; any reply parts that streamed before the
    /// failure are preserved so the caller can still deliver them.
    WithPartial {
        cause: String,
        partial_parts: Vec<crate::converter::ReplyPart>,
    },
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentError::NotConnected(msg) => write!(f, "agent not connected: {msg}"),
            AgentError::LaunchFailed(msg) => write!(f, "failed to launch agent: {msg}"),
            AgentError::InitializeTimeout => write!(f, "agent initialize handshake timed out"),
            AgentError::Protocol(msg) => write!(f, "agent protocol error: {msg}"),
            AgentError::WithPartial { cause, .. } => {
                write!(f, "prompt failed after partial reply: {cause}")
            }
        }
    }
}

impl std::error::Error for AgentError {}
