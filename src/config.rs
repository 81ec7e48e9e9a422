//! TOML configuration loading.
//!
//! Mirrors the section layout of the original Python bridge's
//! `config.py`: `[server]`, `[agent]`, `[[mcp]]`, `[ux]`, `[logging]`.
//! Missing sections and missing fields fall back to their defaults;
//! unrecognized keys are tolerated (no `deny_unknown_fields`).

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::{BridgeError, Result};

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    pub command: String,
    pub args: Vec<String>,
    pub cwd: String,
    pub env: HashMap<String, String>,
    pub initialize_timeout_seconds: f64,
    pub retry_interval_seconds: f64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            args: Vec::new(),
            cwd: "~/.ncat/workspace".to_string(),
            env: HashMap::new(),
            initialize_timeout_seconds: 30.0,
            retry_interval_seconds: 10.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum McpTransport {
    Stdio,
    Sse,
}

impl Default for McpTransport {
    fn default() -> Self {
        McpTransport::Stdio
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct McpServerConfig {
    pub name: String,
    pub transport: McpTransport,
    pub command: Option<String>,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub url: Option<String>,
}

impl Default for McpServerConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            transport: McpTransport::Stdio,
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            url: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct UxConfig {
    pub thinking_notify_seconds: f64,
    pub thinking_long_notify_seconds: f64,
    pub permission_timeout: f64,
    pub permission_raw_input_max_len: usize,
    pub image_download_timeout: f64,
}

impl Default for UxConfig {
    fn default() -> Self {
        Self {
            thinking_notify_seconds: 10.0,
            thinking_long_notify_seconds: 30.0,
            permission_timeout: 300.0,
            permission_raw_input_max_len: 500,
            image_download_timeout: 15.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub dir: String,
    pub keep_days: u32,
    pub max_total_mb: u32,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: "data/logs".to_string(),
            keep_days: 30,
            max_total_mb: 100,
        }
    }
}

/// Top-level configuration, aggregating all sub-sections.
#[derive(Debug, Clone, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct BridgeTomlConfig {
    pub server: ServerConfig,
    pub agent: AgentConfig,
    pub mcp: Vec<McpServerConfig>,
    pub ux: UxConfig,
    pub logging: LoggingConfig,
}

impl BridgeTomlConfig {
    /// Loads configuration from a TOML file, falling back to defaults for
    /// missing sections/fields.
    ///
    /// # Errors
    /// Returns `BridgeError::Config` if the file cannot be read or does not
    /// parse as valid TOML.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|err| {
            BridgeError::Config(format!("failed to read {}: {err}", path.display()))
        })?;
        toml::from_str(&raw)
            .map_err(|err| BridgeError::Config(format!("invalid config {}: {err}", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_sections_missing() {
        let config: BridgeTomlConfig = toml::from_str("").unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.agent.command, "claude");
        assert!(config.mcp.is_empty());
        assert_eq!(config.ux.permission_timeout, 300.0);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn partial_section_fills_in_remaining_defaults() {
        let raw = r#"
            [server]
            port = 9000
        "#;
        let config: BridgeTomlConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "0.0.0.0");
    }

    #[test]
    fn mcp_servers_parse_stdio_and_sse() {
        let raw = r#"
            [[mcp]]
            name = "fs"
            transport = "stdio"
            command = "mcp-fs"
            args = ["--root", "."]

            [[mcp]]
            name = "remote"
            transport = "sse"
            url = "https://example.com/sse"
        "#;
        let config: BridgeTomlConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.mcp.len(), 2);
        assert_eq!(config.mcp[0].transport, McpTransport::Stdio);
        assert_eq!(config.mcp[1].transport, McpTransport::Sse);
        assert_eq!(config.mcp[1].url.as_deref(), Some("https://example.com/sse"));
    }

    #[test]
    fn unknown_keys_are_tolerated() {
        let raw = r#"
            unknown_top_level = true

            [server]
            host = "127.0.0.1"
            unknown_field = 1
        "#;
        let config: BridgeTomlConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let err = BridgeTomlConfig::load("/nonexistent/path/config.toml").unwrap_err();
        assert!(matches!(err, BridgeError::Config(_)));
    }
}
