//! `tracing` subscriber setup for the CLI binary.

use tracing_subscriber::{fmt, EnvFilter};

use crate::error::{BridgeError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, clap::ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

/// Initializes the global `tracing` subscriber.
///
/// The `RUST_LOG` environment variable takes precedence; otherwise `level`
/// (from `[logging] level` in the TOML config) is used as the filter.
///
/// # Errors
/// Returns `BridgeError::Config` if a subscriber is already installed.
pub fn init_tracing(level: &str, format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_lowercase()));
    let subscriber = fmt().with_env_filter(env_filter);

    let result = match format {
        LogFormat::Text => subscriber.try_init(),
        LogFormat::Json => subscriber.json().try_init(),
    };

    result.map_err(|err| BridgeError::Config(format!("failed to init tracing: {err}")))
}
