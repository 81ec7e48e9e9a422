//! CLI entry point: `bridge [configPath]` (§6).

use clap::Parser;
use ncat_bridge::config::BridgeTomlConfig;
use ncat_bridge::logging::{init_tracing, LogFormat};
use ncat_bridge::run_bridge;

#[derive(Parser, Debug)]
#[command(name = "bridge", about = "OneBot <-> Agent Client Protocol bridge")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(default_value = "config.toml")]
    config_path: String,

    /// Log output format; defaults to plain text.
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let cli = Cli::parse();

    let config = match BridgeTomlConfig::load(&cli.config_path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("failed to load config {}: {err}", cli.config_path);
            return std::process::ExitCode::FAILURE;
        }
    };

    if let Err(err) = init_tracing(&config.logging.level, cli.log_format) {
        eprintln!("failed to initialize logging: {err}");
        return std::process::ExitCode::FAILURE;
    }

    let bridge = match run_bridge(config).await {
        Ok(bridge) => bridge,
        Err(err) => {
            tracing::error!(error = %err, "failed to start bridge");
            return std::process::ExitCode::FAILURE;
        }
    };

    tracing::info!(addr = %bridge.local_addr(), "bridge running, press ctrl-c to stop");

    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for ctrl-c");
    }

    tracing::info!("shutting down");
    bridge.shutdown().await;
    std::process::ExitCode::SUCCESS
}
