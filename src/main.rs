use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};

use roster::cli::{self, Cli, Command};
use roster::config::{Config, RunEnv};
use roster::logging::{self, LogConfig};
use roster::presence::MemoryPresence;
use roster::server::heartbeat::tick_period_ms;
use roster::server::startup::{run_server_with_config, ServerConfig};
use roster::server::verify::verify_period_ms;
use roster::server::ws::GatewayState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        // No subcommand or explicit `start` both launch the server.
        None | Some(Command::Start) => run_server().await,

        Some(Command::Status { host, port }) => cli::handle_status(&host, port).await,

        Some(Command::Version) => {
            cli::handle_version();
            Ok(())
        }
    }
}

async fn run_server() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_env()?;
    init_logging_for(&config)?;
    log_startup_banner(&config);

    let presence = Arc::new(MemoryPresence::new());
    let state = Arc::new(GatewayState::new(config.clone(), presence));

    let server_config = ServerConfig {
        state,
        bind_address: SocketAddr::from(([0, 0, 0, 0], config.port)),
        spawn_background_tasks: true,
    };
    let handle = run_server_with_config(server_config).await?;
    info!("Listening on {}", handle.local_addr());

    let reason = await_shutdown_trigger().await;
    info!("Shutdown signal received ({})", reason);
    handle.shutdown().await;
    info!("Gateway shut down");
    Ok(())
}

/// Plaintext/debug in development and test, JSON/info in production;
/// `LOG_LEVEL` overrides the default level either way.
fn init_logging_for(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let mut log_config = match config.env {
        RunEnv::Production => LogConfig::production(),
        RunEnv::Development | RunEnv::Test => LogConfig::development(),
    };
    if let Some(level) = config.log_level {
        log_config = log_config.with_level(level);
    }
    logging::init_logging(log_config)?;
    Ok(())
}

fn log_startup_banner(config: &Config) {
    info!("roster gateway v{}", env!("CARGO_PKG_VERSION"));
    info!("Environment: {}", config.env.as_str());
    info!("WebSocket path: {}", config.ws_path);
    info!(
        "Heartbeat every {}ms, offline after {}ms",
        tick_period_ms(config.heartbeat_interval_ms),
        config.offline_after_ms
    );
    match verify_period_ms(config.verify_interval_ms) {
        Some(period) => info!("Verification every {}ms", period),
        None => info!("Verification disabled"),
    }
}

/// Wait for either Ctrl+C or SIGTERM (Unix only) and return a label for logging.
#[cfg(unix)]
async fn await_shutdown_trigger() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => "ctrl-c",
                _ = sigterm.recv() => "SIGTERM",
            }
        }
        Err(e) => {
            warn!(
                "Failed to install SIGTERM handler: {}; falling back to Ctrl+C only",
                e
            );
            match tokio::signal::ctrl_c().await {
                Ok(()) => "ctrl-c",
                Err(e) => {
                    panic!("Failed to install Ctrl+C handler: {}", e);
                }
            }
        }
    }
}

/// On non-Unix platforms, only Ctrl+C is available.
#[cfg(not(unix))]
async fn await_shutdown_trigger() -> &'static str {
    match tokio::signal::ctrl_c().await {
        Ok(()) => "ctrl-c",
        Err(e) => {
            panic!("Failed to install Ctrl+C handler: {}", e);
        }
    }
}
