//! Testable server startup logic.
//!
//! Provides [`ServerConfig`] and [`ServerHandle`] so integration tests can
//! spin up a real gateway on an ephemeral port, exercise its HTTP and
//! WebSocket endpoints, and shut it down cleanly. The production entry
//! point uses the same path with background tasks enabled.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, warn};

use crate::server::heartbeat::spawn_heartbeat_loop;
use crate::server::http::create_router;
use crate::server::verify::spawn_verify_loop;
use crate::server::ws::GatewayState;

/// Everything needed to start a gateway server.
pub struct ServerConfig {
    pub state: Arc<GatewayState>,
    pub bind_address: SocketAddr,
    /// When `false` (e.g. in tests), the heartbeat and verification loops
    /// are **not** spawned; tests drive the tick functions directly.
    pub spawn_background_tasks: bool,
}

impl ServerConfig {
    /// Minimal config suitable for integration tests: binds to
    /// `127.0.0.1:0` (OS-assigned port) without background loops.
    pub fn for_testing(state: Arc<GatewayState>) -> Self {
        ServerConfig {
            state,
            bind_address: SocketAddr::from(([127, 0, 0, 1], 0)),
            spawn_background_tasks: false,
        }
    }
}

/// Handle to a running server. Returned by [`run_server_with_config`].
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    state: Arc<GatewayState>,
    server_task: JoinHandle<Result<(), std::io::Error>>,
}

impl ServerHandle {
    /// The port the server actually bound to.
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// `http://ip:port` base URL for the running server.
    pub fn base_url(&self) -> String {
        format!("http://{}", self.local_addr)
    }

    /// `ws://ip:port<ws_path>` URL for the running server.
    pub fn ws_url(&self) -> String {
        format!("ws://{}{}", self.local_addr, self.state.config.ws_path)
    }

    pub fn state(&self) -> &Arc<GatewayState> {
        &self.state
    }

    /// Trigger graceful shutdown: stop background loops, drain the server,
    /// then await the server task with a timeout.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);

        match tokio::time::timeout(Duration::from_secs(5), self.server_task).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => error!("Server task returned error: {}", e),
            Ok(Err(e)) => error!("Server task panicked: {}", e),
            Err(_) => warn!("Server task did not finish within 5s timeout"),
        }
    }
}

/// Bind, spawn the serve task, and optionally start the background loops.
pub async fn run_server_with_config(
    config: ServerConfig,
) -> Result<ServerHandle, Box<dyn std::error::Error>> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let app = create_router(config.state.clone());

    if config.spawn_background_tasks {
        spawn_heartbeat_loop(config.state.clone(), shutdown_rx.clone());
        spawn_verify_loop(config.state.clone(), shutdown_rx.clone());
    }

    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;
    let local_addr = listener.local_addr()?;

    let mut shutdown_watch = shutdown_rx.clone();
    let server_task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                loop {
                    if *shutdown_watch.borrow() {
                        break;
                    }
                    if shutdown_watch.changed().await.is_err() {
                        break;
                    }
                }
            })
            .await
    });

    Ok(ServerHandle {
        local_addr,
        shutdown_tx,
        state: config.state,
        server_task,
    })
}
