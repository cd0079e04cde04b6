//! WebSocket gateway core
//!
//! Implements the connection lifecycle: upgrade gate, per-socket read loop,
//! the auth/ping/roles/warp protocol handlers, and the broadcast fan-out.
//!
//! Each socket gets a forwarder task draining an unbounded queue into the
//! sink, so handlers and the background sweeps never block on a slow peer.
//! A socket joins the registry only after a successful `auth`; every
//! handler re-reads its entry and silently aborts when it vanished — an
//! eviction may race a still-in-flight frame from the same connection.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, OnceCell};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::presence::{PresenceClient, PresenceUpsert};
use crate::protocol::{
    parse_client_message, AuthPayload, ClientMessage, Role, ServerMessage, WarpStatusPayload,
};
use crate::server::ratelimit::FixedWindowLimiter;
use crate::server::registry::{ConnId, ConnectionHandle, ConnectionRegistry, ConnectionState};
use crate::server::{client_ip, now_ms};

/// Shared gateway state: the registry is the only significant piece of
/// mutable state; everything else is configuration or handles.
pub struct GatewayState {
    pub config: Config,
    pub registry: ConnectionRegistry,
    pub presence: Arc<dyn PresenceClient>,
    pub limiter: FixedWindowLimiter,
    /// Wall-clock time this process booted.
    pub boot_ms: u64,
    /// Persisted start time, read through from the store once per process.
    pub started_at: OnceCell<u64>,
    pub(crate) heartbeat_running: AtomicBool,
    pub(crate) verify_running: AtomicBool,
}

impl GatewayState {
    pub fn new(config: Config, presence: Arc<dyn PresenceClient>) -> Self {
        let limiter =
            FixedWindowLimiter::new(config.rate_limit_window_ms, config.rate_limit_max);
        Self {
            config,
            registry: ConnectionRegistry::new(),
            presence,
            limiter,
            boot_ms: now_ms(),
            started_at: OnceCell::new(),
            heartbeat_running: AtomicBool::new(false),
            verify_running: AtomicBool::new(false),
        }
    }
}

/// Upgrade gate for the configured WS path.
///
/// A forwarded-protocol header that is present but not `https` is refused
/// outright; a request without a WebSocket upgrade gets 426.
pub async fn ws_handler(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    if let Some(proto) = headers.get("x-forwarded-proto").and_then(|v| v.to_str().ok()) {
        if !proto.trim().eq_ignore_ascii_case("https") {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"success": false, "message": "Insecure connection"})),
            )
                .into_response();
        }
    }
    let Some(ws) = ws else {
        return (
            StatusCode::UPGRADE_REQUIRED,
            Json(json!({"success": false, "message": "WebSocket upgrade required"})),
        )
            .into_response();
    };
    let ip = client_ip(&headers);
    ws.on_upgrade(move |socket| handle_socket(socket, state, ip))
}

/// Drive one socket: forwarder task plus the sequential read loop.
async fn handle_socket(socket: WebSocket, state: Arc<GatewayState>, ip: Option<String>) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if sender.send(msg).await.is_err() || closing {
                break;
            }
        }
    });

    let conn_id = Uuid::new_v4();
    let handle = ConnectionHandle::new(tx);
    debug!(target: "ws", %conn_id, ip = ?ip, "socket connected");

    while let Some(next) = receiver.next().await {
        let msg = match next {
            Ok(msg) => msg,
            Err(_) => break,
        };
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            // Control frames are the transport's business; binary frames
            // are not part of the protocol.
            Message::Ping(_) | Message::Pong(_) | Message::Binary(_) => continue,
        };
        process_frame(&state, conn_id, &handle, ip.as_deref(), &text).await;
    }

    finish_connection(&state, conn_id).await;
    drop(handle);
    let _ = send_task.await;
    debug!(target: "ws", %conn_id, "socket task finished");
}

/// Parse, validate, and dispatch one inbound frame.
pub async fn process_frame(
    state: &GatewayState,
    conn_id: ConnId,
    handle: &ConnectionHandle,
    ip: Option<&str>,
    text: &str,
) {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(err) => {
            safe_send(
                conn_id,
                handle,
                &ServerMessage::invalid_payload(Some(json!(err.to_string()))),
            );
            return;
        }
    };
    let message = match parse_client_message(&value) {
        Ok(message) => message,
        Err(issues) => {
            safe_send(
                conn_id,
                handle,
                &ServerMessage::invalid_payload(Some(json!(issues))),
            );
            return;
        }
    };

    match message {
        ClientMessage::Auth(payload) => handle_auth(state, conn_id, handle, ip, payload).await,
        ClientMessage::Ping => handle_ping(state, conn_id, handle).await,
        ClientMessage::RolesUpdate { roles } => handle_roles_update(state, conn_id, roles).await,
        ClientMessage::WarpStatus(payload) => handle_warp_status(state, conn_id, payload).await,
        ClientMessage::Unknown(kind) => {
            info!(target: "ws", %conn_id, message_type = %kind, "ignoring unknown message type");
        }
    }

    // Any handled frame counts as liveness for an authed connection.
    state.registry.update(conn_id, |conn| {
        conn.last_seen = now_ms();
        conn.is_alive = true;
    });
}

/// `auth`: resolve identity and roles, admit the socket to the registry,
/// answer `auth.ok`, and announce the join to everyone.
async fn handle_auth(
    state: &GatewayState,
    conn_id: ConnId,
    handle: &ConnectionHandle,
    ip: Option<&str>,
    payload: AuthPayload,
) {
    let AuthPayload {
        uuid,
        name,
        account_type,
        roles: hinted_roles,
    } = payload;
    let uuid = if uuid.is_empty() {
        Uuid::new_v4().to_string()
    } else {
        uuid
    };
    let name = if name.is_empty() {
        "Unknown".to_string()
    } else {
        name
    };

    // Re-auth under a new identity retires the previous one first.
    if let Some(previous) = state.registry.get(conn_id) {
        if previous.uuid != uuid {
            if let Err(err) = state.presence.mark_offline(&previous.uuid).await {
                warn!(target: "presence", uuid = %previous.uuid, op = "mark_offline", error = %err, "presence update failed");
            }
            broadcast(
                state,
                &ServerMessage::UserLeave {
                    uuid: previous.uuid,
                },
            );
        }
    }

    // Canonical store roles win over client hints; MEMBER is the floor.
    let stored_roles = match state.presence.fetch_roles(&uuid).await {
        Ok(roles) => roles,
        Err(err) => {
            warn!(target: "presence", uuid = %uuid, op = "fetch_roles", error = %err, "presence lookup failed");
            None
        }
    };
    let store_had_roles = stored_roles.is_some();
    let effective = stored_roles
        .or_else(|| (!hinted_roles.is_empty()).then_some(hinted_roles))
        .unwrap_or_else(|| vec![Role::DEFAULT]);

    let now = now_ms();
    state.registry.insert(
        conn_id,
        handle.clone(),
        ConnectionState {
            uuid: uuid.clone(),
            name: name.clone(),
            account_type,
            roles: effective.clone(),
            connected_at: now,
            last_seen: now,
            last_keepalive_at: now,
            is_alive: true,
            ip: ip.map(str::to_string),
        },
    );

    // Persist hinted/default roles only when the store had none, so client
    // hints never clobber canonical roles.
    let roles_to_persist = (!store_had_roles).then_some(effective.as_slice());
    let upsert = PresenceUpsert {
        uuid: uuid.clone(),
        name: name.clone(),
        account_type,
        roles: effective.clone(),
        ip: ip.map(str::to_string),
    };
    if let Err(err) = state.presence.mark_online(&upsert, roles_to_persist).await {
        warn!(target: "presence", uuid = %uuid, op = "mark_online", error = %err, "presence update failed");
    }

    safe_send(
        conn_id,
        handle,
        &ServerMessage::AuthOk {
            uuid: uuid.clone(),
            roles: effective,
        },
    );
    broadcast(
        state,
        &ServerMessage::UserJoin {
            uuid,
            name,
            account_type,
        },
    );
}

async fn handle_ping(state: &GatewayState, conn_id: ConnId, handle: &ConnectionHandle) {
    let Some(conn) = state.registry.get(conn_id) else {
        return;
    };
    state.registry.update(conn_id, |conn| {
        conn.last_seen = now_ms();
        conn.is_alive = true;
    });
    if let Err(err) = state.presence.update_last_seen(&conn.uuid).await {
        warn!(target: "presence", uuid = %conn.uuid, op = "update_last_seen", error = %err, "presence update failed");
    }
    safe_send(conn_id, handle, &ServerMessage::Pong);
}

async fn handle_roles_update(state: &GatewayState, conn_id: ConnId, roles: Vec<Role>) {
    if roles.is_empty() {
        return;
    }
    let Some(conn) = state.registry.get(conn_id) else {
        return;
    };
    state.registry.update(conn_id, |conn| conn.roles = roles.clone());
    if let Err(err) = state.presence.update_roles(&conn.uuid, &roles).await {
        warn!(target: "presence", uuid = %conn.uuid, op = "update_roles", error = %err, "presence update failed");
    }
    broadcast(
        state,
        &ServerMessage::UserRoles {
            uuid: conn.uuid,
            roles,
        },
    );
}

async fn handle_warp_status(state: &GatewayState, conn_id: ConnId, payload: WarpStatusPayload) {
    if !state.config.persist_warp_status {
        return;
    }
    let Some(conn) = state.registry.get(conn_id) else {
        return;
    };
    let mut blob = match serde_json::to_value(&payload) {
        Ok(Value::Object(map)) => map,
        _ => serde_json::Map::new(),
    };
    blob.insert("serverTimestamp".to_string(), json!(now_ms()));
    let key = format!("warp:status:{}", conn.uuid);
    if let Err(err) = state
        .presence
        .put_status_blob(&key, Value::Object(blob))
        .await
    {
        warn!(target: "presence", uuid = %conn.uuid, op = "put_status_blob", error = %err, "presence update failed");
    }
}

/// Close handler: retire the connection if it is still registered.
/// Idempotent — an already-evicted socket is a no-op.
pub async fn finish_connection(state: &GatewayState, conn_id: ConnId) {
    let Some((_, conn)) = state.registry.remove(conn_id) else {
        return;
    };
    if let Err(err) = state.presence.mark_offline(&conn.uuid).await {
        warn!(target: "presence", uuid = %conn.uuid, op = "mark_offline", error = %err, "presence update failed");
    }
    broadcast(state, &ServerMessage::UserLeave { uuid: conn.uuid });
}

/// Forced removal used by the heartbeat and verification sweeps: retire the
/// connection, announce the leave, then close the socket with the given
/// code.
pub async fn evict(state: &GatewayState, conn_id: ConnId, code: u16, reason: &str) {
    let Some((handle, mut conn)) = state.registry.remove(conn_id) else {
        return;
    };
    conn.is_alive = false;
    if let Err(err) = state.presence.mark_offline(&conn.uuid).await {
        warn!(target: "presence", uuid = %conn.uuid, op = "mark_offline", error = %err, "presence update failed");
    }
    broadcast(
        state,
        &ServerMessage::UserLeave {
            uuid: conn.uuid.clone(),
        },
    );
    if handle.close(code, reason).is_err() {
        debug!(target: "ws", %conn_id, code, reason, "close frame not delivered");
    }
    info!(target: "ws", %conn_id, uuid = %conn.uuid, code, reason, "connection evicted");
}

/// Send a frame to a single socket, only when it is open; serialization and
/// transport failures are logged, never propagated.
pub fn safe_send(conn_id: ConnId, handle: &ConnectionHandle, message: &ServerMessage) -> bool {
    let text = match serde_json::to_string(message) {
        Ok(text) => text,
        Err(err) => {
            warn!(target: "ws", %conn_id, error = %err, "failed to serialize outbound frame");
            return false;
        }
    };
    if !handle.is_open() {
        return false;
    }
    if handle.send_text(text).is_err() {
        debug!(target: "ws", %conn_id, "send to closed socket dropped");
        return false;
    }
    true
}

/// Fan a frame out to every open socket. Serializes once; per-socket
/// failures are logged and never abort the sweep.
pub fn broadcast(state: &GatewayState, message: &ServerMessage) {
    match serde_json::to_string(message) {
        Ok(text) => broadcast_raw(state, &text),
        Err(err) => warn!(target: "ws", error = %err, "failed to serialize broadcast"),
    }
}

/// Fan out an already-serialized payload.
pub fn broadcast_raw(state: &GatewayState, text: &str) {
    for (conn_id, handle, _) in state.registry.snapshot() {
        if !handle.is_open() {
            continue;
        }
        if handle.send_text(text.to_string()).is_err() {
            debug!(target: "ws", %conn_id, "broadcast send failed");
        }
    }
}
