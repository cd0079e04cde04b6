//! Admin HTTP surface
//!
//! Implements:
//! - CORS middleware (preflight + response headers on everything)
//! - `GET /v1/health` (unauthenticated, store-backed start time)
//! - `GET /v1/connected-users` (admin, store first with registry fallback)
//! - `POST /v1/broadcast` (admin, fan-out to every open socket)
//! - 404 fallback with the shared error shape
//!
//! Authorization is a shared secret in the `x-admin-key` header, compared
//! in constant time.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::warn;

use crate::presence::{HealthMarker, PresenceRecord, DEFAULT_ONLINE_LIMIT};
use crate::protocol::{AccountType, Role};
use crate::server::now_ms;
use crate::server::ratelimit::rate_limit_middleware;
use crate::server::registry::ConnectionState;
use crate::server::ws::{broadcast_raw, ws_handler, GatewayState};

const CORS_ALLOW_METHODS: &str = "GET, POST, OPTIONS";
const CORS_ALLOW_HEADERS: &str = "content-type, x-admin-key, x-forwarded-for, x-forwarded-proto";

/// Assemble the full router: WS path, admin routes, rate limiting, CORS.
pub fn create_router(state: Arc<GatewayState>) -> Router {
    let ws_path = state.config.ws_path.clone();
    Router::new()
        .route(&ws_path, get(ws_handler))
        .route("/v1/health", get(health_handler))
        .route("/v1/connected-users", get(connected_users_handler))
        .route("/v1/broadcast", post(broadcast_handler))
        .fallback(not_found_handler)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit_middleware,
        ))
        .layer(middleware::from_fn(cors_middleware))
        .with_state(state)
}

/// Answer preflight directly and stamp CORS headers on every response.
async fn cors_middleware(req: Request, next: Next) -> Response {
    if req.method() == Method::OPTIONS {
        let mut response = StatusCode::NO_CONTENT.into_response();
        apply_cors(response.headers_mut());
        return response;
    }
    let mut response = next.run(req).await;
    apply_cors(response.headers_mut());
    response
}

fn apply_cors(headers: &mut HeaderMap) {
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static(CORS_ALLOW_METHODS),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static(CORS_ALLOW_HEADERS),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
        HeaderValue::from_static("true"),
    );
}

fn authorized(state: &GatewayState, headers: &HeaderMap) -> bool {
    headers
        .get("x-admin-key")
        .and_then(|v| v.to_str().ok())
        .map(|key| constant_time_eq(key, &state.config.admin_key))
        .unwrap_or(false)
}

/// Constant-time string comparison for the admin secret.
fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }
    result == 0
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"success": false, "message": "Unauthorized"})),
    )
        .into_response()
}

fn bad_request(message: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"success": false, "message": message})),
    )
        .into_response()
}

async fn not_found_handler() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"success": false, "message": "Not found"})),
    )
        .into_response()
}

/// Persisted start time, read through from the store once per process.
/// First writer wins per commit hash: the marker is reused while the commit
/// matches and replaced when a new build comes up.
async fn resolve_started_at(state: &GatewayState) -> u64 {
    *state
        .started_at
        .get_or_init(|| async {
            let env = state.config.env.as_str();
            match state.presence.read_health_marker(env).await {
                Ok(Some(marker)) if marker.commit_hash == state.config.commit_hash => {
                    marker.started_at_ms
                }
                Ok(_) => {
                    let marker = HealthMarker {
                        started_at_ms: state.boot_ms,
                        commit_hash: state.config.commit_hash.clone(),
                    };
                    if let Err(err) = state.presence.write_health_marker(env, &marker).await {
                        warn!(target: "presence", op = "write_health_marker", error = %err, "presence update failed");
                    }
                    marker.started_at_ms
                }
                Err(err) => {
                    warn!(target: "presence", op = "read_health_marker", error = %err, "presence lookup failed");
                    state.boot_ms
                }
            }
        })
        .await
}

async fn health_handler(State(state): State<Arc<GatewayState>>) -> Response {
    let started_at = resolve_started_at(&state).await;
    let now = now_ms();
    let online_users = match state.presence.count_online_users().await {
        Ok(count) => Some(count),
        Err(err) => {
            warn!(target: "presence", op = "count_online_users", error = %err, "presence lookup failed");
            None
        }
    };

    let mut body = json!({
        "ok": true,
        "env": state.config.env.as_str(),
        "version": env!("CARGO_PKG_VERSION"),
        "startedAt": started_at,
        "uptimeMs": now.saturating_sub(started_at),
        "timestamp": now,
        "connections": state.registry.len(),
        "uniqueUsers": state.registry.unique_user_count(),
    });
    if let Some(count) = online_users {
        body["onlineUsers"] = json!(count);
    }
    Json(body).into_response()
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ConnectedUser {
    uuid: String,
    name: String,
    account_type: AccountType,
    last_seen: Option<u64>,
    connected_at: Option<u64>,
    roles: Vec<Role>,
}

impl From<PresenceRecord> for ConnectedUser {
    fn from(record: PresenceRecord) -> Self {
        ConnectedUser {
            uuid: record.uuid,
            name: record.name,
            account_type: record.account_type,
            last_seen: record.last_seen,
            connected_at: record.last_join,
            roles: record.roles,
        }
    }
}

impl From<ConnectionState> for ConnectedUser {
    fn from(conn: ConnectionState) -> Self {
        ConnectedUser {
            uuid: conn.uuid,
            name: conn.name,
            account_type: conn.account_type,
            last_seen: Some(conn.last_seen),
            connected_at: Some(conn.connected_at),
            roles: conn.roles,
        }
    }
}

async fn connected_users_handler(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
) -> Response {
    if !authorized(&state, &headers) {
        return unauthorized();
    }

    let users: Vec<ConnectedUser> = match state
        .presence
        .fetch_online_users(DEFAULT_ONLINE_LIMIT)
        .await
    {
        Ok(records) => records.into_iter().map(ConnectedUser::from).collect(),
        Err(err) => {
            warn!(target: "presence", op = "fetch_online_users", error = %err, "falling back to in-memory registry");
            state
                .registry
                .online_projection()
                .into_iter()
                .map(ConnectedUser::from)
                .collect()
        }
    };

    Json(json!({
        "success": true,
        "users": users,
        "connections": state.registry.len(),
    }))
    .into_response()
}

async fn broadcast_handler(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    body: Option<Json<Value>>,
) -> Response {
    if !authorized(&state, &headers) {
        return unauthorized();
    }
    let Some(Json(body)) = body else {
        return bad_request("Invalid broadcast request");
    };
    let Some(kind) = body
        .get("type")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
    else {
        return bad_request("Invalid broadcast request");
    };
    let payload = match body.get("payload") {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(map)) => map.clone(),
        Some(_) => return bad_request("Invalid broadcast request"),
    };

    // Spread semantics: `type` first, payload entries override on collision.
    let mut frame = Map::new();
    frame.insert("type".to_string(), json!(kind));
    for (key, value) in payload {
        frame.insert(key, value);
    }

    match serde_json::to_string(&Value::Object(frame)) {
        Ok(text) => broadcast_raw(&state, &text),
        Err(err) => {
            warn!(target: "http", error = %err, "failed to serialize admin broadcast");
            return bad_request("Invalid broadcast request");
        }
    }
    Json(json!({"success": true})).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("abc", "abc"));
        assert!(!constant_time_eq("abc", "abd"));
        assert!(!constant_time_eq("abc", "ab"));
        assert!(!constant_time_eq("ab", "abc"));
        assert!(constant_time_eq("", ""));
    }

    #[test]
    fn test_connected_user_from_presence_record() {
        let record = PresenceRecord {
            uuid: "a1".to_string(),
            name: "Alice".to_string(),
            account_type: AccountType::Premium,
            roles: vec![Role::Gold],
            online: true,
            last_join: Some(10),
            last_seen: Some(20),
            last_leave: None,
            ip: None,
        };
        let user = ConnectedUser::from(record);
        let value = serde_json::to_value(&user).unwrap();
        assert_eq!(
            value,
            json!({
                "uuid": "a1",
                "name": "Alice",
                "accountType": "PREMIUM",
                "lastSeen": 20,
                "connectedAt": 10,
                "roles": ["GOLD"]
            })
        );
    }

    #[test]
    fn test_connected_user_from_connection_state() {
        let conn = ConnectionState {
            uuid: "b1".to_string(),
            name: "Bob".to_string(),
            account_type: AccountType::Local,
            roles: vec![Role::Member],
            connected_at: 5,
            last_seen: 9,
            last_keepalive_at: 0,
            is_alive: true,
            ip: None,
        };
        let user = ConnectedUser::from(conn);
        assert_eq!(user.connected_at, Some(5));
        assert_eq!(user.last_seen, Some(9));
    }
}
