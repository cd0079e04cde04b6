//! Rate limiting
//!
//! Fixed-window counter per resolved client IP, applied as middleware to
//! the admin surface. The WebSocket path, the health endpoint, and CORS
//! preflight requests bypass the gate.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use parking_lot::RwLock;
use serde_json::json;
use tracing::warn;

use crate::server::ws::GatewayState;
use crate::server::{client_ip, now_ms};

/// Bucket key used when no client IP could be resolved from headers.
const UNKNOWN_KEY: &str = "unknown";

#[derive(Debug, Clone, Copy)]
struct Bucket {
    count: u32,
    reset_at: u64,
}

/// Fixed-window request counter. A bucket is created lazily per key and
/// replaced atomically once its window has elapsed.
pub struct FixedWindowLimiter {
    buckets: RwLock<HashMap<String, Bucket>>,
    window_ms: u64,
    max: u32,
}

impl FixedWindowLimiter {
    pub fn new(window_ms: u64, max: u32) -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
            window_ms,
            max,
        }
    }

    /// Record a request for `key` and report whether it is allowed.
    pub fn check(&self, key: &str) -> bool {
        self.check_at(key, now_ms())
    }

    fn check_at(&self, key: &str, now: u64) -> bool {
        let mut buckets = self.buckets.write();
        match buckets.get_mut(key) {
            Some(bucket) if bucket.reset_at >= now => {
                if bucket.count >= self.max {
                    false
                } else {
                    bucket.count += 1;
                    true
                }
            }
            _ => {
                buckets.insert(
                    key.to_string(),
                    Bucket {
                        count: 1,
                        reset_at: now + self.window_ms,
                    },
                );
                true
            }
        }
    }
}

/// Gate admin-surface requests through the per-IP window.
pub async fn rate_limit_middleware(
    State(state): State<Arc<GatewayState>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let path = req.uri().path();
    if req.method() == Method::OPTIONS
        || path == state.config.ws_path
        || path == "/v1/health"
    {
        return next.run(req).await;
    }

    let key = client_ip(req.headers()).unwrap_or_else(|| UNKNOWN_KEY.to_string());
    if !state.limiter.check(&key) {
        warn!(target: "http", ip = %key, path = %path, "rate limit exceeded");
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({"success": false, "message": "Too many requests"})),
        )
            .into_response();
    }
    next.run(req).await
}
