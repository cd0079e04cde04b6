//! Server module
//!
//! HTTP admin surface, WebSocket gateway core, connection registry, and the
//! two periodic background sweeps (heartbeat, verification).

pub mod heartbeat;
pub mod http;
pub mod ratelimit;
pub mod registry;
pub mod startup;
pub mod verify;
pub mod ws;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::http::HeaderMap;

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_millis() as u64
}

/// Resolve the client IP from proxy headers, first match wins:
/// `cf-connecting-ip`, then `x-real-ip`, then the first entry of
/// `x-forwarded-for`. `None` when no header is present.
pub fn client_ip(headers: &HeaderMap) -> Option<String> {
    for name in ["cf-connecting-ip", "x-real-ip"] {
        if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_client_ip_priority_order() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("3.3.3.3, 4.4.4.4"));
        headers.insert("x-real-ip", HeaderValue::from_static("2.2.2.2"));
        assert_eq!(client_ip(&headers), Some("2.2.2.2".to_string()));

        headers.insert("cf-connecting-ip", HeaderValue::from_static("1.1.1.1"));
        assert_eq!(client_ip(&headers), Some("1.1.1.1".to_string()));
    }

    #[test]
    fn test_client_ip_forwarded_for_takes_first_entry() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("3.3.3.3, 4.4.4.4"));
        assert_eq!(client_ip(&headers), Some("3.3.3.3".to_string()));
    }

    #[test]
    fn test_client_ip_absent() {
        assert_eq!(client_ip(&HeaderMap::new()), None);
    }
}
