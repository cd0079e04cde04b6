//! Heartbeat loop
//!
//! Periodic liveness sweep over the registry: sends `server.keepalive`
//! frames and evicts sockets that went quiet past the offline threshold.
//! The sweep runs on a single timer with a single-flight guard; the tick
//! body is a free function so tests can drive it without timers.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::protocol::{
    ServerMessage, CLOSE_INACTIVITY, CLOSE_KEEPALIVE_FAILED, CLOSE_SOCKET_NOT_OPEN,
};
use crate::server::now_ms;
use crate::server::ws::{evict, GatewayState};

/// Sweep cadence bounds: the configured heartbeat interval is clamped into
/// this band so eviction latency stays predictable.
pub const MIN_TICK_MS: u64 = 5_000;
pub const MAX_TICK_MS: u64 = 10_000;

/// Keepalives are refreshed slightly before a full period has elapsed so a
/// tick firing marginally early still lands inside the window.
const KEEPALIVE_SLACK_MS: u64 = 250;

/// Effective sweep period for a configured heartbeat interval.
pub fn tick_period_ms(heartbeat_interval_ms: u64) -> u64 {
    heartbeat_interval_ms.clamp(MIN_TICK_MS, MAX_TICK_MS)
}

/// Spawn the heartbeat loop. Stops when the shutdown channel flips.
pub fn spawn_heartbeat_loop(
    state: Arc<GatewayState>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = Duration::from_millis(tick_period_ms(state.config.heartbeat_interval_ms));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => heartbeat_tick(&state).await,
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        debug!(target: "gateway", "heartbeat loop stopped");
    })
}

/// One guarded sweep. Overlapping invocations are dropped.
pub async fn heartbeat_tick(state: &GatewayState) {
    if state.heartbeat_running.swap(true, Ordering::SeqCst) {
        debug!(target: "gateway", "heartbeat tick still running, skipping");
        return;
    }
    sweep(state).await;
    state.heartbeat_running.store(false, Ordering::SeqCst);
}

async fn sweep(state: &GatewayState) {
    let now = now_ms();
    let tick_every = tick_period_ms(state.config.heartbeat_interval_ms);
    let keepalive = match serde_json::to_string(&ServerMessage::Keepalive) {
        Ok(text) => text,
        Err(err) => {
            warn!(target: "gateway", error = %err, "failed to serialize keepalive frame");
            return;
        }
    };

    for (conn_id, handle, conn) in state.registry.snapshot() {
        if !handle.is_open() {
            evict(state, conn_id, CLOSE_SOCKET_NOT_OPEN, "socket_not_open").await;
            continue;
        }
        if now.saturating_sub(conn.last_seen) > state.config.offline_after_ms {
            evict(state, conn_id, CLOSE_INACTIVITY, "inactivity_timeout").await;
            continue;
        }
        if now.saturating_sub(conn.last_keepalive_at)
            >= tick_every.saturating_sub(KEEPALIVE_SLACK_MS)
        {
            if handle.send_text(keepalive.clone()).is_ok() {
                state
                    .registry
                    .update(conn_id, |conn| conn.last_keepalive_at = now);
            } else {
                evict(state, conn_id, CLOSE_KEEPALIVE_FAILED, "keepalive_failed").await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::presence::MemoryPresence;
    use crate::protocol::{AccountType, Role};
    use crate::server::registry::{ConnId, ConnectionHandle, ConnectionState};
    use axum::extract::ws::Message;
    use serde_json::{json, Value};
    use tokio::sync::mpsc;
    use uuid::Uuid;

    fn test_state() -> (Arc<GatewayState>, Arc<MemoryPresence>) {
        let presence = Arc::new(MemoryPresence::new());
        let state = Arc::new(GatewayState::new(Config::for_testing(), presence.clone()));
        (state, presence)
    }

    fn register(
        state: &GatewayState,
        uuid: &str,
        last_seen: u64,
        last_keepalive_at: u64,
    ) -> (ConnId, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn_id = Uuid::new_v4();
        state.registry.insert(
            conn_id,
            ConnectionHandle::new(tx),
            ConnectionState {
                uuid: uuid.to_string(),
                name: "Test".to_string(),
                account_type: AccountType::Local,
                roles: vec![Role::Member],
                connected_at: last_seen,
                last_seen,
                last_keepalive_at,
                is_alive: true,
                ip: None,
            },
        );
        (conn_id, rx)
    }

    fn frames(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<Message> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    #[test]
    fn test_tick_period_clamps_configured_interval() {
        assert_eq!(tick_period_ms(30_000), MAX_TICK_MS);
        assert_eq!(tick_period_ms(1_000), MIN_TICK_MS);
        assert_eq!(tick_period_ms(7_000), 7_000);
    }

    #[tokio::test]
    async fn test_stale_connection_evicted_with_4400() {
        let (state, presence) = test_state();
        let now = now_ms();
        // Far past the offline threshold; keepalive fresh so only rule 2 fires.
        let (conn_id, mut rx) = register(&state, "stale", now - 60_000, now);

        heartbeat_tick(&state).await;

        assert!(state.registry.get(conn_id).is_none());
        assert!(!presence.record("stale").unwrap().online);
        let close = frames(&mut rx)
            .into_iter()
            .find_map(|msg| match msg {
                Message::Close(Some(frame)) => Some(frame),
                _ => None,
            })
            .expect("expected close frame");
        assert_eq!(close.code, CLOSE_INACTIVITY);
        assert_eq!(close.reason, "inactivity_timeout");
    }

    #[tokio::test]
    async fn test_fresh_connection_gets_keepalive() {
        let (state, _) = test_state();
        let now = now_ms();
        let (conn_id, mut rx) = register(&state, "fresh", now, 0);

        heartbeat_tick(&state).await;

        assert!(state.registry.get(conn_id).is_some());
        let sent = frames(&mut rx);
        assert_eq!(sent.len(), 1);
        match &sent[0] {
            Message::Text(text) => {
                let frame: Value = serde_json::from_str(text).unwrap();
                assert_eq!(frame, json!({"type": "server.keepalive"}));
            }
            other => panic!("expected keepalive text frame, got {other:?}"),
        }
        assert!(state.registry.get(conn_id).unwrap().last_keepalive_at >= now);
    }

    #[tokio::test]
    async fn test_recent_keepalive_not_resent() {
        let (state, _) = test_state();
        let now = now_ms();
        let (_, mut rx) = register(&state, "fresh", now, now);

        heartbeat_tick(&state).await;

        assert!(frames(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_closed_socket_evicted_with_4001() {
        let (state, presence) = test_state();
        let now = now_ms();
        let (conn_id, rx) = register(&state, "gone", now, now);
        drop(rx);

        heartbeat_tick(&state).await;

        assert!(state.registry.get(conn_id).is_none());
        assert!(!presence.record("gone").unwrap().online);
    }

    #[tokio::test]
    async fn test_eviction_broadcasts_leave_to_survivors() {
        let (state, _) = test_state();
        let now = now_ms();
        let (_, rx_stale) = register(&state, "stale", now - 60_000, now);
        drop(rx_stale);
        let (_, mut rx_live) = register(&state, "live", now, now);

        heartbeat_tick(&state).await;

        let leaves: Vec<Value> = frames(&mut rx_live)
            .into_iter()
            .filter_map(|msg| match msg {
                Message::Text(text) => serde_json::from_str(&text).ok(),
                _ => None,
            })
            .collect();
        assert!(leaves.contains(&json!({"type": "user.leave", "uuid": "stale"})));
    }

    #[tokio::test]
    async fn test_overlapping_tick_is_skipped() {
        let (state, _) = test_state();
        let now = now_ms();
        let (conn_id, _rx) = register(&state, "stale", now - 60_000, now);

        state.heartbeat_running.store(true, Ordering::SeqCst);
        heartbeat_tick(&state).await;
        // Guard held: nothing swept.
        assert!(state.registry.get(conn_id).is_some());

        state.heartbeat_running.store(false, Ordering::SeqCst);
        heartbeat_tick(&state).await;
        assert!(state.registry.get(conn_id).is_none());
    }
}
