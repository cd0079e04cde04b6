//! Verification loop
//!
//! Deep reconciliation between the in-memory registry and the presence
//! store. Connections whose user is no longer online in the store, or whose
//! identity has drifted from the canonical record, are terminated; everyone
//! else gets a `server.verify` frame as an end-to-end liveness receipt.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::presence::PresenceRecord;
use crate::protocol::{ServerMessage, CLOSE_KEEPALIVE_FAILED, CLOSE_VERIFICATION_FAILED};
use crate::server::ws::{evict, safe_send, GatewayState};

/// Floor on the sweep cadence; the store should not be hammered even when
/// misconfigured.
pub const MIN_VERIFY_INTERVAL_MS: u64 = 60_000;

/// Minimum page size requested from the store per sweep.
const MIN_FETCH_LIMIT: usize = 100;

/// Effective sweep period, or `None` when verification is disabled.
pub fn verify_period_ms(configured_ms: i64) -> Option<u64> {
    if configured_ms <= 0 {
        return None;
    }
    Some((configured_ms as u64).max(MIN_VERIFY_INTERVAL_MS))
}

/// Spawn the verification loop, unless disabled by configuration.
pub fn spawn_verify_loop(
    state: Arc<GatewayState>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Option<JoinHandle<()>> {
    let period = verify_period_ms(state.config.verify_interval_ms)?;
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(period));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => verification_tick(&state).await,
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        debug!(target: "gateway", "verification loop stopped");
    }))
}

/// One guarded sweep. Overlapping invocations are dropped.
pub async fn verification_tick(state: &GatewayState) {
    if state.verify_running.swap(true, Ordering::SeqCst) {
        debug!(target: "gateway", "verification tick still running, skipping");
        return;
    }
    sweep(state).await;
    state.verify_running.store(false, Ordering::SeqCst);
}

async fn sweep(state: &GatewayState) {
    let limit = state.registry.len().max(MIN_FETCH_LIMIT);
    let records = match state.presence.fetch_online_users(limit).await {
        Ok(records) => records,
        Err(err) => {
            warn!(target: "presence", op = "fetch_online_users", error = %err, "verification tick skipped");
            return;
        }
    };
    let by_uuid: HashMap<&str, &PresenceRecord> =
        records.iter().map(|r| (r.uuid.as_str(), r)).collect();

    for (conn_id, handle, conn) in state.registry.snapshot() {
        if !handle.is_open() {
            evict(
                state,
                conn_id,
                CLOSE_KEEPALIVE_FAILED,
                "verification_socket_not_open",
            )
            .await;
            continue;
        }
        match by_uuid.get(conn.uuid.as_str()) {
            None => {
                evict(
                    state,
                    conn_id,
                    CLOSE_VERIFICATION_FAILED,
                    "verification_d1_offline",
                )
                .await;
            }
            Some(record) if !record.online => {
                evict(
                    state,
                    conn_id,
                    CLOSE_VERIFICATION_FAILED,
                    "verification_d1_offline",
                )
                .await;
            }
            Some(record)
                if record.name != conn.name || record.account_type != conn.account_type =>
            {
                evict(
                    state,
                    conn_id,
                    CLOSE_VERIFICATION_FAILED,
                    "verification_identity_mismatch",
                )
                .await;
            }
            Some(_) => {
                safe_send(
                    conn_id,
                    &handle,
                    &ServerMessage::Verify {
                        uuid: conn.uuid.clone(),
                        last_seen: conn.last_seen,
                    },
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::presence::{
        HealthMarker, MemoryPresence, PresenceClient, PresenceError, PresenceUpsert,
    };
    use crate::protocol::{AccountType, Role};
    use crate::server::now_ms;
    use crate::server::registry::{ConnId, ConnectionHandle, ConnectionState};
    use async_trait::async_trait;
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
        name: &str,
    ) -> (ConnId, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn_id = Uuid::new_v4();
        let now = now_ms();
        state.registry.insert(
            conn_id,
            ConnectionHandle::new(tx),
            ConnectionState {
                uuid: uuid.to_string(),
                name: name.to_string(),
                account_type: AccountType::Local,
                roles: vec![Role::Member],
                connected_at: now,
                last_seen: now,
                last_keepalive_at: now,
                is_alive: true,
                ip: None,
            },
        );
        (conn_id, rx)
    }

    fn seed_online(presence: &MemoryPresence, uuid: &str, name: &str) {
        presence.seed(crate::presence::PresenceRecord {
            uuid: uuid.to_string(),
            name: name.to_string(),
            account_type: AccountType::Local,
            roles: vec![Role::Member],
            online: true,
            last_join: Some(1),
            last_seen: Some(1),
            last_leave: None,
            ip: None,
        });
    }

    fn close_frame(rx: &mut mpsc::UnboundedReceiver<Message>) -> Option<(u16, String)> {
        while let Ok(msg) = rx.try_recv() {
            if let Message::Close(Some(frame)) = msg {
                return Some((frame.code, frame.reason.to_string()));
            }
        }
        None
    }

    #[test]
    fn test_verify_period_disabled_and_floored() {
        assert_eq!(verify_period_ms(0), None);
        assert_eq!(verify_period_ms(-5), None);
        assert_eq!(verify_period_ms(10_000), Some(MIN_VERIFY_INTERVAL_MS));
        assert_eq!(verify_period_ms(300_000), Some(300_000));
    }

    #[tokio::test]
    async fn test_matching_connection_receives_verify_frame() {
        let (state, presence) = test_state();
        seed_online(&presence, "c1", "Carol");
        let (conn_id, mut rx) = register(&state, "c1", "Carol");

        verification_tick(&state).await;

        assert!(state.registry.get(conn_id).is_some());
        let Message::Text(text) = rx.try_recv().unwrap() else {
            panic!("expected verify frame");
        };
        let frame: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(frame["type"], "server.verify");
        assert_eq!(frame["uuid"], "c1");
        assert!(frame["lastSeen"].as_u64().unwrap() > 0);
    }

    #[tokio::test]
    async fn test_missing_record_evicts_with_d1_offline() {
        let (state, _) = test_state();
        let (conn_id, mut rx) = register(&state, "ghost", "Ghost");

        verification_tick(&state).await;

        assert!(state.registry.get(conn_id).is_none());
        let (code, reason) = close_frame(&mut rx).unwrap();
        assert_eq!(code, CLOSE_VERIFICATION_FAILED);
        assert_eq!(reason, "verification_d1_offline");
    }

    #[tokio::test]
    async fn test_identity_mismatch_evicts_with_4403() {
        let (state, presence) = test_state();
        seed_online(&presence, "c1", "Carolyn");
        let (conn_id, mut rx) = register(&state, "c1", "Carol");

        verification_tick(&state).await;

        assert!(state.registry.get(conn_id).is_none());
        let (code, reason) = close_frame(&mut rx).unwrap();
        assert_eq!(code, CLOSE_VERIFICATION_FAILED);
        assert_eq!(reason, "verification_identity_mismatch");
    }

    #[tokio::test]
    async fn test_closed_socket_evicted_during_verification() {
        let (state, presence) = test_state();
        seed_online(&presence, "c1", "Carol");
        let (conn_id, rx) = register(&state, "c1", "Carol");
        drop(rx);

        verification_tick(&state).await;

        assert!(state.registry.get(conn_id).is_none());
    }

    #[tokio::test]
    async fn test_empty_store_clears_registry() {
        let (state, _) = test_state();
        let (a, _rx_a) = register(&state, "u1", "One");
        let (b, _rx_b) = register(&state, "u2", "Two");

        verification_tick(&state).await;

        assert!(state.registry.get(a).is_none());
        assert!(state.registry.get(b).is_none());
        assert!(state.registry.is_empty());
    }

    /// Store that fails every operation; the sweep must skip the tick.
    struct DownPresence;

    #[async_trait]
    impl PresenceClient for DownPresence {
        async fn mark_online(
            &self,
            _: &PresenceUpsert,
            _: Option<&[Role]>,
        ) -> Result<(), PresenceError> {
            Err(PresenceError::Transport("down".into()))
        }
        async fn mark_offline(&self, _: &str) -> Result<(), PresenceError> {
            Err(PresenceError::Transport("down".into()))
        }
        async fn update_last_seen(&self, _: &str) -> Result<(), PresenceError> {
            Err(PresenceError::Transport("down".into()))
        }
        async fn update_roles(&self, _: &str, _: &[Role]) -> Result<(), PresenceError> {
            Err(PresenceError::Transport("down".into()))
        }
        async fn fetch_roles(&self, _: &str) -> Result<Option<Vec<Role>>, PresenceError> {
            Err(PresenceError::Transport("down".into()))
        }
        async fn fetch_online_users(
            &self,
            _: usize,
        ) -> Result<Vec<crate::presence::PresenceRecord>, PresenceError> {
            Err(PresenceError::Transport("down".into()))
        }
        async fn count_online_users(&self) -> Result<u64, PresenceError> {
            Err(PresenceError::Transport("down".into()))
        }
        async fn read_health_marker(&self, _: &str) -> Result<Option<HealthMarker>, PresenceError> {
            Err(PresenceError::Transport("down".into()))
        }
        async fn write_health_marker(
            &self,
            _: &str,
            _: &HealthMarker,
        ) -> Result<(), PresenceError> {
            Err(PresenceError::Transport("down".into()))
        }
        async fn put_status_blob(&self, _: &str, _: Value) -> Result<(), PresenceError> {
            Err(PresenceError::Transport("down".into()))
        }
    }

    #[tokio::test]
    async fn test_store_failure_skips_tick() {
        let state = Arc::new(GatewayState::new(
            Config::for_testing(),
            Arc::new(DownPresence),
        ));
        let (conn_id, mut rx) = register(&state, "u1", "One");

        verification_tick(&state).await;

        // Nothing evicted, nothing sent, guard released for the next tick.
        assert!(state.registry.get(conn_id).is_some());
        assert!(rx.try_recv().is_err());
        assert!(!state.verify_running.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_admission_after_snapshot_survives_sweep() {
        let (state, presence) = test_state();
        seed_online(&presence, "late", "Late");

        // Sweep an empty registry, then admit: the admission must survive.
        verification_tick(&state).await;
        let (conn_id, _rx) = register(&state, "late", "Late");
        assert!(state.registry.get(conn_id).is_some());
    }

    #[test]
    fn test_json_frame_shape_for_verify() {
        let frame = ServerMessage::Verify {
            uuid: "c1".to_string(),
            last_seen: 7,
        };
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({"type": "server.verify", "uuid": "c1", "lastSeen": 7})
        );
    }
}
