//! Connection registry
//!
//! In-process mapping from socket to connection state — the source of truth
//! for who is connected to *this* instance. A socket appears here only after
//! its peer completed `auth` at least once. Reads are concurrent; writes are
//! serialized; sweeps iterate a snapshot so removal during iteration is safe.

use std::collections::HashMap;

use axum::extract::ws::{CloseFrame, Message};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::{AccountType, Role};

/// Per-socket identifier, assigned at upgrade time.
pub type ConnId = Uuid;

/// Sender half of a connection's outbound queue. Frames pushed here are
/// drained by the socket's forwarder task.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    tx: mpsc::UnboundedSender<Message>,
}

impl ConnectionHandle {
    pub fn new(tx: mpsc::UnboundedSender<Message>) -> Self {
        Self { tx }
    }

    /// Whether the socket's outbound queue is still accepting frames.
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Queue a text frame. Fails when the forwarder task has gone away.
    pub fn send_text(&self, text: String) -> Result<(), SendError> {
        self.tx.send(Message::Text(text)).map_err(|_| SendError)
    }

    /// Queue a close frame with the given code and reason.
    pub fn close(&self, code: u16, reason: &str) -> Result<(), SendError> {
        self.tx
            .send(Message::Close(Some(CloseFrame {
                code,
                reason: reason.to_string().into(),
            })))
            .map_err(|_| SendError)
    }
}

/// The socket's outbound queue is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("socket closed")]
pub struct SendError;

/// Mutable per-connection state, created on the first successful `auth`.
#[derive(Debug, Clone)]
pub struct ConnectionState {
    pub uuid: String,
    pub name: String,
    pub account_type: AccountType,
    pub roles: Vec<Role>,
    pub connected_at: u64,
    pub last_seen: u64,
    pub last_keepalive_at: u64,
    pub is_alive: bool,
    pub ip: Option<String>,
}

struct RegistryEntry {
    handle: ConnectionHandle,
    state: ConnectionState,
}

/// Concurrent socket→state map.
#[derive(Default)]
pub struct ConnectionRegistry {
    inner: RwLock<HashMap<ConnId, RegistryEntry>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite the entry for a socket.
    pub fn insert(&self, conn_id: ConnId, handle: ConnectionHandle, state: ConnectionState) {
        self.inner
            .write()
            .insert(conn_id, RegistryEntry { handle, state });
    }

    /// Remove a socket's entry. `None` when it was already gone.
    pub fn remove(&self, conn_id: ConnId) -> Option<(ConnectionHandle, ConnectionState)> {
        self.inner
            .write()
            .remove(&conn_id)
            .map(|entry| (entry.handle, entry.state))
    }

    /// Snapshot of a single connection's state.
    pub fn get(&self, conn_id: ConnId) -> Option<ConnectionState> {
        self.inner.read().get(&conn_id).map(|e| e.state.clone())
    }

    /// Mutate a connection's state in place. Returns `false` when the entry
    /// vanished — late mutations after an eviction are discarded.
    pub fn update<F>(&self, conn_id: ConnId, mutate: F) -> bool
    where
        F: FnOnce(&mut ConnectionState),
    {
        let mut inner = self.inner.write();
        match inner.get_mut(&conn_id) {
            Some(entry) => {
                mutate(&mut entry.state);
                true
            }
            None => false,
        }
    }

    /// Snapshot for sweeps and broadcasts. Entries removed concurrently are
    /// simply absent on the next lookup.
    pub fn snapshot(&self) -> Vec<(ConnId, ConnectionHandle, ConnectionState)> {
        self.inner
            .read()
            .iter()
            .map(|(conn_id, entry)| (*conn_id, entry.handle.clone(), entry.state.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Number of distinct uuids across all sockets (multi-device dedup).
    pub fn unique_user_count(&self) -> usize {
        let inner = self.inner.read();
        let mut seen: Vec<&str> = inner.values().map(|e| e.state.uuid.as_str()).collect();
        seen.sort_unstable();
        seen.dedup();
        seen.len()
    }

    /// Deduplicated projection grouped by uuid, keeping the entry with the
    /// highest `last_seen`. Fallback source for the connected-users listing
    /// when the store is unreachable.
    pub fn online_projection(&self) -> Vec<ConnectionState> {
        let inner = self.inner.read();
        let mut by_uuid: HashMap<&str, &ConnectionState> = HashMap::new();
        for entry in inner.values() {
            let state = &entry.state;
            match by_uuid.get(state.uuid.as_str()) {
                Some(existing) if existing.last_seen >= state.last_seen => {}
                _ => {
                    by_uuid.insert(state.uuid.as_str(), state);
                }
            }
        }
        let mut users: Vec<ConnectionState> = by_uuid.into_values().cloned().collect();
        users.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        users
    }
}
