//! Presence store contract
//!
//! The gateway treats the durable presence store as an external
//! collaborator behind [`PresenceClient`]. Every call may suspend and may
//! fail; callers log failures with the uuid and operation and carry on —
//! store errors are never surfaced to a client socket.

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::protocol::{AccountType, Role};

pub use memory::MemoryPresence;

/// Default page size for [`PresenceClient::fetch_online_users`].
pub const DEFAULT_ONLINE_LIMIT: usize = 500;

/// Presence store failure. The gateway does not retry; the periodic
/// heartbeat and verification sweeps provide the natural retry.
#[derive(Debug, Error)]
pub enum PresenceError {
    #[error("presence store unreachable: {0}")]
    Transport(String),
    #[error("presence store error: {0}")]
    Store(String),
}

/// Durable per-user record owned by the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub uuid: String,
    pub name: String,
    pub account_type: AccountType,
    pub roles: Vec<Role>,
    pub online: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_join: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_leave: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
}

/// Identity written by `mark_online` when a connection authenticates.
#[derive(Debug, Clone)]
pub struct PresenceUpsert {
    pub uuid: String,
    pub name: String,
    pub account_type: AccountType,
    pub roles: Vec<Role>,
    pub ip: Option<String>,
}

/// Single-row health record keyed by environment name. First writer wins
/// per commit hash, so `started_at_ms` survives restarts of the same build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthMarker {
    pub started_at_ms: u64,
    pub commit_hash: String,
}

/// Contract over the external presence store.
#[async_trait]
pub trait PresenceClient: Send + Sync {
    /// Upsert the user record and flag it online. Stamps `last_join` on
    /// first insert and `last_seen` on every call. When `roles_to_persist`
    /// is `None`, roles already in the store are preserved.
    async fn mark_online(
        &self,
        upsert: &PresenceUpsert,
        roles_to_persist: Option<&[Role]>,
    ) -> Result<(), PresenceError>;

    /// Flag the user offline and stamp `last_leave`. Creates a stub record
    /// with default identity if none exists.
    async fn mark_offline(&self, uuid: &str) -> Result<(), PresenceError>;

    /// Stamp `last_seen` and flag the user online.
    async fn update_last_seen(&self, uuid: &str) -> Result<(), PresenceError>;

    /// Replace the stored role set.
    async fn update_roles(&self, uuid: &str, roles: &[Role]) -> Result<(), PresenceError>;

    /// Canonical role set, or `None` when the record is absent or has no
    /// roles.
    async fn fetch_roles(&self, uuid: &str) -> Result<Option<Vec<Role>>, PresenceError>;

    /// Up to `limit` online records, most recently seen first.
    async fn fetch_online_users(&self, limit: usize)
        -> Result<Vec<PresenceRecord>, PresenceError>;

    /// Number of records currently flagged online.
    async fn count_online_users(&self) -> Result<u64, PresenceError>;

    /// Read the health marker for the given environment.
    async fn read_health_marker(&self, env: &str) -> Result<Option<HealthMarker>, PresenceError>;

    /// Write the health marker for the given environment.
    async fn write_health_marker(
        &self,
        env: &str,
        marker: &HealthMarker,
    ) -> Result<(), PresenceError>;

    /// Persist an opaque status blob on the store's key-value side channel.
    async fn put_status_blob(&self, key: &str, value: Value) -> Result<(), PresenceError>;
}
