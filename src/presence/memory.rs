//! In-process presence store.
//!
//! The default store for single-node deployments and the double used by the
//! test suites. Implements the whole [`PresenceClient`] contract over
//! parking_lot-guarded maps; nothing here suspends, but the trait keeps the
//! call sites honest about stores that do.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

use crate::protocol::{AccountType, Role};

use super::{HealthMarker, PresenceClient, PresenceError, PresenceRecord, PresenceUpsert};

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_millis() as u64
}

/// In-memory implementation of the presence contract.
#[derive(Default)]
pub struct MemoryPresence {
    users: RwLock<HashMap<String, PresenceRecord>>,
    markers: RwLock<HashMap<String, HealthMarker>>,
    blobs: RwLock<HashMap<String, Value>>,
}

impl MemoryPresence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record verbatim. Test seam for pre-populating store state.
    pub fn seed(&self, record: PresenceRecord) {
        self.users.write().insert(record.uuid.clone(), record);
    }

    /// Snapshot of a single record, if present.
    pub fn record(&self, uuid: &str) -> Option<PresenceRecord> {
        self.users.read().get(uuid).cloned()
    }

    /// Snapshot of a stored status blob, if present.
    pub fn status_blob(&self, key: &str) -> Option<Value> {
        self.blobs.read().get(key).cloned()
    }

    fn stub_record(uuid: &str) -> PresenceRecord {
        PresenceRecord {
            uuid: uuid.to_string(),
            name: "Unknown".to_string(),
            account_type: AccountType::Local,
            roles: vec![Role::DEFAULT],
            online: false,
            last_join: None,
            last_seen: None,
            last_leave: None,
            ip: None,
        }
    }
}

#[async_trait]
impl PresenceClient for MemoryPresence {
    async fn mark_online(
        &self,
        upsert: &PresenceUpsert,
        roles_to_persist: Option<&[Role]>,
    ) -> Result<(), PresenceError> {
        let now = now_ms();
        let mut users = self.users.write();
        match users.get_mut(&upsert.uuid) {
            Some(record) => {
                record.name = upsert.name.clone();
                record.account_type = upsert.account_type;
                record.online = true;
                record.last_seen = Some(now);
                record.ip = upsert.ip.clone();
                if let Some(roles) = roles_to_persist {
                    record.roles = roles.to_vec();
                }
            }
            None => {
                users.insert(
                    upsert.uuid.clone(),
                    PresenceRecord {
                        uuid: upsert.uuid.clone(),
                        name: upsert.name.clone(),
                        account_type: upsert.account_type,
                        roles: roles_to_persist
                            .map(<[Role]>::to_vec)
                            .unwrap_or_else(|| upsert.roles.clone()),
                        online: true,
                        last_join: Some(now),
                        last_seen: Some(now),
                        last_leave: None,
                        ip: upsert.ip.clone(),
                    },
                );
            }
        }
        Ok(())
    }

    async fn mark_offline(&self, uuid: &str) -> Result<(), PresenceError> {
        let now = now_ms();
        let mut users = self.users.write();
        let record = users
            .entry(uuid.to_string())
            .or_insert_with(|| Self::stub_record(uuid));
        record.online = false;
        record.last_leave = Some(now);
        Ok(())
    }

    async fn update_last_seen(&self, uuid: &str) -> Result<(), PresenceError> {
        let now = now_ms();
        let mut users = self.users.write();
        let record = users
            .entry(uuid.to_string())
            .or_insert_with(|| Self::stub_record(uuid));
        record.online = true;
        record.last_seen = Some(now);
        Ok(())
    }

    async fn update_roles(&self, uuid: &str, roles: &[Role]) -> Result<(), PresenceError> {
        let mut users = self.users.write();
        let record = users
            .entry(uuid.to_string())
            .or_insert_with(|| Self::stub_record(uuid));
        record.roles = roles.to_vec();
        Ok(())
    }

    async fn fetch_roles(&self, uuid: &str) -> Result<Option<Vec<Role>>, PresenceError> {
        let users = self.users.read();
        Ok(users
            .get(uuid)
            .map(|record| record.roles.clone())
            .filter(|roles| !roles.is_empty()))
    }

    async fn fetch_online_users(
        &self,
        limit: usize,
    ) -> Result<Vec<PresenceRecord>, PresenceError> {
        let users = self.users.read();
        let mut online: Vec<PresenceRecord> = users
            .values()
            .filter(|record| record.online)
            .cloned()
            .collect();
        online.sort_by(|a, b| b.last_seen.unwrap_or(0).cmp(&a.last_seen.unwrap_or(0)));
        online.truncate(limit);
        Ok(online)
    }

    async fn count_online_users(&self) -> Result<u64, PresenceError> {
        let users = self.users.read();
        Ok(users.values().filter(|record| record.online).count() as u64)
    }

    async fn read_health_marker(&self, env: &str) -> Result<Option<HealthMarker>, PresenceError> {
        Ok(self.markers.read().get(env).cloned())
    }

    async fn write_health_marker(
        &self,
        env: &str,
        marker: &HealthMarker,
    ) -> Result<(), PresenceError> {
        self.markers.write().insert(env.to_string(), marker.clone());
        Ok(())
    }

    async fn put_status_blob(&self, key: &str, value: Value) -> Result<(), PresenceError> {
        self.blobs.write().insert(key.to_string(), value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upsert(uuid: &str, name: &str, roles: Vec<Role>) -> PresenceUpsert {
        PresenceUpsert {
            uuid: uuid.to_string(),
            name: name.to_string(),
            account_type: AccountType::Local,
            roles,
            ip: None,
        }
    }

    #[tokio::test]
    async fn test_mark_online_first_insert_stamps_last_join() {
        let store = MemoryPresence::new();
        store
            .mark_online(&upsert("a1", "Alice", vec![Role::Member]), Some(&[Role::Member]))
            .await
            .unwrap();

        let record = store.record("a1").unwrap();
        assert!(record.online);
        assert!(record.last_join.is_some());
        assert!(record.last_seen.is_some());
        assert_eq!(record.roles, vec![Role::Member]);
    }

    #[tokio::test]
    async fn test_mark_online_without_roles_preserves_stored_roles() {
        let store = MemoryPresence::new();
        store
            .mark_online(&upsert("b1", "Bob", vec![Role::Staff]), Some(&[Role::Staff]))
            .await
            .unwrap();
        store
            .mark_online(&upsert("b1", "Bobby", vec![Role::Gold]), None)
            .await
            .unwrap();

        let record = store.record("b1").unwrap();
        assert_eq!(record.name, "Bobby");
        assert_eq!(record.roles, vec![Role::Staff], "roles must not be overwritten");
    }

    #[tokio::test]
    async fn test_mark_offline_creates_stub() {
        let store = MemoryPresence::new();
        store.mark_offline("ghost").await.unwrap();

        let record = store.record("ghost").unwrap();
        assert!(!record.online);
        assert_eq!(record.name, "Unknown");
        assert_eq!(record.roles, vec![Role::Member]);
        assert!(record.last_leave.is_some());
    }

    #[tokio::test]
    async fn test_fetch_roles_empty_is_none() {
        let store = MemoryPresence::new();
        assert!(store.fetch_roles("nobody").await.unwrap().is_none());

        store.update_roles("c1", &[]).await.unwrap();
        assert!(store.fetch_roles("c1").await.unwrap().is_none());

        store.update_roles("c1", &[Role::Diamond]).await.unwrap();
        assert_eq!(
            store.fetch_roles("c1").await.unwrap(),
            Some(vec![Role::Diamond])
        );
    }

    #[tokio::test]
    async fn test_fetch_online_users_orders_and_limits() {
        let store = MemoryPresence::new();
        for (uuid, seen) in [("u1", 100), ("u2", 300), ("u3", 200)] {
            let mut record = MemoryPresence::stub_record(uuid);
            record.online = true;
            record.last_seen = Some(seen);
            store.seed(record);
        }
        let mut offline = MemoryPresence::stub_record("u4");
        offline.last_seen = Some(400);
        store.seed(offline);

        let online = store.fetch_online_users(2).await.unwrap();
        let uuids: Vec<&str> = online.iter().map(|r| r.uuid.as_str()).collect();
        assert_eq!(uuids, vec!["u2", "u3"]);
        assert_eq!(store.count_online_users().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_health_marker_round_trip() {
        let store = MemoryPresence::new();
        assert!(store.read_health_marker("test").await.unwrap().is_none());

        let marker = HealthMarker {
            started_at_ms: 123,
            commit_hash: "abc".to_string(),
        };
        store.write_health_marker("test", &marker).await.unwrap();
        assert_eq!(store.read_health_marker("test").await.unwrap(), Some(marker));
    }
}
