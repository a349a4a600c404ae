//! In-process [`RemoteApi`] used by tests and the CLI demo server.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use super::RemoteApi;
use crate::models::{EntityType, RemoteRecord};
use crate::util::now_millis;
use crate::{Error, Result};

/// Kind of call observed by an [`InMemoryRemote`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteCallKind {
    Create,
    Update,
    Delete,
    List,
}

/// One call in the remote's operation log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCall {
    pub kind: RemoteCallKind,
    pub entity_type: EntityType,
    pub entity_id: Option<String>,
    pub idempotency_key: Option<String>,
    /// Whether the call changed server state (replays and failures do not)
    pub applied: bool,
}

#[derive(Default)]
struct RemoteState {
    records: HashMap<(EntityType, String), RemoteRecord>,
    seen_keys: HashSet<String>,
    calls: Vec<RemoteCall>,
    clock: i64,
    offline: bool,
    mutation_failures: Vec<Error>,
    list_failures: Vec<Error>,
    latency: Option<Duration>,
}

impl RemoteState {
    /// Server clock: wall time, strictly increasing.
    fn tick(&mut self) -> i64 {
        self.clock = now_millis().max(self.clock + 1);
        self.clock
    }

    fn log(
        &mut self,
        kind: RemoteCallKind,
        entity_type: EntityType,
        entity_id: Option<&str>,
        key: Option<&str>,
        applied: bool,
    ) {
        self.calls.push(RemoteCall {
            kind,
            entity_type,
            entity_id: entity_id.map(str::to_string),
            idempotency_key: key.map(str::to_string),
            applied,
        });
    }
}

/// Thread-safe in-memory server with failure injection and an operation log.
#[derive(Default)]
pub struct InMemoryRemote {
    state: Mutex<RemoteState>,
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a record as if another device had written it. Keeps its `updated_at`.
    pub async fn seed(&self, record: RemoteRecord) {
        let mut state = self.state.lock().await;
        state.clock = state.clock.max(record.updated_at);
        state
            .records
            .insert((record.entity_type, record.id.clone()), record);
    }

    /// Edit a record server-side, stamping it with the server clock.
    pub async fn edit(&self, entity_type: EntityType, id: &str, patch: Value) -> Option<RemoteRecord> {
        let mut state = self.state.lock().await;
        let now = state.tick();
        let record = state.records.get_mut(&(entity_type, id.to_string()))?;
        if let Value::Object(patch) = patch {
            for (key, value) in patch {
                record.data.insert(key, value);
            }
        }
        record.updated_at = now;
        Some(record.clone())
    }

    /// Current server copy of a record, tombstones included.
    pub async fn record(&self, entity_type: EntityType, id: &str) -> Option<RemoteRecord> {
        self.state
            .lock()
            .await
            .records
            .get(&(entity_type, id.to_string()))
            .cloned()
    }

    /// Live records of one type.
    pub async fn records(&self, entity_type: EntityType) -> Vec<RemoteRecord> {
        let state = self.state.lock().await;
        let mut records = state
            .records
            .values()
            .filter(|record| record.entity_type == entity_type && !record.deleted)
            .cloned()
            .collect::<Vec<_>>();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    /// Every call received so far, in arrival order.
    pub async fn calls(&self) -> Vec<RemoteCall> {
        self.state.lock().await.calls.clone()
    }

    /// Make every call fail with a transient network error.
    pub async fn set_offline(&self, offline: bool) {
        self.state.lock().await.offline = offline;
    }

    /// Fail the next mutations (create/update/delete) with the given errors, in order.
    pub async fn fail_mutations(&self, errors: impl IntoIterator<Item = Error>) {
        let mut state = self.state.lock().await;
        state.mutation_failures.extend(errors);
    }

    /// Fail the next change listings with the given errors, in order.
    pub async fn fail_listings(&self, errors: impl IntoIterator<Item = Error>) {
        let mut state = self.state.lock().await;
        state.list_failures.extend(errors);
    }

    /// Delay every call, used to exercise per-call timeouts.
    pub async fn set_latency(&self, latency: Option<Duration>) {
        self.state.lock().await.latency = latency;
    }

    async fn delay(&self) {
        let latency = self.state.lock().await.latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    /// Shared path for create/update: failures, replay detection, then `apply`.
    async fn mutate<F>(
        &self,
        kind: RemoteCallKind,
        entity_type: EntityType,
        id: &str,
        key: &str,
        apply: F,
    ) -> Result<Option<RemoteRecord>>
    where
        F: FnOnce(&mut RemoteState, i64) -> Option<RemoteRecord> + Send,
    {
        self.delay().await;
        let mut state = self.state.lock().await;

        if state.offline {
            state.log(kind, entity_type, Some(id), Some(key), false);
            return Err(Error::TransientNetwork("remote unreachable".to_string()));
        }
        if !state.mutation_failures.is_empty() {
            let error = state.mutation_failures.remove(0);
            state.log(kind, entity_type, Some(id), Some(key), false);
            return Err(error);
        }

        if !state.seen_keys.insert(key.to_string()) {
            state.log(kind, entity_type, Some(id), Some(key), false);
            return Ok(state.records.get(&(entity_type, id.to_string())).cloned());
        }

        let now = state.tick();
        let record = apply(&mut *state, now);
        state.log(kind, entity_type, Some(id), Some(key), true);
        Ok(record)
    }
}

#[async_trait]
impl RemoteApi for InMemoryRemote {
    async fn create_entity(
        &self,
        entity_type: EntityType,
        id: &str,
        data: &Map<String, Value>,
        idempotency_key: &str,
    ) -> Result<Option<RemoteRecord>> {
        self.mutate(RemoteCallKind::Create, entity_type, id, idempotency_key, |state, now| {
            let record = RemoteRecord {
                id: id.to_string(),
                entity_type,
                data: data.clone(),
                updated_at: now,
                deleted: false,
            };
            state
                .records
                .insert((entity_type, id.to_string()), record.clone());
            Some(record)
        })
        .await
    }

    async fn update_entity(
        &self,
        entity_type: EntityType,
        id: &str,
        patch: &Map<String, Value>,
        idempotency_key: &str,
    ) -> Result<Option<RemoteRecord>> {
        self.mutate(RemoteCallKind::Update, entity_type, id, idempotency_key, |state, now| {
            let record = state
                .records
                .entry((entity_type, id.to_string()))
                .or_insert_with(|| RemoteRecord {
                    id: id.to_string(),
                    entity_type,
                    data: Map::new(),
                    updated_at: now,
                    deleted: false,
                });
            for (key, value) in patch {
                record.data.insert(key.clone(), value.clone());
            }
            record.deleted = false;
            record.updated_at = now;
            Some(record.clone())
        })
        .await
    }

    async fn delete_entity(
        &self,
        entity_type: EntityType,
        id: &str,
        idempotency_key: &str,
    ) -> Result<()> {
        self.mutate(RemoteCallKind::Delete, entity_type, id, idempotency_key, |state, now| {
            if let Some(record) = state.records.get_mut(&(entity_type, id.to_string())) {
                record.deleted = true;
                record.updated_at = now;
            }
            None
        })
        .await?;
        Ok(())
    }

    async fn list_changed_since(
        &self,
        entity_type: EntityType,
        since: i64,
    ) -> Result<Vec<RemoteRecord>> {
        self.delay().await;
        let mut state = self.state.lock().await;

        if state.offline {
            state.log(RemoteCallKind::List, entity_type, None, None, false);
            return Err(Error::TransientNetwork("remote unreachable".to_string()));
        }
        if !state.list_failures.is_empty() {
            let error = state.list_failures.remove(0);
            state.log(RemoteCallKind::List, entity_type, None, None, false);
            return Err(error);
        }

        let mut changed = state
            .records
            .values()
            .filter(|record| record.entity_type == entity_type && record.updated_at >= since)
            .cloned()
            .collect::<Vec<_>>();
        changed.sort_by(|a, b| a.updated_at.cmp(&b.updated_at).then_with(|| a.id.cmp(&b.id)));
        state.log(RemoteCallKind::List, entity_type, None, None, false);
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn fields(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn replayed_key_is_applied_once() {
        let remote = InMemoryRemote::new();
        let data = fields(json!({"title": "A"}));

        let first = remote
            .create_entity(EntityType::Task, "t-1", &data, "key-1")
            .await
            .unwrap();
        let replay = remote
            .create_entity(EntityType::Task, "t-1", &data, "key-1")
            .await
            .unwrap();

        assert_eq!(first, replay);
        assert_eq!(remote.records(EntityType::Task).await.len(), 1);
        let applied = remote
            .calls()
            .await
            .iter()
            .filter(|call| call.applied)
            .count();
        assert_eq!(applied, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn delete_of_missing_entity_succeeds() {
        let remote = InMemoryRemote::new();
        remote
            .delete_entity(EntityType::Task, "ghost", "key-1")
            .await
            .unwrap();
        assert!(remote.record(EntityType::Task, "ghost").await.is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn listing_starts_at_since_and_includes_tombstones() {
        let remote = InMemoryRemote::new();
        remote
            .seed(RemoteRecord {
                id: "old".to_string(),
                entity_type: EntityType::Task,
                data: Map::new(),
                updated_at: 100,
                deleted: false,
            })
            .await;
        remote
            .create_entity(EntityType::Task, "new", &Map::new(), "k1")
            .await
            .unwrap();
        remote
            .delete_entity(EntityType::Task, "new", "k2")
            .await
            .unwrap();

        let changed = remote
            .list_changed_since(EntityType::Task, 101)
            .await
            .unwrap();
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].id, "new");
        assert!(changed[0].deleted);

        let inclusive = remote
            .list_changed_since(EntityType::Task, 100)
            .await
            .unwrap();
        assert_eq!(inclusive[0].id, "old");
        assert_eq!(inclusive.len(), 2);
        assert!(remote
            .list_changed_since(EntityType::Project, 0)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn injected_failures_are_consumed_in_order() {
        let remote = InMemoryRemote::new();
        remote
            .fail_mutations([
                Error::TransientNetwork("flaky".to_string()),
                Error::ConstraintViolation("bad".to_string()),
            ])
            .await;

        let data = Map::new();
        assert!(matches!(
            remote.create_entity(EntityType::Task, "t", &data, "a").await,
            Err(Error::TransientNetwork(_))
        ));
        assert!(matches!(
            remote.create_entity(EntityType::Task, "t", &data, "b").await,
            Err(Error::ConstraintViolation(_))
        ));
        assert!(remote.create_entity(EntityType::Task, "t", &data, "c").await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn server_clock_is_strictly_increasing() {
        let remote = InMemoryRemote::new();
        let data = Map::new();
        let a = remote.create_entity(EntityType::Task, "a", &data, "1").await.unwrap().unwrap();
        let b = remote.create_entity(EntityType::Task, "b", &data, "2").await.unwrap().unwrap();
        assert!(b.updated_at > a.updated_at);
    }
}
