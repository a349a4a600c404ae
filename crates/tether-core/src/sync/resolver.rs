//! Applies conflict strategies to the offline change log.

use std::sync::Arc;

use crate::config::EngineConfig;
use crate::db::ChangeLogRepository;
use crate::models::{ChangeType, OfflineChangeRecord, QueueOperation, RemoteRecord, Resolution};
use crate::store::{LocalStore, ResolutionWrite};
use crate::sync::strategy::StrategyRegistry;
use crate::util::now_millis;
use crate::{Error, Result};

/// What a resolution did locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionAction {
    /// Local snapshot queued for upload again (LOCAL_WINS)
    Requeued(QueueOperation),
    /// Local row overwritten or removed from the remote snapshot (REMOTE_WINS)
    AppliedRemote,
    /// Merged row written locally and queued (MERGE)
    Merged { local_fields: Vec<String> },
    /// Nothing written; waiting for a human (MANUAL)
    Parked,
}

impl ResolutionAction {
    /// Resolution persisted on the change record.
    pub const fn resolution(&self) -> Resolution {
        match self {
            Self::Requeued(_) => Resolution::LocalWins,
            Self::AppliedRemote => Resolution::RemoteWins,
            Self::Merged { .. } => Resolution::Merge,
            Self::Parked => Resolution::Manual,
        }
    }

    pub const fn is_resolved(&self) -> bool {
        !matches!(self, Self::Parked)
    }
}

/// Resolves logged conflicts through the per-entity strategy registry.
#[derive(Clone)]
pub struct ConflictResolver {
    store: LocalStore,
    strategies: StrategyRegistry,
    config: Arc<EngineConfig>,
}

impl ConflictResolver {
    pub const fn new(store: LocalStore, strategies: StrategyRegistry, config: Arc<EngineConfig>) -> Self {
        Self {
            store,
            strategies,
            config,
        }
    }

    /// Ask the registered strategy and apply its answer. A failing strategy
    /// leaves the record unresolved with `last_error` set.
    pub async fn resolve(&self, conflict: &OfflineChangeRecord) -> Result<ResolutionAction> {
        let strategy = self.strategies.strategy_for(conflict.entity_type);
        let resolution = match strategy.choose(conflict).await {
            Ok(resolution) => resolution,
            Err(error) => {
                let message = match error {
                    Error::ConflictResolution(message) => message,
                    other => other.to_string(),
                };
                let db = self.store.lock().await;
                ChangeLogRepository::new(db.connection())
                    .set_error(&conflict.id, &message)
                    .await?;
                return Err(Error::ConflictResolution(message));
            }
        };
        self.apply(conflict, resolution).await
    }

    /// Apply a decision made outside the strategy registry, e.g. by a user
    /// reviewing a parked conflict.
    pub async fn resolve_with(&self, change_id: &str, resolution: Resolution) -> Result<ResolutionAction> {
        let conflict = {
            let db = self.store.lock().await;
            ChangeLogRepository::new(db.connection())
                .get(change_id)
                .await?
                .ok_or_else(|| Error::NotFound(format!("conflict {change_id}")))?
        };
        if conflict.resolved {
            return Err(Error::InvalidInput(format!(
                "conflict {change_id} is already resolved"
            )));
        }
        self.apply(&conflict, resolution).await
    }

    async fn apply(
        &self,
        conflict: &OfflineChangeRecord,
        resolution: Resolution,
    ) -> Result<ResolutionAction> {
        let remote = RemoteRecord::from_snapshot(conflict.entity_type, &conflict.conflicting_remote)?;
        let involves_delete = conflict.change_type == ChangeType::Delete || remote.deleted;

        let (action, write) = match resolution {
            Resolution::LocalWins => {
                let operation = Self::requeue_operation(conflict);
                (ResolutionAction::Requeued(operation), ResolutionWrite::Requeue(operation))
            }
            // deletions have no fields to merge; the newer local side wins
            Resolution::Merge if involves_delete => {
                let operation = Self::requeue_operation(conflict);
                tracing::debug!(
                    "Merge of {} {} involves a delete, keeping local side",
                    conflict.entity_type,
                    conflict.entity_id
                );
                (ResolutionAction::Requeued(operation), ResolutionWrite::Requeue(operation))
            }
            Resolution::Merge => {
                let fields = self.config.merge_fields_for(conflict.entity_type);
                (
                    ResolutionAction::Merged {
                        local_fields: fields.clone(),
                    },
                    ResolutionWrite::Merge { remote, fields },
                )
            }
            Resolution::RemoteWins => (ResolutionAction::AppliedRemote, ResolutionWrite::AcceptRemote(remote)),
            Resolution::Manual => (ResolutionAction::Parked, ResolutionWrite::Park),
        };

        self.store
            .apply_resolution(conflict, action.resolution(), write, now_millis())
            .await?;

        tracing::info!(
            "{} on {} {}: {}",
            conflict.change_type.conflict_label(),
            conflict.entity_type,
            conflict.entity_id,
            action.resolution()
        );
        Ok(action)
    }

    fn requeue_operation(conflict: &OfflineChangeRecord) -> QueueOperation {
        match conflict.change_type {
            ChangeType::Delete => QueueOperation::Delete,
            ChangeType::Create | ChangeType::Update => QueueOperation::Update,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::QueueRepository;
    use crate::models::{EntityRecord, EntityType};
    use crate::sync::strategy::FixedStrategy;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Map, Value};

    fn fields(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    /// Local row newer than the remote one so the pull logs a conflict.
    async fn conflicted_store(local: Value, remote: Value) -> (LocalStore, OfflineChangeRecord) {
        let store = LocalStore::open_in_memory().await.unwrap();
        store
            .insert(&EntityRecord {
                id: "1".to_string(),
                entity_type: EntityType::Task,
                data: fields(local),
                updated_at: 300,
                is_synced: false,
                last_sync_at: None,
                is_deleted: false,
            })
            .await
            .unwrap();

        let remote = RemoteRecord {
            id: "1".to_string(),
            entity_type: EntityType::Task,
            data: fields(remote),
            updated_at: 200,
            deleted: false,
        };
        let crate::store::Reconciled::Conflict { change, .. } =
            store.reconcile_remote(&remote, 400).await.unwrap()
        else {
            panic!("expected conflict");
        };
        (store, change)
    }

    fn resolver(store: &LocalStore, registry: StrategyRegistry, merge: &[&str]) -> ConflictResolver {
        let mut config = EngineConfig::default();
        config.merge_fields.insert(
            EntityType::Task,
            merge.iter().map(|field| (*field).to_string()).collect(),
        );
        ConflictResolver::new(store.clone(), registry, Arc::new(config))
    }

    async fn queued(store: &LocalStore) -> Vec<crate::models::SyncQueueItem> {
        let db = store.lock().await;
        QueueRepository::new(db.connection()).pending().await.unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn default_strategy_applies_remote() {
        let (store, change) =
            conflicted_store(json!({"title": "A"}), json!({"title": "B"})).await;
        let resolver = resolver(&store, StrategyRegistry::new(), &["title"]);

        let action = resolver.resolve(&change).await.unwrap();
        assert_eq!(action, ResolutionAction::AppliedRemote);

        let record = store.find_by_id(EntityType::Task, "1").await.unwrap().unwrap();
        assert_eq!(record.field_str("title"), Some("B"));
        assert!(record.is_synced);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn merge_takes_allow_listed_fields_from_local() {
        let (store, change) = conflicted_store(
            json!({"title": "Local title", "status": "done"}),
            json!({"title": "Remote title", "status": "todo", "priority": 3}),
        )
        .await;
        let mut registry = StrategyRegistry::new();
        registry.register(EntityType::Task, FixedStrategy(Resolution::Merge));
        let resolver = resolver(&store, registry, &["title"]);

        let action = resolver.resolve(&change).await.unwrap();
        assert_eq!(
            action,
            ResolutionAction::Merged {
                local_fields: vec!["title".to_string()]
            }
        );

        let record = store.find_by_id(EntityType::Task, "1").await.unwrap().unwrap();
        assert_eq!(record.field_str("title"), Some("Local title"));
        assert_eq!(record.field_str("status"), Some("todo"));
        assert_eq!(record.data["priority"], json!(3));
        assert!(!record.is_synced);

        let items = queued(&store).await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].operation, QueueOperation::Update);
        assert_eq!(items[0].payload["title"], json!("Local title"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failing_strategy_leaves_conflict_open() {
        let (store, change) =
            conflicted_store(json!({"title": "A"}), json!({"title": "B"})).await;
        let mut registry = StrategyRegistry::new();
        registry.register_fn(EntityType::Task, |_| {
            Err(Error::ConflictResolution("needs a human".to_string()))
        });
        let resolver = resolver(&store, registry, &["title"]);

        let error = resolver.resolve(&change).await.unwrap_err();
        assert!(matches!(error, Error::ConflictResolution(_)));

        let db = store.lock().await;
        let logged = ChangeLogRepository::new(db.connection())
            .get(&change.id)
            .await
            .unwrap()
            .unwrap();
        assert!(!logged.resolved);
        assert_eq!(logged.last_error.as_deref(), Some("needs a human"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn resolve_with_applies_human_decision_once() {
        let (store, change) =
            conflicted_store(json!({"title": "A"}), json!({"title": "B"})).await;
        let mut registry = StrategyRegistry::new();
        registry.register(EntityType::Task, FixedStrategy(Resolution::Manual));
        let resolver = resolver(&store, registry, &["title"]);

        assert_eq!(resolver.resolve(&change).await.unwrap(), ResolutionAction::Parked);
        assert_eq!(
            store.find_by_id(EntityType::Task, "1").await.unwrap().unwrap().field_str("title"),
            Some("A")
        );

        let action = resolver
            .resolve_with(&change.id, Resolution::LocalWins)
            .await
            .unwrap();
        assert_eq!(action, ResolutionAction::Requeued(QueueOperation::Update));
        assert!(matches!(
            resolver.resolve_with(&change.id, Resolution::RemoteWins).await,
            Err(Error::InvalidInput(_))
        ));
    }
}
