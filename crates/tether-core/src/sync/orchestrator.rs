//! Runs sync cycles and exposes the host-facing write path.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use serde_json::{Map, Value};

use crate::config::EngineConfig;
use crate::db::{ChangeLogRepository, WatermarkRepository};
use crate::models::{
    new_entity_id, split_snapshot, DeadLetter, EntityRecord, EntityType, FailureOutcome,
    OfflineChangeRecord, QueueOperation, Resolution, SyncCursor, SyncQueueItem, Syncable,
};
use crate::remote::{with_timeout, RemoteApi};
use crate::state::SyncState;
use crate::store::{LocalStore, Reconciled};
use crate::sync::events::SyncEvents;
use crate::sync::puller::RemoteChangePuller;
use crate::sync::queue::SyncQueueManager;
use crate::sync::report::{ConflictSummary, SyncCycleResult, SyncIssue, SyncStatus};
use crate::sync::resolver::{ConflictResolver, ResolutionAction};
use crate::sync::strategy::StrategyRegistry;
use crate::util::now_millis;
use crate::{Error, Result};

/// Keys owned by the engine that a caller-supplied payload may not set.
const RESERVED_FIELDS: [&str; 3] = ["id", "updated_at", "deleted"];

/// Coordinates upload, download, resolution and checkpoint phases.
///
/// Cloning is cheap and clones share the same in-progress flag, so a cycle
/// started through one clone blocks the others.
#[derive(Clone)]
pub struct SyncOrchestrator {
    store: LocalStore,
    queue: SyncQueueManager,
    puller: RemoteChangePuller,
    resolver: ConflictResolver,
    remote: Arc<dyn RemoteApi>,
    config: Arc<EngineConfig>,
    events: SyncEvents,
    syncing: Arc<AtomicBool>,
}

/// Clears the in-progress flag on every exit path, unwinding included.
struct CycleGuard<'a>(&'a AtomicBool);

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Why an upload attempt stopped.
enum UploadFailure {
    /// The remote call failed; counts against the item's retry budget.
    Remote(Error),
    /// Local bookkeeping failed; the item stays queued untouched.
    Local(Error),
}

#[derive(Default)]
struct GroupOutcome {
    synced: usize,
    failed: usize,
    dead_lettered: usize,
    issues: Vec<SyncIssue>,
}

impl SyncOrchestrator {
    /// Build an orchestrator that resolves every conflict as `RemoteWins`
    /// unless strategies are registered.
    pub fn new(store: LocalStore, remote: Arc<dyn RemoteApi>, config: EngineConfig) -> Result<Self> {
        Self::with_strategies(store, remote, config, StrategyRegistry::new())
    }

    /// Build an orchestrator with per-type conflict strategies.
    pub fn with_strategies(
        store: LocalStore,
        remote: Arc<dyn RemoteApi>,
        config: EngineConfig,
        strategies: StrategyRegistry,
    ) -> Result<Self> {
        let config = Arc::new(config.validate()?);
        Ok(Self {
            queue: SyncQueueManager::new(store.clone(), config.max_retries),
            puller: RemoteChangePuller::new(Arc::clone(&remote), config.call_timeout()),
            resolver: ConflictResolver::new(store.clone(), strategies, Arc::clone(&config)),
            store,
            remote,
            config,
            events: SyncEvents::new(),
            syncing: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Validated engine configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Local store shared with the queue and resolver
    pub const fn store(&self) -> &LocalStore {
        &self.store
    }

    /// Upload queue
    pub const fn queue(&self) -> &SyncQueueManager {
        &self.queue
    }

    /// Listener registry notified after every cycle
    pub const fn events(&self) -> &SyncEvents {
        &self.events
    }

    /// Whether a cycle is running on this instance or one of its clones
    pub fn state(&self) -> SyncState {
        if self.syncing.load(Ordering::Acquire) {
            SyncState::Syncing
        } else {
            SyncState::Idle
        }
    }

    fn try_start(&self) -> Result<CycleGuard<'_>> {
        self.syncing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| Error::SyncAlreadyInProgress)?;
        Ok(CycleGuard(&self.syncing))
    }

    /// Run one full cycle. Only fails when another cycle is already running;
    /// every other problem is reported in the returned result.
    pub async fn sync(&self) -> Result<SyncCycleResult> {
        let guard = self.try_start()?;
        let mut result = SyncCycleResult {
            started_at: now_millis(),
            ..SyncCycleResult::default()
        };
        tracing::info!("Sync cycle started");

        self.upload_phase(&mut result).await;
        let advance_to = self.download_and_resolve(&mut result).await;
        self.checkpoint(advance_to, &mut result).await;
        match self.open_conflict_count().await {
            Ok(open) => result.unresolved_conflicts = open,
            Err(error) => {
                tracing::warn!("Could not count open conflicts: {error}");
                result.errors.push(SyncIssue::cycle(format!("conflict count unavailable: {error}")));
            }
        }

        result.finished_at = now_millis();
        result.success = result.errors.is_empty();
        tracing::info!(
            "Sync cycle finished in {} ms: {} uploaded, {} failed, {} dead-lettered, {} pulled, {} conflict(s), {} open, {} error(s)",
            result.finished_at - result.started_at,
            result.synced_items,
            result.failed_items,
            result.dead_lettered,
            result.pulled_records,
            result.conflicts.len(),
            result.unresolved_conflicts,
            result.errors.len()
        );

        // listeners observe an idle engine and may start the next cycle
        drop(guard);
        self.events.emit(&result);
        Ok(result)
    }

    // ------------------------------------------------------------------
    // Upload
    // ------------------------------------------------------------------

    async fn upload_phase(&self, result: &mut SyncCycleResult) {
        if let Err(error) = self.queue.recover_stalled().await {
            tracing::error!("Could not recover stalled queue items: {error}");
            result.errors.push(SyncIssue::cycle(format!("upload skipped: {error}")));
            return;
        }

        let (items, blocked) = match self.upload_candidates().await {
            Ok(candidates) => candidates,
            Err(error) => {
                tracing::error!("Could not read the sync queue: {error}");
                result.errors.push(SyncIssue::cycle(format!("upload skipped: {error}")));
                return;
            }
        };

        let groups = group_by_entity(items, &blocked);
        if groups.is_empty() {
            return;
        }
        tracing::debug!("Uploading queue items for {} entities", groups.len());

        let outcomes = join_all(groups.into_iter().map(|group| self.upload_group(group))).await;
        for outcome in outcomes {
            result.synced_items += outcome.synced;
            result.failed_items += outcome.failed;
            result.dead_lettered += outcome.dead_lettered;
            result.errors.extend(outcome.issues);
        }
    }

    /// Pending items plus the entities whose uploads wait on an open conflict.
    async fn upload_candidates(&self) -> Result<(Vec<SyncQueueItem>, HashSet<(EntityType, String)>)> {
        let items = self.queue.pending_items().await?;
        let db = self.store.lock().await;
        let blocked = ChangeLogRepository::new(db.connection())
            .open_entities()
            .await?
            .into_iter()
            .collect();
        Ok((items, blocked))
    }

    /// Upload one entity's items in order, stopping at the first failure.
    async fn upload_group(&self, items: Vec<SyncQueueItem>) -> GroupOutcome {
        let mut outcome = GroupOutcome::default();
        for item in items {
            let error = match self.upload_item(&item).await {
                Ok(()) => {
                    outcome.synced += 1;
                    continue;
                }
                Err(UploadFailure::Remote(error)) => error,
                Err(UploadFailure::Local(error)) => {
                    // SYNCING items are reset by `recover_stalled` next cycle
                    tracing::error!(
                        "Local bookkeeping for queue item {} failed, leaving it queued: {error}",
                        item.id
                    );
                    outcome.failed += 1;
                    outcome.issues.push(SyncIssue::entity(
                        item.entity_type,
                        &item.entity_id,
                        format!("{} not recorded locally: {error}", item.operation),
                    ));
                    break;
                }
            };

            outcome.issues.push(SyncIssue::entity(
                item.entity_type,
                &item.entity_id,
                format!("{} failed: {error}", item.operation),
            ));
            match self.queue.mark_failed(&item.id, &error).await {
                Ok(FailureOutcome::WillRetry { .. }) => outcome.failed += 1,
                Ok(FailureOutcome::DeadLettered(_)) => outcome.dead_lettered += 1,
                Err(bookkeeping) => {
                    tracing::error!("Could not record failure of queue item {}: {bookkeeping}", item.id);
                    outcome.failed += 1;
                    outcome.issues.push(SyncIssue::entity(
                        item.entity_type,
                        &item.entity_id,
                        bookkeeping.to_string(),
                    ));
                }
            }
            break;
        }
        outcome
    }

    async fn upload_item(&self, item: &SyncQueueItem) -> std::result::Result<(), UploadFailure> {
        self.queue
            .mark_syncing(&item.id)
            .await
            .map_err(UploadFailure::Local)?;
        tracing::debug!(
            "Uploading {} {} {} ({})",
            item.operation,
            item.entity_type,
            item.entity_id,
            item.id
        );

        let call = async {
            match item.operation {
                QueueOperation::Create => {
                    let (_, _, _, data) = split_snapshot(&item.payload)?;
                    self.remote
                        .create_entity(item.entity_type, &item.entity_id, &data, &item.id)
                        .await
                        .map(drop)
                }
                QueueOperation::Update => {
                    let (_, _, _, patch) = split_snapshot(&item.payload)?;
                    self.remote
                        .update_entity(item.entity_type, &item.entity_id, &patch, &item.id)
                        .await
                        .map(drop)
                }
                QueueOperation::Delete => {
                    self.remote
                        .delete_entity(item.entity_type, &item.entity_id, &item.id)
                        .await
                }
            }
        };
        with_timeout(self.config.call_timeout(), call)
            .await
            .map_err(UploadFailure::Remote)?;

        self.queue
            .mark_completed(&item.id)
            .await
            .map_err(UploadFailure::Local)
    }

    // ------------------------------------------------------------------
    // Download + resolution
    // ------------------------------------------------------------------

    /// Returns the cursor to store, or `None` when the watermark must not move.
    async fn download_and_resolve(&self, result: &mut SyncCycleResult) -> Option<SyncCursor> {
        let cursor = {
            let db = self.store.lock().await;
            WatermarkRepository::new(db.connection())
                .cursor(&self.config.workspace_id)
                .await
        };
        let cursor = match cursor {
            Ok(cursor) => cursor,
            Err(error) => {
                tracing::error!("Could not read sync watermark: {error}");
                result.errors.push(SyncIssue::cycle(format!("download skipped: {error}")));
                return None;
            }
        };
        result.watermark = cursor.as_ref().map(|cursor| cursor.watermark_ms);
        let cursor = cursor.unwrap_or_default();

        let mut records = match self
            .puller
            .pull_all(&self.config.tracked_entities, cursor.watermark_ms)
            .await
        {
            Ok(records) => records,
            Err(error) => {
                tracing::error!("Download phase aborted: {error}");
                result.errors.push(SyncIssue::cycle(format!("download failed: {error}")));
                return None;
            }
        };
        // the pull includes the watermark instant; skip what was applied there
        records.retain(|record| !cursor.covers(record));
        records.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
        result.pulled_records = records.len();

        let mut persisted_all = true;
        for record in &records {
            match self.store.reconcile_remote(record, now_millis()).await {
                Ok(Reconciled::Conflict { change, is_new }) => {
                    tracing::debug!(
                        "{} {} on {} {}",
                        change.change_type.conflict_label(),
                        if is_new { "detected" } else { "refreshed" },
                        change.entity_type,
                        change.entity_id
                    );
                }
                Ok(applied) => {
                    tracing::debug!("Applied remote {} {}: {applied:?}", record.entity_type, record.id);
                }
                Err(error) => {
                    persisted_all = false;
                    result.errors.push(SyncIssue::entity(
                        record.entity_type,
                        &record.id,
                        format!("could not apply remote change: {error}"),
                    ));
                }
            }
        }

        if let Err(error) = self.resolution_phase(result).await {
            tracing::error!("Resolution phase aborted: {error}");
            result.errors.push(SyncIssue::cycle(format!("resolution failed: {error}")));
            return None;
        }

        if !persisted_all || records.is_empty() {
            return None;
        }
        Some(cursor.advanced(&records))
    }

    /// Every open conflict is offered to the resolver and reported, parked
    /// ones included.
    async fn resolution_phase(&self, result: &mut SyncCycleResult) -> Result<()> {
        let unresolved = {
            let db = self.store.lock().await;
            ChangeLogRepository::new(db.connection()).unresolved().await?
        };

        for conflict in unresolved {
            match self.resolver.resolve(&conflict).await {
                Ok(action) => result.conflicts.push(summarize(&conflict, Some(&action))),
                Err(error) => {
                    tracing::warn!(
                        "Could not resolve conflict {} on {} {}: {error}",
                        conflict.id,
                        conflict.entity_type,
                        conflict.entity_id
                    );
                    result.errors.push(SyncIssue::entity(
                        conflict.entity_type,
                        &conflict.entity_id,
                        error.to_string(),
                    ));
                    result.conflicts.push(summarize(&conflict, None));
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Checkpoint
    // ------------------------------------------------------------------

    async fn checkpoint(&self, advance_to: Option<SyncCursor>, result: &mut SyncCycleResult) {
        let now = now_millis();
        if let Some(cursor) = advance_to {
            let advanced = {
                let db = self.store.lock().await;
                WatermarkRepository::new(db.connection())
                    .advance(&self.config.workspace_id, &cursor, now)
                    .await
            };
            match advanced {
                Ok(watermark) => result.watermark = Some(watermark),
                Err(error) => {
                    tracing::error!("Could not advance sync watermark: {error}");
                    result.errors.push(SyncIssue::cycle(format!("watermark not advanced: {error}")));
                }
            }
        }

        let cutoff = now - self.config.retention_millis();
        if let Err(error) = self.purge(cutoff).await {
            tracing::warn!("Checkpoint cleanup failed: {error}");
            result.errors.push(SyncIssue::cycle(format!("cleanup failed: {error}")));
        }
    }

    async fn open_conflict_count(&self) -> Result<usize> {
        let db = self.store.lock().await;
        let open = ChangeLogRepository::new(db.connection()).count_open().await?;
        Ok(usize::try_from(open).unwrap_or_default())
    }

    async fn purge(&self, cutoff: i64) -> Result<()> {
        let completed = self.queue.purge_completed().await?;
        let letters = self.queue.purge_dead_letters_before(cutoff).await?;
        let resolved = {
            let db = self.store.lock().await;
            ChangeLogRepository::new(db.connection())
                .purge_resolved_before(cutoff)
                .await?
        };
        if completed + letters + resolved > 0 {
            tracing::debug!(
                "Purged {completed} completed item(s), {letters} dead letter(s), {resolved} resolved conflict(s)"
            );
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Host write path and queries
    // ------------------------------------------------------------------

    /// Create an entity locally and queue its upload. An `id` field in `data`
    /// is used as the entity id, otherwise a new one is generated.
    pub async fn create(&self, entity_type: EntityType, mut data: Map<String, Value>) -> Result<EntityRecord> {
        let id = match data.remove("id") {
            Some(Value::String(id)) if !id.trim().is_empty() => id,
            Some(other) if !other.is_null() => {
                return Err(Error::InvalidInput(format!(
                    "{entity_type} id must be a non-empty string"
                )));
            }
            _ => new_entity_id(),
        };
        strip_reserved(&mut data);

        let record = EntityRecord::new(entity_type, id, data);
        self.store.insert_and_enqueue(&record).await?;
        tracing::debug!("Created {entity_type} {}", record.id);
        Ok(record)
    }

    /// Create a strongly typed entity locally and queue its upload.
    pub async fn create_typed<T: Syncable>(&self, entity: &T) -> Result<EntityRecord> {
        let record = EntityRecord::new(T::ENTITY_TYPE, entity.id(), entity.to_fields()?);
        self.store.insert_and_enqueue(&record).await?;
        Ok(record)
    }

    /// Patch an entity locally and queue the change. Returns `None` if it does not exist.
    pub async fn update(
        &self,
        entity_type: EntityType,
        id: &str,
        mut patch: Map<String, Value>,
    ) -> Result<Option<EntityRecord>> {
        strip_reserved(&mut patch);
        Ok(self
            .store
            .update_and_enqueue(entity_type, id, &patch)
            .await?
            .map(|(record, _)| record))
    }

    /// Delete an entity locally and queue the delete. Returns whether it existed.
    pub async fn delete(&self, entity_type: EntityType, id: &str) -> Result<bool> {
        Ok(self
            .store
            .delete_and_enqueue(entity_type, id)
            .await?
            .is_some())
    }

    /// Live entity by id; tombstoned rows are hidden
    pub async fn find(&self, entity_type: EntityType, id: &str) -> Result<Option<EntityRecord>> {
        self.store.find_by_id(entity_type, id).await
    }

    /// Live entity by id as its typed model
    pub async fn find_typed<T: Syncable>(&self, id: &str) -> Result<Option<T>> {
        self.store
            .find_by_id(T::ENTITY_TYPE, id)
            .await?
            .map(|record| T::from_record(&record))
            .transpose()
    }

    /// Every live entity of one type
    pub async fn list(&self, entity_type: EntityType) -> Result<Vec<EntityRecord>> {
        self.store.find_all(entity_type).await
    }

    /// Queue, conflict and watermark counters for hosts
    pub async fn status(&self) -> Result<SyncStatus> {
        let pending_items = self.queue.pending_count().await?;
        let dead_letters = self.queue.dead_letter_count().await?;
        let (open_conflicts, watermark) = {
            let db = self.store.lock().await;
            let open = ChangeLogRepository::new(db.connection()).count_open().await?;
            let watermark = WatermarkRepository::new(db.connection())
                .get(&self.config.workspace_id)
                .await?;
            (open, watermark)
        };
        Ok(SyncStatus {
            state: self.state(),
            pending_items,
            open_conflicts,
            dead_letters,
            watermark,
        })
    }

    /// Recent conflicts, newest first.
    pub async fn conflicts(&self, include_resolved: bool, limit: usize) -> Result<Vec<OfflineChangeRecord>> {
        let db = self.store.lock().await;
        ChangeLogRepository::new(db.connection())
            .list(include_resolved, limit)
            .await
    }

    /// Most recent dead letters first
    pub async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        self.queue.dead_letters(limit).await
    }

    /// Put a dead-lettered mutation back on the queue
    pub async fn requeue_dead_letter(&self, id: &str) -> Result<SyncQueueItem> {
        self.queue.requeue_dead_letter(id).await
    }

    /// Apply a human decision to an open conflict.
    pub async fn resolve_conflict(&self, change_id: &str, resolution: Resolution) -> Result<ResolutionAction> {
        self.resolver.resolve_with(change_id, resolution).await
    }
}

/// Group items per entity, preserving enqueue order inside each group.
/// Entities in `blocked` are left queued.
fn group_by_entity(
    items: Vec<SyncQueueItem>,
    blocked: &HashSet<(EntityType, String)>,
) -> Vec<Vec<SyncQueueItem>> {
    let mut index: HashMap<(EntityType, String), usize> = HashMap::new();
    let mut groups: Vec<Vec<SyncQueueItem>> = Vec::new();

    for item in items {
        let key = (item.entity_type, item.entity_id.clone());
        if blocked.contains(&key) {
            tracing::debug!(
                "Holding {} for {} {} until its conflict is resolved",
                item.operation,
                item.entity_type,
                item.entity_id
            );
            continue;
        }
        match index.get(&key) {
            Some(position) => groups[*position].push(item),
            None => {
                index.insert(key, groups.len());
                groups.push(vec![item]);
            }
        }
    }

    for group in &mut groups {
        group.sort_by_key(|item| item.seq);
    }
    groups
}

fn strip_reserved(fields: &mut Map<String, Value>) {
    for key in RESERVED_FIELDS {
        fields.remove(key);
    }
}

fn summarize(conflict: &OfflineChangeRecord, action: Option<&ResolutionAction>) -> ConflictSummary {
    let mut summary = ConflictSummary::from_record(conflict);
    if let Some(action) = action {
        summary.resolution = Some(action.resolution());
        summary.resolved = action.is_resolved();
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::QueueStatus;
    use crate::remote::InMemoryRemote;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn item(entity_id: &str, seq: i64) -> SyncQueueItem {
        SyncQueueItem {
            id: format!("q-{seq}"),
            seq,
            entity_type: EntityType::Task,
            entity_id: entity_id.to_string(),
            operation: QueueOperation::Update,
            payload: json!({"id": entity_id}),
            enqueued_at: 0,
            retry_count: 0,
            status: QueueStatus::Pending,
            last_error: None,
            completed_at: None,
        }
    }

    async fn orchestrator() -> (SyncOrchestrator, Arc<InMemoryRemote>) {
        let store = LocalStore::open_in_memory().await.unwrap();
        let remote = Arc::new(InMemoryRemote::new());
        let orchestrator =
            SyncOrchestrator::new(store, remote.clone(), EngineConfig::default()).unwrap();
        (orchestrator, remote)
    }

    #[test]
    fn grouping_keeps_per_entity_order_and_skips_blocked() {
        let blocked = HashSet::from([(EntityType::Task, "c".to_string())]);
        let groups = group_by_entity(
            vec![item("a", 3), item("b", 2), item("a", 1), item("c", 4)],
            &blocked,
        );

        let seqs = groups
            .iter()
            .map(|group| group.iter().map(|item| item.seq).collect::<Vec<_>>())
            .collect::<Vec<_>>();
        assert_eq!(seqs, vec![vec![1, 3], vec![2]]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn second_start_is_rejected_while_syncing() {
        let (orchestrator, _remote) = orchestrator().await;

        let guard = orchestrator.try_start().unwrap();
        assert_eq!(orchestrator.state(), SyncState::Syncing);
        assert!(matches!(
            orchestrator.sync().await,
            Err(Error::SyncAlreadyInProgress)
        ));

        drop(guard);
        assert_eq!(orchestrator.state(), SyncState::Idle);
        assert!(orchestrator.sync().await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn create_uses_supplied_id_and_strips_reserved_fields() {
        let (orchestrator, _remote) = orchestrator().await;

        let record = orchestrator
            .create(
                EntityType::Task,
                json!({"id": "t-1", "title": "A", "updated_at": 5, "deleted": true})
                    .as_object()
                    .cloned()
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(record.id, "t-1");
        assert_eq!(record.data, json!({"title": "A"}).as_object().cloned().unwrap());

        let error = orchestrator
            .create(EntityType::Task, json!({"id": 7}).as_object().cloned().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(error, Error::InvalidInput(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn typed_writes_round_trip() {
        let (orchestrator, _remote) = orchestrator().await;
        let task = crate::models::Task::new("Typed");

        orchestrator.create_typed(&task).await.unwrap();
        let loaded = orchestrator
            .find_typed::<crate::models::Task>(&task.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded, task);
        assert_eq!(orchestrator.status().await.unwrap().pending_items, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn upload_failure_stops_only_that_entity() {
        let (orchestrator, remote) = orchestrator().await;
        let first = orchestrator
            .create(EntityType::Task, json!({"title": "A"}).as_object().cloned().unwrap())
            .await
            .unwrap();
        orchestrator
            .update(EntityType::Task, &first.id, json!({"title": "A2"}).as_object().cloned().unwrap())
            .await
            .unwrap();

        remote
            .fail_mutations([Error::TransientNetwork("flaky".to_string())])
            .await;
        let result = orchestrator.sync().await.unwrap();

        // CREATE failed, so the UPDATE behind it waits for the next cycle
        assert_eq!(result.synced_items, 0);
        assert_eq!(result.failed_items, 1);
        assert!(!result.success);
        assert_eq!(result.errors[0].entity_id.as_deref(), Some(first.id.as_str()));
        assert_eq!(orchestrator.status().await.unwrap().pending_items, 2);

        let retry = orchestrator.sync().await.unwrap();
        assert_eq!(retry.synced_items, 2);
        assert!(retry.success);
        let stored = remote.record(EntityType::Task, &first.id).await.unwrap();
        assert_eq!(stored.data["title"], json!("A2"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn local_bookkeeping_failure_keeps_item_queued() {
        let (orchestrator, remote) = orchestrator().await;
        let task = orchestrator
            .create(EntityType::Task, json!({"title": "A"}).as_object().cloned().unwrap())
            .await
            .unwrap();
        let item_id = orchestrator.queue().pending_items().await.unwrap()[0].id.clone();

        {
            let db = orchestrator.store().lock().await;
            db.connection()
                .execute(
                    "CREATE TRIGGER refuse_completion BEFORE UPDATE OF status ON sync_queue
                     WHEN NEW.status = 'COMPLETED'
                     BEGIN SELECT RAISE(ABORT, 'disk I/O error'); END",
                    (),
                )
                .await
                .unwrap();
        }

        // the server applied the create but the client could not record it
        let result = orchestrator.sync().await.unwrap();
        assert_eq!(result.synced_items, 0);
        assert_eq!(result.failed_items, 1);
        assert_eq!(result.dead_lettered, 0);
        assert!(result.errors[0].message.contains("not recorded locally"));
        assert!(remote.record(EntityType::Task, &task.id).await.is_some());

        let item = orchestrator.queue().get(&item_id).await.unwrap().unwrap();
        assert_eq!(item.status, QueueStatus::Syncing);
        assert_eq!(item.retry_count, 0);
        assert!(orchestrator.dead_letters(10).await.unwrap().is_empty());

        {
            let db = orchestrator.store().lock().await;
            db.connection()
                .execute("DROP TRIGGER refuse_completion", ())
                .await
                .unwrap();
        }

        let retry = orchestrator.sync().await.unwrap();
        assert!(retry.success, "{:?}", retry.errors);
        assert_eq!(retry.synced_items, 1);
        assert_eq!(remote.records(EntityType::Task).await.len(), 1);
        assert_eq!(orchestrator.status().await.unwrap().pending_items, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn fatal_download_keeps_upload_progress() {
        let (orchestrator, remote) = orchestrator().await;
        orchestrator
            .create(EntityType::Task, json!({"title": "A"}).as_object().cloned().unwrap())
            .await
            .unwrap();
        remote
            .fail_listings([Error::TransientNetwork("reset".to_string())])
            .await;

        let result = orchestrator.sync().await.unwrap();
        assert_eq!(result.synced_items, 1);
        assert!(!result.success);
        assert_eq!(result.watermark, None);
        assert_eq!(orchestrator.status().await.unwrap().watermark, None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn hung_remote_call_does_not_wedge_the_guard() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let remote = Arc::new(InMemoryRemote::new());
        let config = EngineConfig {
            call_timeout_ms: 20,
            ..EngineConfig::default()
        };
        let orchestrator = SyncOrchestrator::new(store, remote.clone(), config).unwrap();
        orchestrator
            .create(EntityType::Task, json!({"title": "A"}).as_object().cloned().unwrap())
            .await
            .unwrap();

        remote.set_latency(Some(std::time::Duration::from_millis(300))).await;
        let result = orchestrator.sync().await.unwrap();
        assert_eq!(result.failed_items, 1);
        assert!(result.errors[0].message.contains("timed out"));
        assert_eq!(orchestrator.state(), SyncState::Idle);
    }
}
