//! Transactional local store shared by the host application and the sync engine.
//!
//! Every public operation runs in its own transaction while holding the
//! database lock. Network calls are never made while the lock is held.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use libsql::Connection;
use serde_json::{Map, Value};
use tokio::sync::{Mutex, MutexGuard};

use crate::db::{
    ChangeLogRepository, Database, EntityRepository, LibSqlEntityRepository, QueueRepository,
};
use crate::models::{
    split_snapshot, EntityRecord, EntityType, OfflineChangeRecord, QueueOperation, RemoteRecord,
    Resolution, SyncQueueItem,
};
use crate::sync::detector::{classify, Classification, LocalState};
use crate::util::now_millis;
use crate::Result;

/// Who is writing to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOrigin {
    /// A local edit that still has to reach the server
    User,
    /// A write that brings the row in line with the server
    Reconciliation,
}

/// What the download phase did with one pulled record.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Reconciled {
    Inserted,
    Updated,
    Removed,
    /// Remote tombstone for a row this device never had
    Skipped,
    Conflict {
        change: OfflineChangeRecord,
        is_new: bool,
    },
}

/// Local side effects of a conflict resolution.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ResolutionWrite {
    /// Keep the local row and queue it for upload again
    Requeue(QueueOperation),
    /// Replace the local row with the remote snapshot
    AcceptRemote(RemoteRecord),
    /// Take `fields` from the local row on top of the remote snapshot,
    /// write the result locally and queue it
    Merge {
        remote: RemoteRecord,
        fields: Vec<String>,
    },
    /// Leave everything untouched for a human to decide
    Park,
}

/// Thread-safe handle to the local database.
#[derive(Clone)]
pub struct LocalStore {
    db: Arc<Mutex<Database>>,
    db_path: Option<PathBuf>,
}

impl LocalStore {
    /// Open a store at the given filesystem path, creating parent directories.
    pub async fn open_path(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::open(&db_path).await?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path: Some(db_path),
        })
    }

    /// Open an in-memory store (primarily for tests).
    pub async fn open_in_memory() -> Result<Self> {
        let db = Database::open_in_memory().await?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path: None,
        })
    }

    /// Location of the database file, `None` for in-memory stores.
    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, Database> {
        self.db.lock().await
    }

    /// Insert a new record. Fails with `DuplicateEntity` if the id is taken.
    pub async fn insert(&self, record: &EntityRecord) -> Result<()> {
        let db = self.db.lock().await;
        let conn = db.connection();
        begin(conn).await?;
        let outcome = LibSqlEntityRepository::new(conn).insert(record).await;
        finish(conn, outcome).await
    }

    /// Shallow-merge `patch` into a live record. Missing rows are a no-op.
    pub async fn update(
        &self,
        entity_type: EntityType,
        id: &str,
        patch: &Map<String, Value>,
        origin: WriteOrigin,
    ) -> Result<Option<EntityRecord>> {
        let db = self.db.lock().await;
        let conn = db.connection();
        begin(conn).await?;
        let outcome = update_in(conn, entity_type, id, patch, origin, now_millis()).await;
        finish(conn, outcome).await
    }

    /// Delete a record. User deletes leave a tombstone until the delete is
    /// uploaded; reconciliation deletes remove the row. Missing rows are a no-op.
    pub async fn delete(
        &self,
        entity_type: EntityType,
        id: &str,
        origin: WriteOrigin,
    ) -> Result<bool> {
        let db = self.db.lock().await;
        let conn = db.connection();
        begin(conn).await?;
        let outcome = delete_in(conn, entity_type, id, origin, now_millis()).await;
        finish(conn, outcome).await
    }

    /// Fetch a live record by id.
    pub async fn find_by_id(&self, entity_type: EntityType, id: &str) -> Result<Option<EntityRecord>> {
        let db = self.db.lock().await;
        LibSqlEntityRepository::new(db.connection())
            .get(entity_type, id, false)
            .await
    }

    /// Fetch a record by id, tombstones included.
    pub(crate) async fn find_any(
        &self,
        entity_type: EntityType,
        id: &str,
    ) -> Result<Option<EntityRecord>> {
        let db = self.db.lock().await;
        LibSqlEntityRepository::new(db.connection())
            .get(entity_type, id, true)
            .await
    }

    /// All live records of a type, most recently updated first.
    pub async fn find_all(&self, entity_type: EntityType) -> Result<Vec<EntityRecord>> {
        let db = self.db.lock().await;
        LibSqlEntityRepository::new(db.connection())
            .list(entity_type)
            .await
    }

    /// Live records of a type matching `predicate`.
    pub async fn find_where<F>(&self, entity_type: EntityType, predicate: F) -> Result<Vec<EntityRecord>>
    where
        F: Fn(&EntityRecord) -> bool,
    {
        let mut records = self.find_all(entity_type).await?;
        records.retain(|record| predicate(record));
        Ok(records)
    }

    /// Insert a record and queue its CREATE in one transaction.
    pub async fn insert_and_enqueue(&self, record: &EntityRecord) -> Result<SyncQueueItem> {
        let db = self.db.lock().await;
        let conn = db.connection();
        begin(conn).await?;
        let outcome: Result<_> = async {
            LibSqlEntityRepository::new(conn).insert(record).await?;
            QueueRepository::new(conn)
                .enqueue(
                    record.entity_type,
                    &record.id,
                    QueueOperation::Create,
                    record.snapshot(),
                    now_millis(),
                )
                .await
        }
        .await;
        finish(conn, outcome).await
    }

    /// Patch a record and queue an UPDATE in one transaction.
    /// Returns `None` when the record does not exist.
    pub async fn update_and_enqueue(
        &self,
        entity_type: EntityType,
        id: &str,
        patch: &Map<String, Value>,
    ) -> Result<Option<(EntityRecord, SyncQueueItem)>> {
        let db = self.db.lock().await;
        let conn = db.connection();
        begin(conn).await?;
        let outcome: Result<_> = async {
            let now = now_millis();
            let Some(record) = update_in(conn, entity_type, id, patch, WriteOrigin::User, now).await?
            else {
                return Ok(None);
            };
            let item = QueueRepository::new(conn)
                .enqueue(entity_type, id, QueueOperation::Update, record.snapshot(), now)
                .await?;
            Ok(Some((record, item)))
        }
        .await;
        finish(conn, outcome).await
    }

    /// Tombstone a record and queue a DELETE in one transaction.
    /// Returns `None` when the record does not exist.
    pub async fn delete_and_enqueue(
        &self,
        entity_type: EntityType,
        id: &str,
    ) -> Result<Option<SyncQueueItem>> {
        let db = self.db.lock().await;
        let conn = db.connection();
        begin(conn).await?;
        let outcome: Result<_> = async {
            let now = now_millis();
            if !delete_in(conn, entity_type, id, WriteOrigin::User, now).await? {
                return Ok(None);
            }
            let item = QueueRepository::new(conn)
                .enqueue(
                    entity_type,
                    id,
                    QueueOperation::Delete,
                    serde_json::json!({ "id": id }),
                    now,
                )
                .await?;
            Ok(Some(item))
        }
        .await;
        finish(conn, outcome).await
    }

    /// Record a successful upload. Once nothing else is outstanding for the
    /// entity the row is marked synced, or purged if it is a tombstone.
    pub(crate) async fn complete_upload(&self, item: &SyncQueueItem, now: i64) -> Result<()> {
        let db = self.db.lock().await;
        let conn = db.connection();
        begin(conn).await?;
        let outcome: Result<_> = async {
            let queue = QueueRepository::new(conn);
            queue.mark_completed(&item.id, now).await?;
            if queue.outstanding_for(item.entity_type, &item.entity_id).await? > 0 {
                return Ok(());
            }

            let entities = LibSqlEntityRepository::new(conn);
            match entities.get(item.entity_type, &item.entity_id, true).await? {
                Some(record) if record.is_deleted => {
                    entities.remove(item.entity_type, &item.entity_id).await?;
                }
                Some(_) => {
                    entities
                        .mark_synced(item.entity_type, &item.entity_id, now)
                        .await?;
                }
                None => {}
            }
            Ok(())
        }
        .await;
        finish(conn, outcome).await
    }

    /// Classify a pulled record against local state and persist the outcome:
    /// inserts and clean updates are written, conflicts are logged.
    pub(crate) async fn reconcile_remote(&self, remote: &RemoteRecord, now: i64) -> Result<Reconciled> {
        let db = self.db.lock().await;
        let conn = db.connection();
        begin(conn).await?;
        let outcome = reconcile_in(conn, remote, now).await;
        finish(conn, outcome).await
    }

    /// Apply a conflict resolution and record its outcome on the change log.
    pub(crate) async fn apply_resolution(
        &self,
        change: &OfflineChangeRecord,
        resolution: Resolution,
        write: ResolutionWrite,
        now: i64,
    ) -> Result<()> {
        let db = self.db.lock().await;
        let conn = db.connection();
        begin(conn).await?;
        let outcome = resolve_in(conn, change, resolution, write, now).await;
        finish(conn, outcome).await
    }
}

/// Start an immediate write transaction.
pub(crate) async fn begin(conn: &Connection) -> Result<()> {
    if !conn.is_autocommit() {
        // left open by a cancelled operation
        conn.execute("ROLLBACK", ()).await.ok();
    }
    conn.execute("BEGIN IMMEDIATE", ()).await?;
    Ok(())
}

/// Commit on success, roll back on failure.
pub(crate) async fn finish<T>(conn: &Connection, outcome: Result<T>) -> Result<T> {
    match outcome {
        Ok(value) => {
            if let Err(e) = conn.execute("COMMIT", ()).await {
                conn.execute("ROLLBACK", ()).await.ok();
                return Err(e.into());
            }
            Ok(value)
        }
        Err(e) => {
            conn.execute("ROLLBACK", ()).await.ok();
            Err(e)
        }
    }
}

fn synced_from_remote(remote: &RemoteRecord, now: i64) -> EntityRecord {
    EntityRecord {
        id: remote.id.clone(),
        entity_type: remote.entity_type,
        data: remote.data.clone(),
        updated_at: remote.updated_at,
        is_synced: true,
        last_sync_at: Some(now),
        is_deleted: false,
    }
}

async fn update_in(
    conn: &Connection,
    entity_type: EntityType,
    id: &str,
    patch: &Map<String, Value>,
    origin: WriteOrigin,
    now: i64,
) -> Result<Option<EntityRecord>> {
    let entities = LibSqlEntityRepository::new(conn);
    let Some(mut record) = entities.get(entity_type, id, false).await? else {
        return Ok(None);
    };

    record.apply_patch(patch);
    match origin {
        WriteOrigin::User => {
            record.is_synced = false;
            record.updated_at = now;
        }
        WriteOrigin::Reconciliation => {
            record.is_synced = true;
            record.last_sync_at = Some(now);
        }
    }
    entities.upsert(&record).await?;
    Ok(Some(record))
}

async fn delete_in(
    conn: &Connection,
    entity_type: EntityType,
    id: &str,
    origin: WriteOrigin,
    now: i64,
) -> Result<bool> {
    let entities = LibSqlEntityRepository::new(conn);
    match origin {
        WriteOrigin::Reconciliation => entities.remove(entity_type, id).await,
        WriteOrigin::User => {
            let Some(mut record) = entities.get(entity_type, id, false).await? else {
                return Ok(false);
            };
            record.is_deleted = true;
            record.is_synced = false;
            record.updated_at = now;
            entities.upsert(&record).await?;
            Ok(true)
        }
    }
}

async fn reconcile_in(conn: &Connection, remote: &RemoteRecord, now: i64) -> Result<Reconciled> {
    let entities = LibSqlEntityRepository::new(conn);
    let changes = ChangeLogRepository::new(conn);
    let open = changes.open_for(remote.entity_type, &remote.id).await?;
    let local = LocalState {
        record: entities.get(remote.entity_type, &remote.id, true).await?,
        pending_operation: QueueRepository::new(conn)
            .oldest_outstanding_operation(remote.entity_type, &remote.id)
            .await?,
        has_open_conflict: open.is_some(),
    };

    match classify(&local, remote) {
        Classification::NewInsert if remote.deleted => Ok(Reconciled::Skipped),
        Classification::NewInsert => {
            entities.upsert(&synced_from_remote(remote, now)).await?;
            Ok(Reconciled::Inserted)
        }
        Classification::CleanUpdate => {
            // a newer remote version supersedes local edits still waiting to upload
            if local.pending_operation.is_some() {
                let discarded = QueueRepository::new(conn)
                    .discard_queued_for(remote.entity_type, &remote.id)
                    .await?;
                tracing::debug!(
                    "Remote {} {} superseded {discarded} queued change(s)",
                    remote.entity_type,
                    remote.id
                );
            }
            if remote.deleted {
                entities.remove(remote.entity_type, &remote.id).await?;
                Ok(Reconciled::Removed)
            } else {
                entities.upsert(&synced_from_remote(remote, now)).await?;
                Ok(Reconciled::Updated)
            }
        }
        Classification::Conflict(change_type) => {
            let snapshot = remote.snapshot();
            if let Some(mut existing) = open {
                changes.refresh_remote(&existing.id, &snapshot).await?;
                existing.conflicting_remote = snapshot;
                return Ok(Reconciled::Conflict {
                    change: existing,
                    is_new: false,
                });
            }

            let change = OfflineChangeRecord {
                id: uuid::Uuid::now_v7().to_string(),
                entity_id: remote.id.clone(),
                entity_type: remote.entity_type,
                change_type,
                conflicting_local: local
                    .record
                    .as_ref()
                    .map_or(Value::Null, EntityRecord::snapshot),
                conflicting_remote: snapshot,
                detected_at: now,
                resolution: None,
                resolved: false,
                resolved_at: None,
                last_error: None,
            };
            changes.insert(&change).await?;
            Ok(Reconciled::Conflict {
                change,
                is_new: true,
            })
        }
    }
}

async fn resolve_in(
    conn: &Connection,
    change: &OfflineChangeRecord,
    resolution: Resolution,
    write: ResolutionWrite,
    now: i64,
) -> Result<()> {
    let entities = LibSqlEntityRepository::new(conn);
    let queue = QueueRepository::new(conn);
    let changes = ChangeLogRepository::new(conn);
    let (entity_type, entity_id) = (change.entity_type, change.entity_id.as_str());

    match write {
        ResolutionWrite::Park => {
            changes.set_outcome(&change.id, resolution, false, None).await?;
            return Ok(());
        }
        ResolutionWrite::Requeue(operation) => {
            let payload = match operation {
                QueueOperation::Delete => serde_json::json!({ "id": entity_id }),
                _ => entities
                    .get(entity_type, entity_id, true)
                    .await?
                    .map_or_else(|| change.conflicting_local.clone(), |record| record.snapshot()),
            };
            queue.discard_queued_for(entity_type, entity_id).await?;
            queue
                .enqueue(entity_type, entity_id, operation, payload, now)
                .await?;
        }
        ResolutionWrite::AcceptRemote(remote) => {
            queue.discard_queued_for(entity_type, entity_id).await?;
            if remote.deleted {
                entities.remove(entity_type, entity_id).await?;
            } else {
                entities.upsert(&synced_from_remote(&remote, now)).await?;
            }
        }
        ResolutionWrite::Merge { remote, fields } => {
            let current = entities.get(entity_type, entity_id, true).await?;
            let last_sync_at = current.as_ref().and_then(|record| record.last_sync_at);
            let local = match current {
                Some(record) => record.data,
                None => split_snapshot(&change.conflicting_local)?.3,
            };

            let mut data = remote.data;
            for field in &fields {
                if let Some(value) = local.get(field) {
                    data.insert(field.clone(), value.clone());
                }
            }
            let record = EntityRecord {
                id: entity_id.to_string(),
                entity_type,
                data,
                updated_at: now,
                is_synced: false,
                last_sync_at,
                is_deleted: false,
            };
            entities.upsert(&record).await?;
            queue.discard_queued_for(entity_type, entity_id).await?;
            queue
                .enqueue(
                    entity_type,
                    entity_id,
                    QueueOperation::Update,
                    record.snapshot(),
                    now,
                )
                .await?;
        }
    }

    changes
        .set_outcome(&change.id, resolution, true, Some(now))
        .await
}
