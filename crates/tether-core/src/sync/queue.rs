//! Outgoing mutation queue.

use serde_json::Value;

use crate::db::QueueRepository;
use crate::models::{
    DeadLetter, EntityType, FailureOutcome, QueueOperation, QueueStatus, SyncQueueItem,
};
use crate::store::{begin, finish, LocalStore};
use crate::util::now_millis;
use crate::{Error, Result};

/// Durable FIFO of local mutations awaiting upload.
///
/// Items for one entity are uploaded in enqueue order. Failed items are
/// retried on later cycles until `max_retries` attempts have failed, then
/// moved to the dead-letter table.
#[derive(Clone)]
pub struct SyncQueueManager {
    store: LocalStore,
    max_retries: u32,
}

impl SyncQueueManager {
    pub const fn new(store: LocalStore, max_retries: u32) -> Self {
        Self { store, max_retries }
    }

    pub const fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Queue a mutation. The payload must carry the entity `id`.
    pub async fn enqueue(
        &self,
        entity_type: EntityType,
        operation: QueueOperation,
        payload: Value,
    ) -> Result<String> {
        let entity_id = payload
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::InvalidInput("queue payload must include an id".into()))?;

        let db = self.store.lock().await;
        let item = QueueRepository::new(db.connection())
            .enqueue(entity_type, &entity_id, operation, payload, now_millis())
            .await?;
        tracing::debug!(
            "Queued {} for {entity_type} {entity_id} ({})",
            item.operation,
            item.id
        );
        Ok(item.id)
    }

    /// Items awaiting upload, oldest first.
    pub async fn pending_items(&self) -> Result<Vec<SyncQueueItem>> {
        let db = self.store.lock().await;
        QueueRepository::new(db.connection()).pending().await
    }

    pub async fn get(&self, id: &str) -> Result<Option<SyncQueueItem>> {
        let db = self.store.lock().await;
        QueueRepository::new(db.connection()).get(id).await
    }

    pub async fn mark_syncing(&self, id: &str) -> Result<()> {
        let db = self.store.lock().await;
        if QueueRepository::new(db.connection())
            .set_status(id, QueueStatus::Syncing)
            .await?
        {
            Ok(())
        } else {
            Err(Error::NotFound(format!("queue item {id}")))
        }
    }

    /// Record a successful upload and settle the local row.
    pub async fn mark_completed(&self, id: &str) -> Result<()> {
        let item = self
            .get(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("queue item {id}")))?;
        self.store.complete_upload(&item, now_millis()).await
    }

    /// Record a failed upload. Non-retryable errors and items that reached
    /// `max_retries` are dead-lettered.
    pub async fn mark_failed(&self, id: &str, error: &Error) -> Result<FailureOutcome> {
        let db = self.store.lock().await;
        let conn = db.connection();
        begin(conn).await?;
        let outcome: Result<_> = async {
            let queue = QueueRepository::new(conn);
            let item = queue
                .record_failure(id, &error.to_string())
                .await?
                .ok_or_else(|| Error::NotFound(format!("queue item {id}")))?;

            if error.is_retryable() && item.retry_count < i64::from(self.max_retries) {
                return Ok(FailureOutcome::WillRetry {
                    retry_count: item.retry_count,
                });
            }

            let dead_letter = DeadLetter {
                id: uuid::Uuid::now_v7().to_string(),
                queue_item_id: item.id.clone(),
                entity_type: item.entity_type,
                entity_id: item.entity_id.clone(),
                operation: item.operation,
                payload: item.payload.clone(),
                retry_count: item.retry_count,
                last_error: error.to_string(),
                failed_at: now_millis(),
            };
            queue.insert_dead_letter(&dead_letter).await?;
            queue.remove(&item.id).await?;
            Ok(FailureOutcome::DeadLettered(dead_letter))
        }
        .await;
        let outcome = finish(conn, outcome).await?;

        match &outcome {
            FailureOutcome::WillRetry { retry_count } => tracing::warn!(
                "Upload of queue item {id} failed (attempt {retry_count}/{}): {error}",
                self.max_retries
            ),
            FailureOutcome::DeadLettered(letter) => tracing::warn!(
                "Dead-lettered {} of {} {} after {} attempts: {error}",
                letter.operation,
                letter.entity_type,
                letter.entity_id,
                letter.retry_count
            ),
        }
        Ok(outcome)
    }

    /// Number of items not yet uploaded.
    pub async fn pending_count(&self) -> Result<i64> {
        let db = self.store.lock().await;
        QueueRepository::new(db.connection()).count_outstanding().await
    }

    /// Return items stranded in SYNCING by an interrupted cycle to PENDING.
    pub async fn recover_stalled(&self) -> Result<u64> {
        let db = self.store.lock().await;
        let recovered = QueueRepository::new(db.connection()).reset_stalled().await?;
        if recovered > 0 {
            tracing::info!("Recovered {recovered} stalled queue item(s)");
        }
        Ok(recovered)
    }

    pub async fn purge_completed(&self) -> Result<u64> {
        let db = self.store.lock().await;
        QueueRepository::new(db.connection()).purge_completed().await
    }

    /// Most recent dead letters first.
    pub async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        let db = self.store.lock().await;
        QueueRepository::new(db.connection())
            .dead_letters(limit)
            .await
    }

    pub async fn dead_letter_count(&self) -> Result<i64> {
        let db = self.store.lock().await;
        QueueRepository::new(db.connection())
            .count_dead_letters()
            .await
    }

    /// Put a dead-lettered mutation back on the queue with a fresh retry budget.
    pub async fn requeue_dead_letter(&self, id: &str) -> Result<SyncQueueItem> {
        let db = self.store.lock().await;
        let conn = db.connection();
        begin(conn).await?;
        let outcome: Result<_> = async {
            let queue = QueueRepository::new(conn);
            let letter = queue
                .get_dead_letter(id)
                .await?
                .ok_or_else(|| Error::NotFound(format!("dead letter {id}")))?;
            let item = queue
                .enqueue(
                    letter.entity_type,
                    &letter.entity_id,
                    letter.operation,
                    letter.payload,
                    now_millis(),
                )
                .await?;
            queue.remove_dead_letter(id).await?;
            Ok(item)
        }
        .await;
        let item = finish(conn, outcome).await?;
        tracing::info!(
            "Requeued dead letter {id} as {} {} {}",
            item.operation,
            item.entity_type,
            item.entity_id
        );
        Ok(item)
    }

    pub(crate) async fn purge_dead_letters_before(&self, cutoff: i64) -> Result<u64> {
        let db = self.store.lock().await;
        QueueRepository::new(db.connection())
            .purge_dead_letters_before(cutoff)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EntityRecord;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    async fn setup(max_retries: u32) -> (LocalStore, SyncQueueManager) {
        let store = LocalStore::open_in_memory().await.unwrap();
        let queue = SyncQueueManager::new(store.clone(), max_retries);
        (store, queue)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn enqueue_requires_entity_id() {
        let (_store, queue) = setup(5).await;
        let error = queue
            .enqueue(EntityType::Task, QueueOperation::Create, json!({"title": "x"}))
            .await
            .unwrap_err();
        assert!(matches!(error, Error::InvalidInput(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn retryable_failures_dead_letter_at_ceiling() {
        let (_store, queue) = setup(3).await;
        let id = queue
            .enqueue(EntityType::Task, QueueOperation::Update, json!({"id": "t-1"}))
            .await
            .unwrap();
        let error = Error::TransientNetwork("offline".to_string());

        for attempt in 1..3 {
            queue.mark_syncing(&id).await.unwrap();
            assert_eq!(
                queue.mark_failed(&id, &error).await.unwrap(),
                FailureOutcome::WillRetry {
                    retry_count: attempt
                }
            );
        }

        let FailureOutcome::DeadLettered(letter) = queue.mark_failed(&id, &error).await.unwrap()
        else {
            panic!("expected dead letter");
        };
        assert_eq!(letter.retry_count, 3);
        assert_eq!(letter.queue_item_id, id);
        assert!(queue.pending_items().await.unwrap().is_empty());
        assert_eq!(queue.dead_letter_count().await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn permanent_failure_dead_letters_immediately() {
        let (_store, queue) = setup(5).await;
        let id = queue
            .enqueue(EntityType::Task, QueueOperation::Create, json!({"id": "t-1"}))
            .await
            .unwrap();

        let outcome = queue
            .mark_failed(&id, &Error::ConstraintViolation("parent deleted".to_string()))
            .await
            .unwrap();
        assert!(matches!(outcome, FailureOutcome::DeadLettered(_)));
        assert_eq!(queue.pending_count().await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn requeue_dead_letter_restores_item() {
        let (_store, queue) = setup(1).await;
        let id = queue
            .enqueue(EntityType::Task, QueueOperation::Update, json!({"id": "t-1", "title": "A"}))
            .await
            .unwrap();
        let FailureOutcome::DeadLettered(letter) = queue
            .mark_failed(&id, &Error::Timeout(10))
            .await
            .unwrap()
        else {
            panic!("expected dead letter");
        };

        let item = queue.requeue_dead_letter(&letter.id).await.unwrap();
        assert_eq!(item.retry_count, 0);
        assert_eq!(item.payload["title"], json!("A"));
        assert_eq!(queue.dead_letter_count().await.unwrap(), 0);
        assert!(matches!(
            queue.requeue_dead_letter(&letter.id).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn mark_completed_marks_row_synced() {
        let (store, queue) = setup(5).await;
        let record = EntityRecord::new(
            EntityType::Task,
            "t-1",
            json!({"title": "A"}).as_object().cloned().unwrap(),
        );
        let item = store.insert_and_enqueue(&record).await.unwrap();

        queue.mark_syncing(&item.id).await.unwrap();
        queue.mark_completed(&item.id).await.unwrap();

        assert!(store
            .find_by_id(EntityType::Task, "t-1")
            .await
            .unwrap()
            .unwrap()
            .is_synced);
        assert_eq!(queue.purge_completed().await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn recover_stalled_resets_syncing_items() {
        let (_store, queue) = setup(5).await;
        let id = queue
            .enqueue(EntityType::Task, QueueOperation::Delete, json!({"id": "t-1"}))
            .await
            .unwrap();
        queue.mark_syncing(&id).await.unwrap();
        assert!(queue.pending_items().await.unwrap().is_empty());

        assert_eq!(queue.recover_stalled().await.unwrap(), 1);
        assert_eq!(queue.pending_items().await.unwrap()[0].id, id);
    }
}
