//! Sync queue and dead-letter persistence

use crate::error::Result;
use crate::models::{DeadLetter, EntityType, QueueOperation, QueueStatus, SyncQueueItem};
use libsql::{params, Connection, Row};
use serde_json::Value;
use uuid::Uuid;

const QUEUE_COLUMNS: &str = "id, seq, entity_type, entity_id, operation, payload, enqueued_at,
    retry_count, status, last_error, completed_at";

const DEAD_LETTER_COLUMNS: &str = "id, queue_item_id, entity_type, entity_id, operation, payload,
    retry_count, last_error, failed_at";

/// Repository over `sync_queue` and `sync_dead_letters`
pub struct QueueRepository<'a> {
    conn: &'a Connection,
}

impl<'a> QueueRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Append a PENDING item and return it with its assigned sequence
    pub async fn enqueue(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        operation: QueueOperation,
        payload: Value,
        enqueued_at: i64,
    ) -> Result<SyncQueueItem> {
        let id = Uuid::now_v7().to_string();
        self.conn
            .execute(
                "INSERT INTO sync_queue (id, entity_type, entity_id, operation, payload, enqueued_at, status)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
                params![
                    id.as_str(),
                    entity_type.as_str(),
                    entity_id,
                    operation.as_str(),
                    serde_json::to_string(&payload)?,
                    enqueued_at,
                    QueueStatus::Pending.as_str()
                ],
            )
            .await?;

        Ok(SyncQueueItem {
            id,
            seq: self.conn.last_insert_rowid(),
            entity_type,
            entity_id: entity_id.to_string(),
            operation,
            payload,
            enqueued_at,
            retry_count: 0,
            status: QueueStatus::Pending,
            last_error: None,
            completed_at: None,
        })
    }

    /// Items awaiting upload (PENDING or FAILED), oldest first
    pub async fn pending(&self) -> Result<Vec<SyncQueueItem>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {QUEUE_COLUMNS} FROM sync_queue
                     WHERE status IN ('PENDING', 'FAILED')
                     ORDER BY enqueued_at ASC, seq ASC"
                ),
                (),
            )
            .await?;

        let mut items = Vec::new();
        while let Some(row) = rows.next().await? {
            items.push(parse_item(&row)?);
        }
        Ok(items)
    }

    /// Fetch a queue item by id
    pub async fn get(&self, id: &str) -> Result<Option<SyncQueueItem>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {QUEUE_COLUMNS} FROM sync_queue WHERE id = ?"),
                [id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(parse_item(&row)?)),
            None => Ok(None),
        }
    }

    /// Set the status of an item; returns whether the item exists
    pub async fn set_status(&self, id: &str, status: QueueStatus) -> Result<bool> {
        let affected = self
            .conn
            .execute(
                "UPDATE sync_queue SET status = ? WHERE id = ?",
                params![status.as_str(), id],
            )
            .await?;
        Ok(affected > 0)
    }

    /// Mark an item as uploaded
    pub async fn mark_completed(&self, id: &str, completed_at: i64) -> Result<bool> {
        let affected = self
            .conn
            .execute(
                "UPDATE sync_queue SET status = 'COMPLETED', completed_at = ?, last_error = NULL
                 WHERE id = ?",
                params![completed_at, id],
            )
            .await?;
        Ok(affected > 0)
    }

    /// Record a failed attempt and return the updated item
    pub async fn record_failure(&self, id: &str, error: &str) -> Result<Option<SyncQueueItem>> {
        self.conn
            .execute(
                "UPDATE sync_queue
                 SET status = 'FAILED', retry_count = retry_count + 1, last_error = ?
                 WHERE id = ?",
                params![error, id],
            )
            .await?;
        self.get(id).await
    }

    /// Delete an item from the active queue
    pub async fn remove(&self, id: &str) -> Result<bool> {
        let affected = self
            .conn
            .execute("DELETE FROM sync_queue WHERE id = ?", [id])
            .await?;
        Ok(affected > 0)
    }

    /// Number of items not yet completed for one entity
    pub async fn outstanding_for(&self, entity_type: EntityType, entity_id: &str) -> Result<i64> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM sync_queue
                 WHERE entity_type = ? AND entity_id = ? AND status != 'COMPLETED'",
                params![entity_type.as_str(), entity_id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(row.get(0)?),
            None => Ok(0),
        }
    }

    /// Operation of the oldest outstanding item for one entity
    pub async fn oldest_outstanding_operation(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Option<QueueOperation>> {
        let mut rows = self
            .conn
            .query(
                "SELECT operation FROM sync_queue
                 WHERE entity_type = ? AND entity_id = ? AND status != 'COMPLETED'
                 ORDER BY enqueued_at ASC, seq ASC
                 LIMIT 1",
                params![entity_type.as_str(), entity_id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row.get::<String>(0)?.parse()?)),
            None => Ok(None),
        }
    }

    /// Drop queued (not in-flight) items for one entity; returns how many were removed
    pub async fn discard_queued_for(&self, entity_type: EntityType, entity_id: &str) -> Result<u64> {
        Ok(self
            .conn
            .execute(
                "DELETE FROM sync_queue
                 WHERE entity_type = ? AND entity_id = ? AND status IN ('PENDING', 'FAILED')",
                params![entity_type.as_str(), entity_id],
            )
            .await?)
    }

    /// Number of items not yet completed
    pub async fn count_outstanding(&self) -> Result<i64> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM sync_queue WHERE status != 'COMPLETED'",
                (),
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(row.get(0)?),
            None => Ok(0),
        }
    }

    /// Put items left in SYNCING by an interrupted cycle back to PENDING
    pub async fn reset_stalled(&self) -> Result<u64> {
        Ok(self
            .conn
            .execute(
                "UPDATE sync_queue SET status = 'PENDING' WHERE status = 'SYNCING'",
                (),
            )
            .await?)
    }

    /// Drop completed items
    pub async fn purge_completed(&self) -> Result<u64> {
        Ok(self
            .conn
            .execute("DELETE FROM sync_queue WHERE status = 'COMPLETED'", ())
            .await?)
    }

    /// Store a dead letter
    pub async fn insert_dead_letter(&self, dead_letter: &DeadLetter) -> Result<()> {
        self.conn
            .execute(
                &format!(
                    "INSERT INTO sync_dead_letters ({DEAD_LETTER_COLUMNS})
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"
                ),
                params![
                    dead_letter.id.as_str(),
                    dead_letter.queue_item_id.as_str(),
                    dead_letter.entity_type.as_str(),
                    dead_letter.entity_id.as_str(),
                    dead_letter.operation.as_str(),
                    serde_json::to_string(&dead_letter.payload)?,
                    dead_letter.retry_count,
                    dead_letter.last_error.as_str(),
                    dead_letter.failed_at
                ],
            )
            .await?;
        Ok(())
    }

    /// Most recent dead letters first
    pub async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {DEAD_LETTER_COLUMNS} FROM sync_dead_letters
                     ORDER BY failed_at DESC, id DESC
                     LIMIT ?"
                ),
                [i64::try_from(limit).unwrap_or(i64::MAX)],
            )
            .await?;

        let mut letters = Vec::new();
        while let Some(row) = rows.next().await? {
            letters.push(parse_dead_letter(&row)?);
        }
        Ok(letters)
    }

    /// Fetch a dead letter by id
    pub async fn get_dead_letter(&self, id: &str) -> Result<Option<DeadLetter>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {DEAD_LETTER_COLUMNS} FROM sync_dead_letters WHERE id = ?"),
                [id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(parse_dead_letter(&row)?)),
            None => Ok(None),
        }
    }

    /// Delete a dead letter
    pub async fn remove_dead_letter(&self, id: &str) -> Result<bool> {
        let affected = self
            .conn
            .execute("DELETE FROM sync_dead_letters WHERE id = ?", [id])
            .await?;
        Ok(affected > 0)
    }

    /// Number of stored dead letters
    pub async fn count_dead_letters(&self) -> Result<i64> {
        let mut rows = self
            .conn
            .query("SELECT COUNT(*) FROM sync_dead_letters", ())
            .await?;
        match rows.next().await? {
            Some(row) => Ok(row.get(0)?),
            None => Ok(0),
        }
    }

    /// Drop dead letters older than the cutoff
    pub async fn purge_dead_letters_before(&self, cutoff: i64) -> Result<u64> {
        Ok(self
            .conn
            .execute("DELETE FROM sync_dead_letters WHERE failed_at < ?", [cutoff])
            .await?)
    }
}

fn parse_item(row: &Row) -> Result<SyncQueueItem> {
    let entity_type: String = row.get(2)?;
    let operation: String = row.get(4)?;
    let payload: String = row.get(5)?;
    let status: String = row.get(8)?;

    Ok(SyncQueueItem {
        id: row.get(0)?,
        seq: row.get(1)?,
        entity_type: entity_type.parse()?,
        entity_id: row.get(3)?,
        operation: operation.parse()?,
        payload: serde_json::from_str(&payload)?,
        enqueued_at: row.get(6)?,
        retry_count: row.get(7)?,
        status: status.parse()?,
        last_error: row.get::<Option<String>>(9)?,
        completed_at: row.get::<Option<i64>>(10)?,
    })
}

fn parse_dead_letter(row: &Row) -> Result<DeadLetter> {
    let entity_type: String = row.get(2)?;
    let operation: String = row.get(4)?;
    let payload: String = row.get(5)?;

    Ok(DeadLetter {
        id: row.get(0)?,
        queue_item_id: row.get(1)?,
        entity_type: entity_type.parse()?,
        entity_id: row.get(3)?,
        operation: operation.parse()?,
        payload: serde_json::from_str(&payload)?,
        retry_count: row.get(6)?,
        last_error: row.get(7)?,
        failed_at: row.get(8)?,
    })
}
