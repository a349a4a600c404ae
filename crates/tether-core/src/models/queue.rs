//! Sync queue and dead-letter models

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use super::entity::EntityType;
use crate::error::Error;

/// Kind of local mutation waiting to be uploaded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueOperation {
    Create,
    Update,
    Delete,
}

impl QueueOperation {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for QueueOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueOperation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATE" => Ok(Self::Create),
            "UPDATE" => Ok(Self::Update),
            "DELETE" => Ok(Self::Delete),
            other => Err(Error::Database(format!("unknown queue operation '{other}'"))),
        }
    }
}

/// Upload state of a queue item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueStatus {
    Pending,
    Syncing,
    Completed,
    Failed,
}

impl QueueStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Syncing => "SYNCING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "SYNCING" => Ok(Self::Syncing),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            other => Err(Error::Database(format!("unknown queue status '{other}'"))),
        }
    }
}

/// An outgoing mutation not yet confirmed by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncQueueItem {
    /// Queue item id, also used as the upload idempotency key
    pub id: String,
    /// Insertion sequence; breaks `enqueued_at` ties
    pub seq: i64,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub operation: QueueOperation,
    /// Entity snapshot (full record for create/update, id only for delete)
    pub payload: Value,
    /// Enqueue timestamp (Unix ms)
    pub enqueued_at: i64,
    pub retry_count: i64,
    pub status: QueueStatus,
    pub last_error: Option<String>,
    /// Set once the upload succeeded (Unix ms)
    pub completed_at: Option<i64>,
}

/// What happened to a queue item after a failed upload
#[derive(Debug, Clone, PartialEq)]
pub enum FailureOutcome {
    /// Item stays in the queue and is retried next cycle
    WillRetry { retry_count: i64 },
    /// Item left the active queue
    DeadLettered(DeadLetter),
}

/// A queue item removed after exhausting its retries or failing permanently
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: String,
    pub queue_item_id: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub operation: QueueOperation,
    pub payload: Value,
    pub retry_count: i64,
    pub last_error: String,
    /// When the item was dead-lettered (Unix ms)
    pub failed_at: i64,
}
