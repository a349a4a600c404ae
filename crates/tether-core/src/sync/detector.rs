//! Conflict detection.
//!
//! Classification compares wall-clock `updated_at` stamps from two devices, so
//! clock skew can misclassify a change. There are no vector clocks.

use crate::models::{ChangeType, EntityRecord, QueueOperation, RemoteRecord};

/// Everything the detector needs to know about the local side of an entity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocalState {
    /// Local row, tombstones included
    pub record: Option<EntityRecord>,
    /// Operation of the oldest item still queued for the entity
    pub pending_operation: Option<QueueOperation>,
    /// An unresolved change record already exists for the entity
    pub has_open_conflict: bool,
}

/// How a pulled record relates to local state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// No local row; the remote record can be inserted as is
    NewInsert,
    /// Local row has no unconfirmed edits newer than the remote
    CleanUpdate,
    /// Both sides changed; the remote must not be applied blindly
    Conflict(ChangeType),
}

/// Classify a pulled record. Pure and deterministic.
pub fn classify(local: &LocalState, remote: &RemoteRecord) -> Classification {
    let Some(record) = local.record.as_ref() else {
        return Classification::NewInsert;
    };

    if local.has_open_conflict {
        return Classification::Conflict(change_type(record, local.pending_operation));
    }

    if record.is_synced || record.updated_at <= remote.updated_at {
        return Classification::CleanUpdate;
    }

    Classification::Conflict(change_type(record, local.pending_operation))
}

fn change_type(record: &EntityRecord, pending: Option<QueueOperation>) -> ChangeType {
    if record.is_deleted {
        return ChangeType::Delete;
    }
    match pending {
        Some(QueueOperation::Delete) => ChangeType::Delete,
        Some(QueueOperation::Create) => ChangeType::Create,
        Some(QueueOperation::Update) | None => ChangeType::Update,
    }
}
