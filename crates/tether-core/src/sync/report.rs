//! Cycle results and status snapshots handed to hosts.

use serde::Serialize;

use crate::models::{ChangeType, EntityType, OfflineChangeRecord, Resolution};
use crate::state::SyncState;

/// One conflict touched by a cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConflictSummary {
    pub change_id: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub change_type: ChangeType,
    /// `None` when no strategy answer was applied (e.g. the strategy failed)
    pub resolution: Option<Resolution>,
    pub resolved: bool,
}

impl ConflictSummary {
    pub(crate) fn from_record(record: &OfflineChangeRecord) -> Self {
        Self {
            change_id: record.id.clone(),
            entity_type: record.entity_type,
            entity_id: record.entity_id.clone(),
            change_type: record.change_type,
            resolution: record.resolution,
            resolved: record.resolved,
        }
    }
}

/// A per-item or fatal failure attributed to an entity where possible.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncIssue {
    pub entity_type: Option<EntityType>,
    pub entity_id: Option<String>,
    pub message: String,
}

impl SyncIssue {
    pub(crate) fn entity(entity_type: EntityType, entity_id: &str, message: impl Into<String>) -> Self {
        Self {
            entity_type: Some(entity_type),
            entity_id: Some(entity_id.to_string()),
            message: message.into(),
        }
    }

    pub(crate) fn cycle(message: impl Into<String>) -> Self {
        Self {
            entity_type: None,
            entity_id: None,
            message: message.into(),
        }
    }
}

/// Outcome of one sync cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncCycleResult {
    /// No errors of any kind were recorded
    pub success: bool,
    /// Queue items uploaded
    pub synced_items: usize,
    /// Queue items that failed and stay queued
    pub failed_items: usize,
    /// Queue items moved to the dead-letter table
    pub dead_lettered: usize,
    /// Remote records received
    pub pulled_records: usize,
    /// Conflicts offered to the resolver this cycle, parked ones included
    pub conflicts: Vec<ConflictSummary>,
    /// Conflicts still open when the cycle ended
    pub unresolved_conflicts: usize,
    pub errors: Vec<SyncIssue>,
    /// Watermark after the cycle
    pub watermark: Option<i64>,
    pub started_at: i64,
    pub finished_at: i64,
}

/// Point-in-time view of the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    pub state: SyncState,
    pub pending_items: i64,
    pub open_conflicts: i64,
    pub dead_letters: i64,
    pub watermark: Option<i64>,
}
