//! Data models for Tether

mod change;
mod cursor;
mod entity;
mod queue;

pub(crate) use entity::split_snapshot;
pub use change::{ChangeType, OfflineChangeRecord, Resolution};
pub use cursor::SyncCursor;
pub use entity::{
    new_entity_id, EntityRecord, EntitySchema, EntityType, Project, RemoteRecord, Syncable, Task,
    TaskStatus,
};
pub use queue::{DeadLetter, FailureOutcome, QueueOperation, QueueStatus, SyncQueueItem};
