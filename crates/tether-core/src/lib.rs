//! tether-core - Offline-first sync engine
//!
//! Local writes land in a libSQL store and a durable upload queue in one
//! transaction. A [`SyncOrchestrator`] cycle uploads queued changes, pulls
//! remote changes past a watermark, detects and resolves conflicts, then
//! checkpoints. Hosts drive cycles directly or through [`BackgroundSync`].

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod network;
pub mod remote;
pub mod state;
pub mod store;
pub mod sync;
pub mod util;


pub use config::{EngineConfig, RemoteConfig};
pub use error::{Error, Result};
pub use models::{
    EntityRecord, EntityType, OfflineChangeRecord, RemoteRecord, Resolution, SyncQueueItem,
    Syncable,
};
pub use network::{NetworkStatus, Reachability};
pub use remote::{Detached, HttpRemoteApi, InMemoryRemote, RemoteApi};
pub use state::SyncState;
pub use store::{LocalStore, WriteOrigin};
pub use sync::{
    BackgroundSync, ConflictStrategy, StrategyRegistry, SyncCycleResult, SyncOrchestrator,
    SyncStatus,
};
