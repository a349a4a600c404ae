//! Sync engine: queue, pull, conflict handling and cycle orchestration.

mod background;
pub(crate) mod detector;
mod events;
mod orchestrator;
mod puller;
mod queue;
mod report;
mod resolver;
mod strategy;

pub use background::BackgroundSync;
pub use detector::{classify, Classification, LocalState};
pub use events::{ListenerId, SyncEvents};
pub use orchestrator::SyncOrchestrator;
pub use puller::RemoteChangePuller;
pub use queue::SyncQueueManager;
pub use report::{ConflictSummary, SyncCycleResult, SyncIssue, SyncStatus};
pub use resolver::{ConflictResolver, ResolutionAction};
pub use strategy::{ConflictStrategy, FixedStrategy, FnStrategy, StrategyRegistry};
