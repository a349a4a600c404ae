//! Boundary to the remote source of truth.
//!
//! Mutations carry an idempotency key (the queue item id) so a replayed upload
//! is applied at most once. Create is an upsert by id and deleting a missing
//! entity succeeds, so replays are safe even without key support.

mod http;
mod memory;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::models::{EntityType, RemoteRecord};
use crate::{Error, Result};

pub use http::HttpRemoteApi;
pub use memory::{InMemoryRemote, RemoteCall, RemoteCallKind};

/// Remote entity API consumed by the sync engine.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Create (or replace) an entity with a client-chosen id. Returns the
    /// server copy when the response carries one.
    async fn create_entity(
        &self,
        entity_type: EntityType,
        id: &str,
        data: &Map<String, Value>,
        idempotency_key: &str,
    ) -> Result<Option<RemoteRecord>>;

    /// Apply a shallow patch to an entity. Returns the server copy when the
    /// response carries one.
    async fn update_entity(
        &self,
        entity_type: EntityType,
        id: &str,
        patch: &Map<String, Value>,
        idempotency_key: &str,
    ) -> Result<Option<RemoteRecord>>;

    /// Delete an entity. Deleting a missing entity succeeds.
    async fn delete_entity(
        &self,
        entity_type: EntityType,
        id: &str,
        idempotency_key: &str,
    ) -> Result<()>;

    /// Records of one type changed at or after `since` (Unix ms), remote
    /// tombstones included. The bound is inclusive so records sharing the
    /// watermark millisecond are never skipped.
    async fn list_changed_since(
        &self,
        entity_type: EntityType,
        since: i64,
    ) -> Result<Vec<RemoteRecord>>;
}

/// Remote used when no server is configured. Every call fails with a
/// retryable error, so queued work waits instead of being dead-lettered.
#[derive(Debug, Clone, Copy, Default)]
pub struct Detached;

impl Detached {
    fn unavailable() -> Error {
        Error::TransientNetwork("no remote configured".to_string())
    }
}

#[async_trait]
impl RemoteApi for Detached {
    async fn create_entity(
        &self,
        _entity_type: EntityType,
        _id: &str,
        _data: &Map<String, Value>,
        _idempotency_key: &str,
    ) -> Result<Option<RemoteRecord>> {
        Err(Self::unavailable())
    }

    async fn update_entity(
        &self,
        _entity_type: EntityType,
        _id: &str,
        _patch: &Map<String, Value>,
        _idempotency_key: &str,
    ) -> Result<Option<RemoteRecord>> {
        Err(Self::unavailable())
    }

    async fn delete_entity(
        &self,
        _entity_type: EntityType,
        _id: &str,
        _idempotency_key: &str,
    ) -> Result<()> {
        Err(Self::unavailable())
    }

    async fn list_changed_since(
        &self,
        _entity_type: EntityType,
        _since: i64,
    ) -> Result<Vec<RemoteRecord>> {
        Err(Self::unavailable())
    }
}

/// Run a remote call under the per-call timeout; expiry maps to `Error::Timeout`.
pub async fn with_timeout<T>(
    timeout: Duration,
    call: impl Future<Output = Result<T>> + Send,
) -> Result<T> {
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(
            u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        )),
    }
}
