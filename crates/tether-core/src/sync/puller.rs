//! Fetches remote deltas since the watermark.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;

use crate::models::{EntityType, RemoteRecord};
use crate::remote::{with_timeout, RemoteApi};
use crate::Result;

/// Read-only view of remote changes. Never touches the local store.
#[derive(Clone)]
pub struct RemoteChangePuller {
    remote: Arc<dyn RemoteApi>,
    call_timeout: Duration,
}

impl RemoteChangePuller {
    pub fn new(remote: Arc<dyn RemoteApi>, call_timeout: Duration) -> Self {
        Self {
            remote,
            call_timeout,
        }
    }

    /// Records of one type changed at or after `since`.
    pub async fn pull(&self, entity_type: EntityType, since: i64) -> Result<Vec<RemoteRecord>> {
        let records = with_timeout(
            self.call_timeout,
            self.remote.list_changed_since(entity_type, since),
        )
        .await?;
        tracing::debug!(
            "Pulled {} changed {entity_type} record(s) since {since}",
            records.len()
        );
        Ok(records)
    }

    /// Pull every type concurrently; fails if any single pull fails.
    pub async fn pull_all(&self, entity_types: &[EntityType], since: i64) -> Result<Vec<RemoteRecord>> {
        let results = join_all(
            entity_types
                .iter()
                .map(|entity_type| self.pull(*entity_type, since)),
        )
        .await;

        let mut records = Vec::new();
        for result in results {
            records.extend(result?);
        }
        Ok(records)
    }
}
