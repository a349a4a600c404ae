//! Periodic and reconnect-triggered sync.

use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::network::{NetworkStatus, Reachability};
use crate::sync::orchestrator::SyncOrchestrator;
use crate::Error;

/// Handle to the background sync task. Dropping it leaves the task running
/// until the runtime shuts down; call [`BackgroundSync::shutdown`] to stop it.
pub struct BackgroundSync {
    stop: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl BackgroundSync {
    /// Spawn a task that syncs every `period` while online, and immediately
    /// when connectivity returns with uploads waiting.
    pub fn spawn(orchestrator: SyncOrchestrator, reachability: &Reachability, period: Duration) -> Self {
        let (stop, stopped) = oneshot::channel();
        let network = reachability.subscribe();
        let handle = tokio::spawn(run(orchestrator, network, period, stopped));
        Self {
            stop: Some(stop),
            handle,
        }
    }

    /// Stop the task, waiting for an in-flight cycle to finish.
    pub async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Err(error) = (&mut self.handle).await {
            tracing::error!("Background sync task ended abnormally: {error}");
        }
    }
}

async fn run(
    orchestrator: SyncOrchestrator,
    mut network: watch::Receiver<NetworkStatus>,
    period: Duration,
    mut stopped: oneshot::Receiver<()>,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut watching = true;
    let mut status = *network.borrow_and_update();
    tracing::info!("Background sync started (every {}s)", period.as_secs());

    loop {
        tokio::select! {
            _ = &mut stopped => break,
            _ = ticker.tick() => {
                if status.is_online() {
                    run_cycle(&orchestrator, "interval").await;
                } else {
                    tracing::debug!("Skipping scheduled sync while offline");
                }
            }
            changed = network.changed(), if watching => {
                if changed.is_err() {
                    // every publisher is gone; keep the timer only
                    watching = false;
                    continue;
                }
                let previous = status;
                status = *network.borrow_and_update();
                if !previous.is_online() && status.is_online() && has_pending(&orchestrator).await {
                    run_cycle(&orchestrator, "reconnect").await;
                }
            }
        }
    }
    tracing::info!("Background sync stopped");
}

async fn has_pending(orchestrator: &SyncOrchestrator) -> bool {
    match orchestrator.queue().pending_count().await {
        Ok(count) => count > 0,
        Err(error) => {
            tracing::warn!("Could not count pending uploads: {error}");
            false
        }
    }
}

async fn run_cycle(orchestrator: &SyncOrchestrator, trigger: &str) {
    match orchestrator.sync().await {
        Ok(result) if result.success => {
            tracing::debug!("{trigger} sync succeeded");
        }
        Ok(result) => {
            tracing::warn!("{trigger} sync finished with {} error(s)", result.errors.len());
        }
        Err(Error::SyncAlreadyInProgress) => {
            tracing::debug!("{trigger} sync skipped, a cycle is already running");
        }
        Err(error) => {
            tracing::warn!("{trigger} sync failed: {error}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::config::EngineConfig;
    use crate::models::EntityType;
    use crate::remote::InMemoryRemote;
    use crate::store::LocalStore;
    use serde_json::json;

    async fn wait_for_upload(remote: &InMemoryRemote, id: &str) -> bool {
        for _ in 0..100 {
            if remote.record(EntityType::Task, id).await.is_some() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reconnect_triggers_sync_with_pending_uploads() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let remote = Arc::new(InMemoryRemote::new());
        let orchestrator =
            SyncOrchestrator::new(store, remote.clone(), EngineConfig::default()).unwrap();
        let reachability = Reachability::new(NetworkStatus::Offline);
        let background =
            BackgroundSync::spawn(orchestrator.clone(), &reachability, Duration::from_secs(3600));

        let record = orchestrator
            .create(EntityType::Task, json!({"title": "queued"}).as_object().cloned().unwrap())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(remote.record(EntityType::Task, &record.id).await.is_none());

        reachability.set(NetworkStatus::Online);
        assert!(wait_for_upload(&remote, &record.id).await);

        background.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn interval_syncs_while_online() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let remote = Arc::new(InMemoryRemote::new());
        let orchestrator =
            SyncOrchestrator::new(store, remote.clone(), EngineConfig::default()).unwrap();
        let reachability = Reachability::new(NetworkStatus::Online);
        let background =
            BackgroundSync::spawn(orchestrator.clone(), &reachability, Duration::from_millis(20));

        let record = orchestrator
            .create(EntityType::Task, json!({"title": "later"}).as_object().cloned().unwrap())
            .await
            .unwrap();
        assert!(wait_for_upload(&remote, &record.id).await);

        background.shutdown().await;
    }
}
