//! Cycle completion listeners.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};

use super::report::SyncCycleResult;

/// Handle returned by [`SyncEvents::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&SyncCycleResult) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    next_id: u64,
    entries: Vec<(ListenerId, Listener)>,
}

/// Observer list notified after every cycle.
///
/// Listeners run synchronously on the task that finished the cycle, in
/// registration order. A panicking listener is logged and skipped.
#[derive(Clone, Default)]
pub struct SyncEvents {
    listeners: Arc<Mutex<Listeners>>,
}

impl SyncEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&SyncCycleResult) + Send + Sync + 'static,
    {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        let id = ListenerId(listeners.next_id);
        listeners.next_id += 1;
        listeners.entries.push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener; returns whether it was registered.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.entries.len();
        listeners.entries.retain(|(entry, _)| *entry != id);
        listeners.entries.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    pub(crate) fn emit(&self, result: &SyncCycleResult) {
        // listeners may subscribe or unsubscribe while being notified
        let snapshot = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .clone();

        for (id, listener) in snapshot {
            if catch_unwind(AssertUnwindSafe(|| listener(result))).is_err() {
                tracing::error!("Sync listener {id:?} panicked; continuing with remaining listeners");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn listeners_run_in_registration_order_despite_panics() {
        let events = SyncEvents::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let first = Arc::clone(&seen);
        events.subscribe(move |_| first.lock().unwrap().push("first"));
        events.subscribe(|_| panic!("listener bug"));
        let third = Arc::clone(&seen);
        events.subscribe(move |result| {
            third.lock().unwrap().push(if result.success { "third:ok" } else { "third:err" });
        });

        events.emit(&SyncCycleResult {
            success: true,
            ..SyncCycleResult::default()
        });
        assert_eq!(*seen.lock().unwrap(), vec!["first", "third:ok"]);
    }

    #[test]
    fn unsubscribe_stops_notifications() {
        let events = SyncEvents::new();
        let calls = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&calls);
        let id = events.subscribe(move |_| *counter.lock().unwrap() += 1);

        events.emit(&SyncCycleResult::default());
        assert!(events.unsubscribe(id));
        assert!(!events.unsubscribe(id));
        events.emit(&SyncCycleResult::default());

        assert_eq!(*calls.lock().unwrap(), 1);
        assert_eq!(events.listener_count(), 0);
    }
}
