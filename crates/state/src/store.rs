//! Process-wide lifecycle store.
//!
//! Every mutation runs under one publish lock: the closure sees the latest
//! snapshot, the result replaces it in a `watch` channel, and the same snapshot
//! goes out on the event bus before the lock is released. Subscribers therefore
//! observe snapshots in mutation order and never a half-applied change.

use crate::status::{Activity, LifecycleState};
use lumo_events::{emit_serialized, event_names, EventBusRef, NullEventBus};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;

/// Returned when an activity cannot start because another one is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("a {active} is already in progress")]
pub struct Busy {
    pub active: Activity,
}

pub struct LifecycleStore {
    tx: watch::Sender<LifecycleState>,
    publish: Mutex<()>,
    bus: EventBusRef,
}

impl LifecycleStore {
    pub fn new(model_path: impl Into<PathBuf>, bus: EventBusRef) -> Self {
        let (tx, _rx) = watch::channel(LifecycleState::new(model_path.into()));
        Self {
            tx,
            publish: Mutex::new(()),
            bus,
        }
    }

    /// Store that publishes to nobody but its own subscribers.
    pub fn detached(model_path: impl Into<PathBuf>) -> Self {
        Self::new(model_path, Arc::new(NullEventBus))
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> LifecycleState {
        self.tx.borrow().clone()
    }

    /// Receiver that is notified after every published change.
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.tx.subscribe()
    }

    pub fn event_bus(&self) -> &EventBusRef {
        &self.bus
    }

    /// Apply `f` and publish the result.
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut LifecycleState),
    {
        self.update_if(|state| {
            f(state);
            true
        });
    }

    /// Apply `f`; publish only if it returns true and the snapshot actually changed.
    /// Returns whether a new snapshot was published.
    pub fn update_if<F>(&self, f: F) -> bool
    where
        F: FnOnce(&mut LifecycleState) -> bool,
    {
        let _publish = self.publish.lock().unwrap_or_else(PoisonError::into_inner);

        let current = self.tx.borrow().clone();
        let mut next = current.clone();
        if !f(&mut next) || next == current {
            return false;
        }

        self.tx.send_replace(next.clone());
        emit_serialized(self.bus.as_ref(), event_names::LIFECYCLE_CHANGED, &next);
        true
    }

    /// Atomically check that no activity is running and start `activity`.
    ///
    /// The returned guard settles the activity as interrupted if it is dropped
    /// while the store still shows it in progress.
    pub fn try_begin(self: &Arc<Self>, activity: Activity) -> Result<ActivityGuard, Busy> {
        let mut outcome = Err(Busy { active: activity });
        let mut generation_id = 0;
        self.update_if(|state| {
            if let Some(active) = state.active_activity() {
                outcome = Err(Busy { active });
                return false;
            }
            state.begin(activity);
            generation_id = state.generation_id;
            outcome = Ok(());
            true
        });

        outcome.map(|()| {
            tracing::debug!(%activity, generation_id, "Activity started");
            ActivityGuard {
                store: Arc::clone(self),
                activity,
                generation_id,
                settled: false,
            }
        })
    }
}

impl std::fmt::Debug for LifecycleStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleStore")
            .field("state", &*self.tx.borrow())
            .field("subscribers", &self.tx.receiver_count())
            .finish_non_exhaustive()
    }
}

/// Claim on a running activity. Dropping it guarantees the store does not keep
/// reporting the activity as in progress.
#[derive(Debug)]
pub struct ActivityGuard {
    store: Arc<LifecycleStore>,
    activity: Activity,
    generation_id: u64,
    settled: bool,
}

impl ActivityGuard {
    pub fn activity(&self) -> Activity {
        self.activity
    }

    /// Generation number assigned at start (0 for non-generation activities).
    pub fn generation_id(&self) -> u64 {
        self.generation_id
    }

    pub fn store(&self) -> &Arc<LifecycleStore> {
        &self.store
    }

    /// Publish the activity's outcome and release the claim in one snapshot,
    /// so no observer sees the outcome while the activity still blocks others.
    pub fn settle<F>(mut self, outcome: F)
    where
        F: FnOnce(&mut LifecycleState),
    {
        self.settled = true;
        self.close(outcome);
    }

    fn close<F>(&self, outcome: F)
    where
        F: FnOnce(&mut LifecycleState),
    {
        let (activity, generation_id) = (self.activity, self.generation_id);
        let mut interrupted = false;
        self.store.update(|state| {
            outcome(state);
            interrupted = state.abandon(activity, generation_id);
            state.release(activity, generation_id);
        });
        if interrupted {
            tracing::warn!(%activity, generation_id, "Activity ended without an outcome");
        }
    }
}

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        if !self.settled {
            self.close(|_| ());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::{DownloadStatus, GenerationStatus, InitStatus};
    use lumo_events::InMemoryEventBus;

    fn store_with_bus() -> (Arc<LifecycleStore>, Arc<InMemoryEventBus>) {
        let bus = Arc::new(InMemoryEventBus::new());
        let store = Arc::new(LifecycleStore::new("/models/gemma.task", bus.clone()));
        (store, bus)
    }

    #[test]
    fn test_try_begin_is_exclusive_across_activities() {
        let (store, _bus) = store_with_bus();

        let _download = store.try_begin(Activity::Download).unwrap();
        let err = store.try_begin(Activity::Generation).unwrap_err();
        assert_eq!(err.active, Activity::Download);
        let err = store.try_begin(Activity::Initialization).unwrap_err();
        assert_eq!(err.active, Activity::Download);
    }

    #[test]
    fn test_rejected_begin_does_not_publish() {
        let (store, bus) = store_with_bus();
        let _init = store.try_begin(Activity::Initialization).unwrap();
        let published = bus.len();

        assert!(store.try_begin(Activity::Download).is_err());
        assert_eq!(bus.len(), published);
        assert_eq!(store.snapshot().download, DownloadStatus::Idle);
    }

    #[test]
    fn test_dropped_guard_clears_in_progress() {
        let (store, _bus) = store_with_bus();
        {
            let _guard = store.try_begin(Activity::Initialization).unwrap();
            assert_eq!(store.snapshot().init, InitStatus::InProgress);
        }
        let state = store.snapshot();
        assert_eq!(state.init, InitStatus::Failed);
        assert!(state.last_error.is_some());
        assert!(!state.is_busy());
    }

    #[test]
    fn test_generation_claim_outlives_its_status() {
        let (store, _bus) = store_with_bus();
        let guard = store.try_begin(Activity::Generation).unwrap();
        store.update(|s| {
            s.generation = GenerationStatus::Idle;
            s.partial_response = Some("done".into());
        });

        let err = store.try_begin(Activity::Initialization).unwrap_err();
        assert_eq!(err.active, Activity::Generation);

        drop(guard);

        let state = store.snapshot();
        assert!(!state.is_busy());
        assert_eq!(state.last_error, None);
        assert_eq!(state.partial_response.as_deref(), Some("done"));
    }

    #[test]
    fn test_settle_publishes_outcome_and_release_together() {
        let (store, bus) = store_with_bus();
        let guard = store.try_begin(Activity::Generation).unwrap();
        let published = bus.count_for(event_names::LIFECYCLE_CHANGED);

        guard.settle(|s| {
            s.generation = GenerationStatus::Idle;
            s.last_error = Some("Inference error: boom".into());
        });

        let payloads = bus.payloads_for(event_names::LIFECYCLE_CHANGED);
        assert_eq!(payloads.len(), published + 1);
        let last = payloads.last().unwrap();
        assert_eq!(last["engine_busy"], false);
        assert_eq!(last["last_error"], "Inference error: boom");
        assert!(!store.snapshot().is_busy());
    }

    #[test]
    fn test_settle_without_outcome_marks_interrupted() {
        let (store, _bus) = store_with_bus();
        let guard = store.try_begin(Activity::Deletion).unwrap();

        guard.settle(|_| ());

        let state = store.snapshot();
        assert!(!state.deleting);
        assert_eq!(state.last_error.as_deref(), Some("The model deletion was interrupted."));
    }

    #[test]
    fn test_update_if_skips_unchanged_snapshot() {
        let (store, bus) = store_with_bus();
        assert!(!store.update_if(|_| true));
        assert!(bus.is_empty());
    }

    #[test]
    fn test_every_change_is_mirrored_on_bus() {
        let (store, bus) = store_with_bus();
        store.update(|s| s.last_error = Some("boom".into()));
        store.update(|s| s.last_error = None);

        let payloads = bus.payloads_for(event_names::LIFECYCLE_CHANGED);
        assert_eq!(payloads.len(), 2);
        assert_eq!(payloads[0]["last_error"], "boom");
        assert!(payloads[1]["last_error"].is_null());
    }

    #[tokio::test]
    async fn test_subscriber_sees_latest_snapshot() {
        let (store, _bus) = store_with_bus();
        let mut rx = store.subscribe();

        store.update(|s| s.download = DownloadStatus::Complete);

        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().download, DownloadStatus::Complete);
    }

    #[test]
    fn test_concurrent_begins_admit_exactly_one() {
        let (store, _bus) = store_with_bus();
        let winners = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..16)
                .map(|i| {
                    let store = Arc::clone(&store);
                    scope.spawn(move || {
                        let activity = match i % 3 {
                            0 => Activity::Download,
                            1 => Activity::Initialization,
                            _ => Activity::Generation,
                        };
                        store.try_begin(activity).ok()
                    })
                })
                .collect();
            handles
                .into_iter()
                .filter_map(|h| h.join().unwrap())
                .collect::<Vec<_>>()
        });

        assert_eq!(winners.len(), 1);
    }
}
