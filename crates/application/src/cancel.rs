//! User-initiated stop of the running generation.

use crate::session::ModelSessionManager;
use crate::ChatError;
use lumo_engine::CancellationToken;
use lumo_events::{emit_serialized, event_names, now_ms, GenerationErrorEvent};
use lumo_state::{GenerationStatus, LifecycleStore};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone)]
pub(crate) struct ActiveGeneration {
    pub(crate) id: u64,
    pub(crate) token: CancellationToken,
    pub(crate) vision_enabled: bool,
}

/// The token of the generation currently on the engine, shared between the
/// orchestrator (which registers it) and the controller (which fires it).
#[derive(Debug, Default)]
pub(crate) struct GenerationSlot {
    active: Mutex<Option<ActiveGeneration>>,
}

impl GenerationSlot {
    fn lock(&self) -> MutexGuard<'_, Option<ActiveGeneration>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn register(&self, generation: ActiveGeneration) {
        *self.lock() = Some(generation);
    }

    pub(crate) fn take(&self) -> Option<ActiveGeneration> {
        self.lock().take()
    }

    /// Clear the slot only if it still belongs to generation `id`.
    pub(crate) fn release(&self, id: u64) {
        let mut active = self.lock();
        if active.as_ref().is_some_and(|a| a.id == id) {
            *active = None;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// No generation was running.
    NotRunning,
    Cancelled { generation_id: u64 },
}

pub struct CancellationController {
    store: Arc<LifecycleStore>,
    session: Arc<ModelSessionManager>,
    slot: Arc<GenerationSlot>,
}

impl CancellationController {
    pub(crate) fn new(
        store: Arc<LifecycleStore>,
        session: Arc<ModelSessionManager>,
        slot: Arc<GenerationSlot>,
    ) -> Self {
        Self {
            store,
            session,
            slot,
        }
    }

    /// Stop the running generation. Idempotent; a no-op when nothing runs.
    ///
    /// The store is settled first, under its publish lock, so any chunk the
    /// engine produces afterwards is rejected. The session reset then
    /// interrupts the engine itself.
    pub fn cancel(&self) -> CancelOutcome {
        let active = self.slot.take();
        let mut cancelled = None;

        self.store.update_if(|state| {
            if state.generation != GenerationStatus::InProgress {
                return false;
            }
            if let Some(active) = active.as_ref().filter(|a| a.id == state.generation_id) {
                active.token.cancel();
            }
            cancelled = Some(state.generation_id);
            state.generation = GenerationStatus::Idle;
            state.last_error = Some(ChatError::Cancelled.to_string());
            true
        });

        let Some(generation_id) = cancelled else {
            return CancelOutcome::NotRunning;
        };

        emit_serialized(
            self.store.event_bus().as_ref(),
            event_names::CHAT_ERROR,
            &GenerationErrorEvent {
                generation_id,
                error: ChatError::Cancelled.to_string(),
                cancelled: true,
                ts_ms: now_ms(),
            },
        );

        let vision_enabled = active.map(|a| a.vision_enabled).unwrap_or(false);
        if let Err(e) = self.session.reset_session(vision_enabled) {
            tracing::warn!(error = %e, generation_id, "Session reset after cancel failed");
        }
        tracing::info!(generation_id, "Generation cancelled by user");

        CancelOutcome::Cancelled { generation_id }
    }
}
