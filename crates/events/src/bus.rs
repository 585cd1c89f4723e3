//! Event bus abstraction.
//!
//! The orchestrator never talks to a UI runtime directly. Every state change and
//! streamed chunk goes out through an [`EventBus`], so the same core runs under a
//! mobile bridge, the CLI, or a test harness.

use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Sink for orchestrator events.
pub trait EventBus: Send + Sync {
    /// Emit `payload` on `topic` (see [`crate::event_names`]).
    fn emit(&self, topic: &str, payload: serde_json::Value);
}

/// Shared event bus handle.
pub type EventBusRef = Arc<dyn EventBus>;

/// Serialize `payload` and emit it. Payloads that fail to serialize are dropped.
pub fn emit_serialized<T: Serialize>(bus: &dyn EventBus, topic: &str, payload: &T) {
    if let Ok(value) = serde_json::to_value(payload) {
        bus.emit(topic, value);
    }
}

/// A captured event from [`InMemoryEventBus`].
#[derive(Debug, Clone, PartialEq)]
pub struct EmittedEvent {
    pub topic: String,
    pub payload: serde_json::Value,
}

/// Records every event in memory. Used by tests to assert on what the UI would see.
#[derive(Debug, Default)]
pub struct InMemoryEventBus {
    events: Mutex<Vec<EmittedEvent>>,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn guard(&self) -> MutexGuard<'_, Vec<EmittedEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// All captured events, in emission order.
    pub fn events(&self) -> Vec<EmittedEvent> {
        self.guard().clone()
    }

    /// Payloads emitted on `topic`, in emission order.
    pub fn payloads_for(&self, topic: &str) -> Vec<serde_json::Value> {
        self.guard()
            .iter()
            .filter(|e| e.topic == topic)
            .map(|e| e.payload.clone())
            .collect()
    }

    /// Number of events emitted on `topic`.
    pub fn count_for(&self, topic: &str) -> usize {
        self.guard().iter().filter(|e| e.topic == topic).count()
    }

    pub fn clear(&self) {
        self.guard().clear();
    }

    pub fn len(&self) -> usize {
        self.guard().len()
    }

    pub fn is_empty(&self) -> bool {
        self.guard().is_empty()
    }
}

impl EventBus for InMemoryEventBus {
    fn emit(&self, topic: &str, payload: serde_json::Value) {
        self.guard().push(EmittedEvent {
            topic: topic.to_string(),
            payload,
        });
    }
}

/// Discards everything.
pub struct NullEventBus;

impl EventBus for NullEventBus {
    fn emit(&self, _topic: &str, _payload: serde_json::Value) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_in_memory_bus_filters_by_topic() {
        let bus = InMemoryEventBus::new();

        bus.emit("model:download_progress", json!({"progress": 0.5}));
        bus.emit("lifecycle:changed", json!({}));
        bus.emit("model:download_progress", json!({"progress": 1.0}));

        assert_eq!(bus.len(), 3);
        assert_eq!(bus.count_for("model:download_progress"), 2);
        assert_eq!(
            bus.payloads_for("model:download_progress")[1],
            json!({"progress": 1.0})
        );
        assert_eq!(bus.count_for("chat:partial"), 0);
    }

    #[test]
    fn test_clear_empties_bus() {
        let bus = InMemoryEventBus::new();
        bus.emit("chat:partial", json!({"text": "hi"}));
        assert!(!bus.is_empty());

        bus.clear();
        assert!(bus.is_empty());
    }

    #[test]
    fn test_emit_serialized_uses_serde_shape() {
        #[derive(Serialize)]
        struct Payload {
            generation_id: u64,
        }

        let bus = InMemoryEventBus::new();
        emit_serialized(&bus, "chat:complete", &Payload { generation_id: 7 });
        assert_eq!(bus.events()[0].payload, json!({"generation_id": 7}));
    }

    #[test]
    fn test_null_bus_accepts_events() {
        NullEventBus.emit("chat:error", json!({"error": "ignored"}));
    }
}
