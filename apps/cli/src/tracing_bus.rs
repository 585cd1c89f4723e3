use lumo_events::{event_names, EventBus};

/// Event bus that forwards every event to the log.
#[derive(Debug, Default)]
pub struct TracingEventBus;

impl EventBus for TracingEventBus {
    fn emit(&self, topic: &str, payload: serde_json::Value) {
        match topic {
            event_names::CHAT_ERROR => tracing::warn!(topic, %payload, "event"),
            event_names::LIFECYCLE_CHANGED => tracing::trace!(topic, %payload, "event"),
            _ => tracing::debug!(topic, %payload, "event"),
        }
    }
}
