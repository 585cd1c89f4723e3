//! Shared event contracts between the orchestrator and whatever renders it.
//!
//! Payload structs here are the formal contract for UI consumers; using them on
//! both sides avoids field-name drift.

mod bus;

pub use bus::{emit_serialized, EmittedEvent, EventBus, EventBusRef, InMemoryEventBus, NullEventBus};

use serde::{Deserialize, Serialize};

/// Emitted for every progress value published during a download.
///
/// Producers: download manager
/// Consumers: settings screen progress bar
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadProgressEvent {
    /// Fraction in `[0, 1]`.
    pub progress: f32,
    pub downloaded_bytes: u64,
    /// `None` when the server did not declare a length.
    #[serde(default)]
    pub total_bytes: Option<u64>,
}

/// Emitted for every streamed chunk accepted into the partial response.
///
/// Producers: inference orchestrator
/// Consumers: chat screen (live transcript)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialResponseEvent {
    pub generation_id: u64,
    pub text: String,
    pub is_final: bool,
}

/// Emitted once when a generation finishes normally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationCompleteEvent {
    pub generation_id: u64,
    pub response: String,
    #[serde(default)]
    pub ts_ms: i64,
}

/// Emitted when a generation ends in an engine failure or a user cancellation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationErrorEvent {
    pub generation_id: u64,
    pub error: String,
    #[serde(default)]
    pub cancelled: bool,
    #[serde(default)]
    pub ts_ms: i64,
}

/// Milliseconds since the epoch, for event timestamps.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Event names as constants to prevent typos.
pub mod event_names {
    /// Full lifecycle snapshot after each store mutation.
    pub const LIFECYCLE_CHANGED: &str = "lifecycle:changed";
    /// Download progress update.
    pub const DOWNLOAD_PROGRESS: &str = "model:download_progress";
    /// Streamed chunk appended to the partial response.
    pub const CHAT_PARTIAL: &str = "chat:partial";
    /// Generation finished with a response.
    pub const CHAT_COMPLETE: &str = "chat:complete";
    /// Generation failed or was stopped.
    pub const CHAT_ERROR: &str = "chat:error";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_event_without_total() {
        let json = r#"{"progress": 1.0, "downloaded_bytes": 512}"#;
        let event: DownloadProgressEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.total_bytes, None);
        assert_eq!(event.downloaded_bytes, 512);
    }

    #[test]
    fn test_error_event_defaults_to_not_cancelled() {
        let json = r#"{"generation_id": 3, "error": "engine crashed"}"#;
        let event: GenerationErrorEvent = serde_json::from_str(json).unwrap();
        assert!(!event.cancelled);
        assert_eq!(event.ts_ms, 0);
    }
}
