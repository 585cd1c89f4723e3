//! Model lifecycle and streaming inference orchestration.
//!
//! [`LlmService`] is the entry point: it downloads the model artifact,
//! initializes the engine, runs cancellable streaming generations, and
//! publishes every transition through a [`lumo_state::LifecycleStore`].

mod cancel;
mod config;
mod download;
mod error;
mod generation;
mod prompt;
mod service;
mod session;

pub use cancel::{CancelOutcome, CancellationController};
pub use config::{ChatConfig, DEFAULT_HISTORY_WINDOW, DEFAULT_IMAGE_PROMPT};
pub use download::DownloadManager;
pub use error::{ChatError, Result};
pub use generation::{
    CompletionHandler, GenerationRequest, InferenceOrchestrator, ResponseStream,
    EMPTY_RESPONSE_FALLBACK,
};
pub use prompt::{build_prompt, ChatTurn, Speaker};
pub use service::{LlmService, LlmServiceBuilder};
pub use session::{InitOutcome, ModelSessionManager};
