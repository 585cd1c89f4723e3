mod engine;
pub mod scripted;

pub use engine::{EngineLoader, ImageInput, InferenceEngine, PartialSink};
pub use tokio_util::sync::CancellationToken;

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("model file not found: {}", .0.display())]
    ModelNotFound(PathBuf),
    #[error("engine initialization failed: {0}")]
    InitializationFailed(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("invalid image: {0}")]
    InvalidImage(String),
    #[error("engine has been disposed")]
    Disposed,
}

pub type Result<T> = std::result::Result<T, EngineError>;
