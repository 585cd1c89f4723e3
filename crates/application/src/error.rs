use lumo_models::DownloadError;
use lumo_state::Busy;
use lumo_storage::StorageError;
use serde::{Serialize, Serializer};

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("AI Model is not ready. Please wait for initialization or download.")]
    ModelNotReady,

    #[error("Cannot start: {0}.")]
    Busy(#[from] Busy),

    #[error(transparent)]
    Download(#[from] DownloadError),

    #[error("Model initialization failed: {0}")]
    Initialization(String),

    #[error("Inference error: {0}")]
    Inference(String),

    #[error("Response generation stopped by user.")]
    Cancelled,

    #[error("Failed to delete model file: {0}")]
    Delete(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl Serialize for ChatError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ChatError>;

#[cfg(test)]
mod tests {
    use super::*;
    use lumo_state::Activity;

    #[test]
    fn test_serializes_as_message() {
        let json = serde_json::to_value(ChatError::Cancelled).unwrap();
        assert_eq!(json, "Response generation stopped by user.");
    }

    #[test]
    fn test_busy_names_the_running_activity() {
        let err = ChatError::from(Busy {
            active: Activity::Download,
        });
        assert_eq!(err.to_string(), "Cannot start: a model download is already in progress.");
    }

    #[test]
    fn test_download_errors_pass_through() {
        let err = ChatError::from(DownloadError::Unauthorized);
        assert_eq!(
            err.to_string(),
            "Download failed: 401 Unauthorized. Check your Hugging Face Token."
        );
    }
}
