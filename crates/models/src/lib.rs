mod catalog;
mod client;
mod download;

pub use catalog::{
    discover_model_path, models_dir, remove_artifact, ModelArtifact, DEFAULT_MODEL_FILE_NAME,
    DEFAULT_MODEL_URL,
};
pub use client::{ByteStream, HttpClient, HttpResponse, ReqwestHttpClient};
pub use download::{download_artifact, DownloadProgress, DownloadRequest, DEFAULT_BUFFER_SIZE};

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("Download failed: 401 Unauthorized. Check your Hugging Face Token.")]
    Unauthorized,
    #[error("Download failed: HTTP {code} - {message}")]
    Http { code: u16, message: String },
    #[error("Network or file error during download: {0}")]
    Network(String),
    #[error("Empty response body.")]
    EmptyBody,
    #[error("Network or file error during download: {0}")]
    Io(#[from] std::io::Error),
    #[error("A model download is already in progress.")]
    AlreadyInProgress,
    #[error("Cannot download while a {0} is in progress.")]
    Busy(String),
}

impl DownloadError {
    /// Whether the failure is about credentials rather than connectivity.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized)
    }
}

pub type Result<T> = std::result::Result<T, DownloadError>;
