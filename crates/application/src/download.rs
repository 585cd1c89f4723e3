use lumo_events::{emit_serialized, event_names, DownloadProgressEvent};
use lumo_models::{
    download_artifact, DownloadError, DownloadRequest, HttpClient, DEFAULT_BUFFER_SIZE,
};
use lumo_state::{Activity, Busy, DownloadStatus, LifecycleStore};
use lumo_storage::CredentialSource;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Single-flight artifact downloader that reports through the lifecycle store.
pub struct DownloadManager {
    store: Arc<LifecycleStore>,
    client: Arc<dyn HttpClient>,
    credentials: Option<Arc<dyn CredentialSource>>,
    default_token: Option<String>,
    buffer_size: usize,
}

impl DownloadManager {
    pub fn new(store: Arc<LifecycleStore>, client: Arc<dyn HttpClient>) -> Self {
        Self {
            store,
            client,
            credentials: None,
            default_token: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }

    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialSource>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_default_token(mut self, token: Option<String>) -> Self {
        self.default_token = token;
        self
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// A non-blank saved token wins over the configured default.
    pub fn resolve_token(&self) -> Option<String> {
        let saved = self.credentials.as_ref().and_then(|c| match c.read_token() {
            Ok(token) => token,
            Err(e) => {
                tracing::warn!(error = %e, "Could not read saved token");
                None
            }
        });
        saved
            .or_else(|| self.default_token.clone())
            .filter(|t| !t.trim().is_empty())
    }

    /// Download `url` to `destination`.
    ///
    /// Rejects with [`DownloadError::AlreadyInProgress`] while another download
    /// runs and with [`DownloadError::Busy`] while anything else runs; neither
    /// touches the store. Otherwise the store ends in `Complete` or `Failed`.
    pub async fn download(
        &self,
        url: &str,
        destination: &Path,
        bearer_token: Option<String>,
    ) -> Result<PathBuf, DownloadError> {
        let guard = match self.store.try_begin(Activity::Download) {
            Ok(guard) => guard,
            Err(Busy {
                active: Activity::Download,
            }) => {
                tracing::warn!("Download already in progress");
                return Err(DownloadError::AlreadyInProgress);
            }
            Err(busy) => {
                tracing::warn!(active = %busy.active, "Download rejected");
                return Err(DownloadError::Busy(busy.active.to_string()));
            }
        };

        let request = DownloadRequest::new(url, destination)
            .with_token(bearer_token)
            .with_buffer_size(self.buffer_size);
        let bus = Arc::clone(self.store.event_bus());
        let mut published = 0.0f32;

        let result = download_artifact(self.client.as_ref(), &request, |progress| {
            let Some(fraction) = progress.fraction() else {
                return;
            };
            if fraction <= published {
                return;
            }
            published = fraction;
            self.store
                .update(|s| s.download = DownloadStatus::InProgress { progress: fraction });
            emit_serialized(
                bus.as_ref(),
                event_names::DOWNLOAD_PROGRESS,
                &DownloadProgressEvent {
                    progress: fraction,
                    downloaded_bytes: progress.downloaded_bytes,
                    total_bytes: progress.total_bytes,
                },
            );
        })
        .await;

        let outcome = match result {
            Ok(bytes) => {
                if published < 1.0 {
                    emit_serialized(
                        bus.as_ref(),
                        event_names::DOWNLOAD_PROGRESS,
                        &DownloadProgressEvent {
                            progress: 1.0,
                            downloaded_bytes: bytes,
                            total_bytes: Some(bytes),
                        },
                    );
                }
                let path = destination.to_path_buf();
                self.store.update(|s| {
                    s.download = DownloadStatus::Complete;
                    s.model_path = path.clone();
                    s.needs_initialization = true;
                    s.last_error = None;
                });
                Ok(path)
            }
            Err(e) => {
                let message = e.to_string();
                self.store.update(|s| {
                    s.download = DownloadStatus::Failed;
                    s.last_error = Some(message);
                });
                Err(e)
            }
        };

        drop(guard);
        outcome
    }
}

impl std::fmt::Debug for DownloadManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadManager")
            .field("buffer_size", &self.buffer_size)
            .field("has_credentials", &self.credentials.is_some())
            .finish_non_exhaustive()
    }
}
