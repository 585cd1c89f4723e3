//! The facade a UI talks to.
//!
//! Wires the store, session manager, downloader, orchestrator and
//! cancellation controller together around one [`ChatConfig`].

use crate::cancel::{CancelOutcome, CancellationController, GenerationSlot};
use crate::download::DownloadManager;
use crate::generation::{CompletionHandler, GenerationRequest, InferenceOrchestrator, ResponseStream};
use crate::prompt::{build_prompt, ChatTurn};
use crate::session::{InitOutcome, ModelSessionManager};
use crate::{ChatConfig, ChatError, Result};
use lumo_engine::{EngineLoader, ImageInput};
use lumo_events::{EventBusRef, NullEventBus};
use lumo_models::{remove_artifact, DownloadError, HttpClient, ReqwestHttpClient};
use lumo_state::{Activity, DownloadStatus, InitStatus, LifecycleState, LifecycleStore};
use lumo_storage::CredentialSource;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub struct LlmServiceBuilder {
    config: ChatConfig,
    loader: Arc<dyn EngineLoader>,
    client: Option<Arc<dyn HttpClient>>,
    credentials: Option<Arc<dyn CredentialSource>>,
    bus: Option<EventBusRef>,
}

impl LlmServiceBuilder {
    pub fn http_client(mut self, client: Arc<dyn HttpClient>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn credentials(mut self, credentials: Arc<dyn CredentialSource>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn event_bus(mut self, bus: EventBusRef) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn build(self) -> LlmService {
        let config = self.config;
        let bus = self
            .bus
            .unwrap_or_else(|| Arc::new(NullEventBus) as EventBusRef);
        let store = Arc::new(LifecycleStore::new(config.discover_model_path(), bus));
        let session = Arc::new(ModelSessionManager::new(self.loader, Arc::clone(&store)));
        let slot = Arc::new(GenerationSlot::default());

        let client = self
            .client
            .unwrap_or_else(|| Arc::new(ReqwestHttpClient::new()) as Arc<dyn HttpClient>);
        let mut downloads = DownloadManager::new(Arc::clone(&store), client)
            .with_default_token(config.default_token.clone())
            .with_buffer_size(config.download_buffer_size);
        if let Some(credentials) = self.credentials {
            downloads = downloads.with_credentials(credentials);
        }

        LlmService {
            orchestrator: InferenceOrchestrator::new(
                Arc::clone(&store),
                Arc::clone(&session),
                Arc::clone(&slot),
            ),
            cancellation: CancellationController::new(Arc::clone(&store), Arc::clone(&session), slot),
            downloads: Arc::new(downloads),
            session,
            store,
            config,
        }
    }
}

pub struct LlmService {
    config: ChatConfig,
    store: Arc<LifecycleStore>,
    session: Arc<ModelSessionManager>,
    downloads: Arc<DownloadManager>,
    orchestrator: InferenceOrchestrator,
    cancellation: CancellationController,
}

impl LlmService {
    pub fn builder(config: ChatConfig, loader: Arc<dyn EngineLoader>) -> LlmServiceBuilder {
        LlmServiceBuilder {
            config,
            loader,
            client: None,
            credentials: None,
            bus: None,
        }
    }

    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    pub fn state(&self) -> LifecycleState {
        self.store.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.store.subscribe()
    }

    pub fn store(&self) -> &Arc<LifecycleStore> {
        &self.store
    }

    /// Kick off initialization if configured to and the artifact is on disk.
    /// Must be called inside a Tokio runtime.
    pub fn start(&self) -> Option<JoinHandle<Result<InitOutcome>>> {
        let path = self.store.snapshot().model_path;
        if !self.config.auto_initialize || !path.is_file() {
            tracing::debug!(model = %path.display(), "Skipping auto-initialization");
            return None;
        }
        let session = Arc::clone(&self.session);
        let vision_enabled = self.config.vision_enabled;
        Some(tokio::spawn(async move {
            session.initialize(path, vision_enabled).await
        }))
    }

    pub fn resolve_token(&self) -> Option<String> {
        self.downloads.resolve_token()
    }

    /// Download the configured artifact into the managed models directory.
    pub async fn download_model(&self) -> std::result::Result<PathBuf, DownloadError> {
        let destination = self.config.managed_model_path();
        self.downloads
            .download(&self.config.model_url, &destination, self.resolve_token())
            .await
    }

    /// [`Self::download_model`] on a background task.
    pub fn spawn_download(&self) -> JoinHandle<std::result::Result<PathBuf, DownloadError>> {
        let downloads = Arc::clone(&self.downloads);
        let url = self.config.model_url.clone();
        let destination = self.config.managed_model_path();
        let token = self.resolve_token();
        tokio::spawn(async move { downloads.download(&url, &destination, token).await })
    }

    pub async fn initialize(&self, path: PathBuf, vision_enabled: bool) -> Result<InitOutcome> {
        self.session.initialize(path, vision_enabled).await
    }

    /// Load the artifact a download just produced. No-op unless one is waiting.
    pub async fn initialize_model(&self) -> Result<InitOutcome> {
        let state = self.store.snapshot();
        if !state.needs_initialization {
            return Ok(InitOutcome::NotNeeded);
        }
        self.session
            .initialize(state.model_path, self.config.vision_enabled)
            .await
    }

    pub fn generate(&self, request: GenerationRequest) -> Result<ResponseStream> {
        self.orchestrator.generate(request)
    }

    /// Text turn, with the recent conversation prepended.
    pub fn respond_to_text(
        &self,
        input: &str,
        history: &[ChatTurn],
        on_complete: Option<CompletionHandler>,
    ) -> Result<ResponseStream> {
        let prompt = build_prompt(input, history, self.config.history_window);
        self.orchestrator.generate(GenerationRequest {
            prompt,
            images: Vec::new(),
            on_complete,
        })
    }

    /// Vision turn. Falls back to the configured image prompt.
    pub fn describe_image(
        &self,
        image: ImageInput,
        prompt: Option<&str>,
        on_complete: Option<CompletionHandler>,
    ) -> Result<ResponseStream> {
        let prompt = prompt
            .filter(|p| !p.trim().is_empty())
            .unwrap_or(self.config.image_prompt.as_str())
            .to_string();
        self.orchestrator.generate(GenerationRequest {
            prompt,
            images: vec![image],
            on_complete,
        })
    }

    pub fn cancel_inference(&self) -> CancelOutcome {
        self.cancellation.cancel()
    }

    /// Dispose the engine and delete the artifact. Refused while anything runs,
    /// including an engine call still draining after a cancel.
    /// Returns whether a file was removed.
    pub async fn delete_model(&self) -> Result<bool> {
        let guard = self.store.try_begin(Activity::Deletion).map_err(|busy| {
            tracing::warn!(active = %busy.active, "Model deletion rejected");
            ChatError::from(busy)
        })?;
        let model_path = self.store.snapshot().model_path;

        self.session.dispose();
        if model_path.as_os_str().is_empty() {
            guard.settle(|s| s.deleting = false);
            return Ok(false);
        }

        match remove_artifact(&model_path).await {
            Ok(removed) => {
                tracing::info!(model = %model_path.display(), removed, "Model deleted");
                guard.settle(|s| {
                    s.deleting = false;
                    s.model_path = PathBuf::new();
                    s.download = DownloadStatus::Idle;
                    s.init = InitStatus::NotStarted;
                    s.needs_initialization = false;
                    s.partial_response = None;
                    s.last_error = None;
                });
                Ok(removed)
            }
            Err(e) => {
                let err = ChatError::Delete(e.to_string());
                tracing::error!(error = %err, model = %model_path.display(), "Model deletion failed");
                let message = err.to_string();
                guard.settle(|s| {
                    s.deleting = false;
                    s.last_error = Some(message);
                });
                Err(err)
            }
        }
    }

    /// Forget the last response and error, after the UI has recorded them.
    pub fn clear_state(&self) {
        self.store.update(|s| {
            s.partial_response = None;
            s.last_error = None;
        });
    }

    /// Forget the last response but keep `last_error`, which may still carry a
    /// cancellation notice the UI has not shown yet.
    pub fn clear_response(&self) {
        self.store.update(|s| s.partial_response = None);
    }

    /// Stop any generation and release the engine. Idempotent.
    pub fn shutdown(&self) {
        self.cancellation.cancel();
        self.session.dispose();
    }
}

impl Drop for LlmService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for LlmService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmService")
            .field("store", &self.store)
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}
