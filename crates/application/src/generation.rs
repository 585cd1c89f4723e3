//! Streaming inference driver.
//!
//! One generation at a time. The engine runs on the blocking pool and pushes
//! chunks through a callback; each chunk is folded into the store under the
//! publish lock, but only while the store still shows this generation as
//! running. Cancellation flips that state, so late chunks fall on the floor
//! without any extra coordination.
//!
//! The store keeps the generation claimed until the engine call returns, even
//! after a cancel, so nothing else can start or dispose the engine meanwhile.

use crate::cancel::{ActiveGeneration, GenerationSlot};
use crate::session::{EngineCall, ModelSessionManager};
use crate::{ChatError, Result};
use futures::Stream;
use lumo_engine::{CancellationToken, ImageInput};
use lumo_events::{
    emit_serialized, event_names, now_ms, GenerationCompleteEvent, GenerationErrorEvent,
    PartialResponseEvent,
};
use lumo_state::{Activity, ActivityGuard, GenerationStatus, LifecycleState, LifecycleStore};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

/// Shown when a generation ends with neither text nor an error.
pub const EMPTY_RESPONSE_FALLBACK: &str = "Sorry, I couldn't generate a response.";

/// Called once with the finished response.
pub type CompletionHandler = Box<dyn FnOnce(String) + Send + 'static>;

pub struct GenerationRequest {
    pub prompt: String,
    pub images: Vec<ImageInput>,
    pub on_complete: Option<CompletionHandler>,
}

impl GenerationRequest {
    pub fn text(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            images: Vec::new(),
            on_complete: None,
        }
    }

    pub fn with_images(mut self, images: Vec<ImageInput>) -> Self {
        self.images = images;
        self
    }

    pub fn on_complete<F>(mut self, handler: F) -> Self
    where
        F: FnOnce(String) + Send + 'static,
    {
        self.on_complete = Some(Box::new(handler));
        self
    }

    pub fn vision_enabled(&self) -> bool {
        !self.images.is_empty()
    }
}

impl std::fmt::Debug for GenerationRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationRequest")
            .field("prompt_len", &self.prompt.len())
            .field("images", &self.images.len())
            .field("has_handler", &self.on_complete.is_some())
            .finish()
    }
}

/// Live transcript of one generation.
///
/// Yields accepted chunks in engine order. Ends once the engine call has
/// returned and the outcome is published, after success, failure or cancel.
/// It cannot be restarted.
#[derive(Debug)]
pub struct ResponseStream {
    generation_id: u64,
    rx: mpsc::UnboundedReceiver<String>,
}

impl ResponseStream {
    pub fn generation_id(&self) -> u64 {
        self.generation_id
    }

    /// Drain the stream and concatenate every chunk.
    pub async fn collect_text(mut self) -> String {
        let mut text = String::new();
        while let Some(chunk) = self.rx.recv().await {
            text.push_str(&chunk);
        }
        text
    }
}

impl Stream for ResponseStream {
    type Item = String;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<String>> {
        self.rx.poll_recv(cx)
    }
}

pub struct InferenceOrchestrator {
    store: Arc<LifecycleStore>,
    session: Arc<ModelSessionManager>,
    slot: Arc<GenerationSlot>,
}

impl InferenceOrchestrator {
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

    /// Start a generation in the background. Must be called inside a Tokio
    /// runtime.
    ///
    /// Fails without starting if no engine is loaded (the reason also lands in
    /// `last_error`) or if any other activity is running. The completion
    /// handler is dropped uncalled in both cases.
    pub fn generate(&self, request: GenerationRequest) -> Result<ResponseStream> {
        if !self.session.has_engine() {
            tracing::warn!("Generation requested with no model loaded");
            self.store
                .update(|s| s.last_error = Some(ChatError::ModelNotReady.to_string()));
            return Err(ChatError::ModelNotReady);
        }

        let guard = self.store.try_begin(Activity::Generation).map_err(|busy| {
            tracing::warn!(active = %busy.active, "Generation rejected");
            ChatError::from(busy)
        })?;
        // The engine may have been disposed between the check and the claim.
        let Some(call) = self.session.begin_call() else {
            tracing::warn!("Model was released before generation could start");
            guard.settle(|s| {
                s.generation = GenerationStatus::Idle;
                s.last_error = Some(ChatError::ModelNotReady.to_string());
            });
            return Err(ChatError::ModelNotReady);
        };
        let generation_id = guard.generation_id();
        let vision_enabled = request.vision_enabled();
        let token = CancellationToken::new();

        self.slot.register(ActiveGeneration {
            id: generation_id,
            token: token.clone(),
            vision_enabled,
        });
        // A cancel that landed between `try_begin` and `register` found no token.
        if !is_current(&self.store, generation_id) {
            token.cancel();
        }

        let (tx, rx) = mpsc::unbounded_channel();
        tracing::debug!(
            generation_id,
            prompt_len = request.prompt.len(),
            images = request.images.len(),
            "Generation started"
        );

        let run = GenerationRun {
            guard,
            slot: Arc::clone(&self.slot),
            call,
            token,
        };
        tokio::spawn(run.drive(request, tx));

        Ok(ResponseStream { generation_id, rx })
    }
}

fn is_current(store: &LifecycleStore, generation_id: u64) -> bool {
    let state = store.snapshot();
    state.is_generating() && state.generation_id == generation_id
}

struct GenerationRun {
    guard: ActivityGuard,
    slot: Arc<GenerationSlot>,
    call: EngineCall,
    token: CancellationToken,
}

impl GenerationRun {
    async fn drive(self, request: GenerationRequest, tx: mpsc::UnboundedSender<String>) {
        let GenerationRun {
            guard,
            slot,
            call,
            token: cancel,
        } = self;
        let store = Arc::clone(guard.store());
        let generation_id = guard.generation_id();
        let GenerationRequest {
            prompt,
            images,
            on_complete,
        } = request;
        let vision_enabled = !images.is_empty();

        let mut sink = ChunkSink {
            store: Arc::clone(&store),
            generation_id,
            chunks: Some(tx.clone()),
            response: None,
        };
        let joined = tokio::task::spawn_blocking(move || {
            let engine = call.engine();
            let result = engine.reset_session(vision_enabled).and_then(|()| {
                engine.run_inference(&prompt, &images, &cancel, &mut |text: &str, is_final: bool| {
                    sink.accept(text, is_final)
                })
            });
            if result.is_ok() && sink.response.is_none() && !cancel.is_cancelled() {
                tracing::debug!(generation_id, "Engine returned without a final chunk");
                sink.accept("", true);
            }
            (sink.response.take(), result)
        })
        .await;

        let (response, failure) = match joined {
            Ok((response, result)) => (response, result.err().map(|e| e.to_string())),
            Err(e) => (None, Some(e.to_string())),
        };
        let failure = match (&response, failure) {
            (Some(_), Some(error)) => {
                tracing::warn!(generation_id, %error, "Engine failed after its final chunk");
                None
            }
            (_, failure) => failure.map(|error| ChatError::Inference(error).to_string()),
        };

        slot.release(generation_id);
        let mut failed = None;
        guard.settle(|s| {
            if let Some(message) = failure {
                if settle_failure(s, generation_id, &message) {
                    failed = Some(message);
                } else {
                    tracing::debug!(generation_id, error = %message, "Ignoring engine error after cancellation");
                }
            }
        });

        if let Some(response) = response {
            tracing::info!(generation_id, chars = response.len(), "Generation complete");
            emit_serialized(
                store.event_bus().as_ref(),
                event_names::CHAT_COMPLETE,
                &GenerationCompleteEvent {
                    generation_id,
                    response: response.clone(),
                    ts_ms: now_ms(),
                },
            );
            if let Some(handler) = on_complete {
                handler(response);
            }
        } else if let Some(error) = failed {
            tracing::error!(generation_id, %error, "Generation failed");
            emit_serialized(
                store.event_bus().as_ref(),
                event_names::CHAT_ERROR,
                &GenerationErrorEvent {
                    generation_id,
                    error,
                    cancelled: false,
                    ts_ms: now_ms(),
                },
            );
        } else {
            tracing::debug!(generation_id, "Generation ended after cancellation");
        }
        drop(tx);
    }
}

/// Record an engine failure, unless the generation was already cancelled.
fn settle_failure(state: &mut LifecycleState, generation_id: u64, message: &str) -> bool {
    if !state.is_generating() || state.generation_id != generation_id {
        return false;
    }
    state.generation = GenerationStatus::Idle;
    state.last_error = Some(message.to_string());
    true
}

/// Receives engine chunks on the blocking thread.
struct ChunkSink {
    store: Arc<LifecycleStore>,
    generation_id: u64,
    chunks: Option<mpsc::UnboundedSender<String>>,
    /// Set once the final chunk is accepted.
    response: Option<String>,
}

impl ChunkSink {
    fn accept(&mut self, text: &str, is_final: bool) {
        if self.response.is_some() {
            tracing::debug!(generation_id = self.generation_id, "Ignoring chunk after final");
            return;
        }

        let generation_id = self.generation_id;
        let mut live = false;
        let mut response = None;
        self.store.update_if(|s| {
            if !s.is_generating() || s.generation_id != generation_id {
                return false;
            }
            live = true;
            let partial = s.partial_response.get_or_insert_with(String::new);
            partial.push_str(text);
            if is_final {
                response = Some(if partial.is_empty() {
                    s.last_error
                        .clone()
                        .filter(|e| !e.is_empty())
                        .unwrap_or_else(|| EMPTY_RESPONSE_FALLBACK.to_string())
                } else {
                    partial.clone()
                });
                s.generation = GenerationStatus::Idle;
            }
            true
        });

        if !live {
            tracing::debug!(generation_id, "Dropping chunk from stopped generation");
            self.chunks = None;
            return;
        }

        if !text.is_empty() {
            if let Some(tx) = &self.chunks {
                let _ = tx.send(text.to_string());
            }
        }
        emit_serialized(
            self.store.event_bus().as_ref(),
            event_names::CHAT_PARTIAL,
            &PartialResponseEvent {
                generation_id,
                text: text.to_string(),
                is_final,
            },
        );

        if is_final {
            self.chunks = None;
            self.response = response;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use lumo_engine::scripted::{Script, ScriptedLoader};
    use lumo_events::InMemoryEventBus;
    use tokio::sync::oneshot;

    struct Harness {
        orchestrator: InferenceOrchestrator,
        store: Arc<LifecycleStore>,
        bus: Arc<InMemoryEventBus>,
        loader: Arc<ScriptedLoader>,
        _dir: tempfile::TempDir,
    }

    async fn harness(script: Script) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gemma.task");
        std::fs::write(&path, b"weights").unwrap();

        let bus = Arc::new(InMemoryEventBus::new());
        let store = Arc::new(LifecycleStore::new(path.clone(), bus.clone()));
        let loader = Arc::new(ScriptedLoader::new(script));
        let session = Arc::new(ModelSessionManager::new(loader.clone(), Arc::clone(&store)));
        session.initialize(path, false).await.unwrap();

        Harness {
            orchestrator: InferenceOrchestrator::new(
                Arc::clone(&store),
                session,
                Arc::new(GenerationSlot::default()),
            ),
            store,
            bus,
            loader,
            _dir: dir,
        }
    }

    fn completion() -> (
        impl FnOnce(String) + Send + 'static,
        oneshot::Receiver<String>,
    ) {
        let (tx, rx) = oneshot::channel();
        (move |text| {
            let _ = tx.send(text);
        }, rx)
    }

    #[tokio::test]
    async fn test_chunks_accumulate_and_complete_once() {
        let h = harness(Script::chunks(["Hel", "lo"]).final_chunk("!")).await;
        let (handler, done) = completion();

        let stream = h
            .orchestrator
            .generate(GenerationRequest::text("hi").on_complete(handler))
            .unwrap();

        assert_eq!(stream.collect_text().await, "Hello!");
        assert_eq!(done.await.unwrap(), "Hello!");
        let state = h.store.snapshot();
        assert_eq!(state.partial_response.as_deref(), Some("Hello!"));
        assert_eq!(state.generation, GenerationStatus::Idle);

        let partials = h.bus.payloads_for(event_names::CHAT_PARTIAL);
        assert_eq!(partials.len(), 3);
        assert_eq!(partials.iter().filter(|p| p["is_final"] == true).count(), 1);
    }

    #[tokio::test]
    async fn test_repeated_final_is_ignored() {
        let h = harness(Script::chunks(["a"]).final_chunk("b").repeat_final()).await;
        let (handler, done) = completion();

        h.orchestrator
            .generate(GenerationRequest::text("hi").on_complete(handler))
            .unwrap();

        assert_eq!(done.await.unwrap(), "ab");
        assert_eq!(h.store.snapshot().partial_response.as_deref(), Some("ab"));
        assert_eq!(h.bus.count_for(event_names::CHAT_COMPLETE), 1);
    }

    #[tokio::test]
    async fn test_missing_final_chunk_is_synthesized() {
        let h = harness(Script::chunks(["only"]).without_final()).await;
        let (handler, done) = completion();

        h.orchestrator
            .generate(GenerationRequest::text("hi").on_complete(handler))
            .unwrap();

        assert_eq!(done.await.unwrap(), "only");
    }

    #[tokio::test]
    async fn test_empty_response_uses_fallback() {
        let h = harness(Script::chunks(Vec::<String>::new())).await;
        let (handler, done) = completion();

        h.orchestrator
            .generate(GenerationRequest::text("hi").on_complete(handler))
            .unwrap();

        assert_eq!(done.await.unwrap(), EMPTY_RESPONSE_FALLBACK);
    }

    #[tokio::test]
    async fn test_engine_error_skips_completion() {
        let h = harness(Script::chunks(["partial"]).fail_with("out of memory")).await;
        let (handler, done) = completion();

        let stream = h
            .orchestrator
            .generate(GenerationRequest::text("hi").on_complete(handler))
            .unwrap();
        stream.collect_text().await;

        assert!(done.await.is_err(), "handler must be dropped uncalled");
        let state = h.store.snapshot();
        assert_eq!(state.generation, GenerationStatus::Idle);
        assert_eq!(
            state.last_error.as_deref(),
            Some("Inference error: inference failed: out of memory")
        );
        assert_eq!(h.bus.count_for(event_names::CHAT_ERROR), 1);
        assert_eq!(h.bus.count_for(event_names::CHAT_COMPLETE), 0);
    }

    #[tokio::test]
    async fn test_image_request_enables_vision() {
        let h = harness(Script::chunks(["a cat"])).await;
        let image = ImageInput::rgba8(1, 1, vec![0u8; 4]).unwrap();

        let stream = h
            .orchestrator
            .generate(GenerationRequest::text("Describe").with_images(vec![image]))
            .unwrap();
        stream.collect_text().await;

        let engine = h.loader.latest().unwrap();
        assert_eq!(engine.resets(), vec![true]);
        assert_eq!(engine.calls()[0].image_count, 1);
    }

    #[tokio::test]
    async fn test_second_generation_is_rejected_while_running() {
        let h = harness(Script::chunks(["a", "b"]).gated()).await;
        let first = h.orchestrator.generate(GenerationRequest::text("one")).unwrap();
        let before = h.store.snapshot();

        let err = h.orchestrator.generate(GenerationRequest::text("two")).unwrap_err();

        assert!(matches!(err, ChatError::Busy(_)));
        assert_eq!(h.store.snapshot(), before);

        h.loader.latest().unwrap().release(3);
        let chunks: Vec<String> = first.collect().await;
        assert_eq!(chunks, vec!["a".to_string(), "b".to_string()]);
    }
}
