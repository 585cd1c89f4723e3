//! Scripted engine for tests and headless runs.
//!
//! Replays a fixed list of chunks instead of running a model. A gated script
//! waits for [`ScriptedEngine::release`] before each chunk so tests can
//! interleave cancellation with streaming deterministically.

use crate::{EngineError, EngineLoader, ImageInput, InferenceEngine, PartialSink, Result};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How long a gated chunk waits for a permit before giving up and proceeding.
/// Keeps a failed test from wedging the blocking pool.
const GATE_TIMEOUT: Duration = Duration::from_secs(5);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// What a [`ScriptedEngine`] emits for every inference call.
#[derive(Debug, Clone)]
pub struct Script {
    chunks: Vec<String>,
    final_chunk: String,
    failure: Option<String>,
    honor_cancel: bool,
    send_final: bool,
    repeat_final: bool,
    gated: bool,
}

impl Script {
    pub fn chunks<I, S>(chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            chunks: chunks.into_iter().map(Into::into).collect(),
            final_chunk: String::new(),
            failure: None,
            honor_cancel: true,
            send_final: true,
            repeat_final: false,
            gated: false,
        }
    }

    /// Text carried by the terminal `(chunk, true)` call.
    pub fn final_chunk(mut self, text: impl Into<String>) -> Self {
        self.final_chunk = text.into();
        self
    }

    /// Fail with an inference error after streaming the chunks.
    pub fn fail_with(mut self, message: impl Into<String>) -> Self {
        self.failure = Some(message.into());
        self
    }

    /// Keep streaming after the cancellation token fires, like a native call
    /// that only notices a session reset late.
    pub fn ignore_cancel(mut self) -> Self {
        self.honor_cancel = false;
        self
    }

    /// Return normally without ever sending the terminal chunk.
    pub fn without_final(mut self) -> Self {
        self.send_final = false;
        self
    }

    /// Send the terminal chunk twice.
    pub fn repeat_final(mut self) -> Self {
        self.repeat_final = true;
        self
    }

    /// Wait for a permit before every chunk, including the terminal one.
    pub fn gated(mut self) -> Self {
        self.gated = true;
        self
    }
}

#[derive(Debug, Default)]
struct Gate {
    permits: Mutex<usize>,
    ready: Condvar,
}

impl Gate {
    fn acquire(&self) {
        let permits = lock(&self.permits);
        let (mut permits, _timeout) = self
            .ready
            .wait_timeout_while(permits, GATE_TIMEOUT, |p| *p == 0)
            .unwrap_or_else(PoisonError::into_inner);
        *permits = permits.saturating_sub(1);
    }

    fn release(&self, n: usize) {
        let mut permits = lock(&self.permits);
        *permits = permits.saturating_add(n);
        self.ready.notify_all();
    }
}

/// One recorded `run_inference` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub prompt: String,
    pub image_count: usize,
}

#[derive(Debug)]
pub struct ScriptedEngine {
    name: String,
    script: Script,
    gate: Gate,
    calls: Mutex<Vec<RecordedCall>>,
    resets: Mutex<Vec<bool>>,
    disposals: AtomicUsize,
    disposed: AtomicBool,
}

impl ScriptedEngine {
    pub fn new(name: impl Into<String>, script: Script) -> Self {
        Self {
            name: name.into(),
            script,
            gate: Gate::default(),
            calls: Mutex::new(Vec::new()),
            resets: Mutex::new(Vec::new()),
            disposals: AtomicUsize::new(0),
            disposed: AtomicBool::new(false),
        }
    }

    /// Let `n` more gated chunks through.
    pub fn release(&self, n: usize) {
        self.gate.release(n);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        lock(&self.calls).clone()
    }

    /// Vision flag passed to each `reset_session` call, in order.
    pub fn resets(&self) -> Vec<bool> {
        lock(&self.resets).clone()
    }

    /// Number of `dispose` calls, including repeated ones.
    pub fn disposals(&self) -> usize {
        self.disposals.load(Ordering::SeqCst)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn wait_turn(&self) {
        if self.script.gated {
            self.gate.acquire();
        }
    }

    fn stopped(&self, cancel: &CancellationToken) -> bool {
        self.script.honor_cancel && cancel.is_cancelled()
    }
}

impl InferenceEngine for ScriptedEngine {
    fn model_name(&self) -> &str {
        &self.name
    }

    fn reset_session(&self, vision_enabled: bool) -> Result<()> {
        if self.is_disposed() {
            return Err(EngineError::Disposed);
        }
        lock(&self.resets).push(vision_enabled);
        Ok(())
    }

    fn run_inference(
        &self,
        prompt: &str,
        images: &[ImageInput],
        cancel: &CancellationToken,
        on_partial: PartialSink<'_>,
    ) -> Result<()> {
        if self.is_disposed() {
            return Err(EngineError::Disposed);
        }
        lock(&self.calls).push(RecordedCall {
            prompt: prompt.to_string(),
            image_count: images.len(),
        });

        for chunk in &self.script.chunks {
            self.wait_turn();
            if self.stopped(cancel) {
                return Ok(());
            }
            on_partial(chunk, false);
        }

        if let Some(message) = &self.script.failure {
            return Err(EngineError::InferenceFailed(message.clone()));
        }

        self.wait_turn();
        if self.stopped(cancel) || !self.script.send_final {
            return Ok(());
        }
        on_partial(&self.script.final_chunk, true);
        if self.script.repeat_final {
            on_partial(&self.script.final_chunk, true);
        }
        Ok(())
    }

    fn dispose(&self) {
        self.disposals.fetch_add(1, Ordering::SeqCst);
        if !self.disposed.swap(true, Ordering::SeqCst) {
            tracing::debug!(model = %self.name, "Scripted engine disposed");
        }
    }
}

/// Loader that hands out a fresh [`ScriptedEngine`] per load and keeps a
/// reference to each for inspection.
#[derive(Debug)]
pub struct ScriptedLoader {
    script: Script,
    failure: Option<String>,
    instances: Mutex<Vec<Arc<ScriptedEngine>>>,
    vision_flags: Mutex<Vec<bool>>,
}

impl ScriptedLoader {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            failure: None,
            instances: Mutex::new(Vec::new()),
            vision_flags: Mutex::new(Vec::new()),
        }
    }

    /// Loader whose every `load` fails with `message`.
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            failure: Some(message.into()),
            ..Self::new(Script::chunks(Vec::<String>::new()))
        }
    }

    /// Engines created so far, oldest first.
    pub fn instances(&self) -> Vec<Arc<ScriptedEngine>> {
        lock(&self.instances).clone()
    }

    pub fn latest(&self) -> Option<Arc<ScriptedEngine>> {
        lock(&self.instances).last().cloned()
    }

    pub fn vision_flags(&self) -> Vec<bool> {
        lock(&self.vision_flags).clone()
    }
}

impl EngineLoader for ScriptedLoader {
    fn name(&self) -> &str {
        "scripted"
    }

    fn load(&self, model_path: &Path, vision_enabled: bool) -> Result<Box<dyn InferenceEngine>> {
        lock(&self.vision_flags).push(vision_enabled);
        if let Some(message) = &self.failure {
            return Err(EngineError::InitializationFailed(message.clone()));
        }
        if !model_path.is_file() {
            return Err(EngineError::ModelNotFound(model_path.to_path_buf()));
        }

        let name = model_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "scripted".to_string());
        let engine = Arc::new(ScriptedEngine::new(name, self.script.clone()));
        lock(&self.instances).push(Arc::clone(&engine));
        Ok(Box::new(engine))
    }
}
