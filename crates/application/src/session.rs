//! Ownership of the single live engine instance.

use crate::{ChatError, Result};
use lumo_engine::{EngineLoader, InferenceEngine};
use lumo_state::{Activity, Busy, InitStatus, LifecycleStore};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitOutcome {
    /// A new engine is live.
    Ready,
    /// Another initialization was already running; nothing was done.
    AlreadyInProgress,
    /// No freshly downloaded artifact was waiting to be loaded.
    NotNeeded,
}

#[derive(Default)]
struct EngineCell {
    live: Option<Arc<dyn InferenceEngine>>,
    /// Generation calls currently executing on any engine.
    calls: usize,
    /// Engines released while a call was still running on them.
    retired: Vec<Arc<dyn InferenceEngine>>,
}

fn lock(cell: &Mutex<EngineCell>) -> MutexGuard<'_, EngineCell> {
    cell.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Lease on the engine for one generation call. An engine released while
/// leased is disposed when the last lease drops.
pub(crate) struct EngineCall {
    engine: Arc<dyn InferenceEngine>,
    cell: Arc<Mutex<EngineCell>>,
}

impl EngineCall {
    pub(crate) fn engine(&self) -> &dyn InferenceEngine {
        self.engine.as_ref()
    }
}

impl Drop for EngineCall {
    fn drop(&mut self) {
        let retired = {
            let mut cell = lock(&self.cell);
            cell.calls = cell.calls.saturating_sub(1);
            if cell.calls == 0 {
                std::mem::take(&mut cell.retired)
            } else {
                Vec::new()
            }
        };
        for engine in retired {
            tracing::info!(engine = engine.model_name(), "Disposing engine after its last call");
            engine.dispose();
        }
    }
}

/// Owns the engine. Everyone else borrows it for the length of one call.
pub struct ModelSessionManager {
    loader: Arc<dyn EngineLoader>,
    store: Arc<LifecycleStore>,
    cell: Arc<Mutex<EngineCell>>,
}

impl ModelSessionManager {
    pub fn new(loader: Arc<dyn EngineLoader>, store: Arc<LifecycleStore>) -> Self {
        Self {
            loader,
            store,
            cell: Arc::default(),
        }
    }

    /// Borrow the live engine, if any.
    pub fn engine(&self) -> Option<Arc<dyn InferenceEngine>> {
        lock(&self.cell).live.clone()
    }

    pub fn has_engine(&self) -> bool {
        lock(&self.cell).live.is_some()
    }

    /// Lease the live engine for a generation call.
    pub(crate) fn begin_call(&self) -> Option<EngineCall> {
        let mut cell = lock(&self.cell);
        let engine = cell.live.clone()?;
        cell.calls += 1;
        Some(EngineCall {
            engine,
            cell: Arc::clone(&self.cell),
        })
    }

    /// Detach the live engine. Returns it only when it is safe to dispose
    /// now; otherwise the last running call disposes it.
    fn detach_engine(&self) -> Option<Arc<dyn InferenceEngine>> {
        let mut cell = lock(&self.cell);
        let engine = cell.live.take()?;
        if cell.calls > 0 {
            tracing::info!(
                engine = engine.model_name(),
                calls = cell.calls,
                "Engine busy; disposal deferred until the running call returns"
            );
            cell.retired.push(engine);
            return None;
        }
        Some(engine)
    }

    /// Load `path` into a fresh engine, replacing any current one.
    ///
    /// Returns [`InitOutcome::AlreadyInProgress`] without side effects while
    /// another initialization runs.
    pub async fn initialize(&self, path: PathBuf, vision_enabled: bool) -> Result<InitOutcome> {
        let guard = match self.store.try_begin(Activity::Initialization) {
            Ok(guard) => guard,
            Err(Busy {
                active: Activity::Initialization,
            }) => {
                tracing::debug!("Initialization already in progress");
                return Ok(InitOutcome::AlreadyInProgress);
            }
            Err(busy) => {
                tracing::warn!(active = %busy.active, "Initialization rejected");
                return Err(busy.into());
            }
        };

        let previous = self.detach_engine();
        let loader = Arc::clone(&self.loader);
        let load_path = path.clone();
        let start = std::time::Instant::now();

        tracing::info!(model = %path.display(), backend = loader.name(), vision_enabled, "Initializing model");

        let loaded = tokio::task::spawn_blocking(move || {
            if let Some(previous) = previous {
                previous.dispose();
            }
            loader.load(&load_path, vision_enabled)
        })
        .await;

        let result = match loaded {
            Ok(Ok(engine)) => {
                let engine: Arc<dyn InferenceEngine> = Arc::from(engine);
                tracing::info!(
                    model = %path.display(),
                    engine = engine.model_name(),
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Model loaded"
                );
                lock(&self.cell).live = Some(engine);
                self.store.update(|s| {
                    s.init = InitStatus::Ready;
                    s.model_path = path;
                    s.last_error = None;
                });
                Ok(InitOutcome::Ready)
            }
            Ok(Err(e)) => Err(ChatError::Initialization(e.to_string())),
            Err(e) => Err(ChatError::Initialization(e.to_string())),
        };

        if let Err(e) = &result {
            tracing::error!(error = %e, "Model initialization failed");
            let message = e.to_string();
            self.store.update(|s| {
                s.init = InitStatus::Failed;
                s.last_error = Some(message);
            });
        }

        drop(guard);
        result
    }

    /// Recreate the conversational session on the live engine.
    ///
    /// Safe to call while a generation is running on another thread; that is
    /// how generations get interrupted.
    pub fn reset_session(&self, vision_enabled: bool) -> Result<()> {
        let engine = self.engine().ok_or(ChatError::ModelNotReady)?;
        engine
            .reset_session(vision_enabled)
            .map_err(|e| ChatError::Inference(e.to_string()))
    }

    /// Release the engine. Safe to call with no engine loaded. An engine with
    /// a generation call still running is disposed once that call returns.
    pub fn dispose(&self) {
        self.store.update_if(|s| {
            if s.init != InitStatus::Ready {
                return false;
            }
            s.init = InitStatus::NotStarted;
            true
        });
        if let Some(engine) = self.detach_engine() {
            tracing::info!(engine = engine.model_name(), "Disposing engine");
            engine.dispose();
        }
    }
}

impl std::fmt::Debug for ModelSessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelSessionManager")
            .field("backend", &self.loader.name())
            .field("loaded", &self.has_engine())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumo_engine::scripted::{Script, ScriptedLoader};

    fn model_file() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gemma.task");
        std::fs::write(&path, b"weights").unwrap();
        (dir, path)
    }

    fn manager(loader: Arc<ScriptedLoader>) -> (ModelSessionManager, Arc<LifecycleStore>) {
        let store = Arc::new(LifecycleStore::detached(""));
        (ModelSessionManager::new(loader, Arc::clone(&store)), store)
    }

    #[tokio::test]
    async fn test_initialize_publishes_ready() {
        let (_dir, path) = model_file();
        let loader = Arc::new(ScriptedLoader::new(Script::chunks(["hi"])));
        let (sessions, store) = manager(Arc::clone(&loader));

        let outcome = sessions.initialize(path.clone(), true).await.unwrap();

        assert_eq!(outcome, InitOutcome::Ready);
        let state = store.snapshot();
        assert_eq!(state.init, InitStatus::Ready);
        assert_eq!(state.model_path, path);
        assert!(sessions.has_engine());
        assert_eq!(loader.vision_flags(), vec![true]);
    }

    #[tokio::test]
    async fn test_reinitialize_disposes_previous_engine_first() {
        let (_dir, path) = model_file();
        let loader = Arc::new(ScriptedLoader::new(Script::chunks(["hi"])));
        let (sessions, _store) = manager(Arc::clone(&loader));

        sessions.initialize(path.clone(), false).await.unwrap();
        sessions.initialize(path, false).await.unwrap();

        let instances = loader.instances();
        assert_eq!(instances.len(), 2);
        assert!(instances[0].is_disposed());
        assert!(!instances[1].is_disposed());
    }

    #[tokio::test]
    async fn test_failed_load_leaves_no_engine() {
        let (_dir, path) = model_file();
        let loader = Arc::new(ScriptedLoader::failing("bad magic"));
        let (sessions, store) = manager(loader);

        let err = sessions.initialize(path, false).await.unwrap_err();

        assert!(matches!(err, ChatError::Initialization(_)));
        let state = store.snapshot();
        assert_eq!(state.init, InitStatus::Failed);
        assert_eq!(
            state.last_error.as_deref(),
            Some("Model initialization failed: engine initialization failed: bad magic")
        );
        assert!(!sessions.has_engine());
    }

    #[tokio::test]
    async fn test_initialize_while_initializing_is_noop() {
        let loader = Arc::new(ScriptedLoader::new(Script::chunks(["hi"])));
        let (sessions, store) = manager(Arc::clone(&loader));
        let _running = store.try_begin(Activity::Initialization).unwrap();

        let outcome = sessions.initialize(PathBuf::from("gemma.task"), false).await.unwrap();

        assert_eq!(outcome, InitOutcome::AlreadyInProgress);
        assert!(loader.vision_flags().is_empty());
    }

    #[tokio::test]
    async fn test_initialize_rejected_while_downloading() {
        let loader = Arc::new(ScriptedLoader::new(Script::chunks(["hi"])));
        let (sessions, store) = manager(loader);
        let _download = store.try_begin(Activity::Download).unwrap();

        let err = sessions.initialize(PathBuf::from("gemma.task"), false).await.unwrap_err();
        assert!(matches!(err, ChatError::Busy(_)));
    }

    #[tokio::test]
    async fn test_dispose_waits_for_running_call() {
        let (_dir, path) = model_file();
        let loader = Arc::new(ScriptedLoader::new(Script::chunks(["hi"])));
        let (sessions, store) = manager(Arc::clone(&loader));
        sessions.initialize(path, false).await.unwrap();
        let engine = loader.latest().unwrap();

        let call = sessions.begin_call().unwrap();
        sessions.dispose();

        assert!(!sessions.has_engine());
        assert_eq!(store.snapshot().init, InitStatus::NotStarted);
        assert!(!engine.is_disposed());

        drop(call);
        assert_eq!(engine.disposals(), 1);
    }

    #[tokio::test]
    async fn test_begin_call_without_engine_is_none() {
        let loader = Arc::new(ScriptedLoader::new(Script::chunks(["hi"])));
        let (sessions, _store) = manager(loader);
        assert!(sessions.begin_call().is_none());
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent() {
        let (_dir, path) = model_file();
        let loader = Arc::new(ScriptedLoader::new(Script::chunks(["hi"])));
        let (sessions, store) = manager(Arc::clone(&loader));
        sessions.initialize(path, false).await.unwrap();

        sessions.dispose();
        sessions.dispose();

        assert_eq!(loader.latest().unwrap().disposals(), 1);
        assert_eq!(store.snapshot().init, InitStatus::NotStarted);
        assert!(matches!(sessions.reset_session(false), Err(ChatError::ModelNotReady)));
    }
}
