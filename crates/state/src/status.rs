//! Lifecycle snapshot types.
//!
//! A [`LifecycleState`] is a plain value: the store hands out clones, never
//! references into shared memory.

use serde::Serialize;
use std::fmt;
use std::path::PathBuf;

/// Progress of the model artifact download.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DownloadStatus {
    Idle,
    InProgress {
        /// Fraction in `[0, 1]`, non-decreasing within one attempt.
        progress: f32,
    },
    Complete,
    Failed,
}

impl DownloadStatus {
    pub fn is_in_progress(&self) -> bool {
        matches!(self, Self::InProgress { .. })
    }

    /// Progress as a fraction; `Complete` always reads as 1.0.
    pub fn progress(&self) -> f32 {
        match self {
            Self::InProgress { progress } => *progress,
            Self::Complete => 1.0,
            Self::Idle | Self::Failed => 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InitStatus {
    NotStarted,
    InProgress,
    Ready,
    Failed,
}

/// Status of the streaming generation.
///
/// `Cancelled` is part of the projection for UI consumers; the store itself
/// settles cancelled generations back to `Idle` and reports the cancellation
/// through `last_error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStatus {
    Idle,
    InProgress,
    Cancelled,
}

/// Mutually exclusive background activities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Activity {
    Download,
    Initialization,
    Generation,
    Deletion,
}

impl fmt::Display for Activity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Download => "model download",
            Self::Initialization => "model initialization",
            Self::Generation => "response generation",
            Self::Deletion => "model deletion",
        })
    }
}

/// Snapshot of everything the UI may observe.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LifecycleState {
    /// Artifact associated with the session. May not exist on disk yet.
    pub model_path: PathBuf,
    pub download: DownloadStatus,
    pub init: InitStatus,
    pub generation: GenerationStatus,
    pub last_error: Option<String>,
    /// Text streamed so far by the current (or just finished) generation.
    pub partial_response: Option<String>,
    /// Set by a successful download; initialization must be requested explicitly.
    pub needs_initialization: bool,
    /// Incremented each time a generation starts.
    pub generation_id: u64,
    /// The engine is still inside a generation call. Outlives `generation`
    /// after a cancel, until the native call actually returns.
    pub engine_busy: bool,
    pub deleting: bool,
}

impl LifecycleState {
    pub fn new(model_path: PathBuf) -> Self {
        Self {
            model_path,
            download: DownloadStatus::Idle,
            init: InitStatus::NotStarted,
            generation: GenerationStatus::Idle,
            last_error: None,
            partial_response: None,
            needs_initialization: false,
            generation_id: 0,
            engine_busy: false,
            deleting: false,
        }
    }

    /// The background activity currently running, if any.
    pub fn active_activity(&self) -> Option<Activity> {
        if self.download.is_in_progress() {
            Some(Activity::Download)
        } else if self.init == InitStatus::InProgress {
            Some(Activity::Initialization)
        } else if self.is_generating() || self.engine_busy {
            Some(Activity::Generation)
        } else if self.deleting {
            Some(Activity::Deletion)
        } else {
            None
        }
    }

    pub fn is_busy(&self) -> bool {
        self.active_activity().is_some()
    }

    pub fn is_model_ready(&self) -> bool {
        self.init == InitStatus::Ready
    }

    pub fn is_generating(&self) -> bool {
        self.generation == GenerationStatus::InProgress
    }

    /// Apply the start-of-activity transition. Callers have already checked
    /// that nothing else is running.
    pub(crate) fn begin(&mut self, activity: Activity) {
        self.last_error = None;
        match activity {
            Activity::Download => {
                self.download = DownloadStatus::InProgress { progress: 0.0 };
                self.needs_initialization = false;
            }
            Activity::Initialization => {
                self.init = InitStatus::InProgress;
                self.needs_initialization = false;
            }
            Activity::Generation => {
                self.generation = GenerationStatus::InProgress;
                self.partial_response = None;
                self.generation_id += 1;
                self.engine_busy = true;
            }
            Activity::Deletion => self.deleting = true,
        }
    }

    /// Settle an activity whose owner went away without publishing an outcome.
    /// Returns whether anything changed.
    pub(crate) fn abandon(&mut self, activity: Activity, generation_id: u64) -> bool {
        let interrupted = match activity {
            Activity::Download if self.download.is_in_progress() => {
                self.download = DownloadStatus::Failed;
                true
            }
            Activity::Initialization if self.init == InitStatus::InProgress => {
                self.init = InitStatus::Failed;
                true
            }
            Activity::Generation
                if self.is_generating() && self.generation_id == generation_id =>
            {
                self.generation = GenerationStatus::Idle;
                true
            }
            Activity::Deletion if self.deleting => {
                self.deleting = false;
                true
            }
            _ => false,
        };
        if interrupted && self.last_error.is_none() {
            self.last_error = Some(format!("The {activity} was interrupted."));
        }
        interrupted
    }

    /// Drop the claim an activity holds beyond its visible status.
    pub(crate) fn release(&mut self, activity: Activity, generation_id: u64) {
        if activity == Activity::Generation && self.generation_id == generation_id {
            self.engine_busy = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_state_is_idle() {
        let state = LifecycleState::new(PathBuf::from("/models/gemma.task"));
        assert_eq!(state.active_activity(), None);
        assert!(!state.is_model_ready());
        assert_eq!(state.download.progress(), 0.0);
    }

    #[test]
    fn test_begin_generation_clears_previous_output() {
        let mut state = LifecycleState::new(PathBuf::new());
        state.partial_response = Some("old answer".into());
        state.last_error = Some("Response generation stopped by user.".into());

        state.begin(Activity::Generation);

        assert_eq!(state.partial_response, None);
        assert_eq!(state.last_error, None);
        assert_eq!(state.generation_id, 1);
        assert_eq!(state.active_activity(), Some(Activity::Generation));
    }

    #[test]
    fn test_begin_download_resets_needs_initialization() {
        let mut state = LifecycleState::new(PathBuf::new());
        state.needs_initialization = true;
        state.begin(Activity::Download);
        assert!(!state.needs_initialization);
        assert_eq!(state.download, DownloadStatus::InProgress { progress: 0.0 });
    }

    #[test]
    fn test_abandon_ignores_newer_generation() {
        let mut state = LifecycleState::new(PathBuf::new());
        state.begin(Activity::Generation);
        state.begin(Activity::Generation);

        assert!(!state.abandon(Activity::Generation, 1));
        assert!(state.is_generating());
        assert!(state.abandon(Activity::Generation, 2));
        assert!(!state.is_generating());
    }

    #[test]
    fn test_engine_call_keeps_generation_claimed() {
        let mut state = LifecycleState::new(PathBuf::new());
        state.begin(Activity::Generation);
        state.generation = GenerationStatus::Idle;

        assert!(!state.is_generating());
        assert_eq!(state.active_activity(), Some(Activity::Generation));

        state.release(Activity::Generation, state.generation_id);
        assert_eq!(state.active_activity(), None);
    }

    #[test]
    fn test_deletion_is_an_activity() {
        let mut state = LifecycleState::new(PathBuf::new());
        state.begin(Activity::Deletion);
        assert_eq!(state.active_activity(), Some(Activity::Deletion));
        assert_eq!(Activity::Deletion.to_string(), "model deletion");

        assert!(state.abandon(Activity::Deletion, 0));
        assert!(!state.is_busy());
    }

    #[test]
    fn test_abandon_keeps_existing_error() {
        let mut state = LifecycleState::new(PathBuf::new());
        state.begin(Activity::Download);
        state.last_error = Some("Download failed: HTTP 500 - Internal Server Error".into());

        assert!(state.abandon(Activity::Download, 0));
        assert_eq!(state.download, DownloadStatus::Failed);
        assert_eq!(
            state.last_error.as_deref(),
            Some("Download failed: HTTP 500 - Internal Server Error")
        );
    }

    #[test]
    fn test_complete_download_reads_full_progress() {
        assert_eq!(DownloadStatus::Complete.progress(), 1.0);
    }

    #[test]
    fn test_download_status_serializes_tagged() {
        let json = serde_json::to_value(DownloadStatus::InProgress { progress: 0.25 }).unwrap();
        assert_eq!(json, serde_json::json!({"status": "in_progress", "progress": 0.25}));
    }
}
