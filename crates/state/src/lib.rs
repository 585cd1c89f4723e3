//! Lifecycle state store.
//!
//! Holds the single observable record of what the orchestrator is doing:
//! downloading, initializing, generating, or idle, plus the last error and the
//! streamed partial response. Components mutate it only through
//! [`LifecycleStore::update`] and friends; the UI reads snapshots.

mod status;
mod store;

pub use status::{Activity, DownloadStatus, GenerationStatus, InitStatus, LifecycleState};
pub use store::{ActivityGuard, Busy, LifecycleStore};
