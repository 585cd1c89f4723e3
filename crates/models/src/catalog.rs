use std::path::{Path, PathBuf};

pub const DEFAULT_MODEL_URL: &str = "https://huggingface.co/google/gemma-3n-E2B-it-litert-preview/resolve/main/gemma-3n-E2B-it-int4.task";
pub const DEFAULT_MODEL_FILE_NAME: &str = "gemma-3n-E2B-it-int4.task";

/// A downloadable model file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelArtifact {
    pub url: String,
    pub file_name: String,
}

impl Default for ModelArtifact {
    fn default() -> Self {
        Self {
            url: DEFAULT_MODEL_URL.to_string(),
            file_name: DEFAULT_MODEL_FILE_NAME.to_string(),
        }
    }
}

impl ModelArtifact {
    /// Where the app keeps this artifact inside `models_dir`.
    pub fn managed_path(&self, models_dir: &Path) -> PathBuf {
        models_dir.join(&self.file_name)
    }
}

pub fn models_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("lumo")
        .join("models")
}

/// Pick the artifact the session should use.
///
/// The app-managed copy wins, then a side-loaded legacy copy. When neither
/// exists the managed path is returned so a later download lands there.
pub fn discover_model_path(managed: &Path, legacy: Option<&Path>) -> PathBuf {
    if managed.is_file() {
        return managed.to_path_buf();
    }
    match legacy {
        Some(legacy) if legacy.is_file() => {
            tracing::info!(path = %legacy.display(), "Using side-loaded model");
            legacy.to_path_buf()
        }
        _ => managed.to_path_buf(),
    }
}

/// Delete a model file. Returns `false` if there was nothing to delete.
pub async fn remove_artifact(path: &Path) -> std::io::Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            tracing::info!(path = %path.display(), "Model file deleted");
            Ok(true)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
