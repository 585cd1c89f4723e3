use crate::{ChatError, Result};
use lumo_models::{ModelArtifact, DEFAULT_BUFFER_SIZE, DEFAULT_MODEL_FILE_NAME, DEFAULT_MODEL_URL};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_HISTORY_WINDOW: usize = 6;
pub const DEFAULT_IMAGE_PROMPT: &str = "Describe the circled region in the image.";

fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("lumo")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    pub model_url: String,
    pub model_file_name: String,
    pub models_dir: PathBuf,
    /// Side-loaded copy used when the app-managed file is absent.
    pub legacy_model_path: Option<PathBuf>,
    /// Token used when none is saved in the credential store.
    pub default_token: Option<String>,
    pub download_buffer_size: usize,
    pub history_window: usize,
    pub image_prompt: String,
    pub vision_enabled: bool,
    pub auto_initialize: bool,
    pub database_path: PathBuf,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            model_url: DEFAULT_MODEL_URL.to_string(),
            model_file_name: DEFAULT_MODEL_FILE_NAME.to_string(),
            models_dir: lumo_models::models_dir(),
            legacy_model_path: None,
            default_token: None,
            download_buffer_size: DEFAULT_BUFFER_SIZE,
            history_window: DEFAULT_HISTORY_WINDOW,
            image_prompt: DEFAULT_IMAGE_PROMPT.to_string(),
            vision_enabled: true,
            auto_initialize: true,
            database_path: data_dir().join("lumo.db"),
        }
    }
}

impl ChatConfig {
    pub fn default_path() -> PathBuf {
        data_dir().join("config.json")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ChatError::Config(format!("{}: {e}", path.display())))?;
        serde_json::from_str(&raw)
            .map_err(|e| ChatError::Config(format!("{}: {e}", path.display())))
    }

    /// Load `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            Ok(Self::default())
        }
    }

    pub fn artifact(&self) -> ModelArtifact {
        ModelArtifact {
            url: self.model_url.clone(),
            file_name: self.model_file_name.clone(),
        }
    }

    /// Where downloads are written.
    pub fn managed_model_path(&self) -> PathBuf {
        self.artifact().managed_path(&self.models_dir)
    }

    /// The artifact a new session starts with.
    pub fn discover_model_path(&self) -> PathBuf {
        lumo_models::discover_model_path(
            &self.managed_model_path(),
            self.legacy_model_path.as_deref(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ChatConfig::default();
        assert_eq!(config.download_buffer_size, 4096);
        assert_eq!(config.history_window, 6);
        assert!(config.vision_enabled);
        assert!(config.managed_model_path().ends_with("gemma-3n-E2B-it-int4.task"));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"history_window": 2, "auto_initialize": false}"#).unwrap();

        let config = ChatConfig::load(&path).unwrap();
        assert_eq!(config.history_window, 2);
        assert!(!config.auto_initialize);
        assert_eq!(config.image_prompt, DEFAULT_IMAGE_PROMPT);
    }

    #[test]
    fn test_malformed_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();

        assert!(matches!(ChatConfig::load(&path), Err(ChatError::Config(_))));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ChatConfig::load_or_default(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config, ChatConfig::default());
    }
}
