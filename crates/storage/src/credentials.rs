use crate::{Database, Result};
use std::sync::Arc;

/// Settings key holding the Hugging Face access token.
pub const HUGGINGFACE_TOKEN_KEY: &str = "huggingface_token";

/// Persistent home of the bearer token used for model downloads.
pub trait CredentialSource: Send + Sync {
    /// The saved token, or `None` if nothing non-blank is stored.
    fn read_token(&self) -> Result<Option<String>>;

    fn write_token(&self, token: &str) -> Result<()>;

    fn clear_token(&self) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct SettingsCredentialSource {
    db: Arc<Database>,
}

impl SettingsCredentialSource {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

impl CredentialSource for SettingsCredentialSource {
    fn read_token(&self) -> Result<Option<String>> {
        Ok(self
            .db
            .get_setting(HUGGINGFACE_TOKEN_KEY)?
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty()))
    }

    fn write_token(&self, token: &str) -> Result<()> {
        let token = token.trim();
        if token.is_empty() {
            return self.clear_token();
        }
        self.db.set_setting(HUGGINGFACE_TOKEN_KEY, token)?;
        tracing::info!("Saved access token");
        Ok(())
    }

    fn clear_token(&self) -> Result<()> {
        if self.db.delete_setting(HUGGINGFACE_TOKEN_KEY)? {
            tracing::info!("Cleared access token");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> SettingsCredentialSource {
        SettingsCredentialSource::new(Arc::new(Database::open_in_memory().unwrap()))
    }

    #[test]
    fn test_blank_token_reads_as_none() {
        let source = source();
        source.db.set_setting(HUGGINGFACE_TOKEN_KEY, "   ").unwrap();
        assert_eq!(source.read_token().unwrap(), None);
    }

    #[test]
    fn test_writing_blank_clears() {
        let source = source();
        source.write_token("hf_abc").unwrap();
        source.write_token("  ").unwrap();
        assert_eq!(source.read_token().unwrap(), None);
    }

    #[test]
    fn test_token_is_trimmed() {
        let source = source();
        source.write_token("  hf_abc\n").unwrap();
        assert_eq!(source.read_token().unwrap().as_deref(), Some("hf_abc"));
    }
}
