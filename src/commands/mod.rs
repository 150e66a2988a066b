pub mod check;
pub mod serve;
pub mod signatures;

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use toolwarden_runtime::{Settings, SignatureStore, ToolRegistry, VerificationContext};

const SIGNATURES_FILE: &str = "signatures.json";

/// Where settings, signatures and tool indexes come from
pub struct Sources {
    pub config: Option<PathBuf>,
    pub signatures: Option<PathBuf>,
    pub tools: Option<PathBuf>,
}

impl Sources {
    /// Settings file (or defaults) with environment overrides applied.
    pub fn settings(&self) -> Result<Settings> {
        let mut settings = match &self.config {
            Some(path) => Settings::from_file(path)
                .with_context(|| format!("Failed to load settings from {}", path.display()))?,
            None => Settings::default(),
        };
        settings.apply_env()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Signatures from the explicit file, else from the signatures directory.
    pub fn signature_store(&self, settings: &Settings) -> Result<SignatureStore> {
        let path = self.signatures.clone().or_else(|| {
            settings
                .signatures_dir
                .as_ref()
                .map(|dir| dir.join(SIGNATURES_FILE))
                .filter(|path| path.exists())
        });

        match path {
            Some(path) => {
                let store = SignatureStore::from_file(&path)?;
                tracing::info!("Loaded {} signatures from {}", store.len(), path.display());
                Ok(store)
            }
            None => {
                tracing::warn!("No signature definitions found, verifying with none");
                Ok(SignatureStore::default())
            }
        }
    }

    pub fn tool_registry(&self) -> Result<ToolRegistry> {
        match &self.tools {
            Some(path) => Ok(ToolRegistry::from_file(path)?),
            None => Ok(ToolRegistry::new()),
        }
    }

    pub fn context(&self) -> Result<VerificationContext> {
        let settings = self.settings()?;
        let signatures = self.signature_store(&settings)?;
        let tools = self.tool_registry()?;
        Ok(VerificationContext::new(settings, Arc::new(signatures)).with_tools(Arc::new(tools)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signatures_default_to_signatures_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(SIGNATURES_FILE),
            r#"[{"type": "deterministic", "id": "d", "name": "d", "description": "d", "functionFile": "native:pipe_to_shell"}]"#,
        )
        .unwrap();

        let mut settings = Settings::default();
        settings.signatures_dir = Some(dir.path().to_path_buf());
        let sources = Sources {
            config: None,
            signatures: None,
            tools: None,
        };
        let store = sources.signature_store(&settings).unwrap();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn missing_definitions_give_an_empty_store() {
        let sources = Sources {
            config: None,
            signatures: None,
            tools: None,
        };
        let store = sources.signature_store(&Settings::default()).unwrap();
        assert!(store.is_empty());
    }
}
