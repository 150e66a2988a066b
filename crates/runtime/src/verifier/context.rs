//! Verification context handed to every orchestrator call

use std::path::Path;
use std::sync::Arc;

use crate::config::Settings;
use crate::llm::{LlmTransport, LlmVerificationClient};
use crate::registry::ToolRegistry;
use crate::signatures::{EnabledSignatures, SignatureStore};
use crate::types::{ServerInfo, VerificationResult};

/// Settings, signatures and tool indexes a verification runs against
#[derive(Clone)]
pub struct VerificationContext {
    pub settings: Settings,
    pub signatures: Arc<SignatureStore>,
    pub tools: Arc<ToolRegistry>,
    /// Overrides the transport the settings would select
    pub transport: Option<Arc<dyn LlmTransport>>,
}

impl VerificationContext {
    pub fn new(settings: Settings, signatures: Arc<SignatureStore>) -> Self {
        Self {
            settings,
            signatures,
            tools: Arc::new(ToolRegistry::new()),
            transport: None,
        }
    }

    pub fn with_tools(mut self, tools: Arc<ToolRegistry>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn LlmTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Signatures not disabled in the settings.
    pub fn enabled_signatures(&self) -> EnabledSignatures {
        self.signatures
            .partition_enabled(&self.settings.disabled_signatures)
    }

    pub fn signatures_dir(&self) -> Option<&Path> {
        self.settings.signatures_dir.as_deref()
    }

    pub fn tool_description(&self, server_info: Option<&ServerInfo>, tool_name: &str) -> Option<String> {
        self.tools.describe(server_info, tool_name)
    }

    /// LLM client over the override transport, or the one the settings select.
    pub fn llm_client(&self) -> VerificationResult<LlmVerificationClient> {
        match &self.transport {
            Some(transport) => Ok(LlmVerificationClient::new(transport.clone())),
            None => LlmVerificationClient::from_settings(&self.settings),
        }
    }
}

impl std::fmt::Debug for VerificationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerificationContext")
            .field("scan_mode", &self.settings.scan_mode)
            .field("signatures", &self.signatures.len())
            .field("tool_servers", &self.tools.server_count())
            .field("transport", &self.transport.as_ref().map(|t| t.name().to_string()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LlmProviderKind;
    use crate::signatures::{LlmSignature, Signature};

    #[test]
    fn disabled_signatures_are_filtered() {
        let store = SignatureStore::new(vec![Signature::Llm(LlmSignature {
            id: "s".into(),
            name: "s".into(),
            description: "d".into(),
            category: None,
            prompt: "p".into(),
        })])
        .unwrap();
        let mut settings = Settings::default();
        settings.set_signature_enabled("s", false);

        let ctx = VerificationContext::new(settings, Arc::new(store));
        assert!(ctx.enabled_signatures().is_empty());
    }

    #[test]
    fn llm_client_requires_a_transport() {
        let mut settings = Settings::default();
        settings.llm.provider = LlmProviderKind::OpenRouter;
        let ctx = VerificationContext::new(settings, Arc::new(SignatureStore::default()));
        assert!(ctx.llm_client().is_err());
    }
}
