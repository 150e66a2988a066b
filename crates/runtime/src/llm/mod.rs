//! LLM verification client
//!
//! Builds one combined prompt covering every enabled LLM signature, sends
//! it through the configured transport and parses the answer into
//! per-signature verdicts keyed by the model that produced them.

pub mod client;
pub mod parser;
pub mod prompt;

use std::sync::Arc;

pub use client::{
    select_transport, BackendTransport, LlmCompletion, LlmTransport, ProviderTransport,
    ScanMetadata,
};
pub use parser::parse_verdicts;
pub use prompt::{PromptDelimiters, VerificationPrompt};

use crate::config::{AppSettings, Settings};
use crate::signatures::LlmSignature;
use crate::types::{SignatureVerification, VerificationRequest, VerificationResult};

/// Parsed outcome of one LLM verification request
#[derive(Debug, Clone)]
pub struct LlmVerdicts {
    pub model_name: String,
    pub verifications: Vec<SignatureVerification>,
}

impl LlmVerdicts {
    /// AND over every signature verdict.
    pub fn allowed(&self) -> bool {
        self.verifications.iter().all(|v| v.allowed)
    }
}

/// Client issuing verification prompts over an [`LlmTransport`]
#[derive(Clone)]
pub struct LlmVerificationClient {
    transport: Arc<dyn LlmTransport>,
}

impl LlmVerificationClient {
    pub fn new(transport: Arc<dyn LlmTransport>) -> Self {
        Self { transport }
    }

    /// Client over the transport the settings select.
    pub fn from_settings(settings: &Settings) -> VerificationResult<Self> {
        Ok(Self::new(select_transport(settings)?))
    }

    /// Send the prompt for `request` and return the raw model answer.
    pub async fn verify(
        &self,
        request: &VerificationRequest,
        signatures: &[LlmSignature],
        app: &AppSettings,
    ) -> VerificationResult<LlmCompletion> {
        let prompt = VerificationPrompt::build(request, signatures);
        let info = request.server_info.clone().unwrap_or_default();
        let metadata = ScanMetadata {
            app_version: app.version.clone(),
            app_platform: app.platform.clone(),
            mcp_client: info.app_name,
            mcp_server: info.server_name,
            mcp_tool: request.tool_name.clone(),
        };

        tracing::debug!(
            tool = %request.tool_name,
            kind = %request.kind,
            signatures = signatures.len(),
            transport = self.transport.name(),
            "Sending LLM verification request"
        );

        self.transport.complete(&prompt, &metadata).await
    }

    /// Verify and parse the answer into one verdict per signature.
    pub async fn verify_signatures(
        &self,
        request: &VerificationRequest,
        signatures: &[LlmSignature],
        app: &AppSettings,
    ) -> VerificationResult<LlmVerdicts> {
        let completion = self.verify(request, signatures, app).await?;
        let verifications = parse_verdicts(&completion.text, signatures, &completion.model_name);
        Ok(LlmVerdicts {
            model_name: completion.model_name,
            verifications,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    struct ScriptedTransport {
        answer: String,
        seen: Mutex<Vec<(String, ScanMetadata)>>,
    }

    #[async_trait]
    impl LlmTransport for ScriptedTransport {
        async fn complete(
            &self,
            prompt: &VerificationPrompt,
            metadata: &ScanMetadata,
        ) -> VerificationResult<LlmCompletion> {
            self.seen
                .lock()
                .unwrap()
                .push((prompt.input.clone(), metadata.clone()));
            Ok(LlmCompletion {
                model_name: "scripted-model".into(),
                text: self.answer.clone(),
            })
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    fn signature(id: &str) -> LlmSignature {
        LlmSignature {
            id: id.into(),
            name: id.into(),
            description: "d".into(),
            category: None,
            prompt: "p".into(),
        }
    }

    #[tokio::test]
    async fn verdicts_are_keyed_by_model_and_anded() {
        let transport = Arc::new(ScriptedTransport {
            answer: "SIGNATURE ID: a\nALLOWED: true\nREASON: ok\nSIGNATURE ID: b\nALLOWED: false\nREASON: exfiltration\n".into(),
            seen: Mutex::new(Vec::new()),
        });
        let client = LlmVerificationClient::new(transport.clone());
        let request = VerificationRequest::tool_call("upload", json!({"f": 1})).with_server_info(Some(
            crate::types::ServerInfo::new("desktop-client", "files", "1.0"),
        ));

        let verdicts = client
            .verify_signatures(&request, &[signature("a"), signature("b")], &AppSettings::default())
            .await
            .unwrap();

        assert_eq!(verdicts.model_name, "scripted-model");
        assert!(!verdicts.allowed());
        assert_eq!(verdicts.verifications[1].reason, "exfiltration");

        let seen = transport.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].1.mcp_client, "desktop-client");
        assert_eq!(seen[0].1.mcp_server, "files");
        assert_eq!(seen[0].1.mcp_tool, "upload");
    }
}
