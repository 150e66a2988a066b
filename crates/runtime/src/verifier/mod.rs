//! Verification orchestrator
//!
//! Drives one scan from request to decision:
//!
//! 1. report the scan `in_progress`
//! 2. skip directions the scan mode does not cover (allowed)
//! 3. run deterministic signatures one by one, then one combined LLM request
//! 4. merge every verdict; no signatures at all blocks calls and allows
//!    responses
//! 5. escalate blocked verdicts to a human when enabled, re-reporting
//!    `in_progress` first
//! 6. report the terminal state and hand the record to the sink
//!
//! Failures in steps 3-4 end the scan in `error` with the same asymmetric
//! default as the zero-signature case.

pub mod context;

use std::sync::Arc;
use std::time::Instant;

pub use context::VerificationContext;

use crate::config::Settings;
use crate::escalation::EscalationChannel;
use crate::reporter::{ReporterEvent, ScanRecordSink, ScanReporter};
use crate::signatures::{DeterministicExecutor, EnabledSignatures, PredicateInput};
use crate::types::{
    ScanResult, ScanState, ServerInfo, SignatureVerification, SignatureVerificationMap,
    VerificationError, VerificationOutcome, VerificationRequest, VerificationResult,
    VerificationType, EVALUATOR_DETERMINISTIC, EVALUATOR_MANUAL,
};

/// Signature id of the synthetic verdict for skipped scans.
pub const VERIFICATION_SKIPPED: &str = "verification_skipped";
/// Signature id of the synthetic verdict when nothing is enabled.
pub const NO_SIGNATURES: &str = "no_signatures";
/// Signature id of the synthetic verdict for failed scans.
pub const VERIFICATION_ERROR: &str = "verification_error";
/// Signature id of a human override.
pub const USER_OVERRIDE: &str = "user_override";

/// Verification orchestrator
pub struct Verifier {
    reporter: Arc<dyn ScanReporter>,
    escalation: Arc<EscalationChannel>,
    executor: DeterministicExecutor,
    records: Option<Arc<dyn ScanRecordSink>>,
}

impl Verifier {
    /// Orchestrator reporting to `reporter`, escalating through a channel
    /// that shares it.
    pub fn new(reporter: Arc<dyn ScanReporter>) -> Self {
        Self {
            escalation: Arc::new(EscalationChannel::new(reporter.clone())),
            reporter,
            executor: DeterministicExecutor::default(),
            records: None,
        }
    }

    /// Orchestrator whose escalation channel uses the configured timeout.
    pub fn from_settings(reporter: Arc<dyn ScanReporter>, settings: &Settings) -> Self {
        let escalation = EscalationChannel::from_settings(reporter.clone(), &settings.escalation);
        Self::new(reporter).with_escalation(Arc::new(escalation))
    }

    pub fn with_escalation(mut self, escalation: Arc<EscalationChannel>) -> Self {
        self.escalation = escalation;
        self
    }

    pub fn with_executor(mut self, executor: DeterministicExecutor) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_record_sink(mut self, records: Arc<dyn ScanRecordSink>) -> Self {
        self.records = Some(records);
        self
    }

    /// Channel inbound alert responses are delivered to.
    pub fn escalation(&self) -> &Arc<EscalationChannel> {
        &self.escalation
    }

    /// Verify a tool call before it reaches the server.
    pub async fn verify_tool_call(
        &self,
        ctx: &VerificationContext,
        tool_name: &str,
        args: serde_json::Value,
        server_info: Option<ServerInfo>,
        user_intent: Option<String>,
    ) -> VerificationOutcome {
        let request = VerificationRequest::tool_call(tool_name, args)
            .with_server_info(server_info)
            .with_user_intent(user_intent);
        self.verify(ctx, request).await
    }

    /// Verify a tool response before it reaches the client.
    pub async fn verify_tool_response(
        &self,
        ctx: &VerificationContext,
        tool_name: &str,
        response: serde_json::Value,
        server_info: Option<ServerInfo>,
    ) -> VerificationOutcome {
        let request =
            VerificationRequest::tool_response(tool_name, response).with_server_info(server_info);
        self.verify(ctx, request).await
    }

    /// Run one scan to completion.
    pub async fn verify(
        &self,
        ctx: &VerificationContext,
        mut request: VerificationRequest,
    ) -> VerificationOutcome {
        let started = Instant::now();
        let mut scan = ScanResult::begin(&request);
        self.report(&scan).await;

        tracing::debug!(
            scan_id = %scan.id,
            tool = %request.tool_name,
            kind = %request.kind,
            "Scan started"
        );

        if let Some(reason) = ctx.settings.scan_mode.skip_reason(request.kind) {
            scan.record(
                SignatureVerificationMap::single(SignatureVerification::system(
                    VERIFICATION_SKIPPED,
                    "Verification skipped",
                    true,
                    reason,
                )),
                elapsed_ms(started),
            );
            return self.finish(scan, ScanState::Completed).await;
        }

        if request.tool_description.is_none() {
            request.tool_description =
                ctx.tool_description(request.server_info.as_ref(), &request.tool_name);
        }

        match self.evaluate(ctx, &request).await {
            Ok(verifications) => {
                scan.record(verifications, elapsed_ms(started));

                if !scan.allowed && ctx.settings.escalation.enabled {
                    self.escalate(&mut scan).await;
                }

                self.finish(scan, ScanState::Completed).await
            }
            Err(e) => {
                let allowed = request.kind.default_allowed();
                tracing::error!(
                    scan_id = %scan.id,
                    tool = %request.tool_name,
                    allowed,
                    "Verification failed: {}",
                    e
                );
                scan.record(
                    SignatureVerificationMap::single(SignatureVerification::system(
                        VERIFICATION_ERROR,
                        "Verification error",
                        allowed,
                        format!("Verification failed: {}", e),
                    )),
                    elapsed_ms(started),
                );
                self.finish(scan, ScanState::Error).await
            }
        }
    }

    async fn evaluate(
        &self,
        ctx: &VerificationContext,
        request: &VerificationRequest,
    ) -> VerificationResult<SignatureVerificationMap> {
        let enabled = ctx.enabled_signatures();

        if enabled.is_empty() {
            let allowed = request.kind.default_allowed();
            let reason = match request.kind {
                VerificationType::ToolCall => {
                    "No signatures to verify against, tool call blocked by default"
                }
                VerificationType::ToolResponse => {
                    "No signatures to verify against, tool response allowed by default"
                }
            };
            return Ok(SignatureVerificationMap::single(SignatureVerification::system(
                NO_SIGNATURES,
                "No signatures",
                allowed,
                reason,
            )));
        }

        let mut verifications = SignatureVerificationMap::new();

        let input = PredicateInput::new(request.tool_name.clone(), request.content.clone())
            .with_context(request.user_intent.clone(), request.tool_description.clone());
        for signature in &enabled.deterministic {
            let verdict = self
                .executor
                .execute(signature, &input, ctx.signatures_dir())
                .await;
            verifications.insert(SignatureVerification {
                signature_id: signature.id.clone(),
                signature_name: signature.name.clone(),
                allowed: verdict.allowed,
                reason: verdict.reason,
                model_name: EVALUATOR_DETERMINISTIC.to_string(),
            });
        }

        if !enabled.llm.is_empty() {
            let client = ctx.llm_client()?;
            let verdicts = client
                .verify_signatures(request, &enabled.llm, &ctx.settings.app)
                .await?;
            tracing::debug!(
                tool = %request.tool_name,
                model = %verdicts.model_name,
                allowed = verdicts.allowed(),
                "LLM verification finished"
            );
            verifications.extend(verdicts.verifications);
        }

        merge(&enabled, verifications)
    }

    async fn escalate(&self, scan: &mut ScanResult) {
        tracing::info!(
            scan_id = %scan.id,
            tool = %scan.tool_name,
            blocking = scan.signature_verifications.blocking().len(),
            "Operation blocked, escalating to user"
        );

        // Observers see the held scan before the alert
        self.report(scan).await;

        if self.escalation.request_decision(scan).await {
            scan.record_manual(SignatureVerification {
                signature_id: USER_OVERRIDE.to_string(),
                signature_name: "User override".to_string(),
                allowed: true,
                reason: "Allowed by the user after a security alert".to_string(),
                model_name: EVALUATOR_MANUAL.to_string(),
            });
        }
    }

    async fn finish(&self, mut scan: ScanResult, state: ScanState) -> VerificationOutcome {
        scan.finish(state);
        self.report(&scan).await;

        tracing::info!(
            scan_id = %scan.id,
            tool = %scan.tool_name,
            allowed = scan.allowed,
            state = %scan.state,
            scan_time_ms = scan.scan_time,
            "Scan finished"
        );

        let outcome = VerificationOutcome {
            scan_id: scan.id,
            allowed: scan.allowed,
            verification_map: scan.signature_verifications.clone(),
        };

        if let Some(records) = &self.records {
            if let Err(e) = records.store(scan).await {
                tracing::warn!(scan_id = %outcome.scan_id, "Failed to store scan record: {}", e);
            }
        }

        outcome
    }

    async fn report(&self, scan: &ScanResult) {
        self.reporter
            .report(ReporterEvent::ScanResult(scan.clone()))
            .await;
    }
}

/// Check that every enabled signature produced a verdict.
fn merge(
    enabled: &EnabledSignatures,
    verifications: SignatureVerificationMap,
) -> VerificationResult<SignatureVerificationMap> {
    let missing: Vec<&str> = enabled
        .ids()
        .into_iter()
        .filter(|id| !verifications.contains_signature(id))
        .collect();
    if !missing.is_empty() {
        return Err(VerificationError::InternalMerge(format!(
            "No verdict for signatures: {}",
            missing.join(", ")
        )));
    }
    Ok(verifications)
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ScanMode, Settings};
    use crate::llm::{LlmCompletion, LlmTransport, ScanMetadata, VerificationPrompt};
    use crate::reporter::{InMemoryScanRecordSink, MemoryReporter};
    use crate::signatures::{
        DeterministicSignature, LlmSignature, NativePredicates, Signature, SignatureStore,
    };
    use crate::types::EVALUATOR_SYSTEM;
    use async_trait::async_trait;
    use serde_json::json;

    struct FixedTransport(&'static str);

    #[async_trait]
    impl LlmTransport for FixedTransport {
        async fn complete(
            &self,
            _prompt: &VerificationPrompt,
            _metadata: &ScanMetadata,
        ) -> VerificationResult<LlmCompletion> {
            Ok(LlmCompletion {
                model_name: "fixed-model".into(),
                text: self.0.into(),
            })
        }

        fn name(&self) -> &str {
            "fixed"
        }
    }

    struct FailingTransport;

    #[async_trait]
    impl LlmTransport for FailingTransport {
        async fn complete(
            &self,
            _prompt: &VerificationPrompt,
            _metadata: &ScanMetadata,
        ) -> VerificationResult<LlmCompletion> {
            Err(VerificationError::Transport("connection refused".into()))
        }

        fn name(&self) -> &str {
            "failing"
        }
    }

    fn llm_signature(id: &str) -> Signature {
        Signature::Llm(LlmSignature {
            id: id.into(),
            name: id.into(),
            description: "d".into(),
            category: None,
            prompt: "p".into(),
        })
    }

    fn native_signature(id: &str, predicate: &str) -> Signature {
        Signature::Deterministic(DeterministicSignature {
            id: id.into(),
            name: id.into(),
            description: "d".into(),
            category: None,
            function_file: format!("native:{}", predicate),
        })
    }

    fn context(signatures: Vec<Signature>) -> VerificationContext {
        let mut settings = Settings::default();
        settings.escalation.enabled = false;
        VerificationContext::new(settings, Arc::new(SignatureStore::new(signatures).unwrap()))
    }

    fn verifier(reporter: Arc<MemoryReporter>) -> Verifier {
        let mut native = NativePredicates::new();
        native.register("allow", |_: &PredicateInput| json!(true));
        native.register("deny", |_: &PredicateInput| {
            json!({"allowed": false, "reason": "denied by predicate"})
        });
        Verifier::new(reporter).with_executor(DeterministicExecutor::new(native))
    }

    #[tokio::test]
    async fn zero_signatures_is_asymmetric() {
        let reporter = Arc::new(MemoryReporter::new());
        let verifier = verifier(reporter.clone());
        let ctx = context(vec![]);

        let call = verifier
            .verify_tool_call(&ctx, "exec", json!({}), None, None)
            .await;
        assert!(!call.allowed);
        assert_eq!(call.verification_map.len(), 1);
        assert!(
            !call
                .verification_map
                .get(NO_SIGNATURES, EVALUATOR_SYSTEM)
                .unwrap()
                .allowed
        );

        let response = verifier
            .verify_tool_response(&ctx, "exec", json!("ok"), None)
            .await;
        assert!(response.allowed);
        assert_eq!(response.verification_map.len(), 1);
    }

    #[tokio::test]
    async fn skipped_direction_is_allowed() {
        let reporter = Arc::new(MemoryReporter::new());
        let verifier = verifier(reporter.clone());
        let mut ctx = context(vec![native_signature("d", "deny")]);
        ctx.settings.scan_mode = ScanMode::ResponseOnly;

        let outcome = verifier
            .verify_tool_call(&ctx, "exec", json!({}), None, None)
            .await;
        assert!(outcome.allowed);
        let skipped = outcome
            .verification_map
            .get(VERIFICATION_SKIPPED, EVALUATOR_SYSTEM)
            .unwrap();
        assert!(skipped.reason.contains("RESPONSE_ONLY"));
        assert_eq!(
            reporter.states(outcome.scan_id),
            vec![ScanState::InProgress, ScanState::Completed]
        );
    }

    #[tokio::test]
    async fn deterministic_and_llm_verdicts_are_anded() {
        let reporter = Arc::new(MemoryReporter::new());
        let verifier = verifier(reporter.clone());
        let ctx = context(vec![native_signature("d", "allow"), llm_signature("l")])
            .with_transport(Arc::new(FixedTransport(
                "SIGNATURE ID: l\nALLOWED: false\nREASON: hidden instruction\n",
            )));

        let outcome = verifier
            .verify_tool_call(&ctx, "exec", json!({"cmd": "ls"}), None, None)
            .await;
        assert!(!outcome.allowed);
        assert!(outcome.verification_map.get("d", EVALUATOR_DETERMINISTIC).unwrap().allowed);
        let llm = outcome.verification_map.get("l", "fixed-model").unwrap();
        assert!(!llm.allowed);
        assert_eq!(llm.reason, "hidden instruction");
        assert_eq!(outcome.allowed, outcome.verification_map.all_allowed());
    }

    #[tokio::test]
    async fn llm_failure_follows_direction_policy() {
        let reporter = Arc::new(MemoryReporter::new());
        let sink = Arc::new(InMemoryScanRecordSink::new());
        let verifier = verifier(reporter.clone()).with_record_sink(sink.clone());
        let ctx = context(vec![llm_signature("l")]).with_transport(Arc::new(FailingTransport));

        let call = verifier
            .verify_tool_call(&ctx, "exec", json!({}), None, None)
            .await;
        assert!(!call.allowed);
        let entry = call
            .verification_map
            .get(VERIFICATION_ERROR, EVALUATOR_SYSTEM)
            .unwrap();
        assert!(entry.reason.contains("connection refused"));
        assert_eq!(
            reporter.states(call.scan_id),
            vec![ScanState::InProgress, ScanState::Error]
        );

        let response = verifier
            .verify_tool_response(&ctx, "exec", json!("data"), None)
            .await;
        assert!(response.allowed);
        assert_eq!(sink.get(response.scan_id).await.unwrap().state, ScanState::Error);
        assert_eq!(sink.records().await.len(), 2);
    }

    #[tokio::test]
    async fn missing_transport_is_an_error_scan() {
        let reporter = Arc::new(MemoryReporter::new());
        let verifier = verifier(reporter.clone());
        let ctx = context(vec![llm_signature("l")]);

        let outcome = verifier
            .verify_tool_call(&ctx, "exec", json!({}), None, None)
            .await;
        assert!(!outcome.allowed);
        let entry = outcome
            .verification_map
            .get(VERIFICATION_ERROR, EVALUATOR_SYSTEM)
            .unwrap();
        assert!(entry.reason.contains("Configuration error"));
    }

    #[test]
    fn merge_requires_every_signature() {
        let enabled = EnabledSignatures {
            deterministic: vec![],
            llm: vec![LlmSignature {
                id: "l".into(),
                name: "l".into(),
                description: "d".into(),
                category: None,
                prompt: "p".into(),
            }],
        };
        let err = merge(&enabled, SignatureVerificationMap::new()).unwrap_err();
        assert!(matches!(err, VerificationError::InternalMerge(_)));
    }
}
