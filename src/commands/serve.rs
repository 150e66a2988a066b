//! Line-delimited JSON bridge for the intercepting proxy
//!
//! Inbound on stdin: `TOOL_CALL`, `TOOL_RESPONSE`, `SECURITY_ALERT_RESPONSE`.
//! Outbound on stdout: `SCAN_RESULT`, `SHOW_SECURITY_ALERT`,
//! `VERIFICATION_DECISION`. Every message is `{"type": ..., "data": ...}`.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use toolwarden_runtime::escalation::SecurityAlertResponse;
use toolwarden_runtime::{
    ChannelReporter, CompositeReporter, JsonLinesReporter, ScanId, ScanReporter, ServerInfo,
    SignatureVerificationMap, VerificationContext, VerificationOutcome, VerificationRequest,
    Verifier,
};

const OUTBOUND_CAPACITY: usize = 1024;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolCallMessage {
    /// Correlates the decision with the proxy's pending call
    id: String,
    tool_name: String,
    #[serde(default)]
    arguments: serde_json::Value,
    #[serde(default)]
    server_info: Option<ServerInfo>,
    #[serde(default)]
    user_intent: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolResponseMessage {
    id: String,
    tool_name: String,
    #[serde(default)]
    response: serde_json::Value,
    #[serde(default)]
    server_info: Option<ServerInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
enum InboundMessage {
    ToolCall(ToolCallMessage),
    ToolResponse(ToolResponseMessage),
    SecurityAlertResponse(SecurityAlertResponse),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VerificationDecision {
    id: String,
    scan_id: ScanId,
    allowed: bool,
    verification_map: SignatureVerificationMap,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
enum OutboundMessage {
    VerificationDecision(VerificationDecision),
}

impl VerificationDecision {
    fn new(id: String, outcome: VerificationOutcome) -> Self {
        Self {
            id,
            scan_id: outcome.scan_id,
            allowed: outcome.allowed,
            verification_map: outcome.verification_map,
        }
    }
}

/// Run the stdio bridge until stdin closes.
pub async fn run(sources: &super::Sources, events: Option<PathBuf>) -> Result<()> {
    let ctx = Arc::new(sources.context()?);

    let (lines_tx, lines_rx) = mpsc::channel::<String>(OUTBOUND_CAPACITY);
    let writer = tokio::spawn(write_lines(lines_rx));

    let (channel_reporter, mut events_rx) = ChannelReporter::channel(OUTBOUND_CAPACITY);
    let mut reporter = CompositeReporter::new(vec![Arc::new(channel_reporter)]);
    if let Some(path) = events {
        reporter.push(Arc::new(JsonLinesReporter::new(Some(path))));
    }
    let reporter: Arc<dyn ScanReporter> = Arc::new(reporter);

    {
        let lines_tx = lines_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                match serde_json::to_string(&event) {
                    Ok(line) => {
                        if lines_tx.send(line).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::warn!("Failed to encode scan event: {}", e),
                }
            }
        });
    }

    let verifier = Arc::new(Verifier::from_settings(reporter, &ctx.settings));
    tracing::info!(
        "Serving verifications on stdio: scan_mode={} signatures={}",
        ctx.settings.scan_mode,
        ctx.signatures.len()
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match serde_json::from_str::<InboundMessage>(line) {
            Ok(InboundMessage::ToolCall(msg)) => {
                let request = VerificationRequest::tool_call(msg.tool_name, msg.arguments)
                    .with_server_info(msg.server_info)
                    .with_user_intent(msg.user_intent);
                spawn_verification(&verifier, &ctx, &lines_tx, msg.id, request);
            }
            Ok(InboundMessage::ToolResponse(msg)) => {
                let request = VerificationRequest::tool_response(msg.tool_name, msg.response)
                    .with_server_info(msg.server_info);
                spawn_verification(&verifier, &ctx, &lines_tx, msg.id, request);
            }
            Ok(InboundMessage::SecurityAlertResponse(response)) => {
                verifier.escalation().handle_response(response);
            }
            Err(e) => tracing::warn!("Ignoring malformed message: {}", e),
        }
    }

    tracing::info!("stdin closed, waiting for in-flight output");
    drop(lines_tx);
    drop(verifier);
    if let Err(e) = writer.await {
        tracing::warn!("Output writer stopped: {}", e);
    }
    Ok(())
}

fn spawn_verification(
    verifier: &Arc<Verifier>,
    ctx: &Arc<VerificationContext>,
    lines_tx: &mpsc::Sender<String>,
    id: String,
    request: VerificationRequest,
) {
    let verifier = verifier.clone();
    let ctx = ctx.clone();
    let lines_tx = lines_tx.clone();
    tokio::spawn(async move {
        let outcome = verifier.verify(&ctx, request).await;
        let message = OutboundMessage::VerificationDecision(VerificationDecision::new(id, outcome));
        match serde_json::to_string(&message) {
            Ok(line) => {
                if lines_tx.send(line).await.is_err() {
                    tracing::warn!("Output closed before decision was written");
                }
            }
            Err(e) => tracing::warn!("Failed to encode decision: {}", e),
        }
    });
}

async fn write_lines(mut rx: mpsc::Receiver<String>) {
    let mut stdout = tokio::io::stdout();
    while let Some(line) = rx.recv().await {
        let written = async {
            stdout.write_all(line.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await
        }
        .await;
        if let Err(e) = written {
            tracing::warn!("Failed to write to stdout: {}", e);
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_inbound_messages() {
        let call: InboundMessage = serde_json::from_str(
            r#"{"type": "TOOL_CALL", "data": {"id": "1", "toolName": "read", "arguments": {"path": "/tmp"}, "userIntent": "look"}}"#,
        )
        .unwrap();
        assert!(matches!(call, InboundMessage::ToolCall(ref m) if m.user_intent.as_deref() == Some("look")));

        let response: InboundMessage = serde_json::from_str(
            r#"{"type": "TOOL_RESPONSE", "data": {"id": "2", "toolName": "read", "response": "ok"}}"#,
        )
        .unwrap();
        assert!(matches!(response, InboundMessage::ToolResponse(_)));

        let alert: InboundMessage = serde_json::from_str(
            r#"{"type": "SECURITY_ALERT_RESPONSE", "data": {"requestId": "67e55044-10b1-426f-9247-bb680e5fe0c8", "allowed": true}}"#,
        )
        .unwrap();
        assert!(matches!(alert, InboundMessage::SecurityAlertResponse(r) if r.allowed));
    }

    #[test]
    fn decision_wire_format() {
        let message = OutboundMessage::VerificationDecision(VerificationDecision {
            id: "7".to_string(),
            scan_id: ScanId::new(),
            allowed: false,
            verification_map: SignatureVerificationMap::new(),
        });
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["type"], "VERIFICATION_DECISION");
        assert_eq!(value["data"]["id"], "7");
        assert_eq!(value["data"]["allowed"], false);
        assert!(value["data"]["scanId"].is_string());
    }
}
