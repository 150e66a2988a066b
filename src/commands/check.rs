use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use toolwarden_runtime::{
    JsonLinesReporter, NullReporter, ScanReporter, ServerInfo, VerificationRequest, Verifier,
};

use super::Sources;

/// Arguments of a one-shot verification
pub struct CheckRequest {
    pub tool: String,
    pub args: String,
    pub response: bool,
    pub intent: Option<String>,
    pub app: Option<String>,
    pub server: Option<String>,
    pub server_version: Option<String>,
    pub events: Option<PathBuf>,
}

impl CheckRequest {
    fn to_verification_request(&self) -> Result<VerificationRequest> {
        let content: serde_json::Value = serde_json::from_str(&self.args)
            .with_context(|| format!("--args is not valid JSON: {}", self.args))?;

        let server_info = if self.app.is_some() || self.server.is_some() {
            Some(ServerInfo::new(
                self.app.clone().unwrap_or_default(),
                self.server.clone().unwrap_or_default(),
                self.server_version.clone().unwrap_or_default(),
            ))
        } else {
            None
        };

        let request = if self.response {
            VerificationRequest::tool_response(&self.tool, content)
        } else {
            VerificationRequest::tool_call(&self.tool, content).with_user_intent(self.intent.clone())
        };
        Ok(request.with_server_info(server_info))
    }
}

/// Verify one operation, print the outcome and return the decision.
pub async fn run(sources: &Sources, check: CheckRequest) -> Result<bool> {
    let mut ctx = sources.context()?;
    // Nobody can answer an alert in one-shot mode
    ctx.settings.escalation.enabled = false;

    let reporter: Arc<dyn ScanReporter> = match &check.events {
        Some(path) => Arc::new(JsonLinesReporter::new(Some(path.clone()))),
        None => Arc::new(NullReporter),
    };
    let verifier = Verifier::new(reporter);

    let outcome = verifier
        .verify(&ctx, check.to_verification_request()?)
        .await;

    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(outcome.allowed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(args: &str, response: bool) -> CheckRequest {
        CheckRequest {
            tool: "read_file".to_string(),
            args: args.to_string(),
            response,
            intent: Some("read notes".to_string()),
            app: None,
            server: Some("fs".to_string()),
            server_version: None,
            events: None,
        }
    }

    #[test]
    fn builds_tool_call_request() {
        let request = check(r#"{"path": "notes.txt"}"#, false)
            .to_verification_request()
            .unwrap();
        assert!(!request.kind.is_response());
        assert_eq!(request.user_intent.as_deref(), Some("read notes"));
        assert_eq!(request.server_info.unwrap().server_name, "fs");
    }

    #[test]
    fn responses_carry_no_intent() {
        let request = check(r#""contents""#, true).to_verification_request().unwrap();
        assert!(request.kind.is_response());
        assert!(request.user_intent.is_none());
    }

    #[test]
    fn rejects_invalid_json() {
        assert!(check("{not json", false).to_verification_request().is_err());
    }
}
