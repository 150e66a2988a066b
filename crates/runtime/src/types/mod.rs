//! Core types and data structures for tool-call verification

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

pub mod error;

pub use error::*;

/// Evaluator tag for verdicts produced by deterministic predicates.
pub const EVALUATOR_DETERMINISTIC: &str = "deterministic";
/// Evaluator tag for verdicts recorded from a human decision.
pub const EVALUATOR_MANUAL: &str = "manual";
/// Evaluator tag for default, skip and error verdicts.
pub const EVALUATOR_SYSTEM: &str = "system";

/// Unique identifier for scans
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScanId(pub Uuid);

impl ScanId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ScanId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ScanId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for security alerts awaiting a human decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AlertRequestId(pub Uuid);

impl AlertRequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AlertRequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for AlertRequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for AlertRequestId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Direction of the verified operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationType {
    ToolCall,
    ToolResponse,
}

impl VerificationType {
    pub fn is_response(&self) -> bool {
        matches!(self, VerificationType::ToolResponse)
    }

    /// Verdict applied when no definitive answer is available.
    ///
    /// Calls fail closed, responses fail open.
    pub fn default_allowed(&self) -> bool {
        self.is_response()
    }
}

impl std::fmt::Display for VerificationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VerificationType::ToolCall => write!(f, "tool_call"),
            VerificationType::ToolResponse => write!(f, "tool_response"),
        }
    }
}

/// Identity of the MCP client and server that carried the operation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub app_name: String,
    pub server_name: String,
    pub server_version: String,
}

impl ServerInfo {
    pub fn new(
        app_name: impl Into<String>,
        server_name: impl Into<String>,
        server_version: impl Into<String>,
    ) -> Self {
        Self {
            app_name: app_name.into(),
            server_name: server_name.into(),
            server_version: server_version.into(),
        }
    }
}

/// One tool call or tool response submitted for verification
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationRequest {
    #[serde(rename = "type")]
    pub kind: VerificationType,
    pub tool_name: String,
    /// Call arguments or response payload, opaque to the engine
    pub content: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_intent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_info: Option<ServerInfo>,
}

impl VerificationRequest {
    pub fn tool_call(tool_name: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            kind: VerificationType::ToolCall,
            tool_name: tool_name.into(),
            content: args,
            user_intent: None,
            tool_description: None,
            server_info: None,
        }
    }

    pub fn tool_response(tool_name: impl Into<String>, response: serde_json::Value) -> Self {
        Self {
            kind: VerificationType::ToolResponse,
            ..Self::tool_call(tool_name, response)
        }
    }

    pub fn with_user_intent(mut self, intent: Option<String>) -> Self {
        self.user_intent = intent;
        self
    }

    pub fn with_tool_description(mut self, description: Option<String>) -> Self {
        self.tool_description = description;
        self
    }

    pub fn with_server_info(mut self, info: Option<ServerInfo>) -> Self {
        self.server_info = info;
        self
    }

    /// Content rendered as text, strings are passed through unquoted.
    pub fn content_text(&self) -> String {
        match &self.content {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// Verdict of one signature against one request, from one evaluator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureVerification {
    pub signature_id: String,
    pub signature_name: String,
    pub allowed: bool,
    pub reason: String,
    /// Evaluator identity: a model name, `deterministic`, `manual` or `system`
    pub model_name: String,
}

impl SignatureVerification {
    /// Synthetic verdict attributed to the `system` evaluator.
    pub fn system(
        signature_id: impl Into<String>,
        signature_name: impl Into<String>,
        allowed: bool,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            signature_id: signature_id.into(),
            signature_name: signature_name.into(),
            allowed,
            reason: reason.into(),
            model_name: EVALUATOR_SYSTEM.to_string(),
        }
    }
}

/// signatureId -> evaluator -> verdict
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SignatureVerificationMap(BTreeMap<String, BTreeMap<String, SignatureVerification>>);

impl SignatureVerificationMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// A map holding exactly one verdict.
    pub fn single(verification: SignatureVerification) -> Self {
        let mut map = Self::new();
        map.insert(verification);
        map
    }

    /// Insert a verdict under its signature id and evaluator.
    ///
    /// Only an entry with the same signature id and evaluator is replaced.
    pub fn insert(&mut self, verification: SignatureVerification) {
        self.0
            .entry(verification.signature_id.clone())
            .or_default()
            .insert(verification.model_name.clone(), verification);
    }

    pub fn get(&self, signature_id: &str, evaluator: &str) -> Option<&SignatureVerification> {
        self.0.get(signature_id).and_then(|by_eval| by_eval.get(evaluator))
    }

    /// All verdicts recorded for a signature.
    pub fn for_signature(&self, signature_id: &str) -> Vec<&SignatureVerification> {
        self.0
            .get(signature_id)
            .map(|by_eval| by_eval.values().collect())
            .unwrap_or_default()
    }

    pub fn contains_signature(&self, signature_id: &str) -> bool {
        self.0.contains_key(signature_id)
    }

    pub fn entries(&self) -> impl Iterator<Item = &SignatureVerification> {
        self.0.values().flat_map(|by_eval| by_eval.values())
    }

    /// Number of individual verdicts across all signatures and evaluators.
    pub fn len(&self) -> usize {
        self.0.values().map(|by_eval| by_eval.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// AND over every verdict in the map.
    pub fn all_allowed(&self) -> bool {
        self.entries().all(|v| v.allowed)
    }

    /// Overall decision: manual verdicts, when present, take precedence over
    /// the automated ones; otherwise the AND over every verdict.
    pub fn decision(&self) -> bool {
        let mut manual = self
            .entries()
            .filter(|v| v.model_name == EVALUATOR_MANUAL)
            .peekable();
        if manual.peek().is_some() {
            manual.all(|v| v.allowed)
        } else {
            self.all_allowed()
        }
    }

    /// Verdicts that blocked the operation.
    pub fn blocking(&self) -> Vec<&SignatureVerification> {
        self.entries().filter(|v| !v.allowed).collect()
    }

    pub fn extend(&mut self, verifications: impl IntoIterator<Item = SignatureVerification>) {
        for verification in verifications {
            self.insert(verification);
        }
    }
}

/// Lifecycle state of a scan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanState {
    InProgress,
    Completed,
    Error,
}

impl ScanState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ScanState::InProgress)
    }
}

impl std::fmt::Display for ScanState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanState::InProgress => write!(f, "in_progress"),
            ScanState::Completed => write!(f, "completed"),
            ScanState::Error => write!(f, "error"),
        }
    }
}

/// The unit of record for one verified operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanResult {
    pub id: ScanId,
    pub date: DateTime<Utc>,
    pub app_name: String,
    pub server_name: String,
    pub server_version: String,
    pub tool_name: String,
    pub tool_args: String,
    pub allowed: bool,
    pub signature_verifications: SignatureVerificationMap,
    pub is_response: bool,
    /// Wall-clock verification time in milliseconds
    pub scan_time: u64,
    pub state: ScanState,
}

impl ScanResult {
    /// Open a new in-progress scan for a request.
    pub fn begin(request: &VerificationRequest) -> Self {
        let info = request.server_info.clone().unwrap_or_default();
        Self {
            id: ScanId::new(),
            date: Utc::now(),
            app_name: info.app_name,
            server_name: info.server_name,
            server_version: info.server_version,
            tool_name: request.tool_name.clone(),
            tool_args: request.content_text(),
            allowed: false,
            signature_verifications: SignatureVerificationMap::new(),
            is_response: request.kind.is_response(),
            scan_time: 0,
            state: ScanState::InProgress,
        }
    }

    /// Record the merged verdicts while keeping the scan in progress.
    pub fn record(&mut self, verifications: SignatureVerificationMap, scan_time_ms: u64) {
        self.allowed = verifications.decision();
        self.signature_verifications = verifications;
        self.scan_time = scan_time_ms;
    }

    /// Add a human verdict and recompute the decision.
    pub fn record_manual(&mut self, verification: SignatureVerification) {
        debug_assert_eq!(verification.model_name, EVALUATOR_MANUAL);
        self.signature_verifications.insert(verification);
        self.allowed = self.signature_verifications.decision();
    }

    /// Move the scan to a terminal state.
    pub fn finish(&mut self, state: ScanState) {
        debug_assert!(state.is_terminal());
        self.state = state;
    }
}

/// Decision handed back to the proxy layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationOutcome {
    pub scan_id: ScanId,
    pub allowed: bool,
    pub verification_map: SignatureVerificationMap,
}
