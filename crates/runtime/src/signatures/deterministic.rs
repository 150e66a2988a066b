//! Deterministic signature execution
//!
//! A deterministic signature references a predicate that is evaluated
//! locally against the tool name, the tool input and the call context.
//! Predicates come from pluggable [`PredicateEvaluator`]s: compiled Rust
//! predicates registered under `native:<name>`, and (with the
//! `cel-predicates` feature) CEL expressions read from
//! `<signatures_dir>/deterministic/<file>`. File-backed predicates are read
//! fresh on every invocation so edits apply without a restart.
//!
//! Every failure is converted into a denying verdict for that signature
//! alone. A missing signatures directory denies every file-backed
//! predicate; native predicates are compiled in and do not read it, so they
//! still run.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;

use super::helpers;
use super::DeterministicSignature;
use crate::types::{VerificationError, VerificationResult};

/// Prefix of predicate references resolved by [`NativePredicates`].
pub const NATIVE_PREFIX: &str = "native:";

const GENERIC_ALLOW_REASON: &str = "Deterministic signature check passed";
const GENERIC_DENY_REASON: &str = "Deterministic signature check failed";

/// Everything a predicate may inspect
#[derive(Debug, Clone)]
pub struct PredicateInput {
    pub tool_name: String,
    pub tool_input: Value,
    pub user_intent: Option<String>,
    pub tool_description: Option<String>,
}

impl PredicateInput {
    pub fn new(tool_name: impl Into<String>, tool_input: Value) -> Self {
        Self {
            tool_name: tool_name.into(),
            tool_input,
            user_intent: None,
            tool_description: None,
        }
    }

    pub fn with_context(
        mut self,
        user_intent: Option<String>,
        tool_description: Option<String>,
    ) -> Self {
        self.user_intent = user_intent;
        self.tool_description = tool_description;
        self
    }

    /// The `context` object handed to predicates.
    pub fn context_value(&self) -> Value {
        json!({
            "userIntent": self.user_intent,
            "toolDescription": self.tool_description,
        })
    }

    /// Tool input flattened to text for keyword and pattern checks.
    pub fn input_text(&self) -> String {
        helpers::searchable_text(&self.tool_input)
    }
}

/// Normalized outcome of one deterministic signature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeterministicVerdict {
    pub allowed: bool,
    pub reason: String,
}

impl DeterministicVerdict {
    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
        }
    }

    /// Normalize a raw predicate return value.
    ///
    /// Booleans map to a generic reason, objects carrying a boolean
    /// `allowed` pass through, anything else is denied.
    pub fn from_output(output: &Value) -> Self {
        match output {
            Value::Bool(allowed) => Self {
                allowed: *allowed,
                reason: if *allowed {
                    GENERIC_ALLOW_REASON.to_string()
                } else {
                    GENERIC_DENY_REASON.to_string()
                },
            },
            Value::Object(obj) => match obj.get("allowed").and_then(Value::as_bool) {
                Some(allowed) => Self {
                    allowed,
                    reason: obj
                        .get("reason")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(|| {
                            if allowed {
                                GENERIC_ALLOW_REASON.to_string()
                            } else {
                                GENERIC_DENY_REASON.to_string()
                            }
                        }),
                },
                None => Self::deny("Signature function returned an invalid return type"),
            },
            _ => Self::deny("Signature function returned an invalid return type"),
        }
    }
}

/// Source of predicate implementations
#[async_trait]
pub trait PredicateEvaluator: Send + Sync {
    /// Whether this evaluator resolves the given predicate reference.
    fn supports(&self, function_ref: &str) -> bool;

    /// Run the predicate and return its raw output.
    async fn evaluate(
        &self,
        signature: &DeterministicSignature,
        input: &PredicateInput,
        signatures_dir: Option<&Path>,
    ) -> VerificationResult<Value>;

    /// Evaluator name for logging.
    fn name(&self) -> &str;
}

/// Compiled predicate
pub type NativePredicate = Arc<dyn Fn(&PredicateInput) -> Value + Send + Sync>;

/// Registry of compiled predicates, referenced as `native:<name>`
#[derive(Clone, Default)]
pub struct NativePredicates {
    predicates: HashMap<String, NativePredicate>,
}

impl NativePredicates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-loaded with the built-in predicates.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for (name, pattern, reason) in default_rules() {
            registry.register(name, move |input: &PredicateInput| {
                if helpers::matches_pattern(&input.input_text(), pattern) {
                    json!({ "allowed": false, "reason": reason })
                } else {
                    json!(true)
                }
            });
        }
        registry
    }

    /// Register a predicate under `name` (without the `native:` prefix).
    pub fn register<F>(&mut self, name: impl Into<String>, predicate: F)
    where
        F: Fn(&PredicateInput) -> Value + Send + Sync + 'static,
    {
        self.predicates.insert(name.into(), Arc::new(predicate));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.predicates.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.predicates.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for NativePredicates {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativePredicates")
            .field("predicates", &self.names())
            .finish()
    }
}

/// Built-in patterns, matched against the flattened tool input.
fn default_rules() -> Vec<(&'static str, &'static str, &'static str)> {
    vec![
        (
            "pipe_to_shell",
            r"(curl|wget)\s+[^|]*\|\s*(ba|z)?sh\b",
            "Piping downloaded content to a shell is a code execution risk",
        ),
        (
            "destructive_delete",
            r"rm\s+-(rf|fr|r)\s+(/|~)",
            "Recursive deletion from the root or home directory is destructive",
        ),
        (
            "private_key_access",
            r"(?i)(\.ssh/id_(rsa|dsa|ecdsa|ed25519)|BEGIN (RSA |EC |OPENSSH )?PRIVATE KEY)",
            "Accessing private key material is not allowed",
        ),
        (
            "env_file_access",
            r"(?i)(^|[/\\\s])\.env\b",
            "References to .env files may leak secrets",
        ),
        (
            "base64_to_shell",
            r"(?i)base64\s+(-d|--decode).*\|\s*(ba)?sh",
            "Decoding base64 into a shell is an obfuscation technique",
        ),
    ]
}

#[async_trait]
impl PredicateEvaluator for NativePredicates {
    fn supports(&self, function_ref: &str) -> bool {
        function_ref.starts_with(NATIVE_PREFIX)
    }

    async fn evaluate(
        &self,
        signature: &DeterministicSignature,
        input: &PredicateInput,
        _signatures_dir: Option<&Path>,
    ) -> VerificationResult<Value> {
        let name = signature
            .function_file
            .strip_prefix(NATIVE_PREFIX)
            .unwrap_or(&signature.function_file);

        let predicate =
            self.predicates
                .get(name)
                .ok_or_else(|| VerificationError::SignatureLoad {
                    signature_id: signature.id.clone(),
                    reason: format!("No native predicate registered as '{}'", name),
                })?;

        std::panic::catch_unwind(AssertUnwindSafe(|| predicate(input))).map_err(|_| {
            VerificationError::SignatureExecution {
                signature_id: signature.id.clone(),
                reason: format!("Native predicate '{}' panicked", name),
            }
        })
    }

    fn name(&self) -> &str {
        "native"
    }
}

/// Runs deterministic signatures through the first evaluator that supports
/// their predicate reference
#[derive(Clone)]
pub struct DeterministicExecutor {
    evaluators: Vec<Arc<dyn PredicateEvaluator>>,
}

impl DeterministicExecutor {
    /// Executor over the given native registry plus file-backed CEL
    /// predicates when that feature is enabled.
    pub fn new(native: NativePredicates) -> Self {
        #[allow(unused_mut)]
        let mut evaluators: Vec<Arc<dyn PredicateEvaluator>> = vec![Arc::new(native)];
        #[cfg(feature = "cel-predicates")]
        evaluators.push(Arc::new(super::cel::CelPredicates::new()));
        Self { evaluators }
    }

    /// Executor with no evaluators; add them with [`Self::with_evaluator`].
    pub fn empty() -> Self {
        Self {
            evaluators: Vec::new(),
        }
    }

    pub fn with_evaluator(mut self, evaluator: Arc<dyn PredicateEvaluator>) -> Self {
        self.evaluators.push(evaluator);
        self
    }

    /// Execute one signature. Never fails: errors become denying verdicts.
    pub async fn execute(
        &self,
        signature: &DeterministicSignature,
        input: &PredicateInput,
        signatures_dir: Option<&Path>,
    ) -> DeterministicVerdict {
        match self.run(signature, input, signatures_dir).await {
            Ok(output) => {
                let verdict = DeterministicVerdict::from_output(&output);
                tracing::debug!(
                    signature_id = %signature.id,
                    tool = %input.tool_name,
                    allowed = verdict.allowed,
                    "Deterministic signature evaluated"
                );
                verdict
            }
            Err(e) => {
                tracing::warn!(
                    signature_id = %signature.id,
                    tool = %input.tool_name,
                    "Deterministic signature failed closed: {}",
                    e
                );
                DeterministicVerdict::deny(e.to_string())
            }
        }
    }

    async fn run(
        &self,
        signature: &DeterministicSignature,
        input: &PredicateInput,
        signatures_dir: Option<&Path>,
    ) -> VerificationResult<Value> {
        let evaluator = self
            .evaluators
            .iter()
            .find(|e| e.supports(&signature.function_file))
            .ok_or_else(|| VerificationError::SignatureLoad {
                signature_id: signature.id.clone(),
                reason: format!(
                    "No predicate evaluator available for '{}'",
                    signature.function_file
                ),
            })?;

        evaluator.evaluate(signature, input, signatures_dir).await
    }
}

impl Default for DeterministicExecutor {
    fn default() -> Self {
        Self::new(NativePredicates::with_defaults())
    }
}
