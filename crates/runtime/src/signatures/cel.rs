//! File-backed CEL predicates
//!
//! A predicate file holds one CEL expression evaluated with these
//! variables in scope:
//!
//! - `toolName`: the tool being called
//! - `toolInput`: arguments (tool call) or response payload (tool response)
//! - `context`: `{ userIntent, toolDescription }`, either may be null
//!
//! plus the helper functions `isString`, `isObject`, `isArray`,
//! `hasProperty`, `matchesPattern` and `containsKeyword`. The expression
//! must yield a bool or a map with a boolean `allowed` and optional
//! `reason`.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use super::deterministic::{PredicateEvaluator, PredicateInput, NATIVE_PREFIX};
use super::helpers;
use super::DeterministicSignature;
use crate::types::{VerificationError, VerificationResult};

/// Subdirectory of the signatures directory holding predicate files.
pub const PREDICATE_SUBDIR: &str = "deterministic";

/// Evaluates CEL predicates read from disk on every call
#[derive(Debug, Clone, Default)]
pub struct CelPredicates;

impl CelPredicates {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PredicateEvaluator for CelPredicates {
    fn supports(&self, function_ref: &str) -> bool {
        !function_ref.starts_with(NATIVE_PREFIX)
    }

    async fn evaluate(
        &self,
        signature: &DeterministicSignature,
        input: &PredicateInput,
        signatures_dir: Option<&Path>,
    ) -> VerificationResult<Value> {
        let path = resolve_predicate_path(signature, signatures_dir)?;

        let source = match tokio::fs::read_to_string(&path).await {
            Ok(source) => source,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(VerificationError::SignatureLoad {
                    signature_id: signature.id.clone(),
                    reason: format!("Signature function file not found: {}", path.display()),
                });
            }
            Err(e) => {
                return Err(VerificationError::SignatureLoad {
                    signature_id: signature.id.clone(),
                    reason: format!("Failed to read {}: {}", path.display(), e),
                });
            }
        };

        evaluate_source(&signature.id, &source, input)
    }

    fn name(&self) -> &str {
        "cel"
    }
}

/// Resolve `<dir>/deterministic/<function_file>`, refusing paths that leave
/// the predicate directory.
fn resolve_predicate_path(
    signature: &DeterministicSignature,
    signatures_dir: Option<&Path>,
) -> VerificationResult<PathBuf> {
    let dir = signatures_dir.ok_or_else(|| VerificationError::SignatureLoad {
        signature_id: signature.id.clone(),
        reason: "Signatures directory is not configured".to_string(),
    })?;

    if !dir.is_dir() {
        return Err(VerificationError::SignatureLoad {
            signature_id: signature.id.clone(),
            reason: format!("Signatures directory not found: {}", dir.display()),
        });
    }

    let relative = Path::new(&signature.function_file);
    let escapes = relative.as_os_str().is_empty()
        || relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
    if escapes {
        return Err(VerificationError::SignatureLoad {
            signature_id: signature.id.clone(),
            reason: format!(
                "Signature function file '{}' is outside the predicate directory",
                signature.function_file
            ),
        });
    }

    Ok(dir.join(PREDICATE_SUBDIR).join(relative))
}

/// Compile and run one predicate expression.
pub fn evaluate_source(
    signature_id: &str,
    source: &str,
    input: &PredicateInput,
) -> VerificationResult<Value> {
    let program = cel::Program::compile(source.trim()).map_err(|e| {
        VerificationError::SignatureLoad {
            signature_id: signature_id.to_string(),
            reason: format!("Signature function is not a valid predicate: {}", e),
        }
    })?;

    let mut ctx = cel::Context::default();
    ctx.add_variable_from_value(
        "toolName",
        cel::Value::String(Arc::new(input.tool_name.clone())),
    );
    ctx.add_variable_from_value("toolInput", json_to_cel(&input.tool_input));
    ctx.add_variable_from_value("context", json_to_cel(&input.context_value()));

    ctx.add_function("isString", cel_is_string);
    ctx.add_function("isObject", cel_is_object);
    ctx.add_function("isArray", cel_is_array);
    ctx.add_function("hasProperty", cel_has_property);
    ctx.add_function("matchesPattern", cel_matches_pattern);
    ctx.add_function("containsKeyword", cel_contains_keyword);

    let result = program
        .execute(&ctx)
        .map_err(|e| VerificationError::SignatureExecution {
            signature_id: signature_id.to_string(),
            reason: format!("Signature function failed: {}", e),
        })?;

    Ok(cel_to_json(&result))
}

fn cel_is_string(value: cel::Value) -> bool {
    matches!(value, cel::Value::String(_))
}

fn cel_is_object(value: cel::Value) -> bool {
    matches!(value, cel::Value::Map(_))
}

fn cel_is_array(value: cel::Value) -> bool {
    matches!(value, cel::Value::List(_))
}

fn cel_has_property(value: cel::Value, key: Arc<String>) -> bool {
    helpers::has_property(&cel_to_json(&value), &key)
}

fn cel_matches_pattern(text: cel::Value, pattern: Arc<String>) -> bool {
    helpers::matches_pattern(&helpers::searchable_text(&cel_to_json(&text)), &pattern)
}

fn cel_contains_keyword(text: cel::Value, keyword: Arc<String>) -> bool {
    helpers::contains_keyword(&helpers::searchable_text(&cel_to_json(&text)), &keyword)
}

fn json_to_cel(value: &Value) -> cel::Value {
    match value {
        Value::Null => cel::Value::Null,
        Value::Bool(b) => cel::Value::Bool(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                cel::Value::Int(i)
            } else if let Some(u) = n.as_u64() {
                cel::Value::UInt(u)
            } else if let Some(f) = n.as_f64() {
                cel::Value::Float(f)
            } else {
                cel::Value::Null
            }
        }
        Value::String(s) => cel::Value::String(Arc::new(s.clone())),
        Value::Array(items) => cel::Value::List(Arc::new(items.iter().map(json_to_cel).collect())),
        Value::Object(map) => {
            let entries: HashMap<String, cel::Value> = map
                .iter()
                .map(|(k, v)| (k.clone(), json_to_cel(v)))
                .collect();
            entries.into()
        }
    }
}

fn cel_to_json(value: &cel::Value) -> Value {
    match value {
        cel::Value::Null => Value::Null,
        cel::Value::Bool(b) => Value::Bool(*b),
        cel::Value::Int(i) => Value::Number((*i).into()),
        cel::Value::UInt(u) => Value::Number((*u).into()),
        cel::Value::Float(f) => serde_json::Number::from_f64(*f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        cel::Value::String(s) => Value::String(s.to_string()),
        cel::Value::List(items) => Value::Array(items.iter().map(cel_to_json).collect()),
        cel::Value::Map(m) => {
            let mut obj = serde_json::Map::new();
            for (key, val) in m.map.iter() {
                let k = match key {
                    cel::objects::Key::String(s) => s.to_string(),
                    cel::objects::Key::Int(i) => i.to_string(),
                    cel::objects::Key::Uint(u) => u.to_string(),
                    cel::objects::Key::Bool(b) => b.to_string(),
                };
                obj.insert(k, cel_to_json(val));
            }
            Value::Object(obj)
        }
        // Bytes, durations, timestamps and functions have no predicate meaning
        _ => Value::Null,
    }
}
