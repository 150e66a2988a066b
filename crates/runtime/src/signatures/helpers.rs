//! Helper capabilities exposed to deterministic predicates.
//!
//! Native predicates call these directly; CEL predicates get them as
//! functions (`isString`, `isObject`, `isArray`, `hasProperty`,
//! `matchesPattern`, `containsKeyword`).

use regex::Regex;
use serde_json::Value;

pub fn is_string(value: &Value) -> bool {
    value.is_string()
}

pub fn is_object(value: &Value) -> bool {
    value.is_object()
}

pub fn is_array(value: &Value) -> bool {
    value.is_array()
}

/// Whether `value` is an object carrying `key`.
pub fn has_property(value: &Value, key: &str) -> bool {
    value
        .as_object()
        .map(|obj| obj.contains_key(key))
        .unwrap_or(false)
}

/// Regex match; an invalid pattern never matches.
pub fn matches_pattern(text: &str, pattern: &str) -> bool {
    match Regex::new(pattern) {
        Ok(re) => re.is_match(text),
        Err(e) => {
            tracing::debug!("Invalid predicate pattern '{}': {}", pattern, e);
            false
        }
    }
}

/// Case-insensitive containment of `keyword` in `text`.
pub fn contains_keyword(text: &str, keyword: &str) -> bool {
    text.to_lowercase().contains(&keyword.to_lowercase())
}

/// Flatten a value to searchable text; strings are used verbatim.
pub fn searchable_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
