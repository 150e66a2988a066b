//! Parsing of the verifier's per-signature output blocks
//!
//! The model answers with `SIGNATURE ID / ALLOWED / REASON` blocks. A
//! signature whose block cannot be found is allowed with a generic reason,
//! so one malformed answer never blocks an operation by itself.

use regex::Regex;

use crate::signatures::LlmSignature;
use crate::types::SignatureVerification;

/// Reason recorded when the model produced no block for a signature.
pub const UNMATCHED_REASON: &str =
    "No verdict found in verifier output for this signature, allowed by default";

const EMPTY_REASON: &str = "No reason provided";

/// Extract one verdict per signature from the model output.
pub fn parse_verdicts(
    text: &str,
    signatures: &[LlmSignature],
    model_name: &str,
) -> Vec<SignatureVerification> {
    signatures
        .iter()
        .map(|signature| {
            let (allowed, reason) = match find_block(text, &signature.id) {
                Some(found) => found,
                None => {
                    tracing::warn!(
                        signature_id = %signature.id,
                        model = %model_name,
                        "No verdict block for signature, defaulting to allow"
                    );
                    (true, UNMATCHED_REASON.to_string())
                }
            };
            SignatureVerification {
                signature_id: signature.id.clone(),
                signature_name: signature.name.clone(),
                allowed,
                reason,
                model_name: model_name.to_string(),
            }
        })
        .collect()
}

/// Locate the `ALLOWED` and `REASON` lines following a signature's marker.
fn find_block(text: &str, signature_id: &str) -> Option<(bool, String)> {
    let pattern = format!(
        concat!(
            r"(?is)SIGNATURE\s+ID[*`]*:[*`]*\s*[*`]*{}[*`]*",
            r"\s+[*`]*ALLOWED[*`]*:[*`]*\s*[*`]*(true|false|yes|no)\b[*`]*",
            r"\s*[*`]*REASON[*`]*:[*`]*\s*(.*?)\s*(?:[*`]*SIGNATURE\s+ID|\z)",
        ),
        regex::escape(signature_id)
    );
    let re = match Regex::new(&pattern) {
        Ok(re) => re,
        Err(e) => {
            tracing::debug!(signature_id, "Could not build verdict pattern: {}", e);
            return None;
        }
    };

    let caps = re.captures(text)?;
    let allowed = matches!(caps[1].to_ascii_lowercase().as_str(), "true" | "yes");
    let reason = caps[2].trim().trim_matches('*').trim();
    let reason = if reason.is_empty() {
        EMPTY_REASON.to_string()
    } else {
        reason.to_string()
    };
    Some((allowed, reason))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signature(id: &str) -> LlmSignature {
        LlmSignature {
            id: id.into(),
            name: format!("{} name", id),
            description: "desc".into(),
            category: None,
            prompt: "rule".into(),
        }
    }

    #[test]
    fn parses_each_block() {
        let text = "\
SIGNATURE ID: sig-1
ALLOWED: true
REASON: Arguments are benign.

SIGNATURE ID: sig-2
ALLOWED: false
REASON: Reads ~/.ssh/id_rsa and sends it to a remote host.
";
        let verdicts = parse_verdicts(text, &[signature("sig-1"), signature("sig-2")], "gpt-4o");
        assert_eq!(verdicts.len(), 2);
        assert!(verdicts[0].allowed);
        assert_eq!(verdicts[0].reason, "Arguments are benign.");
        assert!(!verdicts[1].allowed);
        assert_eq!(
            verdicts[1].reason,
            "Reads ~/.ssh/id_rsa and sends it to a remote host."
        );
        assert!(verdicts.iter().all(|v| v.model_name == "gpt-4o"));
    }

    #[test]
    fn missing_block_defaults_to_allow() {
        let text = "SIGNATURE ID: sig-1\nALLOWED: false\nREASON: bad\n";
        let verdicts = parse_verdicts(text, &[signature("sig-1"), signature("sig-9")], "m");
        assert!(!verdicts[0].allowed);
        assert!(verdicts[1].allowed);
        assert_eq!(verdicts[1].reason, UNMATCHED_REASON);
    }

    #[test]
    fn id_prefix_does_not_match_longer_id() {
        let text = "SIGNATURE ID: sig-10\nALLOWED: false\nREASON: blocked\n";
        let verdicts = parse_verdicts(text, &[signature("sig-1")], "m");
        assert!(verdicts[0].allowed);
        assert_eq!(verdicts[0].reason, UNMATCHED_REASON);
    }

    #[test]
    fn tolerates_markdown_and_case() {
        let text = "signature id: **sig-1**\nallowed: **No**\nreason: Hidden instruction in the path argument\n";
        let verdicts = parse_verdicts(text, &[signature("sig-1")], "m");
        assert!(!verdicts[0].allowed);
        assert_eq!(verdicts[0].reason, "Hidden instruction in the path argument");
    }

    #[test]
    fn tolerates_emphasised_keywords() {
        let text = "\
**SIGNATURE ID:** sig-1
**ALLOWED:** false
**REASON:** Sends credentials to a paste site.

**SIGNATURE ID:** sig-2
**ALLOWED**: true
**REASON**: Benign.
";
        let verdicts = parse_verdicts(text, &[signature("sig-1"), signature("sig-2")], "m");
        assert!(!verdicts[0].allowed);
        assert_eq!(verdicts[0].reason, "Sends credentials to a paste site.");
        assert!(verdicts[1].allowed);
        assert_eq!(verdicts[1].reason, "Benign.");
    }

    #[test]
    fn ids_with_regex_metacharacters() {
        let text = "SIGNATURE ID: a.b+(c)\nALLOWED: false\nREASON: x\n";
        let verdicts = parse_verdicts(text, &[signature("a.b+(c)")], "m");
        assert!(!verdicts[0].allowed);
    }
}
