//! Extraction of JSON payloads from free-form model output.
//!
//! Models asked for JSON frequently wrap it in markdown fences or prose. The
//! cascade tries, in order: a direct parse, a ```json fence, any ``` fence,
//! then the outermost balanced-brace span.

use serde_json::Value;
use std::sync::OnceLock;

fn json_fence() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"```json\s*([\s\S]*?)\s*```").unwrap())
}

fn any_fence() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"```\s*([\s\S]*?)\s*```").unwrap())
}

/// Return the first extractable JSON document as a string, or `None`.
pub fn extract_json_block(content: &str) -> Option<String> {
    let trimmed = content.trim();
    if serde_json::from_str::<Value>(trimmed).is_ok() {
        return Some(trimmed.to_string());
    }

    for re in [json_fence(), any_fence()] {
        if let Some(cap) = re.captures(content) {
            let candidate = cap[1].trim();
            if serde_json::from_str::<Value>(candidate).is_ok() {
                return Some(candidate.to_string());
            }
        }
    }

    // Outermost balanced braces.
    let start = content.find('{')?;
    let end = content.rfind('}')?;
    if end > start {
        let candidate = &content[start..=end];
        if serde_json::from_str::<Value>(candidate).is_ok() {
            return Some(candidate.to_string());
        }
    }
    None
}

/// Parsed variant of [`extract_json_block`].
pub fn extract_json(content: &str) -> Option<Value> {
    extract_json_block(content).and_then(|s| serde_json::from_str(&s).ok())
}
