//! Defensive parsing of model responses.
//!
//! Models asked for JSON still wrap it in markdown fences or surround it
//! with prose often enough that a strict `serde_json::from_str` would
//! reject usable answers. The helpers here extract the JSON candidate
//! before parsing, and parse failures carry a bounded excerpt of the raw
//! text so the error can be shown to a human or embedded in a retry prompt.

use serde_json::Value;

use crate::error::{PipelineError, Result};

/// How much of a malformed response is preserved in the error message.
const EXCERPT_LEN: usize = 400;

/// Extract JSON content from markdown fenced code blocks.
///
/// Recognizes `` ```json ``, `` ```JSON ``, and plain `` ``` `` fences.
pub fn extract_json_block(text: &str) -> Option<String> {
    let markers = ["```json", "```JSON", "```"];
    for marker in markers {
        if let Some(start) = text.find(marker) {
            let content_start = start + marker.len();
            if let Some(end) = text[content_start..].find("```") {
                return Some(text[content_start..content_start + end].trim().to_string());
            }
        }
    }
    None
}

/// Try to locate and extract a JSON object or array from text that may
/// contain surrounding prose.
///
/// Tries, in order:
/// 1. Markdown code block extraction
/// 2. First `{` or `[` with matching closer
pub fn extract_json_candidate(text: &str) -> Option<String> {
    let trimmed = text.trim();

    if let Some(block) = extract_json_block(trimmed) {
        return Some(block);
    }

    if let Some(idx) = trimmed.find('{').or_else(|| trimmed.find('[')) {
        let candidate = &trimmed[idx..];
        if serde_json::from_str::<Value>(candidate).is_ok() {
            return Some(candidate.to_string());
        }
        let open = candidate.as_bytes()[0];
        let close = if open == b'{' { b'}' } else { b']' };
        if let Some(end) = candidate.rfind(close as char) {
            let substr = &candidate[..=end];
            if serde_json::from_str::<Value>(substr).is_ok() {
                return Some(substr.to_string());
            }
        }
    }

    None
}

/// Parse a model response into a JSON `Value`.
///
/// Tolerates leading/trailing whitespace, markdown fences, and surrounding
/// prose. On failure returns [`PipelineError::MalformedResponse`] carrying
/// the serde error description and the first [`EXCERPT_LEN`] characters of
/// the raw text.
pub fn parse_response(text: &str) -> Result<Value> {
    let trimmed = text.trim();

    match serde_json::from_str::<Value>(trimmed) {
        Ok(val) => return Ok(val),
        Err(direct_err) => {
            if let Some(candidate) = extract_json_candidate(trimmed) {
                if let Ok(val) = serde_json::from_str::<Value>(&candidate) {
                    return Ok(val);
                }
            }
            Err(PipelineError::MalformedResponse {
                reason: direct_err.to_string(),
                excerpt: excerpt(trimmed),
            })
        }
    }
}

/// Truncate text to the excerpt length on a character boundary.
pub fn excerpt(text: &str) -> String {
    if text.chars().count() <= EXCERPT_LEN {
        text.to_string()
    } else {
        text.chars().take(EXCERPT_LEN).collect()
    }
}
