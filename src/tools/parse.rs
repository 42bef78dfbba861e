use crate::stage::StepError;
use serde_json::Value;

pub fn strip_code_fences(response: &str) -> String {
    let trimmed = response.trim();
    if !trimmed.starts_with("```") {
        return trimmed.to_string();
    }

    let lines: Vec<&str> = trimmed.lines().collect();
    // Skip first line (```json) and, when present, the closing fence.
    let end = if lines.len() > 1 && lines[lines.len() - 1].trim_start().starts_with("```") {
        lines.len() - 1
    } else {
        lines.len()
    };
    lines.get(1..end).unwrap_or_default().join("\n")
}

/// Pull a JSON value out of a model reply: fenced, bare, or embedded in
/// surrounding prose.
pub fn extract_json(response: &str) -> Result<Value, StepError> {
    let body = strip_code_fences(response);
    if let Ok(value) = serde_json::from_str(&body) {
        return Ok(value);
    }

    let start = body.find(['{', '[']);
    let end = body.rfind(['}', ']']);
    match (start, end) {
        (Some(start), Some(end)) if start < end => Ok(serde_json::from_str(&body[start..=end])?),
        _ => Err(StepError::invalid("no JSON found in response")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn strips_fenced_block() {
        let reply = "```rust\nfn main() {}\n```";
        assert_eq!(strip_code_fences(reply), "fn main() {}");
    }

    #[test]
    fn unfenced_text_is_trimmed() {
        assert_eq!(strip_code_fences("  plain  "), "plain");
    }

    #[test]
    fn lone_fence_does_not_panic() {
        assert_eq!(strip_code_fences("```"), "");
        assert_eq!(strip_code_fences("```json\n{}"), "{}");
    }

    #[test]
    fn extracts_fenced_json() {
        let reply = "```json\n{\"tone\": \"positive\"}\n```";
        assert_eq!(extract_json(reply).unwrap(), json!({"tone": "positive"}));
    }

    #[test]
    fn extracts_json_embedded_in_prose() {
        let reply = "Sure! Here are the ids: [3, 5, 10]. Anything else?";
        assert_eq!(extract_json(reply).unwrap(), json!([3, 5, 10]));
    }

    #[test]
    fn no_json_is_invalid() {
        let err = extract_json("nothing to see").unwrap_err();
        assert!(matches!(err, StepError::Invalid(_)));
    }
}
