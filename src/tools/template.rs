//! Instruction templates rendered against the blackboard.
//!
//! `{key}` inserts the value under `key` and fails when it is absent;
//! `{key?}` inserts an empty string instead. `{{` and `}}` are literal
//! braces. Braces around anything that is not an identifier are left as is,
//! so JSON examples inside a prompt survive rendering.

use crate::blackboard::Blackboard;
use crate::stage::StepError;
use serde_json::Value;

pub fn render(template: &str, board: &Blackboard) -> Result<String, StepError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(pos) = rest.find(['{', '}']) {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];

        if tail.starts_with("{{") || tail.starts_with("}}") {
            out.push_str(&tail[..1]);
            rest = &tail[2..];
            continue;
        }
        if tail.starts_with('}') {
            out.push('}');
            rest = &tail[1..];
            continue;
        }

        let Some(close) = tail.find('}') else {
            out.push_str(tail);
            rest = "";
            break;
        };
        let inner = &tail[1..close];
        let (key, optional) = match inner.strip_suffix('?') {
            Some(key) => (key, true),
            None => (inner, false),
        };

        if !is_identifier(key) {
            out.push('{');
            rest = &tail[1..];
            continue;
        }

        match board.get(key) {
            Some(value) => push_value(&mut out, value),
            None if optional => {}
            None => {
                return Err(StepError::invalid(format!(
                    "template references missing key '{key}'"
                )));
            }
        }
        rest = &tail[close + 1..];
    }

    out.push_str(rest);
    Ok(out)
}

fn is_identifier(key: &str) -> bool {
    let mut chars = key.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn push_value(out: &mut String, value: &Value) {
    match value {
        Value::String(s) => out.push_str(s),
        Value::Null => {}
        other => out.push_str(&other.to_string()),
    }
}
