use regex::Regex;
use serde_json::Value;

/// Pull a JSON object out of a model response that may wrap it in code
/// fences or surrounding prose. Tries fenced blocks first, then the first
/// balanced `{...}` object in the text.
pub fn extract_json(text: &str) -> Option<Value> {
    let fence = Regex::new(r"(?is)```(?:json)?\s*(.+?)\s*```").unwrap();
    if let Some(cap) = fence.captures(text) {
        if let Ok(v) = serde_json::from_str::<Value>(cap[1].trim()) {
            if v.is_object() {
                return Some(v);
            }
        }
    }

    let start = text.find('{')?;
    let candidate = balanced_object(&text[start..])?;
    serde_json::from_str::<Value>(candidate)
        .ok()
        .filter(|v| v.is_object())
}

/// Return the substring covering the first balanced brace pair, ignoring
/// braces inside string literals.
fn balanced_object(s: &str) -> Option<&str> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(&s[..=i]);
                }
            }
            _ => {}
        }
    }
    None
}
