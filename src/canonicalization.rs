//! JSON canonicalization for deterministic output.
//!
//! Implements strict canonical JSON serialization:
//! - Object keys sorted lexicographically
//! - No insignificant whitespace
//! - Numbers rendered consistently
//! - Line endings normalized to `\n` inside strings
//!
//! Used for literal rendering in reasons and for artifact digests.

use serde_json::Value;

/// Canonicalizes a JSON value to a deterministic string representation.
pub fn canonicalize(value: &Value) -> String {
    let mut output = String::new();
    write_canonical(&mut output, value);
    output
}

fn write_canonical(out: &mut String, value: &Value) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => push_escaped_string(out, s),
        Value::Array(arr) => {
            out.push('[');
            for (i, item) in arr.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(out, item);
            }
            out.push(']');
        }
        Value::Object(obj) => {
            out.push('{');
            let mut entries: Vec<(&String, &Value)> = obj.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                push_escaped_string(out, key);
                out.push(':');
                write_canonical(out, item);
            }
            out.push('}');
        }
    }
}

/// Appends `s` as a double-quoted JSON string with line endings normalized.
fn push_escaped_string(out: &mut String, s: &str) {
    let normalized = s.replace("\r\n", "\n").replace('\r', "\n");

    out.push('"');
    for c in normalized.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out.push('"');
}

/// Computes the canonical hash of a JSON value.
pub fn canonical_hash(value: &Value) -> String {
    crate::hash::sha256_str(&canonicalize(value))
}
