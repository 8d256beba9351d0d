//! Literal serialization for emitted script.
//!
//! Everything produced here is safe to embed inside an HTML `<script>`
//! element: `<` never appears unescaped inside string literals, so no
//! literal can close the surrounding element.

use lazy_static::lazy_static;
use regex::Regex;
use std::fmt::Write;

lazy_static! {
    static ref IDENT_RE: Regex = Regex::new(r"^[A-Za-z_$][A-Za-z0-9_$]*$").unwrap();
    static ref BLOCK_START_RE: Regex = Regex::new(r"^\s*\{").unwrap();
}

/// Whether `name` can be written as a bare identifier or dotted property.
pub fn is_identifier(name: &str) -> bool {
    IDENT_RE.is_match(name)
}

/// Whether `text` would be read as a block (not an object literal) when it
/// appears at the start of a statement or an arrow function body.
pub fn starts_like_block(text: &str) -> bool {
    BLOCK_START_RE.is_match(text)
}

/// Wraps `text` in parentheses when it would otherwise be read as a block.
pub fn guard_block_start(text: String) -> String {
    if starts_like_block(&text) {
        format!("({})", text)
    } else {
        text
    }
}

/// Double-quoted string literal.
pub fn string_literal(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    let mut chars = value.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '<' => out.push_str("\\x3C"),
            '\0' => {
                if chars.peek().is_some_and(|c| c.is_ascii_digit()) {
                    out.push_str("\\x00");
                } else {
                    out.push_str("\\0");
                }
            }
            '\u{2028}' => out.push_str("\\u2028"),
            '\u{2029}' => out.push_str("\\u2029"),
            ch if ch < '\u{20}' => {
                let _ = write!(out, "\\x{:02X}", ch as u32);
            }
            ch => out.push(ch),
        }
    }
    out.push('"');
    out
}

/// Number literal. Negative values are parenthesized so the literal can sit
/// next to any operator.
pub fn number_literal(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value.is_infinite() {
        if value > 0.0 {
            "Infinity".to_string()
        } else {
            "(-Infinity)".to_string()
        }
    } else if value == 0.0 && value.is_sign_negative() {
        "(-0)".to_string()
    } else if value < 0.0 {
        format!("({})", value)
    } else {
        format!("{}", value)
    }
}

pub fn bigint_literal(value: i128) -> String {
    if value < 0 {
        format!("({}n)", value)
    } else {
        format!("{}n", value)
    }
}

/// Property key inside an object literal.
pub fn property_key(key: &str) -> String {
    if is_identifier(key) {
        key.to_string()
    } else {
        string_literal(key)
    }
}

/// Serializes a JSON value as a script literal.
pub fn json_literal(value: &serde_json::Value) -> String {
    let mut out = String::new();
    write_json(&mut out, value);
    out
}

fn write_json(out: &mut String, value: &serde_json::Value) {
    match value {
        serde_json::Value::Null => out.push_str("null"),
        serde_json::Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        serde_json::Value::Number(n) => {
            let text = n.to_string();
            if text.starts_with('-') {
                let _ = write!(out, "({})", text);
            } else {
                out.push_str(&text);
            }
        }
        serde_json::Value::String(s) => out.push_str(&string_literal(s)),
        serde_json::Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_json(out, item);
            }
            out.push(']');
        }
        serde_json::Value::Object(entries) => {
            out.push('{');
            for (i, (key, item)) in entries.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&property_key(key));
                out.push(':');
                write_json(out, item);
            }
            out.push('}');
        }
    }
}

/// Lowercase base-36 rendering used for generated names.
pub fn to_base36(mut n: usize) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut buf = Vec::new();
    while n > 0 {
        buf.push(DIGITS[n % 36]);
        n /= 36;
    }
    buf.reverse();
    String::from_utf8(buf).unwrap_or_default()
}
