//! Secret redaction for structured log fields.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Replacement written in place of a secret.
pub const REDACTED: &str = "[REDACTED]";

/// Keys whose values are always secret (substring match, case-insensitive).
const DENYLIST_KEYS: [&str; 8] = [
    "token",
    "authorization",
    "cookie",
    "password",
    "secret",
    "private_key",
    "credential",
    "assertion",
];

/// Keys that are secret only on exact match; `code` as a substring would also
/// hit `status_code`.
const EXACT_KEYS: [&str; 2] = ["code", "auth_code"];

const MAX_VALUE_LEN: usize = 512;

/// Redact a field value based on its key and shape.
pub fn sanitize_value(key: &str, value: &Value) -> Value {
    if is_sensitive_key(key) {
        return Value::String(REDACTED.to_string());
    }

    match value {
        Value::String(s) => sanitize_string(s),
        Value::Object(map) => {
            let mut out = Map::new();
            for (k, v) in map {
                out.insert(k.clone(), sanitize_value(k, v));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| sanitize_value(key, item))
                .collect::<Vec<_>>(),
        ),
        _ => value.clone(),
    }
}

fn sanitize_string(raw: &str) -> Value {
    if looks_like_sensitive_value(raw) {
        return Value::String(REDACTED.to_string());
    }
    if raw.len() > MAX_VALUE_LEN {
        return Value::String(format!("[TRUNCATED:{}]", sha256_prefix(raw)));
    }
    Value::String(raw.to_string())
}

fn looks_like_sensitive_value(raw: &str) -> bool {
    let lower = raw.to_ascii_lowercase();
    if lower.starts_with("bearer ") || lower.starts_with("basic ") {
        return true;
    }
    // JWT: header.payload.signature
    if raw.matches('.').count() == 2 && raw.len() > 40 && !raw.contains(' ') {
        return true;
    }
    is_long_hex(raw) || is_long_base64(raw)
}

fn is_sensitive_key(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    DENYLIST_KEYS.iter().any(|entry| lower.contains(entry))
        || EXACT_KEYS.iter().any(|entry| lower == *entry)
}

fn is_long_hex(value: &str) -> bool {
    value.len() > 48 && value.chars().all(|c| c.is_ascii_hexdigit())
}

fn is_long_base64(value: &str) -> bool {
    value.len() > 48
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '/' | '=' | '_' | '-'))
}

fn sha256_prefix(raw: &str) -> String {
    let digest = Sha256::digest(raw.as_bytes());
    digest.iter().take(8).map(|b| format!("{:02x}", b)).collect()
}
