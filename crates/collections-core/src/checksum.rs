//! Canonical-JSON checksumming, shared by the state store (C6) for
//! corruption detection and the mailbox (C8) for content-hash dedupe keys.
//!
//! Transcribed from `InvoiceStateManager._compute_checksum`: sort object
//! keys, serialize with no extraneous whitespace, SHA-256, keep the first
//! 16 hex characters. Fields whose key starts with `_` are metadata
//! (`_checksum`, `_updated_at`, `_version`) and are excluded so the
//! checksum is stable across the round trip of writing and re-reading it.

use ring::digest;
use serde_json::Value;

/// Serializes `value` with object keys sorted and no insignificant
/// whitespace, dropping any top-level object keys starting with `_`.
pub fn canonical_json(value: &Value) -> String {
    let scrubbed = match value {
        Value::Object(map) => {
            let mut sorted: Vec<(&String, &Value)> =
                map.iter().filter(|(k, _)| !k.starts_with('_')).collect();
            sorted.sort_by(|a, b| a.0.cmp(b.0));
            let mut out = String::from("{");
            for (i, (k, v)) in sorted.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(k).expect("string key always serializes"));
                out.push(':');
                out.push_str(&canonical_json(v));
            }
            out.push('}');
            return out;
        }
        other => other.to_string(),
    };
    scrubbed
}

/// Computes the 16-hex-character checksum of `value`'s canonical form.
pub fn checksum16(value: &Value) -> String {
    let content = canonical_json(value);
    let digest = digest::digest(&digest::SHA256, content.as_bytes());
    let hex = hex_encode(digest.as_ref());
    hex[..16].to_owned()
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        write!(s, "{:02x}", b).expect("writing to a String never fails");
    }
    s
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn checksum_ignores_key_order() {
        let a = json!({"b": 1, "a": 2});
        let b = json!({"a": 2, "b": 1});
        assert_eq!(checksum16(&a), checksum16(&b));
    }

    #[test]
    fn checksum_ignores_metadata_fields() {
        let a = json!({"amount": 100, "status": "unpaid"});
        let b = json!({
            "amount": 100,
            "status": "unpaid",
            "_checksum": "deadbeefcafebabe",
            "_updated_at": "2026-01-01T00:00:00Z",
        });
        assert_eq!(checksum16(&a), checksum16(&b));
    }

    #[test]
    fn checksum_is_sixteen_hex_chars() {
        let sum = checksum16(&json!({"x": 1}));
        assert_eq!(sum.len(), 16);
        assert!(sum.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn checksum_changes_on_content_change() {
        let a = json!({"amount": 100});
        let b = json!({"amount": 101});
        assert_ne!(checksum16(&a), checksum16(&b));
    }
}
