//! Canonical JSON hashing for command intents.
//!
//! Intent hashes must be stable across processes and languages, so the
//! JSON is canonicalized per RFC 8785 (sorted keys, minimal separators)
//! before hashing. Two enqueues that differ only in key order or
//! whitespace produce the same hash.

use serde_json::{json, Value};
use sha2::{Digest, Sha256};

/// Serialize a JSON value in RFC 8785 canonical form.
///
/// Canonicalization only fails on non-finite floats, which `serde_json::Value`
/// cannot represent, so this is infallible for any well-formed `Value`.
pub fn canonicalize_json(value: &Value) -> String {
    serde_json_canonicalizer::to_string(value)
        .expect("canonical JSON serialization failed on a finite Value")
}

/// SHA-256 of arbitrary bytes, lowercase hex.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Content-derived idempotency key for a command.
///
/// Covers the command kind and payload; delivery metadata (target agent,
/// schedule, dedupe key) does not participate.
pub fn intent_hash(kind: &str, payload: &Value) -> String {
    let intent = json!({ "type": kind, "payload": payload });
    sha256_hex(canonicalize_json(&intent).as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_form_sorts_keys() {
        let v = json!({"b": 1, "a": {"z": true, "y": null}});
        assert_eq!(canonicalize_json(&v), r#"{"a":{"y":null,"z":true},"b":1}"#);
    }

    #[test]
    fn intent_hash_ignores_key_order() {
        let a = json!({"venue": "KRAKEN", "symbol": "BTC/USD", "amount": 0.5});
        let b = json!({"amount": 0.5, "symbol": "BTC/USD", "venue": "KRAKEN"});
        assert_eq!(intent_hash("order.place", &a), intent_hash("order.place", &b));
    }

    #[test]
    fn intent_hash_covers_kind() {
        let p = json!({"venue": "KRAKEN"});
        assert_ne!(intent_hash("order.place", &p), intent_hash("order.cancel", &p));
    }

    #[test]
    fn intent_hash_is_hex_sha256() {
        let h = intent_hash("order.place", &json!({}));
        assert_eq!(h.len(), 64);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
