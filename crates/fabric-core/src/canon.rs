//! Canonical JSON + MD5 hashing.
//!
//! This is the *only* change-detection mechanism for Spawner/Summoner and
//! the identity mechanism for subscription `paramHash` (spec §4.5, §4.9.5).
//! MD5 is a wire-compatibility requirement — peers must independently
//! compute the same hash for the same value — not a security boundary, so
//! the `md5` crate is used directly (grounded: `examples/estuary-flow`
//! depends on `md5 = "0.7.0"`).

use serde::Serialize;
use serde_json::Value;

/// Canonicalize a JSON value: object keys are sorted (key-order-insensitive
/// equality), array element order is preserved (array-order-sensitive
/// equality, per P2). Returns the canonical JSON text.
pub fn canonicalize(value: &Value) -> String {
    serde_json::to_string(&sort_keys(value)).expect("canonical json value always serializes")
}

fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: std::collections::BTreeMap<String, Value> = map
                .iter()
                .map(|(k, v)| (k.clone(), sort_keys(v)))
                .collect();
            // BTreeMap serializes in key order; re-expressed as a Value so
            // `to_string` below doesn't need a second code path.
            serde_json::to_value(sorted).expect("sorted map always serializes")
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}

/// MD5 hash of the canonical JSON encoding of `value`, as lowercase hex.
pub fn hash_of<T: Serialize>(value: &T) -> String {
    let json = serde_json::to_value(value).expect("value serializes to json");
    let canonical = canonicalize(&json);
    format!("{:x}", md5::compute(canonical.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_order_does_not_affect_hash() {
        let a = json!({"topic": "t", "retries": 3});
        let b = json!({"retries": 3, "topic": "t"});
        assert_eq!(hash_of(&a), hash_of(&b));
    }

    #[test]
    fn array_order_affects_hash() {
        let a = json!({"items": [1, 2, 3]});
        let b = json!({"items": [3, 2, 1]});
        assert_ne!(hash_of(&a), hash_of(&b));
    }

    #[test]
    fn nested_objects_are_canonicalized_recursively() {
        let a = json!({"outer": {"b": 1, "a": 2}});
        let b = json!({"outer": {"a": 2, "b": 1}});
        assert_eq!(hash_of(&a), hash_of(&b));
    }

    #[test]
    fn distinct_values_hash_differently() {
        let a = json!({"topic": "t1"});
        let b = json!({"topic": "t2"});
        assert_ne!(hash_of(&a), hash_of(&b));
    }

    #[test]
    fn hash_is_deterministic_across_calls() {
        let v = json!({"shard": "a", "params": {"topic": "t"}});
        assert_eq!(hash_of(&v), hash_of(&v));
    }
}
