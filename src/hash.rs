use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::StepOutputs;

/// Canonical textual form of a JSON value: object keys sorted
/// lexicographically, arrays in order, scalars literal. Two structurally
/// equal values canonicalize identically regardless of the order their keys
/// were inserted in.
pub fn canonical_string(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => serde_json::to_string(s).unwrap_or_default(),
        Value::Array(arr) => {
            let items: Vec<String> = arr.iter().map(canonical_string).collect();
            format!("[{}]", items.join(","))
        }
        Value::Object(map) => {
            let mut tree = BTreeMap::new();
            for (k, v) in map {
                tree.insert(k, canonical_string(v));
            }
            let items: Vec<String> = tree
                .into_iter()
                .map(|(k, v)| {
                    format!("{}:{}", serde_json::to_string(&k).unwrap_or_default(), v)
                })
                .collect();
            format!("{{{}}}", items.join(","))
        }
    }
}

/// SHA-256 of the canonical form, lowercase hex.
pub fn sha256_hex(value: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_string(value).as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Cache key for one step execution: identity, dependency outputs, params
/// and the optional snapshot tag. Explicit override keys bypass this at the
/// call site.
pub fn step_cache_key(
    step_id: &str,
    deps_outputs: &StepOutputs,
    params: &Value,
    snapshot: Option<&str>,
) -> String {
    sha256_hex(&json!({
        "step_id": step_id,
        "deps_outputs": deps_outputs,
        "params": params,
        "snapshot": snapshot,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn canonical_form_sorts_object_keys() {
        let v = json!({"b": 2, "a": 1, "c": {"z": true, "y": [1, 2, 3]}});
        assert_eq!(
            canonical_string(&v),
            r#"{"a":1,"b":2,"c":{"y":[1,2,3],"z":true}}"#
        );
    }

    #[test]
    fn null_and_absence_are_distinct() {
        assert_ne!(
            canonical_string(&json!({"a": null})),
            canonical_string(&json!({}))
        );
    }

    #[test]
    fn structurally_equal_values_hash_identically() {
        let mut first = HashMap::new();
        first.insert("alpha".to_string(), json!(1));
        first.insert("beta".to_string(), json!({"x": [1, 2]}));

        let mut second = HashMap::new();
        second.insert("beta".to_string(), json!({"x": [1, 2]}));
        second.insert("alpha".to_string(), json!(1));

        let a = step_cache_key("render", &first, &json!({"fps": 30}), Some("v1"));
        let b = step_cache_key("render", &second, &json!({"fps": 30}), Some("v1"));
        assert_eq!(a, b);
    }

    #[test]
    fn key_changes_with_any_component() {
        let outputs = HashMap::new();
        let base = step_cache_key("render", &outputs, &json!({"fps": 30}), Some("v1"));

        assert_ne!(
            base,
            step_cache_key("encode", &outputs, &json!({"fps": 30}), Some("v1"))
        );
        assert_ne!(
            base,
            step_cache_key("render", &outputs, &json!({"fps": 60}), Some("v1"))
        );
        assert_ne!(
            base,
            step_cache_key("render", &outputs, &json!({"fps": 30}), Some("v2"))
        );
        assert_ne!(
            base,
            step_cache_key("render", &outputs, &json!({"fps": 30}), None)
        );
    }
}
