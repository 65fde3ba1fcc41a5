//! Content hashing for payloads and slices
//!
//! Hashes are computed over a canonical JSON rendering (object keys sorted,
//! no insignificant whitespace) so two documents that differ only in key
//! order hash identically. Output format: `sha256:<lowercase hex>`.

use serde_json::Value;
use sha2::{Digest, Sha256};

pub const HASH_PREFIX: &str = "sha256:";

/// Hash a JSON document.
pub fn content_hash(value: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(value).as_bytes());
    format!("{}{:x}", HASH_PREFIX, hasher.finalize())
}

/// Hash raw bytes (idempotency keys, derived identifiers).
pub fn bytes_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{}{:x}", HASH_PREFIX, hasher.finalize())
}

/// Render a JSON value with sorted object keys.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // Serializing a &str cannot fail
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_hash_format() {
        let h = content_hash(&json!({"name": "A"}));
        assert!(h.starts_with("sha256:"));
        assert_eq!(h.len(), HASH_PREFIX.len() + 64);
    }

    #[test]
    fn test_hash_ignores_key_order() {
        let a: Value = serde_json::from_str(r#"{"b":1,"a":{"y":2,"x":[1,2]}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"a":{"x":[1,2],"y":2},"b":1}"#).unwrap();
        assert_eq!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn test_hash_distinguishes_values() {
        assert_ne!(content_hash(&json!({"name": "A"})), content_hash(&json!({"name": "B"})));
        assert_ne!(content_hash(&json!([1, 2])), content_hash(&json!([2, 1])));
    }

    #[test]
    fn test_canonical_json_escapes_keys() {
        let v = json!({"a\"b": null});
        assert_eq!(canonical_json(&v), r#"{"a\"b":null}"#);
    }
}
