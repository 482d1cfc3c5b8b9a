//! Deterministic cache key generation.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Parameter names that control a single call but must never shape its key.
/// A bypassed read still writes under the same key as a non-bypassed one.
const CONTROL_FLAGS: &[&str] = &["bypass_cache"];

/// Build a cache key from a namespace and query parameters.
///
/// The key is independent of object key order anywhere in `params`, and
/// transient control flags are excluded. The namespace is kept as a plain
/// prefix so a tier can be invalidated by namespace; the parameter material
/// is SHA-256 hashed for stable, fixed-length keys.
pub fn cache_key(namespace: &str, params: &Value) -> String {
  let mut canonical = String::new();
  write_canonical(params, &mut canonical);

  let mut hasher = Sha256::new();
  hasher.update(canonical.as_bytes());
  let digest = hasher.finalize();

  format!("{}:{}", namespace, hex::encode(digest))
}

/// Serialize a JSON value with sorted object keys, skipping control flags.
fn write_canonical(value: &Value, out: &mut String) {
  match value {
    Value::Object(map) => {
      let mut keys: Vec<&String> = map
        .keys()
        .filter(|k| !CONTROL_FLAGS.contains(&k.as_str()))
        .collect();
      keys.sort();

      out.push('{');
      for (i, k) in keys.iter().enumerate() {
        if i > 0 {
          out.push(',');
        }
        out.push_str(&Value::String((*k).clone()).to_string());
        out.push(':');
        write_canonical(&map[*k], out);
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
    other => out.push_str(&other.to_string()),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_key_is_order_independent() {
    let a = cache_key("mrs", &json!({"a": 1, "b": 2}));
    let b = cache_key("mrs", &json!({"b": 2, "a": 1}));
    assert_eq!(a, b);
  }

  #[test]
  fn test_key_ignores_bypass_flag() {
    let plain = cache_key("mrs", &json!({"group": "platform"}));
    let bypassed = cache_key("mrs", &json!({"group": "platform", "bypass_cache": true}));
    assert_eq!(plain, bypassed);
  }

  #[test]
  fn test_key_ignores_nested_bypass_flag() {
    let plain = cache_key("mrs", &json!({"opts": {"state": "open"}}));
    let bypassed = cache_key("mrs", &json!({"opts": {"state": "open", "bypass_cache": true}}));
    assert_eq!(plain, bypassed);
  }

  #[test]
  fn test_namespace_is_a_plain_prefix() {
    let key = cache_key("work_items", &json!({"project": "ABC"}));
    assert!(key.starts_with("work_items:"));
  }

  #[test]
  fn test_different_params_produce_different_keys() {
    let a = cache_key("mrs", &json!({"group": "platform"}));
    let b = cache_key("mrs", &json!({"group": "infra"}));
    assert_ne!(a, b);
  }
}
