//! Deep merge for layered contexts
//!
//! Objects merge key by key, recursively. Every other value, arrays and
//! `null` included, replaces whatever was underneath it.

use serde_json::Value;

/// Merge `patch` into `target`, most-specific (the patch) wins per key.
pub fn deep_merge(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(base), Value::Object(overrides)) => {
            for (key, value) in overrides {
                match base.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

/// Fold `layers` left to right, starting from an empty object.
pub fn layer(layers: &[&Value]) -> Value {
    let mut merged = Value::Object(serde_json::Map::new());
    for layer in layers {
        deep_merge(&mut merged, layer);
    }
    merged
}
