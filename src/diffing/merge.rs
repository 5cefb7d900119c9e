//! RFC 7396 JSON Merge Patch: computing a merge patch between two JSON
//! values, and applying one.

use serde_json::{Map, Value};

/// Compute the minimal merge patch that transforms `old` into `new`:
/// present keys replace, explicit `null` deletes a key that existed in
/// `old`, and unchanged keys are omitted.
pub fn diff_merge_patch(old: &Value, new: &Value) -> Value {
    match (old, new) {
        (Value::Object(old_map), Value::Object(new_map)) => {
            let mut patch = Map::new();
            for k in old_map.keys() {
                if !new_map.contains_key(k) {
                    patch.insert(k.clone(), Value::Null);
                }
            }
            for (k, new_v) in new_map {
                match old_map.get(k) {
                    Some(old_v) if old_v == new_v => {}
                    Some(old_v) if old_v.is_object() && new_v.is_object() => {
                        let nested = diff_merge_patch(old_v, new_v);
                        if nested.as_object().map(|m| !m.is_empty()).unwrap_or(true) {
                            patch.insert(k.clone(), nested);
                        }
                    }
                    _ => {
                        patch.insert(k.clone(), new_v.clone());
                    }
                }
            }
            Value::Object(patch)
        }
        _ if old == new => Value::Object(Map::new()),
        _ => new.clone(),
    }
}

/// Apply a merge patch produced by [`diff_merge_patch`] (or any RFC 7396
/// compliant patch) to `target` in place.
pub fn apply_merge_patch(target: &mut Value, patch: &Value) {
    if let Value::Object(patch_map) = patch {
        if !target.is_object() {
            *target = Value::Object(Map::new());
        }
        let target_map = target.as_object_mut().unwrap();
        for (k, v) in patch_map {
            if v.is_null() {
                target_map.remove(k);
            } else if v.is_object() {
                let entry = target_map
                    .entry(k.clone())
                    .or_insert_with(|| Value::Object(Map::new()));
                apply_merge_patch(entry, v);
            } else {
                target_map.insert(k.clone(), v.clone());
            }
        }
    } else {
        *target = patch.clone();
    }
}
