//! The structured `db_patch` mutator families and their application to a
//! [`serde_json::Value`].

use std::collections::BTreeMap;

use serde_json::Value;

/// A `push` target: either a single value or `{each: [...]}`.
#[derive(Debug, Clone, PartialEq)]
pub enum PushOp {
    /// Append one value.
    One(Value),
    /// Append each value in order.
    Each(Vec<Value>),
}

/// A minimal, database-applicable structured patch between two revisions of
/// the same document, as produced by [`crate::diffing::Differ::diff`].
///
/// Paths are dotted (e.g. `metadata.tags.0`) and use the storage-visible
/// name of each field, matching [`crate::versioning::Versioned::VERSION_FIELD`]
/// for the version component.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DbPatch {
    /// Scalar/subtree replacements, keyed by dotted path.
    pub set: BTreeMap<String, Value>,
    /// Paths to delete.
    pub unset: Vec<String>,
    /// Numeric deltas, keyed by dotted path (used for version bumps).
    pub inc: BTreeMap<String, f64>,
    /// Array append operations.
    pub push: BTreeMap<String, PushOp>,
    /// Single-value array removals.
    pub pull: BTreeMap<String, Value>,
    /// Multi-value array removals.
    pub pull_all: BTreeMap<String, Vec<Value>>,
}

impl DbPatch {
    /// True when no mutator family carries any entry.
    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
            && self.unset.is_empty()
            && self.inc.is_empty()
            && self.push.is_empty()
            && self.pull.is_empty()
            && self.pull_all.is_empty()
    }

    pub(crate) fn set_at(&mut self, path: impl Into<String>, value: Value) {
        self.set.insert(path.into(), value);
    }

    pub(crate) fn unset_at(&mut self, path: impl Into<String>) {
        self.unset.push(path.into());
    }

    pub(crate) fn inc_at(&mut self, path: impl Into<String>, delta: f64) {
        *self.inc.entry(path.into()).or_insert(0.0) += delta;
    }
}

fn split_path(path: &str) -> Vec<&str> {
    if path.is_empty() {
        Vec::new()
    } else {
        path.split('.').collect()
    }
}

fn navigate_mut<'a>(root: &'a mut Value, segments: &[&str]) -> Option<&'a mut Value> {
    let mut cur = root;
    for seg in segments {
        match cur {
            Value::Object(map) => {
                cur = map.entry(seg.to_string()).or_insert(Value::Null);
            }
            Value::Array(arr) => {
                let idx: usize = seg.parse().ok()?;
                while arr.len() <= idx {
                    arr.push(Value::Null);
                }
                cur = &mut arr[idx];
            }
            _ => return None,
        }
    }
    Some(cur)
}

fn remove_path(root: &mut Value, path: &str) {
    let segments = split_path(path);
    if segments.is_empty() {
        *root = Value::Null;
        return;
    }
    let (last, parent_segments) = segments.split_last().unwrap();
    if let Some(parent) = navigate_mut(root, parent_segments) {
        match parent {
            Value::Object(map) => {
                map.remove(*last);
            }
            Value::Array(arr) => {
                if let Ok(idx) = last.parse::<usize>() {
                    if idx < arr.len() {
                        arr[idx] = Value::Null;
                    }
                }
            }
            _ => {}
        }
    }
}

/// Apply a [`DbPatch`] to a JSON value in place, emulating what the real
/// backend does for `$set`/`$unset`/`$inc`/`$push`/`$pull`/`$pullAll`. Used
/// by the in-memory reference adapter and by tests that verify invariant 3
/// (`applying db_patch to old yields new`).
pub fn apply(root: &mut Value, patch: &DbPatch) {
    for (path, value) in &patch.set {
        let segments = split_path(path);
        if segments.is_empty() {
            *root = value.clone();
            continue;
        }
        let (last, parent_segments) = segments.split_last().unwrap();
        if let Some(parent) = navigate_mut(root, parent_segments) {
            match parent {
                Value::Object(map) => {
                    map.insert(last.to_string(), value.clone());
                }
                Value::Array(arr) => {
                    if let Ok(idx) = last.parse::<usize>() {
                        while arr.len() <= idx {
                            arr.push(Value::Null);
                        }
                        arr[idx] = value.clone();
                    }
                }
                _ => {}
            }
        }
    }

    for path in &patch.unset {
        remove_path(root, path);
    }

    for (path, delta) in &patch.inc {
        let segments = split_path(path);
        if let Some(target) = navigate_mut(root, &segments) {
            let current = target.as_f64().unwrap_or(0.0);
            let updated = current + delta;
            *target = serde_json::json!(updated);
        }
    }

    for (path, op) in &patch.push {
        let segments = split_path(path);
        if let Some(target) = navigate_mut(root, &segments) {
            if !target.is_array() {
                *target = Value::Array(Vec::new());
            }
            if let Value::Array(arr) = target {
                match op {
                    PushOp::One(v) => arr.push(v.clone()),
                    PushOp::Each(vs) => arr.extend(vs.iter().cloned()),
                }
            }
        }
    }

    for (path, value) in &patch.pull {
        let segments = split_path(path);
        if let Some(Value::Array(arr)) = navigate_mut(root, &segments) {
            arr.retain(|v| v != value);
        }
    }

    for (path, values) in &patch.pull_all {
        let segments = split_path(path);
        if let Some(Value::Array(arr)) = navigate_mut(root, &segments) {
            arr.retain(|v| !values.contains(v));
        }
    }
}
