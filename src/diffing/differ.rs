//! Recursive structural differ producing a [`crate::diffing::Diff`] between
//! two revisions of the same document type.
//!
//! The original walks arbitrary structs via reflection; here the same
//! recursive-container traversal runs over each side's `serde_json::Value`
//! representation, obtained through `Serialize`. A JSON object stands in for
//! both "struct" and "associative container" from the original's type
//! switch — both get the same only-in-old/only-in-new/in-both treatment,
//! since the distinction is invisible once serialized.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::Serialize;
use serde_json::Value;

use crate::error::{Result, StoreError};

use super::merge::diff_merge_patch;
use super::patch::{DbPatch, PushOp};

/// Below this element count, a changed sequence is replaced wholesale via
/// `set` rather than diffed element-wise or multiset-diffed.
const SMALL_SEQUENCE_THRESHOLD: usize = 10;

/// The result of comparing two revisions of the same document.
#[derive(Debug, Clone, PartialEq)]
pub struct Diff {
    /// Whether `db_patch` carries any mutation.
    pub has_changes: bool,
    /// RFC 7396 merge patch from `old` to `new`.
    pub merge_patch: Value,
    /// Structured, database-applicable patch.
    pub db_patch: DbPatch,
}

/// A caller-supplied comparator overriding the default recursive diff for a
/// specific registered type.
pub trait CustomPatcher: Send + Sync {
    /// Append this type's mutations (relative to `path`) into `patch`.
    fn diff(&self, path: &str, old: &Value, new: &Value, patch: &mut DbPatch);
}

/// Computes [`Diff`]s between document revisions, with an optional registry
/// of per-type [`CustomPatcher`]s that override the default traversal.
///
/// The patcher registry is the Rust analogue of the original's per-type
/// patcher cache: a `RwLock`-guarded map, but keyed by [`TypeId`] and
/// holding only explicitly *registered* overrides — the default path needs
/// no memoization since `serde_json::Value` traversal carries no per-type
/// dispatch cost to cache.
#[derive(Default)]
pub struct Differ {
    patchers: RwLock<HashMap<TypeId, Arc<dyn CustomPatcher>>>,
}

impl Differ {
    /// Construct a differ with no custom patchers registered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a custom patcher for type `T`, overriding the default
    /// recursive traversal whenever `T` is diffed at the top level.
    pub fn register_patcher<T: Any>(&self, patcher: Arc<dyn CustomPatcher>) {
        let mut guard = self.patchers.write().expect("patcher registry poisoned");
        guard.insert(TypeId::of::<T>(), patcher);
    }

    /// Diff two revisions of the same type, producing both the structured
    /// `db_patch` and the RFC 7396 `merge_patch`.
    pub fn diff<T: Serialize + Any>(&self, old: &T, new: &T) -> Result<Diff> {
        let old_value = serde_json::to_value(old).map_err(StoreError::Serde)?;
        let new_value = serde_json::to_value(new).map_err(StoreError::Serde)?;

        let custom = {
            let guard = self.patchers.read().expect("patcher registry poisoned");
            guard.get(&TypeId::of::<T>()).cloned()
        };

        let mut db_patch = DbPatch::default();
        if let Some(patcher) = custom {
            patcher.diff("", &old_value, &new_value, &mut db_patch);
        } else {
            diff_values("", &old_value, &new_value, &mut db_patch);
        }

        let merge_patch = diff_merge_patch(&old_value, &new_value);

        Ok(Diff {
            has_changes: !db_patch.is_empty(),
            merge_patch,
            db_patch,
        })
    }
}

fn join_path(base: &str, key: &str) -> String {
    if base.is_empty() {
        key.to_string()
    } else {
        format!("{base}.{key}")
    }
}

fn is_zero_value(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::Bool(b) => !*b,
        Value::Number(n) => n.as_f64().map(|f| f == 0.0).unwrap_or(false),
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(m) => m.is_empty(),
    }
}

fn diff_values(path: &str, old: &Value, new: &Value, patch: &mut DbPatch) {
    match (old, new) {
        (Value::Null, Value::Null) => {}
        (Value::Null, _) if !new.is_null() => patch.set_at(path, new.clone()),
        (_, Value::Null) if !old.is_null() => patch.unset_at(path),

        (Value::Object(old_map), Value::Object(new_map)) => {
            for key in old_map.keys() {
                if !new_map.contains_key(key) {
                    patch.unset_at(join_path(path, key));
                }
            }
            for (key, new_v) in new_map {
                let child_path = join_path(path, key);
                match old_map.get(key) {
                    None => patch.set_at(child_path, new_v.clone()),
                    Some(old_v) if old_v == new_v => {}
                    Some(old_v) => diff_values(&child_path, old_v, new_v, patch),
                }
            }
        }

        (Value::Array(old_arr), Value::Array(new_arr)) => {
            diff_arrays(path, old_arr, new_arr, patch);
        }

        _ => {
            if std::mem::discriminant(old) != std::mem::discriminant(new) {
                patch.set_at(path, new.clone());
                return;
            }
            if old != new {
                if is_zero_value(new) && !is_zero_value(old) {
                    patch.unset_at(path);
                } else {
                    patch.set_at(path, new.clone());
                }
            }
        }
    }
}

fn is_primitive(v: &Value) -> bool {
    !matches!(v, Value::Object(_) | Value::Array(_))
}

/// Multiset (count-aware) diff between two primitive sequences: each `new`
/// element consumes one matching occurrence in `old` rather than merely
/// checking membership, so `[1,1,2] -> [1,2,2]` reports one removed `1` and
/// one added `2` instead of an empty diff.
fn multiset_diff(old: &[Value], new: &[Value]) -> (Vec<Value>, Vec<Value>) {
    let mut remaining_old: Vec<Value> = old.to_vec();
    let mut added = Vec::new();
    for v in new {
        if let Some(pos) = remaining_old.iter().position(|o| o == v) {
            remaining_old.remove(pos);
        } else {
            added.push(v.clone());
        }
    }
    (added, remaining_old)
}

fn diff_arrays(path: &str, old: &[Value], new: &[Value], patch: &mut DbPatch) {
    if old.len() == new.len() {
        for (i, (o, n)) in old.iter().zip(new.iter()).enumerate() {
            if o != n {
                diff_values(&join_path(path, &i.to_string()), o, n, patch);
            }
        }
        return;
    }

    let all_primitive = old.iter().all(is_primitive) && new.iter().all(is_primitive);

    if !all_primitive || old.len().max(new.len()) < SMALL_SEQUENCE_THRESHOLD {
        patch.set_at(path, Value::Array(new.to_vec()));
        return;
    }

    let (added, removed) = multiset_diff(old, new);

    if !added.is_empty() {
        let op = if added.len() == 1 {
            PushOp::One(added.into_iter().next().unwrap())
        } else {
            PushOp::Each(added)
        };
        patch.push.insert(path.to_string(), op);
    }
    if removed.len() == 1 {
        patch.pull.insert(path.to_string(), removed.into_iter().next().unwrap());
    } else if !removed.is_empty() {
        patch.pull_all.insert(path.to_string(), removed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diffing::patch::apply;
    use crate::versioning::Versioned;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Doc {
        v: i64,
        value: i64,
        tags: Vec<String>,
        metadata: Option<Meta>,
    }

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Meta {
        v: i64,
        note: String,
    }

    crate::derive_versioned!(Doc, v, "v");

    #[test]
    fn scalar_change_emits_set() {
        let differ = Differ::new();
        let old = Doc { v: 1, value: 42, tags: vec![], metadata: None };
        let mut new = old.clone();
        new.value = 43;
        new.set_version(2);

        let diff = differ.diff(&old, &new).unwrap();
        assert!(diff.has_changes);
        assert_eq!(diff.db_patch.set.get("value"), Some(&serde_json::json!(43)));
        assert_eq!(diff.db_patch.set.get("v"), Some(&serde_json::json!(2)));
    }

    #[test]
    fn no_changes_has_no_changes() {
        let differ = Differ::new();
        let old = Doc { v: 1, value: 42, tags: vec![], metadata: None };
        let diff = differ.diff(&old, &old).unwrap();
        assert!(!diff.has_changes);
        assert!(diff.db_patch.is_empty());
    }

    #[test]
    fn nested_struct_recurses() {
        let differ = Differ::new();
        let old = Doc {
            v: 1,
            value: 0,
            tags: vec![],
            metadata: Some(Meta { v: 1, note: "a".into() }),
        };
        let mut new = old.clone();
        new.metadata.as_mut().unwrap().note = "b".into();

        let diff = differ.diff(&old, &new).unwrap();
        assert_eq!(
            diff.db_patch.set.get("metadata.note"),
            Some(&serde_json::json!("b"))
        );
        assert!(diff.db_patch.set.get("metadata.v").is_none());
    }

    #[test]
    fn large_primitive_array_diff_counts_duplicates() {
        let differ = Differ::new();
        let base: Vec<String> = (0..10).map(|i| format!("t{i}")).collect();

        let mut old = Doc { v: 1, value: 0, tags: base.clone(), metadata: None };
        old.tags.push("dup".into());
        old.tags.push("dup".into());
        old.tags.push("solo".into());

        let mut new = old.clone();
        new.tags.retain(|t| t != "solo");
        new.tags.push("dup".into());
        new.tags.push("fresh".into());

        // old has two "dup" + one "solo"; new has three "dup" + one "fresh".
        let diff = differ.diff(&old, &new).unwrap();
        assert!(diff.has_changes);
        match diff.db_patch.push.get("tags").unwrap() {
            PushOp::Each(added) => {
                assert_eq!(added, &vec![serde_json::json!("dup"), serde_json::json!("fresh")]);
            }
            PushOp::One(v) => panic!("expected two additions, got {v:?}"),
        }
        assert_eq!(diff.db_patch.pull.get("tags"), Some(&serde_json::json!("solo")));
    }

    #[test]
    fn small_array_length_change_replaces_whole() {
        let differ = Differ::new();
        let old = Doc { v: 1, value: 0, tags: vec!["x".into()], metadata: None };
        let mut new = old.clone();
        new.tags.push("y".into());

        let diff = differ.diff(&old, &new).unwrap();
        assert_eq!(
            diff.db_patch.set.get("tags"),
            Some(&serde_json::json!(["x", "y"]))
        );
    }

    #[test]
    fn patch_does_not_alias_source() {
        let differ = Differ::new();
        let old = Doc { v: 1, value: 0, tags: vec!["x".into()], metadata: None };
        let mut new = old.clone();
        new.tags = vec!["x".into(), "y".into()];

        let diff = differ.diff(&old, &new).unwrap();
        let mut mutated_new = new.clone();
        mutated_new.tags.push("z".into());

        assert_eq!(
            diff.db_patch.set.get("tags"),
            Some(&serde_json::json!(["x", "y"]))
        );
    }

    #[test]
    fn applying_db_patch_reaches_new_value() {
        let differ = Differ::new();
        let old = Doc { v: 1, value: 42, tags: vec!["x".into()], metadata: None };
        let mut new = old.clone();
        new.value = 43;
        new.tags.push("y".into());
        new.set_version(2);

        let diff = differ.diff(&old, &new).unwrap();
        let mut old_value = serde_json::to_value(&old).unwrap();
        apply(&mut old_value, &diff.db_patch);

        let reconstructed: Doc = serde_json::from_value(old_value).unwrap();
        assert_eq!(reconstructed, new);
    }
}
