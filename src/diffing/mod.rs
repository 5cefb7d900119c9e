//! Minimal patch computation between two revisions of a document (C2).
//!
//! Two complementary patch shapes come out of every diff: a structured
//! [`patch::DbPatch`] with `set`/`unset`/`inc`/`push`/`pull`/`pullAll`
//! mutator families, directly applicable to the persistence backend, and an
//! RFC 7396 `merge_patch` JSON value for callers that want a simple partial
//! document instead.

mod differ;
mod merge;
mod patch;

pub use differ::{CustomPatcher, Diff, Differ};
pub use merge::{apply_merge_patch, diff_merge_patch};
pub use patch::{apply as apply_db_patch, DbPatch, PushOp};
