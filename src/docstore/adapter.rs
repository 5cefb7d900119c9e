//! The persistence adapter contract (C3): a uniform save/load/list/delete
//! surface over whatever document database backs a
//! [`crate::docstore::VersionedStore`], plus an optional snapshot capability.

use async_trait::async_trait;

use crate::error::Result;

/// Uniform persistence operations consumed by [`crate::docstore::VersionedStore`].
///
/// Implementations MUST be safe under concurrent access — the store may call
/// any method from any task, with no external synchronization.
#[async_trait]
pub trait PersistenceAdapter: Send + Sync {
    /// Serialize and upsert `bytes` under `id`, overwriting any existing
    /// record.
    async fn save(&self, id: &str, bytes: &[u8]) -> Result<()>;

    /// Load the raw bytes stored under `id`. `Err(StoreError::NotFound)` if
    /// absent.
    async fn load(&self, id: &str) -> Result<Vec<u8>>;

    /// All known ids.
    async fn list(&self) -> Result<Vec<String>>;

    /// Delete the record under `id`. Idempotent: deleting an absent id is
    /// not an error.
    async fn delete(&self, id: &str) -> Result<()>;

    /// Release any resources held by the adapter (connection pools, file
    /// handles). Idempotent.
    async fn close(&self) -> Result<()>;

    /// Upsert `bytes` under `id` only if no record currently exists.
    /// Returns `true` when the insert happened, `false` when a record
    /// already existed and was left untouched. Used by
    /// `find_one_and_upsert` for at-most-one-create semantics.
    async fn insert_if_absent(&self, id: &str, bytes: &[u8]) -> Result<bool>;

    /// Conditionally overwrite the record under `id`, succeeding only when
    /// the stored document's current version equals `expected_version`.
    /// Returns `true` on success, `false` on version mismatch (the caller
    /// retries), matching the "find-and-update filtered by {id, v}"
    /// contract used by every OCC edit path.
    async fn compare_and_swap(
        &self,
        id: &str,
        expected_version: i64,
        bytes: &[u8],
    ) -> Result<bool>;

    /// Conditionally overwrite the record under `id`, predicated on the
    /// integer found at the dotted JSON path `version_path` (a section's
    /// own version counter, e.g. `"metadata.v"`) equaling
    /// `expected_version`. When `expected_version` is `None`, the write
    /// succeeds as long as `id` exists — used when the section had no
    /// prior version to predicate on. Backs `update_section`'s two-level
    /// OCC.
    async fn compare_and_swap_section(
        &self,
        id: &str,
        version_path: &str,
        expected_version: Option<i64>,
        bytes: &[u8],
    ) -> Result<bool>;

    /// Narrow this adapter to its optional snapshot capability, if
    /// implemented. Mirrors the original's "optional capability discovered
    /// by interface query" without Go-style type assertions: the adapter
    /// explicitly opts in by overriding this accessor.
    fn as_snapshot_provider(&self) -> Option<&dyn SnapshotProvider> {
        None
    }
}

/// Optional point-in-time snapshot capability a [`PersistenceAdapter`] may
/// additionally implement. When a backend does not implement it, snapshot
/// calls at the store level fail with `StoreError::UnsupportedOperation`.
#[async_trait]
pub trait SnapshotProvider: Send + Sync {
    /// Record a new snapshot of `id` at its current persisted state,
    /// returning the snapshot's version tag.
    async fn create(&self, id: &str) -> Result<i64>;

    /// Persist `bytes` explicitly as a snapshot of `id` at `version`.
    async fn save(&self, id: &str, version: i64, bytes: &[u8]) -> Result<()>;

    /// Load a specific snapshot's bytes.
    async fn load(&self, id: &str, version: i64) -> Result<Vec<u8>>;

    /// List all snapshot versions recorded for `id`, ascending.
    async fn list(&self, id: &str) -> Result<Vec<i64>>;

    /// Delete one snapshot version.
    async fn delete(&self, id: &str, version: i64) -> Result<()>;

    /// Delete every snapshot recorded for `id`.
    async fn delete_all(&self, id: &str) -> Result<()>;

    /// Overwrite the live document at `id` with the contents of snapshot
    /// `version`.
    async fn restore(&self, id: &str, version: i64) -> Result<()>;
}
