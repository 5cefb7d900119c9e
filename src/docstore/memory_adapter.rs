//! In-memory reference [`PersistenceAdapter`], used by tests and by callers
//! who don't need real persistence. Not exposed as a production backend.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::{Result, StoreError};

use super::adapter::{PersistenceAdapter, SnapshotProvider};

/// A `HashMap`-backed adapter that treats stored bytes as JSON and reads a
/// configurable version field out of them to implement `compare_and_swap`
/// without a real database's native predicate support.
pub struct MemoryAdapter {
    version_field: String,
    docs: RwLock<HashMap<String, Vec<u8>>>,
    snapshots: RwLock<HashMap<String, BTreeMap<i64, Vec<u8>>>>,
}

impl MemoryAdapter {
    /// Construct an adapter that reads the version counter from the JSON
    /// field named `version_field` (e.g. `"v"`, or whatever
    /// `Versioned::VERSION_FIELD` resolves to for the document type in use).
    pub fn new(version_field: impl Into<String>) -> Self {
        Self {
            version_field: version_field.into(),
            docs: RwLock::new(HashMap::new()),
            snapshots: RwLock::new(HashMap::new()),
        }
    }

    fn read_version(&self, bytes: &[u8]) -> Option<i64> {
        let value: Value = serde_json::from_slice(bytes).ok()?;
        value.get(&self.version_field)?.as_i64()
    }
}

#[async_trait]
impl PersistenceAdapter for MemoryAdapter {
    async fn save(&self, id: &str, bytes: &[u8]) -> Result<()> {
        self.docs.write().await.insert(id.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Vec<u8>> {
        self.docs
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn list(&self) -> Result<Vec<String>> {
        Ok(self.docs.read().await.keys().cloned().collect())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.docs.write().await.remove(id);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn insert_if_absent(&self, id: &str, bytes: &[u8]) -> Result<bool> {
        let mut guard = self.docs.write().await;
        if guard.contains_key(id) {
            Ok(false)
        } else {
            guard.insert(id.to_string(), bytes.to_vec());
            Ok(true)
        }
    }

    async fn compare_and_swap(&self, id: &str, expected_version: i64, bytes: &[u8]) -> Result<bool> {
        let mut guard = self.docs.write().await;
        let current = match guard.get(id) {
            Some(b) => b,
            None => return Ok(false),
        };
        let current_version = self.read_version(current).unwrap_or(0);
        if current_version != expected_version {
            return Ok(false);
        }
        guard.insert(id.to_string(), bytes.to_vec());
        Ok(true)
    }

    async fn compare_and_swap_section(
        &self,
        id: &str,
        version_path: &str,
        expected_version: Option<i64>,
        bytes: &[u8],
    ) -> Result<bool> {
        let mut guard = self.docs.write().await;
        let current = match guard.get(id) {
            Some(b) => b,
            None => return Ok(false),
        };
        if let Some(expected) = expected_version {
            let value: Value = serde_json::from_slice(current).unwrap_or(Value::Null);
            let observed = version_path
                .split('.')
                .try_fold(&value, |cur, seg| cur.get(seg))
                .and_then(Value::as_i64);
            if observed != Some(expected) {
                return Ok(false);
            }
        }
        guard.insert(id.to_string(), bytes.to_vec());
        Ok(true)
    }

    fn as_snapshot_provider(&self) -> Option<&dyn SnapshotProvider> {
        Some(self)
    }
}

#[async_trait]
impl SnapshotProvider for MemoryAdapter {
    async fn create(&self, id: &str) -> Result<i64> {
        let bytes = PersistenceAdapter::load(self, id).await?;
        let version = self.read_version(&bytes).unwrap_or(0);
        self.snapshots
            .write()
            .await
            .entry(id.to_string())
            .or_default()
            .insert(version, bytes);
        Ok(version)
    }

    async fn save(&self, id: &str, version: i64, bytes: &[u8]) -> Result<()> {
        self.snapshots
            .write()
            .await
            .entry(id.to_string())
            .or_default()
            .insert(version, bytes.to_vec());
        Ok(())
    }

    async fn load(&self, id: &str, version: i64) -> Result<Vec<u8>> {
        self.snapshots
            .read()
            .await
            .get(id)
            .and_then(|m| m.get(&version))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("{id}@{version}")))
    }

    async fn list(&self, id: &str) -> Result<Vec<i64>> {
        Ok(self
            .snapshots
            .read()
            .await
            .get(id)
            .map(|m| m.keys().copied().collect())
            .unwrap_or_default())
    }

    async fn delete(&self, id: &str, version: i64) -> Result<()> {
        if let Some(m) = self.snapshots.write().await.get_mut(id) {
            m.remove(&version);
        }
        Ok(())
    }

    async fn delete_all(&self, id: &str) -> Result<()> {
        self.snapshots.write().await.remove(id);
        Ok(())
    }

    async fn restore(&self, id: &str, version: i64) -> Result<()> {
        let bytes = SnapshotProvider::load(self, id, version).await?;
        self.save_doc_for_restore(id, &bytes).await
    }
}

impl MemoryAdapter {
    async fn save_doc_for_restore(&self, id: &str, bytes: &[u8]) -> Result<()> {
        self.docs.write().await.insert(id.to_string(), bytes.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_if_absent_is_at_most_once() {
        let adapter = MemoryAdapter::new("v");
        assert!(adapter.insert_if_absent("a", br#"{"v":1}"#).await.unwrap());
        assert!(!adapter.insert_if_absent("a", br#"{"v":1}"#).await.unwrap());
    }

    #[tokio::test]
    async fn compare_and_swap_rejects_stale_version() {
        let adapter = MemoryAdapter::new("v");
        PersistenceAdapter::save(&adapter, "a", br#"{"v":1}"#).await.unwrap();

        assert!(adapter.compare_and_swap("a", 1, br#"{"v":2}"#).await.unwrap());
        assert!(!adapter.compare_and_swap("a", 1, br#"{"v":3}"#).await.unwrap());
        assert!(adapter.compare_and_swap("a", 2, br#"{"v":3}"#).await.unwrap());
    }

    #[tokio::test]
    async fn load_missing_is_not_found() {
        let adapter = MemoryAdapter::new("v");
        assert!(matches!(
            PersistenceAdapter::load(&adapter, "missing").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn snapshot_round_trip() {
        let adapter = MemoryAdapter::new("v");
        PersistenceAdapter::save(&adapter, "a", br#"{"v":3,"value":9}"#).await.unwrap();
        let provider = adapter.as_snapshot_provider().unwrap();
        let version = provider.create("a").await.unwrap();
        assert_eq!(version, 3);

        PersistenceAdapter::save(&adapter, "a", br#"{"v":4,"value":10}"#).await.unwrap();
        provider.restore("a", version).await.unwrap();
        let restored = PersistenceAdapter::load(&adapter, "a").await.unwrap();
        assert_eq!(restored, br#"{"v":3,"value":9}"#.to_vec());
    }
}
