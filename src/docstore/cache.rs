//! The cache contract (C4): key→document mapping with TTL, used as the
//! store's write-through layer.

use std::time::Duration;

use async_trait::async_trait;
use moka::future::Cache as MokaCache;

use crate::error::Result;

/// Write-through key→document cache, keyed by the hex string form of a
/// document id.
///
/// The store always writes the database first and refreshes the cache
/// second; a cache failure after a successful database write surfaces as
/// `StoreError::PartialSuccess` rather than rolling back the write.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Fetch the cached bytes for `key`, if present and unexpired.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Insert `value` under `key` with the given time-to-live.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()>;

    /// Remove `key`, if present.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Remove every entry.
    async fn clear(&self) -> Result<()>;

    /// Release any resources held by the cache. Idempotent.
    async fn close(&self) -> Result<()>;
}

/// Reference [`Cache`] built on `moka::future::Cache`, the ecosystem's
/// async-aware TTL cache, rather than a hand-rolled `HashMap<_, (T, Instant)>`.
///
/// Per-entry TTL is enforced with a `moka::Expiry` that reads the duration
/// supplied to `set` instead of one cache-wide TTL.
pub struct MemoryCache {
    inner: MokaCache<String, std::sync::Arc<(Vec<u8>, Duration)>>,
}

struct PerEntryExpiry;

impl moka::Expiry<String, std::sync::Arc<(Vec<u8>, Duration)>> for PerEntryExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &std::sync::Arc<(Vec<u8>, Duration)>,
        _created_at: std::time::Instant,
    ) -> Option<Duration> {
        Some(value.1)
    }
}

impl MemoryCache {
    /// Construct a cache with the given maximum entry count.
    pub fn new(max_capacity: u64) -> Self {
        Self {
            inner: MokaCache::builder()
                .max_capacity(max_capacity)
                .expire_after(PerEntryExpiry)
                .build(),
        }
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.inner.get(key).await.map(|entry| entry.0.clone()))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        self.inner
            .insert(key.to_string(), std::sync::Arc::new((value, ttl)))
            .await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.invalidate(key).await;
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.inner.invalidate_all();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
