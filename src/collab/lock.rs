//! Distributed lock manager (C7): named, leased, owner-fenced locks with
//! auto-refresh.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::config::LockConfig;
use crate::error::Result;

/// Backend operations a [`LockManager`] needs: atomic set-if-absent,
/// owner-checked expire, and owner-checked delete over a
/// `lock:<resource_id> -> owner_id` keyspace.
#[async_trait]
pub trait LockManager: Send + Sync {
    /// Set `lock:<resource_id> -> owner_id` with `ttl` only if absent.
    /// Returns `true` when the set happened (lock acquired).
    async fn try_acquire(&self, resource_id: &str, owner_id: &str, ttl: Duration) -> Result<bool>;

    /// Atomic "owner-checked expire": refresh the TTL only if the current
    /// owner matches `owner_id`. No-ops (returns `false`) for non-owners or
    /// an expired/absent lock.
    async fn try_refresh(&self, resource_id: &str, owner_id: &str, ttl: Duration) -> Result<bool>;

    /// Atomic "owner-checked delete": remove the lock only if the current
    /// owner matches `owner_id`. Idempotent when not held by `owner_id`.
    async fn try_release(&self, resource_id: &str, owner_id: &str) -> Result<bool>;
}

struct Entry {
    owner_id: String,
    deadline: Instant,
}

/// Reference [`LockManager`] over an in-process map, guarded by a
/// read-write lock (readers check expiry, writers insert/remove).
#[derive(Default)]
pub struct InMemoryLockManager {
    locks: RwLock<HashMap<String, Entry>>,
}

impl InMemoryLockManager {
    /// Construct an empty lock manager.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockManager for InMemoryLockManager {
    async fn try_acquire(&self, resource_id: &str, owner_id: &str, ttl: Duration) -> Result<bool> {
        let mut guard = self.locks.write().await;
        let now = Instant::now();
        if let Some(existing) = guard.get(resource_id) {
            if existing.deadline > now {
                return Ok(false);
            }
        }
        guard.insert(
            resource_id.to_string(),
            Entry { owner_id: owner_id.to_string(), deadline: now + ttl },
        );
        Ok(true)
    }

    async fn try_refresh(&self, resource_id: &str, owner_id: &str, ttl: Duration) -> Result<bool> {
        let mut guard = self.locks.write().await;
        match guard.get_mut(resource_id) {
            Some(entry) if entry.owner_id == owner_id && entry.deadline > Instant::now() => {
                entry.deadline = Instant::now() + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn try_release(&self, resource_id: &str, owner_id: &str) -> Result<bool> {
        let mut guard = self.locks.write().await;
        match guard.get(resource_id) {
            Some(entry) if entry.owner_id == owner_id => {
                guard.remove(resource_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// A handle to a single named resource's lock, bound to one owner id.
/// Acquiring starts a background refresh task ticking at `ttl/3` (minimum
/// one second); releasing stops it.
pub struct DistributedLock {
    backend: Arc<dyn LockManager>,
    resource_id: String,
    owner_id: String,
    config: LockConfig,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
}

impl DistributedLock {
    /// Construct a lock handle for `resource_id`, owned by `owner_id` once
    /// acquired.
    pub fn new(backend: Arc<dyn LockManager>, resource_id: impl Into<String>, owner_id: impl Into<String>, config: LockConfig) -> Self {
        Self {
            backend,
            resource_id: resource_id.into(),
            owner_id: owner_id.into(),
            config,
            refresh_task: Mutex::new(None),
        }
    }

    /// Attempt to acquire the lock, polling until `config.acquire_timeout`
    /// elapses. Returns `true` on acquisition, `false` on contention
    /// timeout.
    pub async fn acquire(&self) -> Result<bool> {
        let deadline = Instant::now() + self.config.acquire_timeout;
        loop {
            if self.backend.try_acquire(&self.resource_id, &self.owner_id, self.config.ttl).await? {
                self.start_refresh();
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    fn start_refresh(&self) {
        let backend = self.backend.clone();
        let resource_id = self.resource_id.clone();
        let owner_id = self.owner_id.clone();
        let ttl = self.config.ttl;
        let interval = self.config.refresh_interval();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Ok(false) | Err(_) = backend.try_refresh(&resource_id, &owner_id, ttl).await {
                    break;
                }
            }
        });
        if let Ok(mut guard) = self.refresh_task.try_lock() {
            *guard = Some(handle);
        }
    }

    /// Release the lock if owned by this handle, and stop the refresh
    /// task. Idempotent when not held.
    pub async fn release(&self) -> Result<bool> {
        if let Some(handle) = self.refresh_task.lock().await.take() {
            handle.abort();
        }
        self.backend.try_release(&self.resource_id, &self.owner_id).await
    }

    /// Explicitly refresh the lease. No-ops if this handle is not the
    /// current owner.
    pub async fn refresh(&self) -> Result<bool> {
        self.backend.try_refresh(&self.resource_id, &self.owner_id, self.config.ttl).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mutual_exclusion_and_no_op_release() {
        let backend = Arc::new(InMemoryLockManager::new());
        let config = LockConfig { ttl: Duration::from_secs(5), acquire_timeout: Duration::from_millis(100) };

        let a = DistributedLock::new(backend.clone(), "R", "A", config);
        let b = DistributedLock::new(backend.clone(), "R", "B", config);

        assert!(a.acquire().await.unwrap());
        assert!(!b.acquire().await.unwrap());

        assert!(!b.release().await.unwrap(), "release by non-owner is a no-op");
        assert!(a.refresh().await.unwrap());
        assert!(a.release().await.unwrap());

        assert!(b.acquire().await.unwrap());
        b.release().await.unwrap();
    }

    #[tokio::test]
    async fn refresh_by_non_owner_fails() {
        let backend = Arc::new(InMemoryLockManager::new());
        let config = LockConfig { ttl: Duration::from_secs(5), acquire_timeout: Duration::from_millis(100) };

        let a = DistributedLock::new(backend.clone(), "R", "A", config);
        let b = DistributedLock::new(backend.clone(), "R", "B", config);
        assert!(a.acquire().await.unwrap());
        assert!(!b.refresh().await.unwrap());
    }
}
