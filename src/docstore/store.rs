//! The versioned document store itself (C5): CRUD, optimistic concurrency
//! control at whole-document and section granularity, and change-stream
//! fan-out.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, RwLock};

use crate::cancellation::CancellationToken;
use crate::config::StoreConfig;
use crate::diffing::{apply_db_patch, Diff, DbPatch, Differ};
use crate::error::{Result, StoreError};
use crate::types::ObjectId;
use crate::versioning::Versioned;

use super::adapter::PersistenceAdapter;
use super::cache::Cache;
use super::hot_watcher::HotWatcher;

/// A document type usable with [`VersionedStore`] exposes its primary key
/// alongside [`Versioned`]'s version counter.
pub trait Identified {
    /// The document's primary key.
    fn id(&self) -> ObjectId;
}

/// The kind of mutation a [`WatchEvent`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// A new document was created.
    Create,
    /// An existing document was modified.
    Update,
    /// A document was removed.
    Delete,
}

/// An event emitted for every applied mutation and delivered to each
/// subscriber's channel, in database-commit order per subscriber.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    /// Hex-string id of the affected document.
    pub id: String,
    /// What kind of mutation occurred.
    pub operation: Operation,
    /// The post-image, when available (absent for deletes).
    pub data: Option<Value>,
}

struct Subscriber {
    sender: mpsc::Sender<WatchEvent>,
}

/// A live subscription returned by [`VersionedStore::watch`]. Drop the
/// receiver and call [`VersionedStore::unsubscribe`] with `id` to stop
/// delivery early; otherwise the subscription is torn down on
/// [`VersionedStore::close`].
pub struct Subscription {
    /// Identifies this subscription for [`VersionedStore::unsubscribe`].
    pub id: u64,
    /// Receives a [`WatchEvent`] for every mutation applied after
    /// subscribing.
    pub receiver: mpsc::Receiver<WatchEvent>,
}

/// Generic, versioned document repository with a write-through cache.
///
/// `T` must be [`Versioned`] (so the store can read/bump its version
/// counter without reflection) and [`Identified`] (so the store can read
/// its primary key). Cloning a store is cheap — all state is `Arc`-shared —
/// matching the teacher's handle-passing convention for its manager types.
pub struct VersionedStore<T> {
    adapter: Arc<dyn PersistenceAdapter>,
    cache: Arc<dyn Cache>,
    differ: Arc<Differ>,
    config: StoreConfig,
    hot_watcher: Option<Arc<HotWatcher>>,
    subscribers: Arc<RwLock<HashMap<u64, Subscriber>>>,
    next_subscriber_id: Arc<AtomicU64>,
    closed: Arc<AtomicBool>,
    cancellation: CancellationToken,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for VersionedStore<T> {
    fn clone(&self) -> Self {
        Self {
            adapter: self.adapter.clone(),
            cache: self.cache.clone(),
            differ: self.differ.clone(),
            config: self.config.clone(),
            hot_watcher: self.hot_watcher.clone(),
            subscribers: self.subscribers.clone(),
            next_subscriber_id: self.next_subscriber_id.clone(),
            closed: self.closed.clone(),
            cancellation: self.cancellation.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> VersionedStore<T>
where
    T: Versioned + Identified + Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Construct a store over `adapter` with a write-through `cache`. Starts
    /// the hot-data watcher when `config.hot_watcher` is set.
    pub fn new(adapter: Arc<dyn PersistenceAdapter>, cache: Arc<dyn Cache>, config: StoreConfig) -> Self {
        let hot_watcher = config.hot_watcher.map(|hw_config| {
            let watcher = Arc::new(HotWatcher::new(hw_config));
            watcher.start(adapter.clone(), cache.clone(), config.cache_ttl);
            watcher
        });

        Self {
            adapter,
            cache,
            differ: Arc::new(Differ::new()),
            config,
            hot_watcher,
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            next_subscriber_id: Arc::new(AtomicU64::new(0)),
            closed: Arc::new(AtomicBool::new(false)),
            cancellation: CancellationToken::new(),
            _marker: PhantomData,
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }

    async fn refresh_cache_best_effort(&self, id: &str, bytes: Vec<u8>) {
        if let Err(e) = self.cache.set(id, bytes, self.config.cache_ttl).await {
            log::warn!(
                "database write for {id} succeeded but cache refresh failed: {e}; \
                 treating as partial success, stale cache entry will self-correct on next miss"
            );
        }
    }

    async fn dispatch(&self, event: WatchEvent) {
        let guard = self.subscribers.read().await;
        for sub in guard.values() {
            if let Err(e) = sub.sender.try_send(event.clone()) {
                log::warn!("dropping watch event for a full/closed subscriber channel: {e}");
            }
        }
    }

    async fn notify(&self, operation: Operation, id: &str, doc: &T) {
        let data = serde_json::to_value(doc).ok();
        self.dispatch(WatchEvent { id: id.to_string(), operation, data }).await;
    }

    async fn notify_delete(&self, id: &str) {
        self.dispatch(WatchEvent { id: id.to_string(), operation: Operation::Delete, data: None }).await;
    }

    async fn backoff_or_cancelled(&self, attempt: u32) -> Result<()> {
        let delay = self.config.retry.backoff(attempt);
        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = self.cancellation.cancelled() => Err(StoreError::Timeout(self.config.edit_timeout)),
        }
    }

    /// Subscribe to the store's change-stream fan-out. Each applied
    /// mutation (create/update/delete) produces exactly one [`WatchEvent`]
    /// on this subscription's channel, delivered non-blockingly: a full
    /// channel drops the event for this subscriber only.
    pub async fn watch(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.config.subscriber_capacity);
        let id = self.next_subscriber_id.fetch_add(1, Ordering::SeqCst);
        self.subscribers.write().await.insert(id, Subscriber { sender: tx });
        Subscription { id, receiver: rx }
    }

    /// Remove a subscription early, before [`Self::close`].
    pub async fn unsubscribe(&self, subscription_id: u64) {
        self.subscribers.write().await.remove(&subscription_id);
    }

    /// Fetch a document by id. Cache lookup first — on hit, records the
    /// access for the hot-data watcher; on miss, loads from persistence,
    /// populates the cache, and returns.
    pub async fn find_one(&self, id: &str) -> Result<T> {
        self.ensure_open()?;

        if let Some(bytes) = self.cache.get(id).await? {
            if let Some(hw) = &self.hot_watcher {
                hw.record_access(id).await;
            }
            return serde_json::from_slice(&bytes).map_err(StoreError::Serde);
        }

        let bytes = self.adapter.load(id).await?;
        let doc: T = serde_json::from_slice(&bytes).map_err(StoreError::Serde)?;
        self.refresh_cache_best_effort(id, bytes).await;
        Ok(doc)
    }

    /// Query every stored document, keeping those for which `filter`
    /// returns `true`. When `cache_query_results` is configured, matching
    /// results are also written through to the cache.
    pub async fn find_many<F>(&self, filter: F) -> Result<Vec<T>>
    where
        F: Fn(&T) -> bool,
    {
        self.ensure_open()?;
        let ids = self.adapter.list().await?;
        let mut out = Vec::new();
        for id in ids {
            let bytes = match self.adapter.load(&id).await {
                Ok(b) => b,
                Err(StoreError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            let doc: T = serde_json::from_slice(&bytes).map_err(StoreError::Serde)?;
            if filter(&doc) {
                if self.config.cache_query_results {
                    self.refresh_cache_best_effort(&id, bytes).await;
                }
                out.push(doc);
            }
        }
        Ok(out)
    }

    /// Create-or-fetch: initializes `v=1` on `doc`, then inserts it only if
    /// absent. Concurrent callers for the same id observe at-most-one
    /// create; all receive the same, already-persisted document.
    pub async fn find_one_and_upsert(&self, mut doc: T) -> Result<T> {
        self.ensure_open()?;
        doc.set_version(1);
        let id = doc.id().to_string();
        let bytes = serde_json::to_vec(&doc).map_err(StoreError::Serde)?;

        if self.adapter.insert_if_absent(&id, &bytes).await? {
            self.refresh_cache_best_effort(&id, bytes).await;
            self.notify(Operation::Create, &id, &doc).await;
            Ok(doc)
        } else {
            let existing_bytes = self.adapter.load(&id).await?;
            let existing: T = serde_json::from_slice(&existing_bytes).map_err(StoreError::Serde)?;
            self.refresh_cache_best_effort(&id, existing_bytes).await;
            Ok(existing)
        }
    }

    /// The canonical OCC edit path: reads, applies `update_fn`, and retries
    /// against the latest version on conflict, bounded by the configured
    /// edit timeout and retry budget.
    pub async fn find_one_and_update<F>(&self, id: &str, update_fn: F) -> Result<(T, Diff)>
    where
        F: Fn(T) -> Result<T>,
    {
        self.ensure_open()?;
        let body = self.find_one_and_update_inner(id, update_fn);
        match tokio::time::timeout(self.config.edit_timeout, body).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.config.edit_timeout)),
        }
    }

    async fn find_one_and_update_inner<F>(&self, id: &str, update_fn: F) -> Result<(T, Diff)>
    where
        F: Fn(T) -> Result<T>,
    {
        let mut last_expected = 0;
        for attempt in 0..self.config.retry.max_retries {
            let current = self.find_one(id).await?;
            let v0 = current.version();
            last_expected = v0;

            let mut draft = update_fn(current.clone())?;

            // Diff against the caller's actual mutations before the version
            // bump, which every draft carries regardless of `update_fn` and
            // would otherwise make `has_changes` true unconditionally.
            let diff = self.differ.diff(&current, &draft)?;
            if !diff.has_changes {
                return Ok((current, diff));
            }

            draft.set_version(v0 + 1);
            let diff = self.differ.diff(&current, &draft)?;

            let bytes = serde_json::to_vec(&draft).map_err(StoreError::Serde)?;
            if self.adapter.compare_and_swap(id, v0, &bytes).await? {
                self.refresh_cache_best_effort(id, bytes).await;
                self.notify(Operation::Update, id, &draft).await;
                return Ok((draft, diff));
            }

            let _ = self.cache.delete(id).await;
            self.backoff_or_cancelled(attempt).await?;
        }
        Err(StoreError::VersionConflict { doc_id: id.to_string(), expected: last_expected })
    }

    /// Apply a pre-built [`DbPatch`] directly, merging in the version
    /// increment and retrying on conflict with the same backoff as
    /// [`Self::find_one_and_update`].
    pub async fn update_one(&self, id: &str, update: DbPatch) -> Result<T> {
        self.ensure_open()?;
        let body = self.update_one_inner(id, update);
        match tokio::time::timeout(self.config.edit_timeout, body).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.config.edit_timeout)),
        }
    }

    async fn update_one_inner(&self, id: &str, mut update: DbPatch) -> Result<T> {
        let mut last_expected = 0;
        for attempt in 0..self.config.retry.max_retries {
            let bytes = self.adapter.load(id).await?;
            let mut value: Value = serde_json::from_slice(&bytes).map_err(StoreError::Serde)?;
            let v0 = value.get(T::VERSION_FIELD).and_then(Value::as_i64).unwrap_or(0);
            last_expected = v0;

            update.inc.insert(T::VERSION_FIELD.to_string(), 1.0);
            apply_db_patch(&mut value, &update);

            let new_bytes = serde_json::to_vec(&value).map_err(StoreError::Serde)?;
            if self.adapter.compare_and_swap(id, v0, &new_bytes).await? {
                self.refresh_cache_best_effort(id, new_bytes).await;
                let doc: T = serde_json::from_value(value).map_err(StoreError::Serde)?;
                self.notify(Operation::Update, id, &doc).await;
                return Ok(doc);
            }

            let _ = self.cache.delete(id).await;
            self.backoff_or_cancelled(attempt).await?;
        }
        Err(StoreError::VersionConflict { doc_id: id.to_string(), expected: last_expected })
    }

    /// Apply an ordered sequence of [`DbPatch`] "pipeline stages", bumping
    /// the version once at the end, retrying on conflict. The Rust
    /// realization of a match-then-set aggregation pipeline: each stage is
    /// itself a structured patch rather than an arbitrary aggregation
    /// expression.
    pub async fn update_one_with_pipeline(&self, id: &str, stages: Vec<DbPatch>) -> Result<T> {
        self.ensure_open()?;
        let body = self.update_one_with_pipeline_inner(id, stages);
        match tokio::time::timeout(self.config.edit_timeout, body).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.config.edit_timeout)),
        }
    }

    async fn update_one_with_pipeline_inner(&self, id: &str, stages: Vec<DbPatch>) -> Result<T> {
        let mut last_expected = 0;
        for attempt in 0..self.config.retry.max_retries {
            let bytes = self.adapter.load(id).await?;
            let mut value: Value = serde_json::from_slice(&bytes).map_err(StoreError::Serde)?;
            let v0 = value.get(T::VERSION_FIELD).and_then(Value::as_i64).unwrap_or(0);
            last_expected = v0;

            for stage in &stages {
                apply_db_patch(&mut value, stage);
            }
            if let Value::Object(map) = &mut value {
                map.insert(T::VERSION_FIELD.to_string(), serde_json::json!(v0 + 1));
            }

            let new_bytes = serde_json::to_vec(&value).map_err(StoreError::Serde)?;
            if self.adapter.compare_and_swap(id, v0, &new_bytes).await? {
                self.refresh_cache_best_effort(id, new_bytes).await;
                let doc: T = serde_json::from_value(value).map_err(StoreError::Serde)?;
                self.notify(Operation::Update, id, &doc).await;
                return Ok(doc);
            }

            let _ = self.cache.delete(id).await;
            self.backoff_or_cancelled(attempt).await?;
        }
        Err(StoreError::VersionConflict { doc_id: id.to_string(), expected: last_expected })
    }

    /// Two-level OCC: `path` names a dotted, nested section carrying its
    /// own independent version counter under
    /// `config.section_version_field`. A missing terminal section is
    /// treated as an empty container at implicit version 0 (so the first
    /// write lands at version 1); a missing intermediate container fails
    /// with `InvalidPath`.
    pub async fn update_section<F>(&self, id: &str, path: &str, section_fn: F) -> Result<T>
    where
        F: Fn(Value) -> Result<Value>,
    {
        self.ensure_open()?;
        let body = self.update_section_inner(id, path, section_fn);
        match tokio::time::timeout(self.config.edit_timeout, body).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.config.edit_timeout)),
        }
    }

    async fn update_section_inner<F>(&self, id: &str, path: &str, section_fn: F) -> Result<T>
    where
        F: Fn(Value) -> Result<Value>,
    {
        let segments: Vec<&str> = path.split('.').collect();
        let version_path = format!("{path}.{}", self.config.section_version_field);

        let mut last_expected = 0;
        let mut last_observed = 0;
        for attempt in 0..self.config.retry.max_retries {
            let bytes = self.adapter.load(id).await?;
            let mut doc_value: Value = serde_json::from_slice(&bytes).map_err(StoreError::Serde)?;

            let section_before = resolve_section(&doc_value, &segments)?;
            let existing_version = match &section_before {
                Some(Value::Object(map)) => map.get(&self.config.section_version_field).and_then(Value::as_i64),
                Some(_) => return Err(StoreError::InvalidPath(path.to_string())),
                None => None,
            };
            last_expected = existing_version.unwrap_or(0);
            last_observed = last_expected;

            let section_input = section_before.cloned().unwrap_or_else(|| Value::Object(Default::default()));
            let mut section_after = section_fn(section_input)?;
            if !section_after.is_object() {
                return Err(StoreError::InvalidPath(path.to_string()));
            }
            let new_version = existing_version.unwrap_or(0) + 1;
            section_after
                .as_object_mut()
                .unwrap()
                .insert(self.config.section_version_field.clone(), serde_json::json!(new_version));

            set_section(&mut doc_value, &segments, section_after)?;
            if let Value::Object(map) = &mut doc_value {
                let doc_version = map.get(T::VERSION_FIELD).and_then(Value::as_i64).unwrap_or(0);
                map.insert(T::VERSION_FIELD.to_string(), serde_json::json!(doc_version));
            }

            let new_bytes = serde_json::to_vec(&doc_value).map_err(StoreError::Serde)?;
            if self
                .adapter
                .compare_and_swap_section(id, &version_path, existing_version, &new_bytes)
                .await?
            {
                self.refresh_cache_best_effort(id, new_bytes).await;
                let doc: T = serde_json::from_value(doc_value).map_err(StoreError::Serde)?;
                self.notify(Operation::Update, id, &doc).await;
                return Ok(doc);
            }

            // Section version conflict: re-read the observed version for
            // the error we raise if retries are exhausted.
            if let Ok(refreshed) = self.adapter.load(id).await {
                if let Ok(v) = serde_json::from_slice::<Value>(&refreshed) {
                    if let Ok(Some(section)) = resolve_section(&v, &segments) {
                        if let Some(observed) = section
                            .as_object()
                            .and_then(|m| m.get(&self.config.section_version_field))
                            .and_then(Value::as_i64)
                        {
                            last_observed = observed;
                        }
                    }
                }
            }
            self.backoff_or_cancelled(attempt).await?;
        }
        Err(StoreError::SectionVersionError {
            doc_id: id.to_string(),
            path: path.to_string(),
            expected: last_expected,
            observed: last_observed,
        })
    }

    /// Delete a document from persistence, then the cache. A cache failure
    /// after a successful persistence delete surfaces as `PartialSuccess`
    /// rather than rolling back the delete.
    pub async fn delete_one(&self, id: &str) -> Result<()> {
        self.ensure_open()?;
        self.adapter.delete(id).await?;
        if let Err(e) = self.cache.delete(id).await {
            self.notify_delete(id).await;
            return Err(StoreError::PartialSuccess { doc_id: id.to_string(), cache_error: e.to_string() });
        }
        self.notify_delete(id).await;
        Ok(())
    }

    /// Run `f` against a store handle scoped to this "transaction". There
    /// is no external database session to bind here (the real database is
    /// an out-of-scope collaborator); this executes `f` against a cloned
    /// handle over the same adapter/cache so that operations issued inside
    /// `f` participate in the same store state, without pretending to offer
    /// rollback an arbitrary `PersistenceAdapter` cannot provide.
    pub async fn with_transaction<F, Fut, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(VersionedStore<T>) -> Fut,
        Fut: std::future::Future<Output = Result<R>>,
    {
        self.ensure_open()?;
        f(self.clone()).await
    }

    /// Stop the hot-data watcher, close the cache and adapter, and tear
    /// down all subscriptions.
    pub async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.cancellation.cancel();
        if let Some(hw) = &self.hot_watcher {
            hw.close().await;
        }
        self.subscribers.write().await.clear();
        self.cache.close().await?;
        self.adapter.close().await?;
        Ok(())
    }
}

fn resolve_section<'a>(root: &'a Value, segments: &[&str]) -> Result<Option<&'a Value>> {
    if segments.is_empty() {
        return Ok(Some(root));
    }
    let mut cur = root;
    for seg in &segments[..segments.len() - 1] {
        match cur {
            Value::Object(map) => match map.get(*seg) {
                Some(v) => cur = v,
                None => return Err(StoreError::InvalidPath(segments.join("."))),
            },
            _ => return Err(StoreError::InvalidPath(segments.join("."))),
        }
    }
    match cur {
        Value::Object(map) => Ok(map.get(*segments.last().unwrap())),
        _ => Err(StoreError::InvalidPath(segments.join("."))),
    }
}

fn set_section(root: &mut Value, segments: &[&str], value: Value) -> Result<()> {
    if segments.is_empty() {
        *root = value;
        return Ok(());
    }
    let mut cur = root;
    for seg in &segments[..segments.len() - 1] {
        if !cur.is_object() {
            return Err(StoreError::InvalidPath(segments.join(".")));
        }
        cur = cur
            .as_object_mut()
            .unwrap()
            .entry(seg.to_string())
            .or_insert_with(|| Value::Object(Default::default()));
    }
    if !cur.is_object() {
        return Err(StoreError::InvalidPath(segments.join(".")));
    }
    cur.as_object_mut()
        .unwrap()
        .insert((*segments.last().unwrap()).to_string(), value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docstore::MemoryAdapter;
    use crate::docstore::MemoryCache;
    use serde::Deserialize;
    use std::time::Duration;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Doc {
        id: String,
        v: i64,
        value: i64,
        metadata: Option<Value>,
    }

    crate::derive_versioned!(Doc, v, "v");

    impl Identified for Doc {
        fn id(&self) -> ObjectId {
            self.id.parse().unwrap_or_default()
        }
    }

    fn new_store() -> VersionedStore<Doc> {
        let adapter = Arc::new(MemoryAdapter::new("v"));
        let cache = Arc::new(MemoryCache::default());
        VersionedStore::new(adapter, cache, StoreConfig::default())
    }

    #[tokio::test]
    async fn upsert_initializes_version_one_and_is_idempotent() {
        let store = new_store();
        let id = ObjectId::new().to_string();
        let first = store
            .find_one_and_upsert(Doc { id: id.clone(), v: 0, value: 1, metadata: None })
            .await
            .unwrap();
        assert_eq!(first.v, 1);

        let second = store
            .find_one_and_upsert(Doc { id: id.clone(), v: 0, value: 999, metadata: None })
            .await
            .unwrap();
        assert_eq!(second, first);
    }

    #[tokio::test]
    async fn find_one_and_update_bumps_version() {
        let store = new_store();
        let id = ObjectId::new().to_string();
        store
            .find_one_and_upsert(Doc { id: id.clone(), v: 0, value: 42, metadata: None })
            .await
            .unwrap();

        let (updated, diff) = store
            .find_one_and_update(&id, |mut d| {
                d.value += 1;
                Ok(d)
            })
            .await
            .unwrap();

        assert_eq!(updated.v, 2);
        assert_eq!(updated.value, 43);
        assert!(diff.has_changes);
    }

    #[tokio::test]
    async fn find_one_and_update_with_no_changes_skips_write() {
        let store = new_store();
        let id = ObjectId::new().to_string();
        store
            .find_one_and_upsert(Doc { id: id.clone(), v: 0, value: 42, metadata: None })
            .await
            .unwrap();

        let (doc, diff) = store.find_one_and_update(&id, Ok).await.unwrap();
        assert_eq!(doc.v, 1);
        assert!(!diff.has_changes);
    }

    #[tokio::test]
    async fn concurrent_updates_eventually_all_succeed_once() {
        let store = new_store();
        let id = ObjectId::new().to_string();
        store
            .find_one_and_upsert(Doc { id: id.clone(), v: 0, value: 0, metadata: None })
            .await
            .unwrap();

        let a = store.clone();
        let b = store.clone();
        let id_a = id.clone();
        let id_b = id.clone();

        let (ra, rb) = tokio::join!(
            a.find_one_and_update(&id_a, |mut d| {
                d.value += 1;
                Ok(d)
            }),
            b.find_one_and_update(&id_b, |mut d| {
                d.value += 1;
                Ok(d)
            })
        );

        assert!(ra.is_ok());
        assert!(rb.is_ok());
        let final_doc = store.find_one(&id).await.unwrap();
        assert_eq!(final_doc.value, 2);
        assert_eq!(final_doc.v, 3);
    }

    #[tokio::test]
    async fn update_section_tracks_independent_version() {
        let store = new_store();
        let id = ObjectId::new().to_string();
        store
            .find_one_and_upsert(Doc {
                id: id.clone(),
                v: 0,
                value: 0,
                metadata: Some(serde_json::json!({"v": 1, "tags": ["x"]})),
            })
            .await
            .unwrap();

        let updated = store
            .update_section(&id, "metadata", |section| {
                let mut section = section;
                let tags = section
                    .as_object_mut()
                    .unwrap()
                    .entry("tags")
                    .or_insert_with(|| Value::Array(Vec::new()));
                tags.as_array_mut().unwrap().push(serde_json::json!("y"));
                Ok(section)
            })
            .await
            .unwrap();

        let metadata = updated.metadata.unwrap();
        assert_eq!(metadata["v"], serde_json::json!(2));
        assert_eq!(metadata["tags"], serde_json::json!(["x", "y"]));
        assert_eq!(updated.v, 1, "document version unchanged by a section update");
    }

    #[tokio::test]
    async fn update_section_missing_intermediate_is_invalid_path() {
        let store = new_store();
        let id = ObjectId::new().to_string();
        store
            .find_one_and_upsert(Doc { id: id.clone(), v: 0, value: 0, metadata: None })
            .await
            .unwrap();

        let result = store.update_section(&id, "metadata.nested", |s| Ok(s)).await;
        assert!(matches!(result, Err(StoreError::InvalidPath(_))));
    }

    #[tokio::test]
    async fn delete_then_find_is_not_found() {
        let store = new_store();
        let id = ObjectId::new().to_string();
        store
            .find_one_and_upsert(Doc { id: id.clone(), v: 0, value: 0, metadata: None })
            .await
            .unwrap();

        store.delete_one(&id).await.unwrap();
        assert!(matches!(store.find_one(&id).await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn watch_receives_create_update_delete_in_order() {
        let store = new_store();
        let id = ObjectId::new().to_string();
        let mut sub = store.watch().await;

        store
            .find_one_and_upsert(Doc { id: id.clone(), v: 0, value: 0, metadata: None })
            .await
            .unwrap();
        store
            .find_one_and_update(&id, |mut d| {
                d.value = 1;
                Ok(d)
            })
            .await
            .unwrap();
        store.delete_one(&id).await.unwrap();

        let ev1 = sub.receiver.recv().await.unwrap();
        let ev2 = sub.receiver.recv().await.unwrap();
        let ev3 = sub.receiver.recv().await.unwrap();

        assert_eq!(ev1.operation, Operation::Create);
        assert_eq!(ev2.operation, Operation::Update);
        assert_eq!(ev3.operation, Operation::Delete);
        assert_eq!(ev1.id, id);
    }

    #[tokio::test]
    async fn operations_after_close_fail() {
        let store = new_store();
        store.close().await.unwrap();
        assert!(matches!(store.find_one("anything").await, Err(StoreError::Closed)));
    }

    #[tokio::test]
    async fn find_many_filters_results() {
        let store = new_store();
        for i in 0..3 {
            store
                .find_one_and_upsert(Doc {
                    id: ObjectId::new().to_string(),
                    v: 0,
                    value: i,
                    metadata: None,
                })
                .await
                .unwrap();
        }
        let evens = store.find_many(|d| d.value % 2 == 0).await.unwrap();
        assert_eq!(evens.len(), 2);
    }

    struct AlwaysConflictAdapter(MemoryAdapter);

    #[async_trait::async_trait]
    impl PersistenceAdapter for AlwaysConflictAdapter {
        async fn save(&self, id: &str, bytes: &[u8]) -> Result<()> {
            self.0.save(id, bytes).await
        }
        async fn load(&self, id: &str) -> Result<Vec<u8>> {
            self.0.load(id).await
        }
        async fn list(&self) -> Result<Vec<String>> {
            self.0.list().await
        }
        async fn delete(&self, id: &str) -> Result<()> {
            self.0.delete(id).await
        }
        async fn close(&self) -> Result<()> {
            self.0.close().await
        }
        async fn insert_if_absent(&self, id: &str, bytes: &[u8]) -> Result<bool> {
            self.0.insert_if_absent(id, bytes).await
        }
        async fn compare_and_swap(&self, _id: &str, _expected_version: i64, _bytes: &[u8]) -> Result<bool> {
            Ok(false)
        }
        async fn compare_and_swap_section(
            &self,
            _id: &str,
            _version_path: &str,
            _expected_version: Option<i64>,
            _bytes: &[u8],
        ) -> Result<bool> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn edit_timeout_bounds_a_perpetually_conflicting_retry_loop() {
        let mut config = StoreConfig::default();
        config.edit_timeout = Duration::from_millis(50);
        config.retry.max_retries = 1_000_000;
        config.retry.retry_delay = Duration::from_millis(1);
        config.retry.max_retry_delay = Duration::from_millis(1);
        config.retry.jitter_fraction = 0.0;

        let adapter = Arc::new(AlwaysConflictAdapter(MemoryAdapter::new("v")));
        let cache = Arc::new(MemoryCache::default());
        let store = VersionedStore::new(adapter, cache, config);

        let id = ObjectId::new().to_string();
        store
            .find_one_and_upsert(Doc { id: id.clone(), v: 0, value: 0, metadata: None })
            .await
            .unwrap();

        let result = store
            .find_one_and_update(&id, |mut d| {
                d.value += 1;
                Ok(d)
            })
            .await;
        assert!(matches!(result, Err(StoreError::Timeout(_))));
    }
}
