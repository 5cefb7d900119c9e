//! Managed CRDT document (C11): the per-document lifecycle that ties a
//! CRDT replica, the sync-manager registry, the distributed lock manager,
//! and the transaction marker manager together behind a single `edit`
//! surface.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::warn;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

use crate::config::{DocumentOptions, LockConfig, RetryConfig};
use crate::docstore::PersistenceAdapter;
use crate::error::{Result, StoreError};
use crate::types::ObjectId;

use super::engine::{CrdtEngine, CrdtPatch, CrdtReplica};
use super::lock::{DistributedLock, LockManager};
use super::registry::SyncManagerRegistry;
use super::serializer::{DocumentRecord, DocumentSerializer};
use super::tx_marker::TransactionMarkerManager;

/// Blanket trait for the closure shape every edit entry point accepts:
/// read the replica's current state, queue operations onto the patch.
/// Implementations must not call [`CrdtReplica::apply_op`] directly — the
/// document applies the patch itself immediately afterward.
pub trait EditFn: Fn(&dyn CrdtReplica, &mut dyn CrdtPatch) -> Result<()> + Send + Sync {}
impl<F> EditFn for F where F: Fn(&dyn CrdtReplica, &mut dyn CrdtPatch) -> Result<()> + Send + Sync {}

/// The result of a successful edit: the patch that was applied and
/// broadcast, encoded as it was sent over the transport.
#[derive(Debug, Clone)]
pub struct EditOutcome {
    /// Encoded bytes of the patch that was applied and broadcast.
    pub patch_bytes: Vec<u8>,
}

/// A callback invoked after every successful edit, with the document id
/// and the encoded patch that was just applied.
pub type ChangeCallback = Box<dyn Fn(&str, &[u8]) + Send + Sync>;

struct DocState {
    version: i64,
    last_modified: DateTime<Utc>,
}

/// A single document's managed CRDT state: replica, registry membership,
/// optional distributed lock and transaction marker integration, and
/// persistence through a [`PersistenceAdapter`].
pub struct ManagedDocument {
    id: String,
    session_id: String,
    engine: Arc<dyn CrdtEngine>,
    replica: Arc<AsyncMutex<Box<dyn CrdtReplica>>>,
    registry: Arc<SyncManagerRegistry>,
    adapter: Arc<dyn PersistenceAdapter>,
    serializer: DocumentSerializer,
    lock_manager: Option<Arc<dyn LockManager>>,
    tx_marker_manager: Option<Arc<dyn TransactionMarkerManager>>,
    options: DocumentOptions,
    lock_config: LockConfig,
    retry: RetryConfig,
    state: AsyncMutex<DocState>,
    metadata: AsyncMutex<Value>,
    edit_guard: AsyncMutex<()>,
    active_tx_id: AsyncMutex<Option<String>>,
    callbacks: AsyncMutex<Vec<ChangeCallback>>,
    autosave_task: AsyncMutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl ManagedDocument {
    /// Allocate a session id and a fresh CRDT replica for `id`, register
    /// it with `registry`, persist its (empty) initial state through
    /// `adapter`, and start an auto-save loop if configured.
    #[allow(clippy::too_many_arguments)]
    pub async fn create(
        id: impl Into<String>,
        engine: Arc<dyn CrdtEngine>,
        registry: Arc<SyncManagerRegistry>,
        adapter: Arc<dyn PersistenceAdapter>,
        lock_manager: Option<Arc<dyn LockManager>>,
        tx_marker_manager: Option<Arc<dyn TransactionMarkerManager>>,
        options: DocumentOptions,
        lock_config: LockConfig,
        retry: RetryConfig,
    ) -> Result<Arc<Self>> {
        let id = id.into();
        let session_id = ObjectId::new().to_string();
        let replica: Arc<AsyncMutex<Box<dyn CrdtReplica>>> =
            Arc::new(AsyncMutex::new(engine.new_replica(&session_id)));
        let serializer = DocumentSerializer::new(engine.clone());

        registry.register(&id, replica.clone()).await?;

        let doc = Arc::new(Self {
            id,
            session_id,
            engine,
            replica,
            registry,
            adapter,
            serializer,
            lock_manager,
            tx_marker_manager,
            options,
            lock_config,
            retry,
            state: AsyncMutex::new(DocState { version: 0, last_modified: Utc::now() }),
            metadata: AsyncMutex::new(Value::Object(Default::default())),
            edit_guard: AsyncMutex::new(()),
            active_tx_id: AsyncMutex::new(None),
            callbacks: AsyncMutex::new(Vec::new()),
            autosave_task: AsyncMutex::new(None),
            closed: AtomicBool::new(false),
        });

        doc.persist_initial().await?;

        if let Some(interval) = doc.options.auto_save_interval {
            doc.start_autosave(interval);
        }

        Ok(doc)
    }

    /// This document's id.
    pub fn id(&self) -> &str {
        &self.id
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }

    async fn build_record(&self) -> DocumentRecord {
        let state = self.state.lock().await;
        let metadata = self.metadata.lock().await.clone();
        let replica_guard = self.replica.lock().await;
        self.serializer.to_record(&self.id, replica_guard.as_ref(), state.last_modified, metadata, state.version)
    }

    async fn persist_initial(&self) -> Result<()> {
        let record = self.build_record().await;
        let bytes = self.serializer.to_bytes(&record)?;
        self.adapter.insert_if_absent(&self.id, &bytes).await?;
        Ok(())
    }

    async fn touch(&self) {
        let mut state = self.state.lock().await;
        state.version += 1;
        state.last_modified = Utc::now();
    }

    async fn fire_callbacks(&self, patch_bytes: &[u8]) {
        let callbacks = self.callbacks.lock().await;
        for cb in callbacks.iter() {
            cb(&self.id, patch_bytes);
        }
    }

    async fn broadcast_marker(&self, tx_id: &str, marker_type: &str) {
        let mut marker_patch = self.engine.new_patch();
        marker_patch.set_metadata(serde_json::json!({
            "transactionMarker": true,
            "markerType": marker_type,
            "transactionId": tx_id,
        }));
        if let Err(err) = self.registry.apply_patch(&self.id, marker_patch.as_mut()).await {
            warn!("failed to broadcast {marker_type} marker for tx {tx_id} on document '{}': {err}", self.id);
        }
    }

    async fn finish_tx(&self, tx_id: &str, committed: bool) {
        if let Some(mgr) = &self.tx_marker_manager {
            let result = if committed { mgr.commit(tx_id).await } else { mgr.abort(tx_id).await };
            if let Err(err) = result {
                warn!("failed to finalize transaction {tx_id} on document '{}': {err}", self.id);
            }
        }
    }

    async fn autosave_best_effort(&self) {
        if let Err(err) = self.save().await {
            warn!("auto-save failed for document '{}': {err}", self.id);
        }
    }

    /// Serially apply one local edit: `edit_fn` reads the replica and
    /// queues operations, the resulting patch is applied locally and
    /// broadcast, and registered change callbacks fire with the result.
    pub async fn edit<F: EditFn>(&self, edit_fn: F) -> Result<EditOutcome> {
        self.ensure_open()?;
        let _guard = self.edit_guard.lock().await;

        let mut patch = self.engine.new_patch();
        {
            let replica_guard = self.replica.lock().await;
            edit_fn(replica_guard.as_ref(), patch.as_mut())?;
        }
        self.registry.apply_patch(&self.id, patch.as_mut()).await?;
        let bytes = patch.encode()?;

        self.touch().await;
        if self.options.auto_save {
            self.autosave_best_effort().await;
        }
        self.fire_callbacks(&bytes).await;

        Ok(EditOutcome { patch_bytes: bytes })
    }

    /// Multi-replica-safe edit: acquires the document's distributed lock
    /// (if a lock manager is configured) and wraps the edit in
    /// start/commit/abort transaction markers. Fails immediately with
    /// `TxIllegalState` if a transaction is already in flight on this
    /// document.
    pub async fn edit_transaction<F: EditFn>(&self, edit_fn: F) -> Result<EditOutcome> {
        self.ensure_open()?;
        let mut active_guard = self
            .active_tx_id
            .try_lock()
            .map_err(|_| StoreError::TxIllegalState(self.id.clone()))?;
        if active_guard.is_some() {
            return Err(StoreError::TxIllegalState(self.id.clone()));
        }

        let lock_handle = match &self.lock_manager {
            Some(backend) => {
                let lock_config = LockConfig { ttl: self.lock_config.ttl, acquire_timeout: Duration::from_secs(30) };
                let lock = DistributedLock::new(
                    backend.clone(),
                    format!("doc:{}", self.id),
                    self.session_id.clone(),
                    lock_config,
                );
                if !lock.acquire().await? {
                    return Err(StoreError::LockContended(self.id.clone()));
                }
                Some(lock)
            }
            None => None,
        };

        let _edit_guard = self.edit_guard.lock().await;

        let tx_id = match &self.tx_marker_manager {
            Some(mgr) => mgr.begin(&self.id, &self.session_id).await?,
            None => ObjectId::new().to_string(),
        };
        *active_guard = Some(tx_id.clone());

        self.broadcast_marker(&tx_id, "start").await;

        let outcome: Result<Vec<u8>> = async {
            let mut user_patch = self.engine.new_patch();
            {
                let replica_guard = self.replica.lock().await;
                edit_fn(replica_guard.as_ref(), user_patch.as_mut())?;
            }
            user_patch.set_metadata(serde_json::json!({"transactionId": &tx_id}));
            self.registry.apply_patch(&self.id, user_patch.as_mut()).await?;
            user_patch.encode()
        }
        .await;

        let result = match outcome {
            Ok(bytes) => {
                self.touch().await;
                if self.options.auto_save {
                    self.autosave_best_effort().await;
                }
                self.broadcast_marker(&tx_id, "commit").await;
                self.fire_callbacks(&bytes).await;
                self.finish_tx(&tx_id, true).await;
                Ok(EditOutcome { patch_bytes: bytes })
            }
            Err(err) => {
                self.broadcast_marker(&tx_id, "abort").await;
                self.finish_tx(&tx_id, false).await;
                Err(err)
            }
        };

        *active_guard = None;
        drop(active_guard);

        if let Some(lock) = lock_handle {
            lock.release().await?;
        }

        result
    }

    /// Retries plain `edit` up to `max_retries` times, backing off
    /// exponentially between attempts. A retryable conflict here is an
    /// `edit_fn`/apply failure (e.g. an index-based operation that a
    /// concurrently-applied remote patch invalidated), since this layer
    /// has no persisted version counter of its own to condition on.
    pub async fn edit_with_optimistic_concurrency<F: EditFn>(
        &self,
        edit_fn: F,
        max_retries: u32,
    ) -> Result<EditOutcome> {
        let mut attempt = 0u32;
        loop {
            match self.edit(&edit_fn).await {
                Ok(outcome) => return Ok(outcome),
                Err(err) => {
                    if attempt >= max_retries {
                        return Err(err);
                    }
                    attempt += 1;
                    tokio::time::sleep(self.retry.backoff(attempt)).await;
                }
            }
        }
    }

    /// Dispatch to `edit_transaction`, `edit_with_optimistic_concurrency`,
    /// or plain `edit`, based on this document's [`DocumentOptions`].
    pub async fn edit_with_retry<F: EditFn>(&self, edit_fn: F, max_retries: u32) -> Result<EditOutcome> {
        if self.options.require_distributed_lock && self.lock_manager.is_some() {
            self.edit_transaction(edit_fn).await
        } else if self.options.optimistic_concurrency {
            self.edit_with_optimistic_concurrency(edit_fn, max_retries).await
        } else {
            self.edit(edit_fn).await
        }
    }

    /// The replica's current materialized content.
    pub async fn get_content(&self) -> Value {
        self.replica.lock().await.view()
    }

    /// The replica's current content, deserialized as `T`.
    pub async fn get_content_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.get_content().await)?)
    }

    /// Set a document-level metadata key (distinct from per-patch
    /// transaction metadata).
    pub async fn set_metadata(&self, key: &str, value: Value) {
        let mut metadata = self.metadata.lock().await;
        if !metadata.is_object() {
            *metadata = Value::Object(Default::default());
        }
        metadata.as_object_mut().expect("just normalized to object").insert(key.to_string(), value);
    }

    /// Read a document-level metadata key.
    pub async fn get_metadata(&self, key: &str) -> Option<Value> {
        self.metadata.lock().await.get(key).cloned()
    }

    /// Register a callback invoked after every successful edit.
    pub async fn on_change(&self, callback: ChangeCallback) {
        self.callbacks.lock().await.push(callback);
    }

    /// Reconcile with `peer_id`, or every known peer when `None`.
    pub async fn sync(&self, peer_id: Option<&str>) -> Result<()> {
        self.registry.sync(&self.id, peer_id).await
    }

    /// Reconcile with every known peer.
    pub async fn sync_with_all_peers(&self) -> Result<()> {
        self.sync(None).await
    }

    /// Persist the current state through the parent store's adapter.
    pub async fn save(&self) -> Result<()> {
        self.ensure_open()?;
        let record = self.build_record().await;
        let bytes = self.serializer.to_bytes(&record)?;
        self.adapter.save(&self.id, &bytes).await
    }

    fn start_autosave(self: &Arc<Self>, interval: Duration) {
        let doc = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if doc.closed.load(Ordering::SeqCst) {
                    break;
                }
                doc.autosave_best_effort().await;
            }
        });
        if let Ok(mut guard) = self.autosave_task.try_lock() {
            *guard = Some(handle);
        }
    }

    /// Stop the auto-save loop and unregister from the sync-manager
    /// registry. Idempotent.
    pub async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(handle) = self.autosave_task.lock().await.take() {
            handle.abort();
        }
        self.registry.unregister(&self.id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::engine::{CrdtOp, SimpleCrdtEngine};
    use crate::collab::lock::InMemoryLockManager;
    use crate::collab::tx_marker::InMemoryTxMarkerManager;
    use crate::collab::transport::InMemoryTransport;
    use crate::docstore::MemoryAdapter;
    use std::sync::atomic::AtomicUsize;

    fn new_doc_env() -> (Arc<SyncManagerRegistry>, Arc<dyn CrdtEngine>, Arc<dyn PersistenceAdapter>) {
        let engine: Arc<dyn CrdtEngine> = Arc::new(SimpleCrdtEngine);
        let registry = SyncManagerRegistry::new(Arc::new(InMemoryTransport::new()), engine.clone());
        let adapter: Arc<dyn PersistenceAdapter> = Arc::new(MemoryAdapter::new("version"));
        (registry, engine, adapter)
    }

    #[tokio::test]
    async fn edit_applies_broadcasts_and_persists_on_auto_save() {
        let (registry, engine, adapter) = new_doc_env();
        let mut options = DocumentOptions::default();
        options.auto_save = true;

        let doc = ManagedDocument::create(
            "doc-1",
            engine,
            registry,
            adapter.clone(),
            None,
            None,
            options,
            LockConfig::default(),
            RetryConfig::default(),
        )
        .await
        .unwrap();

        doc.edit(|_replica, patch| {
            patch.add_operation(CrdtOp::Insert { index: 0, text: "hello".to_string() });
            Ok(())
        })
        .await
        .unwrap();

        assert_eq!(doc.get_content().await, Value::String("hello".to_string()));

        let bytes = adapter.load("doc-1").await.unwrap();
        let record: DocumentRecord = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(record.content, Value::String("hello".to_string()));
        assert_eq!(record.version, 1);
    }

    #[tokio::test]
    async fn on_change_callback_fires_with_patch_bytes() {
        let (registry, engine, adapter) = new_doc_env();
        let doc = ManagedDocument::create(
            "doc-1",
            engine,
            registry,
            adapter,
            None,
            None,
            DocumentOptions::default(),
            LockConfig::default(),
            RetryConfig::default(),
        )
        .await
        .unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();
        doc.on_change(Box::new(move |_id, _bytes| {
            seen_clone.fetch_add(1, Ordering::SeqCst);
        }))
        .await;

        doc.edit(|_r, patch| {
            patch.add_operation(CrdtOp::Insert { index: 0, text: "x".to_string() });
            Ok(())
        })
        .await
        .unwrap();

        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn edit_transaction_commits_and_marks_tx_committed() {
        let (registry, engine, adapter) = new_doc_env();
        let lock_manager: Arc<dyn LockManager> = Arc::new(InMemoryLockManager::new());
        let tx_manager: Arc<dyn TransactionMarkerManager> = Arc::new(InMemoryTxMarkerManager::default());

        let doc = ManagedDocument::create(
            "doc-1",
            engine,
            registry,
            adapter,
            Some(lock_manager),
            Some(tx_manager.clone()),
            DocumentOptions::default(),
            LockConfig::default(),
            RetryConfig::default(),
        )
        .await
        .unwrap();

        doc.edit_transaction(|_r, patch| {
            patch.add_operation(CrdtOp::Insert { index: 0, text: "tx".to_string() });
            Ok(())
        })
        .await
        .unwrap();

        assert_eq!(doc.get_content().await, Value::String("tx".to_string()));

        // A second transaction must be free to start once the first completed.
        doc.edit_transaction(|_r, patch| {
            patch.add_operation(CrdtOp::Insert { index: 2, text: "!".to_string() });
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(doc.get_content().await, Value::String("tx!".to_string()));
    }

    #[tokio::test]
    async fn edit_transaction_aborts_and_releases_lock_on_edit_fn_error() {
        let (registry, engine, adapter) = new_doc_env();
        let lock_manager: Arc<dyn LockManager> = Arc::new(InMemoryLockManager::new());
        let tx_manager: Arc<dyn TransactionMarkerManager> = Arc::new(InMemoryTxMarkerManager::default());

        let doc = ManagedDocument::create(
            "doc-1",
            engine,
            registry,
            adapter,
            Some(lock_manager.clone()),
            Some(tx_manager),
            DocumentOptions::default(),
            LockConfig::default(),
            RetryConfig::default(),
        )
        .await
        .unwrap();

        let err = doc
            .edit_transaction(|_r, _patch| Err(StoreError::Backend("boom".to_string())))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Backend(_)));

        // Lock was released on abort: another owner can now acquire it.
        let other = DistributedLock::new(lock_manager, format!("doc:{}", doc.id()), "someone-else", LockConfig::default());
        assert!(other.acquire().await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_transaction_attempt_is_rejected() {
        let (registry, engine, adapter) = new_doc_env();
        let doc = ManagedDocument::create(
            "doc-1",
            engine,
            registry,
            adapter,
            None,
            None,
            DocumentOptions::default(),
            LockConfig::default(),
            RetryConfig::default(),
        )
        .await
        .unwrap();

        let guard = doc.active_tx_id.lock().await;
        let err = doc.edit_transaction(|_r, _p| Ok(())).await.unwrap_err();
        assert!(matches!(err, StoreError::TxIllegalState(_)));
        drop(guard);
    }

    #[tokio::test]
    async fn close_unregisters_and_rejects_further_edits() {
        let (registry, engine, adapter) = new_doc_env();
        let doc = ManagedDocument::create(
            "doc-1",
            engine,
            registry,
            adapter,
            None,
            None,
            DocumentOptions::default(),
            LockConfig::default(),
            RetryConfig::default(),
        )
        .await
        .unwrap();

        doc.close().await.unwrap();
        let err = doc.edit(|_r, _p| Ok(())).await.unwrap_err();
        assert!(matches!(err, StoreError::Closed));
    }
}
