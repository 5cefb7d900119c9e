//! Sync-manager registry (C10): one shared transport, many managed
//! documents. Centralizes peer discovery and patch routing so that N
//! documents don't each open their own transport connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::warn;
use tokio::sync::{Mutex as AsyncMutex, RwLock};
use tokio::task::JoinHandle;

use crate::error::{Result, StoreError};

use super::engine::{CrdtEngine, CrdtReplica};
use super::transport::SyncTransport;

/// A document registered with the [`SyncManagerRegistry`]: its replica
/// (shared with the owning `ManagedDocument`) and the background task
/// applying patches received from the transport.
struct Registration {
    replica: Arc<AsyncMutex<Box<dyn CrdtReplica>>>,
    inbound_task: JoinHandle<()>,
}

/// Shared facade over one [`SyncTransport`] and one [`CrdtEngine`],
/// multiplexing many managed documents' patch traffic by document id
/// (used as the transport topic).
pub struct SyncManagerRegistry {
    transport: Arc<dyn SyncTransport>,
    engine: Arc<dyn CrdtEngine>,
    docs: RwLock<HashMap<String, Registration>>,
    closed: AtomicBool,
}

impl SyncManagerRegistry {
    /// Construct a registry over a shared transport and CRDT engine.
    pub fn new(transport: Arc<dyn SyncTransport>, engine: Arc<dyn CrdtEngine>) -> Arc<Self> {
        Arc::new(Self {
            transport,
            engine,
            docs: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    /// Register `replica` under `doc_id`, starting a background task that
    /// applies patches arriving over the transport's `doc_id` topic.
    /// Fails if `doc_id` is already registered.
    pub async fn register(
        self: &Arc<Self>,
        doc_id: &str,
        replica: Arc<AsyncMutex<Box<dyn CrdtReplica>>>,
    ) -> Result<()> {
        self.ensure_open()?;
        let mut guard = self.docs.write().await;
        if guard.contains_key(doc_id) {
            return Err(StoreError::Backend(format!(
                "document '{doc_id}' is already registered with the sync manager"
            )));
        }

        let mut subscription = self.transport.subscribe(doc_id).await?;
        let engine = self.engine.clone();
        let task_replica = replica.clone();
        let task_doc_id = doc_id.to_string();
        let inbound_task = tokio::spawn(async move {
            while let Some(bytes) = subscription.recv().await {
                let mut patch = match engine.decode_patch(&bytes) {
                    Ok(patch) => patch,
                    Err(err) => {
                        warn!("dropping undecodable patch for document '{task_doc_id}': {err}");
                        continue;
                    }
                };
                let mut replica_guard = task_replica.lock().await;
                if let Err(err) = patch.apply(replica_guard.as_mut()) {
                    warn!("failed to apply inbound patch to document '{task_doc_id}': {err}");
                }
            }
        });

        guard.insert(doc_id.to_string(), Registration { replica, inbound_task });
        Ok(())
    }

    /// Remove `doc_id` from the registry and stop its inbound-patch task.
    /// Does not stop the shared transport.
    pub async fn unregister(&self, doc_id: &str) -> Result<()> {
        if let Some(registration) = self.docs.write().await.remove(doc_id) {
            registration.inbound_task.abort();
        }
        Ok(())
    }

    /// Reconcile `doc_id` with `peer_id` (or, when `None`, every known
    /// peer). The shared broadcast transport already delivers every
    /// published patch to every live subscriber, so reconciliation here
    /// reduces to confirming peer reachability; there is no state-vector
    /// exchange protocol in scope to request missing patches out of band.
    pub async fn sync(&self, doc_id: &str, peer_id: Option<&str>) -> Result<()> {
        self.ensure_open()?;
        if !self.docs.read().await.contains_key(doc_id) {
            return Err(StoreError::NotFound(doc_id.to_string()));
        }
        let peers = self.transport.discover_peers().await?;
        if let Some(peer_id) = peer_id {
            if !peers.iter().any(|p| p == peer_id) {
                return Err(StoreError::NotFound(format!("peer '{peer_id}'")));
            }
        }
        Ok(())
    }

    /// Apply `patch` to `doc_id`'s replica, then broadcast the same patch
    /// to every other subscriber of `doc_id`'s topic.
    pub async fn apply_patch(
        &self,
        doc_id: &str,
        patch: &mut dyn super::engine::CrdtPatch,
    ) -> Result<()> {
        self.ensure_open()?;
        let replica = {
            let guard = self.docs.read().await;
            guard
                .get(doc_id)
                .map(|r| r.replica.clone())
                .ok_or_else(|| StoreError::NotFound(doc_id.to_string()))?
        };
        {
            let mut replica_guard = replica.lock().await;
            patch.apply(replica_guard.as_mut())?;
        }
        let bytes = patch.encode()?;
        self.transport.publish(doc_id, bytes).await
    }

    /// Stop every registered document's inbound task, clear the map, and
    /// close the shared transport. Idempotent.
    pub async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        let mut guard = self.docs.write().await;
        for (_, registration) in guard.drain() {
            registration.inbound_task.abort();
        }
        drop(guard);
        self.transport.close().await
    }
}
