//! Transaction marker manager (C8): pending/committed/aborted state
//! tracking per transaction id, for cross-replica edit fencing
//! observability. Advisory only — [`crate::collab::lock`] is the real
//! fencing mechanism.

use std::collections::HashMap;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::config::TxMarkerConfig;
use crate::error::{Result, StoreError};
use crate::types::ObjectId;

/// The lifecycle kind of a [`TransactionMarker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum MarkerKind {
    /// The transaction was opened.
    Start,
    /// The transaction committed.
    Commit,
    /// The transaction aborted.
    Abort,
}

/// The externally-visible status derived from a [`TransactionMarker`]'s
/// kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    /// `start` seen, no terminal marker yet.
    Pending,
    /// `commit` seen.
    Committed,
    /// `abort` seen.
    Aborted,
}

/// A small record describing the lifecycle state of a logical transaction
/// across replicas.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TransactionMarker {
    /// Transaction id.
    pub tx_id: String,
    /// Current lifecycle kind.
    pub kind: MarkerKind,
    /// Timestamp of the last transition.
    pub timestamp: DateTime<Utc>,
    /// Document this transaction is editing.
    pub document_id: String,
    /// Session that began the transaction.
    pub session_id: String,
}

/// Manages transaction markers. `start`/`commit`/`abort` enforce the
/// `start -> commit|abort` state machine; terminal states are absorbing.
#[async_trait]
pub trait TransactionMarkerManager: Send + Sync {
    /// Generate a fresh transaction id and write a `start` marker.
    async fn begin(&self, document_id: &str, session_id: &str) -> Result<String>;

    /// Transition `tx_id` to `commit`. Fails with `TxIllegalState` unless
    /// the current status is `Pending`.
    async fn commit(&self, tx_id: &str) -> Result<()>;

    /// Transition `tx_id` to `abort`. Fails with `TxIllegalState` unless
    /// the current status is `Pending`.
    async fn abort(&self, tx_id: &str) -> Result<()>;

    /// Read the current status of `tx_id`.
    async fn status(&self, tx_id: &str) -> Result<TxStatus>;
}

struct Record {
    marker: TransactionMarker,
    expires_at: Instant,
}

/// Reference in-memory [`TransactionMarkerManager`], keyed `tx:<tx_id>`
/// with the configured TTL (default 30 minutes) extended on every
/// transition.
pub struct InMemoryTxMarkerManager {
    markers: RwLock<HashMap<String, Record>>,
    config: TxMarkerConfig,
}

impl InMemoryTxMarkerManager {
    /// Construct a manager with the given marker TTL.
    pub fn new(config: TxMarkerConfig) -> Self {
        Self { markers: RwLock::new(HashMap::new()), config }
    }

    fn live(record: &Record) -> bool {
        record.expires_at > Instant::now()
    }

    async fn transition(&self, tx_id: &str, kind: MarkerKind) -> Result<()> {
        let mut guard = self.markers.write().await;
        let record = guard
            .get_mut(tx_id)
            .filter(|r| Self::live(r))
            .ok_or_else(|| StoreError::TxIllegalState(tx_id.to_string()))?;
        if record.marker.kind != MarkerKind::Start {
            return Err(StoreError::TxIllegalState(tx_id.to_string()));
        }
        record.marker.kind = kind;
        record.marker.timestamp = Utc::now();
        record.expires_at = Instant::now() + self.config.ttl;
        Ok(())
    }
}

impl Default for InMemoryTxMarkerManager {
    fn default() -> Self {
        Self::new(TxMarkerConfig::default())
    }
}

#[async_trait]
impl TransactionMarkerManager for InMemoryTxMarkerManager {
    async fn begin(&self, document_id: &str, session_id: &str) -> Result<String> {
        let tx_id = ObjectId::new().to_string();
        let marker = TransactionMarker {
            tx_id: tx_id.clone(),
            kind: MarkerKind::Start,
            timestamp: Utc::now(),
            document_id: document_id.to_string(),
            session_id: session_id.to_string(),
        };
        let mut guard = self.markers.write().await;
        guard.insert(tx_id.clone(), Record { marker, expires_at: Instant::now() + self.config.ttl });
        Ok(tx_id)
    }

    async fn commit(&self, tx_id: &str) -> Result<()> {
        self.transition(tx_id, MarkerKind::Commit).await
    }

    async fn abort(&self, tx_id: &str) -> Result<()> {
        self.transition(tx_id, MarkerKind::Abort).await
    }

    async fn status(&self, tx_id: &str) -> Result<TxStatus> {
        let guard = self.markers.read().await;
        let record = guard
            .get(tx_id)
            .filter(|r| Self::live(r))
            .ok_or_else(|| StoreError::TxIllegalState(tx_id.to_string()))?;
        Ok(match record.marker.kind {
            MarkerKind::Start => TxStatus::Pending,
            MarkerKind::Commit => TxStatus::Committed,
            MarkerKind::Abort => TxStatus::Aborted,
        })
    }
}

/// A no-op manager for single-node deployments: every transaction always
/// succeeds and reports committed.
#[derive(Default)]
pub struct NoopTxMarkerManager;

#[async_trait]
impl TransactionMarkerManager for NoopTxMarkerManager {
    async fn begin(&self, _document_id: &str, _session_id: &str) -> Result<String> {
        Ok(ObjectId::new().to_string())
    }

    async fn commit(&self, _tx_id: &str) -> Result<()> {
        Ok(())
    }

    async fn abort(&self, _tx_id: &str) -> Result<()> {
        Ok(())
    }

    async fn status(&self, _tx_id: &str) -> Result<TxStatus> {
        Ok(TxStatus::Committed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_then_commit_succeeds_once() {
        let mgr = InMemoryTxMarkerManager::default();
        let tx = mgr.begin("doc-1", "session-1").await.unwrap();
        assert_eq!(mgr.status(&tx).await.unwrap(), TxStatus::Pending);

        mgr.commit(&tx).await.unwrap();
        assert_eq!(mgr.status(&tx).await.unwrap(), TxStatus::Committed);

        assert!(matches!(mgr.commit(&tx).await, Err(StoreError::TxIllegalState(_))));
        assert!(matches!(mgr.abort(&tx).await, Err(StoreError::TxIllegalState(_))));
    }

    #[tokio::test]
    async fn abort_is_terminal_too() {
        let mgr = InMemoryTxMarkerManager::default();
        let tx = mgr.begin("doc-1", "session-1").await.unwrap();
        mgr.abort(&tx).await.unwrap();
        assert_eq!(mgr.status(&tx).await.unwrap(), TxStatus::Aborted);
        assert!(matches!(mgr.commit(&tx).await, Err(StoreError::TxIllegalState(_))));
    }

    #[tokio::test]
    async fn noop_manager_always_reports_committed() {
        let mgr = NoopTxMarkerManager;
        let tx = mgr.begin("doc-1", "session-1").await.unwrap();
        assert_eq!(mgr.status(&tx).await.unwrap(), TxStatus::Committed);
    }
}
