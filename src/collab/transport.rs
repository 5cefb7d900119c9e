//! Pub/sub sync transport contract (C9): broadcast and subscribe opaque
//! CRDT patch bytes by topic, with peer discovery. Patches are idempotent
//! under the CRDT primitive engine, so at-least-once, possibly-duplicate
//! delivery is an acceptable contract.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::{broadcast, RwLock};

use crate::error::Result;

/// A live subscription to one topic. `recv` yields the next patch,
/// transparently resynchronizing past any patches dropped due to a slow
/// consumer (duplicates are harmless; see module docs).
pub struct Subscription {
    topic: String,
    inner: broadcast::Receiver<Vec<u8>>,
}

impl Subscription {
    /// Await the next patch published on this subscription's topic.
    /// Returns `None` once the transport has closed the topic.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        loop {
            match self.inner.recv().await {
                Ok(bytes) => return Some(bytes),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// The topic this subscription was created for.
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

/// Broadcaster, syncer, and peer-discovery surface consumed by the
/// sync-manager registry (C10). Patches are opaque bytes; encoding is
/// whatever the store/document serializer chose.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Publish `patch_bytes` to every current and future subscriber of
    /// `topic`.
    async fn publish(&self, topic: &str, patch_bytes: Vec<u8>) -> Result<()>;

    /// Subscribe to `topic`, receiving every patch published from this
    /// point on.
    async fn subscribe(&self, topic: &str) -> Result<Subscription>;

    /// List peer ids currently known to the transport.
    async fn discover_peers(&self) -> Result<Vec<String>>;

    /// Announce this replica as a reachable peer.
    async fn register_peer(&self, peer_id: &str) -> Result<()>;

    /// Withdraw a previously registered peer.
    async fn unregister_peer(&self, peer_id: &str) -> Result<()>;

    /// Release any resources held by the transport. Idempotent.
    async fn close(&self) -> Result<()>;
}

const CHANNEL_CAPACITY: usize = 1024;

/// Reference in-process [`SyncTransport`]: one `broadcast` channel per
/// topic, fanning published patches out to every live subscriber. Useful
/// for single-process multi-document tests and for deployments where all
/// replicas share a process.
#[derive(Default)]
pub struct InMemoryTransport {
    topics: RwLock<HashMap<String, broadcast::Sender<Vec<u8>>>>,
    peers: RwLock<HashSet<String>>,
}

impl InMemoryTransport {
    /// Construct an empty transport with no topics or registered peers.
    pub fn new() -> Self {
        Self::default()
    }

    async fn sender_for(&self, topic: &str) -> broadcast::Sender<Vec<u8>> {
        if let Some(sender) = self.topics.read().await.get(topic) {
            return sender.clone();
        }
        let mut guard = self.topics.write().await;
        guard
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl SyncTransport for InMemoryTransport {
    async fn publish(&self, topic: &str, patch_bytes: Vec<u8>) -> Result<()> {
        let sender = self.sender_for(topic).await;
        // No receivers yet is not an error: the patch simply has no one
        // to deliver to at this instant.
        let _ = sender.send(patch_bytes);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        let sender = self.sender_for(topic).await;
        Ok(Subscription { topic: topic.to_string(), inner: sender.subscribe() })
    }

    async fn discover_peers(&self) -> Result<Vec<String>> {
        Ok(self.peers.read().await.iter().cloned().collect())
    }

    async fn register_peer(&self, peer_id: &str) -> Result<()> {
        self.peers.write().await.insert(peer_id.to_string());
        Ok(())
    }

    async fn unregister_peer(&self, peer_id: &str) -> Result<()> {
        self.peers.write().await.remove(peer_id);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.topics.write().await.clear();
        self.peers.write().await.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn published_patch_reaches_subscriber() {
        let transport = InMemoryTransport::new();
        let mut sub = transport.subscribe("doc-1").await.unwrap();
        transport.publish("doc-1", b"patch-a".to_vec()).await.unwrap();
        assert_eq!(sub.recv().await, Some(b"patch-a".to_vec()));
    }

    #[tokio::test]
    async fn topics_are_isolated() {
        let transport = InMemoryTransport::new();
        let mut sub_a = transport.subscribe("doc-a").await.unwrap();
        let mut sub_b = transport.subscribe("doc-b").await.unwrap();
        transport.publish("doc-a", b"only-a".to_vec()).await.unwrap();

        assert_eq!(sub_a.recv().await, Some(b"only-a".to_vec()));
        // doc-b's subscriber must not observe doc-a's traffic; race the
        // recv against a timeout instead of blocking forever.
        let timed_out = tokio::time::timeout(std::time::Duration::from_millis(20), sub_b.recv()).await;
        assert!(timed_out.is_err());
    }

    #[tokio::test]
    async fn peer_registry_round_trips() {
        let transport = InMemoryTransport::new();
        transport.register_peer("peer-1").await.unwrap();
        transport.register_peer("peer-2").await.unwrap();
        let mut peers = transport.discover_peers().await.unwrap();
        peers.sort();
        assert_eq!(peers, vec!["peer-1".to_string(), "peer-2".to_string()]);

        transport.unregister_peer("peer-1").await.unwrap();
        assert_eq!(transport.discover_peers().await.unwrap(), vec!["peer-2".to_string()]);
    }

    #[tokio::test]
    async fn multiple_subscribers_both_receive() {
        let transport = InMemoryTransport::new();
        let mut sub_1 = transport.subscribe("doc-1").await.unwrap();
        let mut sub_2 = transport.subscribe("doc-1").await.unwrap();
        transport.publish("doc-1", b"fan-out".to_vec()).await.unwrap();

        assert_eq!(sub_1.recv().await, Some(b"fan-out".to_vec()));
        assert_eq!(sub_2.recv().await, Some(b"fan-out".to_vec()));
    }
}
