//! CRDT primitive engine contract: replica/patch/operation primitives
//! consumed by [`crate::collab::managed_document`]. This is an external
//! collaborator — the contract is all this crate owns; concrete CRDT
//! semantics (patch application, node identity, timestamps) belong to the
//! engine implementation. A `yrs`-backed reference implementation is
//! available behind the `yrs-engine` feature; a dependency-free
//! `SimpleCrdtEngine` is always available for tests and callers who don't
//! need real conflict-free merge semantics.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, StoreError};

/// A single CRDT operation queued onto a patch before it is applied or
/// broadcast. Kept concrete (rather than fully opaque bytes) so that
/// `CrdtPatch::apply` can dispatch without downcasting to a specific
/// engine's internal type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CrdtOp {
    /// Insert `text` at character offset `index` of the replica's root
    /// text node.
    Insert {
        /// Character offset to insert at.
        index: u32,
        /// Text to insert.
        text: String,
    },
    /// Remove `len` characters starting at `index` of the replica's root
    /// text node.
    Delete {
        /// Character offset to remove from.
        index: u32,
        /// Number of characters to remove.
        len: u32,
    },
    /// Replace the entire root text node with `content`. Used by the
    /// document serializer to re-initialize a replica from a decoded
    /// portable record rather than replaying an operation log.
    Replace {
        /// New full content of the root text node.
        content: String,
    },
}

/// A single logical replica of a document's CRDT state.
pub trait CrdtReplica: Send + Sync {
    /// The session id this replica was constructed with.
    fn session_id(&self) -> &str;

    /// Allocate the next logical timestamp for an operation about to be
    /// applied. Monotonically increasing per replica.
    fn next_timestamp(&mut self) -> u64;

    /// Materialize the replica's current state as a plain JSON value.
    fn view(&self) -> Value;

    /// Look up the operation recorded under logical timestamp `lts`.
    fn get_node(&self, lts: u64) -> Result<Value>;

    /// Apply a single operation, stamped with the logical timestamp it
    /// was allocated under. Called by [`CrdtPatch::apply`] once per
    /// queued operation, in order.
    fn apply_op(&mut self, lts: u64, op: &CrdtOp) -> Result<()>;
}

/// A buffer of queued operations plus free-form metadata, flushed against
/// a replica and broadcast as opaque bytes over the sync transport.
pub trait CrdtPatch: Send + Sync {
    /// Queue an operation onto this patch.
    fn add_operation(&mut self, op: CrdtOp);

    /// Apply every queued operation to `replica`, in order. Stops at the
    /// first failing operation.
    fn apply(&mut self, replica: &mut dyn CrdtReplica) -> Result<()>;

    /// The patch's metadata container (`transactionMarker`, `markerType`,
    /// `transactionId` are reserved keys at the transaction layer).
    fn metadata(&self) -> &Value;

    /// Replace the patch's metadata container.
    fn set_metadata(&mut self, metadata: Value);

    /// Encode the patch (operations and metadata) as the wire bytes sent
    /// over the sync transport.
    fn encode(&self) -> Result<Vec<u8>>;
}

/// Factory for replicas and patches, and the decoder for patches received
/// over the wire. One engine instance is shared by every managed document
/// created from the same store.
pub trait CrdtEngine: Send + Sync {
    /// Construct a fresh, empty replica under `session_id`.
    fn new_replica(&self, session_id: &str) -> Box<dyn CrdtReplica>;

    /// Construct an empty patch builder.
    fn new_patch(&self) -> Box<dyn CrdtPatch>;

    /// Decode a patch previously produced by [`CrdtPatch::encode`].
    fn decode_patch(&self, bytes: &[u8]) -> Result<Box<dyn CrdtPatch>>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct WireFormat {
    ops: Vec<CrdtOp>,
    metadata: Value,
}

/// A dependency-free reference [`CrdtEngine`]: the replica's root node is
/// a plain `String`, mutated by applying `CrdtOp::Insert`/`Delete`
/// directly with no conflict resolution. Not a real CRDT — safe only for
/// single-writer tests. Always available, with no optional feature.
#[derive(Default)]
pub struct SimpleCrdtEngine;

struct SimpleReplica {
    session_id: String,
    content: String,
    counter: u64,
    nodes: HashMap<u64, Value>,
}

impl CrdtReplica for SimpleReplica {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn next_timestamp(&mut self) -> u64 {
        self.counter += 1;
        self.counter
    }

    fn view(&self) -> Value {
        Value::String(self.content.clone())
    }

    fn get_node(&self, lts: u64) -> Result<Value> {
        self.nodes
            .get(&lts)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("crdt node at timestamp {lts}")))
    }

    fn apply_op(&mut self, lts: u64, op: &CrdtOp) -> Result<()> {
        match op {
            CrdtOp::Insert { index, text } => {
                let at = char_boundary(&self.content, *index as usize)?;
                self.content.insert_str(at, text);
            }
            CrdtOp::Delete { index, len } => {
                let start = char_boundary(&self.content, *index as usize)?;
                let end = char_boundary(&self.content, *index as usize + *len as usize)?;
                self.content.replace_range(start..end, "");
            }
            CrdtOp::Replace { content } => {
                self.content = content.clone();
            }
        }
        self.nodes.insert(lts, serde_json::to_value(op)?);
        Ok(())
    }
}

fn char_boundary(s: &str, char_index: usize) -> Result<usize> {
    s.char_indices()
        .map(|(b, _)| b)
        .chain(std::iter::once(s.len()))
        .nth(char_index)
        .ok_or_else(|| StoreError::InvalidPath(format!("character offset {char_index} out of range")))
}

struct SimplePatch {
    ops: Vec<CrdtOp>,
    metadata: Value,
}

impl CrdtPatch for SimplePatch {
    fn add_operation(&mut self, op: CrdtOp) {
        self.ops.push(op);
    }

    fn apply(&mut self, replica: &mut dyn CrdtReplica) -> Result<()> {
        for op in &self.ops {
            let lts = replica.next_timestamp();
            replica.apply_op(lts, op)?;
        }
        Ok(())
    }

    fn metadata(&self) -> &Value {
        &self.metadata
    }

    fn set_metadata(&mut self, metadata: Value) {
        self.metadata = metadata;
    }

    fn encode(&self) -> Result<Vec<u8>> {
        let wire = WireFormat { ops: self.ops.clone(), metadata: self.metadata.clone() };
        Ok(serde_json::to_vec(&wire)?)
    }
}

impl CrdtEngine for SimpleCrdtEngine {
    fn new_replica(&self, session_id: &str) -> Box<dyn CrdtReplica> {
        Box::new(SimpleReplica {
            session_id: session_id.to_string(),
            content: String::new(),
            counter: 0,
            nodes: HashMap::new(),
        })
    }

    fn new_patch(&self) -> Box<dyn CrdtPatch> {
        Box::new(SimplePatch { ops: Vec::new(), metadata: Value::Object(Default::default()) })
    }

    fn decode_patch(&self, bytes: &[u8]) -> Result<Box<dyn CrdtPatch>> {
        let wire: WireFormat = serde_json::from_slice(bytes)?;
        Ok(Box::new(SimplePatch { ops: wire.ops, metadata: wire.metadata }))
    }
}

#[cfg(feature = "yrs-engine")]
mod yrs_backend {
    use super::*;
    use yrs::{GetString, Doc, Text, TextRef, Transact};

    /// `yrs`-backed reference [`CrdtEngine`]. The replica's root node is a
    /// `yrs::Text` named `"content"`; operations are applied as real
    /// CRDT-merged text inserts/deletes rather than plain string splicing.
    #[derive(Default)]
    pub struct YrsCrdtEngine;

    struct YrsReplica {
        session_id: String,
        doc: Doc,
        text: TextRef,
        counter: u64,
        nodes: HashMap<u64, Value>,
    }

    impl YrsReplica {
        fn new(session_id: &str) -> Self {
            let doc = Doc::new();
            let text = doc.get_or_insert_text("content");
            Self { session_id: session_id.to_string(), doc, text, counter: 0, nodes: HashMap::new() }
        }
    }

    impl CrdtReplica for YrsReplica {
        fn session_id(&self) -> &str {
            &self.session_id
        }

        fn next_timestamp(&mut self) -> u64 {
            self.counter += 1;
            self.counter
        }

        fn view(&self) -> Value {
            let txn = self.doc.transact();
            Value::String(self.text.get_string(&txn))
        }

        fn get_node(&self, lts: u64) -> Result<Value> {
            self.nodes
                .get(&lts)
                .cloned()
                .ok_or_else(|| StoreError::NotFound(format!("crdt node at timestamp {lts}")))
        }

        fn apply_op(&mut self, lts: u64, op: &CrdtOp) -> Result<()> {
            {
                let mut txn = self.doc.transact_mut();
                match op {
                    CrdtOp::Insert { index, text } => {
                        self.text.insert(&mut txn, *index, text);
                    }
                    CrdtOp::Delete { index, len } => {
                        self.text.remove_range(&mut txn, *index, *len);
                    }
                    CrdtOp::Replace { content } => {
                        let current_len = self.text.len(&txn);
                        if current_len > 0 {
                            self.text.remove_range(&mut txn, 0, current_len);
                        }
                        self.text.insert(&mut txn, 0, content);
                    }
                }
            }
            self.nodes.insert(lts, serde_json::to_value(op)?);
            Ok(())
        }
    }

    struct YrsPatch {
        ops: Vec<CrdtOp>,
        metadata: Value,
    }

    impl CrdtPatch for YrsPatch {
        fn add_operation(&mut self, op: CrdtOp) {
            self.ops.push(op);
        }

        fn apply(&mut self, replica: &mut dyn CrdtReplica) -> Result<()> {
            for op in &self.ops {
                let lts = replica.next_timestamp();
                replica.apply_op(lts, op)?;
            }
            Ok(())
        }

        fn metadata(&self) -> &Value {
            &self.metadata
        }

        fn set_metadata(&mut self, metadata: Value) {
            self.metadata = metadata;
        }

        fn encode(&self) -> Result<Vec<u8>> {
            let wire = WireFormat { ops: self.ops.clone(), metadata: self.metadata.clone() };
            Ok(serde_json::to_vec(&wire)?)
        }
    }

    impl CrdtEngine for YrsCrdtEngine {
        fn new_replica(&self, session_id: &str) -> Box<dyn CrdtReplica> {
            Box::new(YrsReplica::new(session_id))
        }

        fn new_patch(&self) -> Box<dyn CrdtPatch> {
            Box::new(YrsPatch { ops: Vec::new(), metadata: Value::Object(Default::default()) })
        }

        fn decode_patch(&self, bytes: &[u8]) -> Result<Box<dyn CrdtPatch>> {
            let wire: WireFormat = serde_json::from_slice(bytes)?;
            Ok(Box::new(YrsPatch { ops: wire.ops, metadata: wire.metadata }))
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn insert_and_delete_merge_into_view() {
            let engine = YrsCrdtEngine;
            let mut replica = engine.new_replica("session-1");
            let mut patch = engine.new_patch();
            patch.add_operation(CrdtOp::Insert { index: 0, text: "hello".to_string() });
            patch.apply(replica.as_mut()).unwrap();
            assert_eq!(replica.view(), Value::String("hello".to_string()));

            let mut patch2 = engine.new_patch();
            patch2.add_operation(CrdtOp::Delete { index: 0, len: 1 });
            patch2.apply(replica.as_mut()).unwrap();
            assert_eq!(replica.view(), Value::String("ello".to_string()));
        }
    }
}

#[cfg(feature = "yrs-engine")]
pub use yrs_backend::YrsCrdtEngine;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_engine_applies_ops_in_order() {
        let engine = SimpleCrdtEngine;
        let mut replica = engine.new_replica("session-1");
        let mut patch = engine.new_patch();
        patch.add_operation(CrdtOp::Insert { index: 0, text: "hello world".to_string() });
        patch.apply(replica.as_mut()).unwrap();
        assert_eq!(replica.view(), Value::String("hello world".to_string()));

        let mut patch2 = engine.new_patch();
        patch2.add_operation(CrdtOp::Delete { index: 5, len: 6 });
        patch2.apply(replica.as_mut()).unwrap();
        assert_eq!(replica.view(), Value::String("hello".to_string()));
    }

    #[test]
    fn replace_overwrites_whole_content() {
        let engine = SimpleCrdtEngine;
        let mut replica = engine.new_replica("session-1");
        let mut patch = engine.new_patch();
        patch.add_operation(CrdtOp::Insert { index: 0, text: "stale".to_string() });
        patch.apply(replica.as_mut()).unwrap();

        let mut reset = engine.new_patch();
        reset.add_operation(CrdtOp::Replace { content: "fresh content".to_string() });
        reset.apply(replica.as_mut()).unwrap();
        assert_eq!(replica.view(), Value::String("fresh content".to_string()));
    }

    #[test]
    fn get_node_resolves_applied_operation() {
        let engine = SimpleCrdtEngine;
        let mut replica = engine.new_replica("session-1");
        let mut patch = engine.new_patch();
        patch.add_operation(CrdtOp::Insert { index: 0, text: "hi".to_string() });
        patch.apply(replica.as_mut()).unwrap();

        let node = replica.get_node(1).unwrap();
        assert_eq!(node["kind"], Value::String("insert".to_string()));
    }

    #[test]
    fn get_node_missing_timestamp_is_not_found() {
        let engine = SimpleCrdtEngine;
        let replica = engine.new_replica("session-1");
        assert!(matches!(replica.get_node(99), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn encode_decode_round_trips_ops_and_metadata() {
        let engine = SimpleCrdtEngine;
        let mut patch = engine.new_patch();
        patch.add_operation(CrdtOp::Insert { index: 0, text: "x".to_string() });
        patch.set_metadata(serde_json::json!({"transactionId": "tx-1"}));

        let bytes = patch.encode().unwrap();
        let decoded = engine.decode_patch(&bytes).unwrap();
        assert_eq!(decoded.metadata()["transactionId"], Value::String("tx-1".to_string()));
    }
}
