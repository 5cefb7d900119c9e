//! The collaborative CRDT document layer (C7-C12): distributed locks,
//! transaction markers, a pluggable sync transport, the CRDT primitive
//! engine contract, a sync-manager registry multiplexing many documents
//! over one transport, the managed document lifecycle, and the document
//! serializer.

mod engine;
mod lock;
mod managed_document;
mod registry;
mod serializer;
mod transport;
mod tx_marker;

pub use engine::{CrdtEngine, CrdtOp, CrdtPatch, CrdtReplica, SimpleCrdtEngine};
#[cfg(feature = "yrs-engine")]
pub use engine::YrsCrdtEngine;
pub use lock::{DistributedLock, InMemoryLockManager, LockManager};
pub use managed_document::{ChangeCallback, EditFn, EditOutcome, ManagedDocument};
pub use registry::SyncManagerRegistry;
pub use serializer::{DocumentRecord, DocumentSerializer, JsonPatchCodec, PatchCodec};
pub use transport::{InMemoryTransport, SyncTransport, Subscription};
pub use tx_marker::{
    InMemoryTxMarkerManager, MarkerKind, NoopTxMarkerManager, TransactionMarker,
    TransactionMarkerManager, TxStatus,
};
