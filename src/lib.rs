#![warn(missing_docs)]
//! Versioned document store with optimistic concurrency control, minimal
//! patch diffing, change-stream fan-out, and a collaborative CRDT document
//! layer built on top of it.
//!
//! The store (`docstore`) is generic over any document type that implements
//! [`versioning::Versioned`] and is backed by a pluggable
//! [`docstore::PersistenceAdapter`]; the collaboration layer (`collab`)
//! manages CRDT-backed documents, distributed locks, transaction markers,
//! and a pub/sub transport, independent of the store.

/// Error types shared across the whole crate.
pub mod error;

/// A minimal cancellation-token primitive used by OCC loops, change-stream
/// dispatch, and lock refresh tasks.
pub mod cancellation;

/// Configuration for the store, the retry/backoff policy, the hot-data
/// watcher, and the collaboration layer.
pub mod config;

/// Ambient identifier types (`ObjectId`) shared across the crate.
pub mod types;

/// The `Versioned` capability trait and version-field helpers (C1).
pub mod versioning;

/// Patch diffing: minimal db-style patches and RFC 7396 merge patches (C2).
pub mod diffing;

/// The versioned document store: persistence adapter, cache, hot-data
/// watcher, and the store itself (C3-C6).
pub mod docstore;

/// The collaborative CRDT document layer: locks, transaction markers,
/// sync transport, sync-manager registry, managed documents, and the
/// document serializer (C7-C12).
pub mod collab;

pub use error::{Result, StoreError};
pub use versioning::Versioned;
