//! Unified error type for the versioned store and the CRDT collaboration layer.
//!
//! Mirrors the single-enum-per-crate convention: every failure mode named in
//! the component design surfaces as a variant here rather than as a family of
//! small per-module error types.

use thiserror::Error;

/// Errors produced by the document store and the managed CRDT document layer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The requested document or key does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// An optimistic-concurrency write lost the race: the version predicate
    /// did not match any record.
    #[error("version conflict on document {doc_id} (expected v{expected})")]
    VersionConflict {
        /// Id of the document that failed to update.
        doc_id: String,
        /// The version the caller's write was conditioned on.
        expected: i64,
    },

    /// A section-level optimistic-concurrency write lost the race.
    #[error(
        "section version conflict on document {doc_id} at '{path}': expected v{expected}, observed v{observed}"
    )]
    SectionVersionError {
        /// Id of the document containing the section.
        doc_id: String,
        /// Dotted path to the section.
        path: String,
        /// Version the write was conditioned on.
        expected: i64,
        /// Version actually found in the backend.
        observed: i64,
    },

    /// The database write succeeded but refreshing the cache afterwards
    /// failed. Callers MUST treat this as a successful persist; the returned
    /// document reflects the new, database-confirmed state.
    #[error(
        "wrote document {doc_id} to the database but failed to refresh the cache: {cache_error}"
    )]
    PartialSuccess {
        /// Id of the document that was written.
        doc_id: String,
        /// Description of the cache failure.
        cache_error: String,
    },

    /// The version field could not be resolved against the document type at
    /// store-construction time.
    #[error("config error: {0}")]
    ConfigError(String),

    /// A section path traversed a value that was not an associative
    /// container.
    #[error("invalid path '{0}': does not resolve to a container")]
    InvalidPath(String),

    /// The edit retry budget or wall-clock deadline was exceeded.
    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// A distributed lock could not be acquired within its timeout.
    #[error("lock contended: resource '{0}'")]
    LockContended(String),

    /// A transaction marker transition was attempted from a non-pending
    /// state.
    #[error("illegal transaction state transition for tx {0}")]
    TxIllegalState(String),

    /// The backend does not implement the requested optional capability.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// The pub/sub transport failed. Broadcasts are best-effort; this is
    /// logged and suppressed on the local-edit path, never propagated from
    /// `ManagedDocument::edit`.
    #[error("transport error: {0}")]
    TransportError(String),

    /// The operation was attempted after the owning store/document closed.
    #[error("operation attempted after close")]
    Closed,

    /// JSON (de)serialization failure, surfaced from the differ, the
    /// document serializer, or a codec.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Catch-all for backend-reported failures that do not fit a more
    /// specific variant (e.g. a persistence adapter's own I/O failure).
    #[error("{0}")]
    Backend(String),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
