//! The versioned document store (C3-C6): a generic document repository
//! layered with a write-through cache, optimistic concurrency control at
//! whole-document and section granularity, and change-stream fan-out.

mod adapter;
mod cache;
mod hot_watcher;
mod memory_adapter;
mod store;

pub use adapter::{PersistenceAdapter, SnapshotProvider};
pub use cache::{Cache, MemoryCache};
pub use hot_watcher::HotWatcher;
pub use memory_adapter::MemoryAdapter;
pub use store::{Identified, Operation, VersionedStore, WatchEvent};
