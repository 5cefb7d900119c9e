//! Hot-data watcher (C6): tracks per-id access frequency with decay and
//! periodically prefetches the top-K hottest ids into the cache.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::HotWatcherConfig;

use super::adapter::PersistenceAdapter;
use super::cache::Cache;

#[derive(Default)]
struct Counters {
    counts: HashMap<String, f64>,
}

/// Tracks access frequency for document ids and keeps the hottest ones
/// prefetched into the cache.
///
/// Two independent schedules run as background tasks: one decays all
/// counters by `decay_factor`, the other re-reads the current top-K ids
/// through the store (causing them to populate the cache via the normal
/// read path) — matching the original's "separate schedule" design.
pub struct HotWatcher {
    counters: Arc<Mutex<Counters>>,
    config: HotWatcherConfig,
    decay_task: Mutex<Option<JoinHandle<()>>>,
    prefetch_task: Mutex<Option<JoinHandle<()>>>,
}

impl HotWatcher {
    /// Construct a watcher with the given configuration. Call [`Self::start`]
    /// to begin the decay/prefetch schedules.
    pub fn new(config: HotWatcherConfig) -> Self {
        Self {
            counters: Arc::new(Mutex::new(Counters::default())),
            config,
            decay_task: Mutex::new(None),
            prefetch_task: Mutex::new(None),
        }
    }

    /// Record an access to `id`, incrementing its counter.
    pub async fn record_access(&self, id: &str) {
        let mut guard = self.counters.lock().await;
        *guard.counts.entry(id.to_string()).or_insert(0.0) += 1.0;
    }

    /// Current top-K ids by access count, descending.
    pub async fn top_k(&self) -> Vec<String> {
        let guard = self.counters.lock().await;
        let mut entries: Vec<(&String, &f64)> = guard.counts.iter().collect();
        entries.sort_by(|a, b| b.1.partial_cmp(a.1).unwrap_or(std::cmp::Ordering::Equal));
        entries
            .into_iter()
            .take(self.config.top_k)
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Start the decay and prefetch background loops. `load` is invoked on
    /// a schedule for each hot id so that its normal read path (which
    /// populates the cache on a miss) runs without the caller needing to
    /// drive it manually.
    pub fn start(
        self: &Arc<Self>,
        adapter: Arc<dyn PersistenceAdapter>,
        cache: Arc<dyn Cache>,
        cache_ttl: std::time::Duration,
    ) {
        let decay_counters = self.counters.clone();
        let decay_factor = self.config.decay_factor;
        let decay_interval = self.config.decay_interval;
        let decay_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(decay_interval);
            loop {
                ticker.tick().await;
                let mut guard = decay_counters.lock().await;
                for v in guard.counts.values_mut() {
                    *v *= decay_factor;
                }
                guard.counts.retain(|_, v| *v > 0.01);
            }
        });

        let watcher = self.clone();
        let watch_interval = self.config.watch_interval;
        let prefetch_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(watch_interval);
            loop {
                ticker.tick().await;
                let hot = watcher.top_k().await;
                for id in hot {
                    if let Ok(bytes) = adapter.load(&id).await {
                        let _ = cache.set(&id, bytes, cache_ttl).await;
                    }
                }
            }
        });

        // These locks never contend in practice (start() is called once at
        // construction); `try_lock` would also do, but a blocking lock keeps
        // `start` synchronous without forcing callers into async.
        if let Ok(mut guard) = self.decay_task.try_lock() {
            *guard = Some(decay_handle);
        }
        if let Ok(mut guard) = self.prefetch_task.try_lock() {
            *guard = Some(prefetch_handle);
        }
    }

    /// Stop both background loops. Called together with the parent store's
    /// close.
    pub async fn close(&self) {
        if let Some(handle) = self.decay_task.lock().await.take() {
            handle.abort();
        }
        if let Some(handle) = self.prefetch_task.lock().await.take() {
            handle.abort();
        }
    }
}
