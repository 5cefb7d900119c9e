//! Configuration types for the versioned store and the CRDT collaboration layer.
//!
//! Every knob named in the component design (§5's timeouts, §4.5's backoff
//! schedule, §4.6's watcher cadence, §4.7/§4.8's lease/TTL durations) lives on
//! one of these structs, constructed with `Default` and adjusted with plain
//! field assignment or the `with_*` builder methods — the same shape the
//! teacher's own `Config` uses.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level configuration for a [`crate::docstore::VersionedStore`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Retry/backoff policy for OCC edit loops.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Time-to-live applied to cache entries written by the store.
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl: Duration,

    /// Whether `find_many` results are also written through to the cache.
    #[serde(default)]
    pub cache_query_results: bool,

    /// Wall-clock budget for a single OCC edit loop, independent of the
    /// retry count.
    #[serde(default = "default_edit_timeout")]
    pub edit_timeout: Duration,

    /// Hot-data watcher configuration; `None` disables the watcher.
    #[serde(default)]
    pub hot_watcher: Option<HotWatcherConfig>,

    /// Bounded capacity of each subscriber's change-event channel. Events
    /// are dropped (never block the dispatcher) once this fills.
    #[serde(default = "default_subscriber_capacity")]
    pub subscriber_capacity: usize,

    /// Storage-visible name of a section's own version sub-key (default
    /// `"v"`), independent of the document's own version field.
    #[serde(default = "default_section_version_field")]
    pub section_version_field: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            cache_ttl: default_cache_ttl(),
            cache_query_results: false,
            edit_timeout: default_edit_timeout(),
            hot_watcher: None,
            subscriber_capacity: default_subscriber_capacity(),
            section_version_field: default_section_version_field(),
        }
    }
}

fn default_cache_ttl() -> Duration {
    Duration::from_secs(300)
}

fn default_edit_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_subscriber_capacity() -> usize {
    100
}

fn default_section_version_field() -> String {
    "v".to_string()
}

/// Exponential backoff with jitter, shared by whole-document OCC, section
/// OCC, and the direct-operator/pipeline edit paths.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts before giving up with `VersionConflict`.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay for attempt 0; doubles each subsequent attempt up to
    /// `max_retry_delay`.
    #[serde(default = "default_retry_delay")]
    pub retry_delay: Duration,

    /// Ceiling on the computed backoff delay, before jitter.
    #[serde(default = "default_max_retry_delay")]
    pub max_retry_delay: Duration,

    /// Fraction of the computed delay (0.0-1.0) to randomize by, split
    /// evenly above and below the nominal value.
    #[serde(default = "default_jitter_fraction")]
    pub jitter_fraction: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay: default_retry_delay(),
            max_retry_delay: default_max_retry_delay(),
            jitter_fraction: default_jitter_fraction(),
        }
    }
}

impl RetryConfig {
    /// Compute the backoff delay for a given zero-based attempt number,
    /// including jitter. `attempt` is the attempt that just failed.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self.retry_delay.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
        let capped = exp.min(self.max_retry_delay);

        let jitter_span = capped.mul_f64(self.jitter_fraction.clamp(0.0, 1.0));
        let half = jitter_span.mul_f64(0.5);
        let jitter = rand::random::<f64>() * jitter_span.as_secs_f64() - half.as_secs_f64();

        let nominal = capped.as_secs_f64();
        Duration::from_secs_f64((nominal + jitter).max(0.0))
    }
}

fn default_max_retries() -> u32 {
    10
}

fn default_retry_delay() -> Duration {
    Duration::from_millis(50)
}

fn default_max_retry_delay() -> Duration {
    Duration::from_secs(2)
}

fn default_jitter_fraction() -> f64 {
    0.2
}

/// Hot-data watcher cadence and bound (C6).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HotWatcherConfig {
    /// Number of top ids to keep prefetched into the cache.
    pub top_k: usize,

    /// Multiplicative decay applied to access counters on `decay_interval`.
    pub decay_factor: f64,

    /// How often prefetch of the top-K ids runs.
    pub watch_interval: Duration,

    /// How often the decay factor is applied to all counters.
    pub decay_interval: Duration,
}

impl Default for HotWatcherConfig {
    fn default() -> Self {
        Self {
            top_k: 100,
            decay_factor: 0.5,
            watch_interval: Duration::from_secs(30),
            decay_interval: Duration::from_secs(60),
        }
    }
}

/// Lease/timeout configuration for the distributed lock manager (C7).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LockConfig {
    /// Lease duration granted on `acquire`.
    #[serde(default = "default_lock_ttl")]
    pub ttl: Duration,

    /// Wall-clock budget for `acquire` to succeed before giving up with
    /// `LockContended`.
    #[serde(default = "default_lock_acquire_timeout")]
    pub acquire_timeout: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl: default_lock_ttl(),
            acquire_timeout: default_lock_acquire_timeout(),
        }
    }
}

impl LockConfig {
    /// Refresh cadence: `ttl / 3`, floored at one second, per §4.7.
    pub fn refresh_interval(&self) -> Duration {
        (self.ttl / 3).max(Duration::from_secs(1))
    }
}

fn default_lock_ttl() -> Duration {
    Duration::from_secs(15)
}

fn default_lock_acquire_timeout() -> Duration {
    Duration::from_secs(30)
}

/// TTL for transaction markers (C8). Fixed at 30 minutes per spec; exposed
/// here only so tests can shorten it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TxMarkerConfig {
    /// Time-to-live applied to `start`/`commit`/`abort` marker records.
    #[serde(default = "default_tx_ttl")]
    pub ttl: Duration,
}

impl Default for TxMarkerConfig {
    fn default() -> Self {
        Self {
            ttl: default_tx_ttl(),
        }
    }
}

fn default_tx_ttl() -> Duration {
    Duration::from_secs(30 * 60)
}

/// Options governing how a [`crate::collab::ManagedDocument`] dispatches
/// edits (C11 `edit_with_retry`).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DocumentOptions {
    /// Route edits through `edit_transaction` (lock + tx markers) when a
    /// lock manager is configured.
    #[serde(default)]
    pub require_distributed_lock: bool,

    /// Route edits through `edit_with_optimistic_concurrency` otherwise.
    #[serde(default)]
    pub optimistic_concurrency: bool,

    /// Persist after every successful edit.
    #[serde(default)]
    pub auto_save: bool,

    /// Interval between auto-save flushes when `auto_save` is set and a
    /// background loop is used instead of per-edit saves.
    #[serde(default)]
    pub auto_save_interval: Option<Duration>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_capped_and_nonnegative() {
        let cfg = RetryConfig {
            max_retries: 10,
            retry_delay: Duration::from_millis(50),
            max_retry_delay: Duration::from_millis(500),
            jitter_fraction: 0.2,
        };

        for attempt in 0..20 {
            let d = cfg.backoff(attempt);
            assert!(d <= Duration::from_millis(600));
        }
    }

    #[test]
    fn backoff_grows_with_attempt_before_cap() {
        let cfg = RetryConfig {
            max_retries: 10,
            retry_delay: Duration::from_millis(10),
            max_retry_delay: Duration::from_secs(10),
            jitter_fraction: 0.0,
        };

        assert_eq!(cfg.backoff(0), Duration::from_millis(10));
        assert_eq!(cfg.backoff(1), Duration::from_millis(20));
        assert_eq!(cfg.backoff(2), Duration::from_millis(40));
    }

    #[test]
    fn lock_refresh_interval_floors_at_one_second() {
        let cfg = LockConfig {
            ttl: Duration::from_secs(1),
            acquire_timeout: Duration::from_secs(5),
        };
        assert_eq!(cfg.refresh_interval(), Duration::from_secs(1));
    }

    #[test]
    fn default_store_config_is_sane() {
        let cfg = StoreConfig::default();
        assert!(cfg.cache_ttl > Duration::ZERO);
        assert!(cfg.subscriber_capacity > 0);
    }
}
