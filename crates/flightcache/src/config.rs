use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What to do with computations that settled in a failure state.
///
/// Retaining failed entries until natural eviction means a lookup shortly
/// after a failure replays that failure instead of retrying — a sharp edge
/// when the failure was transient. Retrying is therefore the default and
/// replay is opt-in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Evict failed entries eagerly; the next call re-runs the producer.
    #[default]
    Retry,
    /// Keep failed entries until the store evicts them; lookups replay the
    /// failure instead of re-running the producer.
    Replay,
}

/// Configuration for one cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Identifier used in trace output and as the store's internal name.
    pub name: String,
    /// Maximum number of entries, or maximum total weight when a weigher is
    /// installed. The store's own policy decides which entries to evict.
    pub capacity: u64,
    /// Admission limit for a single entry's weight. Entries above it are
    /// computed but not retained. Requires a weigher.
    pub max_entry_weight: Option<u32>,
    /// Relative time-to-live used when no explicit time-to-use function is
    /// configured.
    #[serde(with = "humantime_serde")]
    pub default_ttl: Option<Duration>,
    /// Retention of computations that settled in `Failed` or `Cancelled`.
    pub failure_policy: FailurePolicy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            name: "flightcache".into(),
            capacity: 1024,
            max_entry_weight: None,
            default_ttl: None,
            failure_policy: FailurePolicy::default(),
        }
    }
}

impl CacheConfig {
    /// A config with the given name and everything else at defaults.
    pub fn new(name: impl Into<String>) -> Self {
        CacheConfig {
            name: name.into(),
            ..Default::default()
        }
    }
}
