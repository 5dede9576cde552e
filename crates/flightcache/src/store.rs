//! The keyed expiring store consumed by the coordinator.
//!
//! The store itself is not reimplemented here: [`TlruStore`] wraps
//! [`moka::sync::Cache`] and only adapts the caller-supplied time-to-use
//! function into moka's [`Expiry`](moka::Expiry) mechanism by stamping each
//! entry with its absolute deadline at insertion time. Capacity accounting
//! and the eviction policy for full caches are moka's concern.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::CacheConfig;
use crate::error::StoreRejected;
use crate::key::CacheKey;

/// A time-to-use function: computes the absolute deadline after which an
/// entry must no longer be used.
pub type Ttu<V> = Arc<dyn Fn(&CacheKey, &V, Instant) -> Instant + Send + Sync>;

/// The "cost" of keeping a value in the store.
pub type Weigher<V> = Arc<dyn Fn(&CacheKey, &V) -> u32 + Send + Sync>;

/// The store contract the coordinator consumes.
///
/// Freshness is internal to the implementation: a `get` must never return an
/// entry whose deadline has passed. `set` may refuse a candidate value per
/// the implementation's admission policy.
pub trait KeyedStore<V>: Send + Sync {
    fn get(&self, key: &CacheKey) -> Option<V>;
    fn set(&self, key: &CacheKey, value: V) -> Result<(), StoreRejected>;
    fn delete(&self, key: &CacheKey);
    fn keys(&self) -> Vec<CacheKey>;
    fn clear(&self);
}

/// An item saved in the store, stamped with its eviction deadline.
#[derive(Clone, Debug)]
struct DeadlineEntry<V> {
    deadline: Instant,
    value: V,
}

/// A struct implementing [`moka::Expiry`] that uses the [`DeadlineEntry`]
/// [`Instant`] as the explicit expiration time.
struct StoreExpiration;

/// Returns the duration between the `current_time` and `target_time` in the
/// future, or `Some(ZERO)` if the target has already elapsed.
fn saturating_duration_since(current_time: Instant, target_time: Instant) -> Option<Duration> {
    Some(
        target_time
            .checked_duration_since(current_time)
            .unwrap_or_default(),
    )
}

impl<V> moka::Expiry<CacheKey, DeadlineEntry<V>> for StoreExpiration {
    fn expire_after_create(
        &self,
        _key: &CacheKey,
        value: &DeadlineEntry<V>,
        current_time: Instant,
    ) -> Option<Duration> {
        saturating_duration_since(current_time, value.deadline)
    }

    fn expire_after_update(
        &self,
        _key: &CacheKey,
        value: &DeadlineEntry<V>,
        current_time: Instant,
        _current_duration: Option<Duration>,
    ) -> Option<Duration> {
        saturating_duration_since(current_time, value.deadline)
    }
}

/// The default [`KeyedStore`]: a time-aware, capacity-bounded map.
///
/// Entries expire at the absolute deadline computed by the time-to-use
/// function and are additionally evicted by moka's policy when the cache is
/// over capacity. Expired entries are also reaped lazily on read, so a
/// stale entry is reported absent even before the background timer runs.
pub struct TlruStore<V> {
    cache: moka::sync::Cache<CacheKey, DeadlineEntry<V>>,
    ttu: Ttu<V>,
    weigher: Option<Weigher<V>>,
    max_entry_weight: Option<u32>,
}

impl<V: Clone + Send + Sync + 'static> std::fmt::Debug for TlruStore<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlruStore")
            .field("name", &self.cache.name())
            .field("entries", &self.cache.entry_count())
            .finish()
    }
}

impl<V: Clone + Send + Sync + 'static> Clone for TlruStore<V> {
    fn clone(&self) -> Self {
        TlruStore {
            cache: self.cache.clone(),
            ttu: Arc::clone(&self.ttu),
            weigher: self.weigher.clone(),
            max_entry_weight: self.max_entry_weight,
        }
    }
}

impl<V: Clone + Send + Sync + 'static> TlruStore<V> {
    /// Creates a store whose capacity counts entries.
    pub fn new(
        config: &CacheConfig,
        ttu: impl Fn(&CacheKey, &V, Instant) -> Instant + Send + Sync + 'static,
    ) -> Self {
        Self::build(config, Arc::new(ttu), None)
    }

    /// Creates a store whose capacity counts weight, with per-entry
    /// admission governed by [`CacheConfig::max_entry_weight`].
    pub fn with_weigher(
        config: &CacheConfig,
        ttu: impl Fn(&CacheKey, &V, Instant) -> Instant + Send + Sync + 'static,
        weigher: impl Fn(&CacheKey, &V) -> u32 + Send + Sync + 'static,
    ) -> Self {
        Self::build(config, Arc::new(ttu), Some(Arc::new(weigher)))
    }

    fn build(config: &CacheConfig, ttu: Ttu<V>, weigher: Option<Weigher<V>>) -> Self {
        let mut builder = moka::sync::Cache::builder()
            .max_capacity(config.capacity)
            .name(&config.name)
            .expire_after(StoreExpiration);
        if let Some(weigher) = weigher.clone() {
            builder = builder.weigher(move |key: &CacheKey, entry: &DeadlineEntry<V>| {
                weigher.as_ref()(key, &entry.value)
            });
        }

        TlruStore {
            cache: builder.build(),
            ttu,
            weigher,
            max_entry_weight: config.max_entry_weight,
        }
    }

    /// Runs the store's deferred housekeeping (evictions, expirations).
    ///
    /// Eviction under capacity pressure is asynchronous in moka; tests call
    /// this to make it deterministic.
    pub fn run_pending_tasks(&self) {
        self.cache.run_pending_tasks();
    }

    /// The number of entries currently held, including entries pending
    /// eviction.
    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }
}

impl<V: Clone + Send + Sync + 'static> KeyedStore<V> for TlruStore<V> {
    fn get(&self, key: &CacheKey) -> Option<V> {
        let entry = self.cache.get(key)?;
        if entry.deadline <= Instant::now() {
            // stale entry observed before the timer wheel got to it
            self.cache.invalidate(key);
            return None;
        }
        Some(entry.value)
    }

    fn set(&self, key: &CacheKey, value: V) -> Result<(), StoreRejected> {
        if let (Some(max), Some(weigher)) = (self.max_entry_weight, self.weigher.as_ref()) {
            if weigher.as_ref()(key, &value) > max {
                return Err(StoreRejected);
            }
        }
        let deadline = self.ttu.as_ref()(key, &value, Instant::now());
        self.cache.insert(key.clone(), DeadlineEntry { deadline, value });
        Ok(())
    }

    fn delete(&self, key: &CacheKey) {
        self.cache.invalidate(key);
    }

    fn keys(&self) -> Vec<CacheKey> {
        self.cache.iter().map(|(key, _)| key.as_ref().clone()).collect()
    }

    fn clear(&self) {
        self.cache.invalidate_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> CacheKey {
        CacheKey::of(name)
    }

    #[test]
    fn test_fresh_entry_is_returned() {
        let store = TlruStore::new(&CacheConfig::default(), |_, _, now| {
            now + Duration::from_secs(5)
        });
        store.set(&key("a"), 1u32).unwrap();
        assert_eq!(store.get(&key("a")), Some(1));
    }

    #[test]
    fn test_expired_entry_is_absent_and_reaped() {
        // deadline at insertion time: immediately stale
        let store = TlruStore::new(&CacheConfig::default(), |_, _, now| now);
        store.set(&key("a"), 1u32).unwrap();
        assert_eq!(store.get(&key("a")), None);
        store.run_pending_tasks();
        assert_eq!(store.entry_count(), 0);
    }

    #[test]
    fn test_ttu_sees_the_value() {
        let store = TlruStore::new(&CacheConfig::default(), |_, value: &u64, now| {
            if *value == 0 {
                now
            } else {
                now + Duration::from_secs(5)
            }
        });
        store.set(&key("stale"), 0).unwrap();
        store.set(&key("fresh"), 7).unwrap();
        assert_eq!(store.get(&key("stale")), None);
        assert_eq!(store.get(&key("fresh")), Some(7));
    }

    #[test]
    fn test_capacity_eviction_is_the_stores_policy() {
        let config = CacheConfig {
            capacity: 2,
            ..Default::default()
        };
        let store = TlruStore::new(&config, |_, _, now| now + Duration::from_secs(60));
        store.set(&key("a"), 1u32).unwrap();
        store.set(&key("b"), 2).unwrap();
        store.set(&key("c"), 3).unwrap();
        store.run_pending_tasks();
        assert!(store.entry_count() <= 2);
        assert!(store.keys().len() <= 2);
    }

    #[test]
    fn test_admission_rejects_overweight_values() {
        let config = CacheConfig {
            max_entry_weight: Some(8),
            ..Default::default()
        };
        let store = TlruStore::with_weigher(
            &config,
            |_, _, now| now + Duration::from_secs(60),
            |_, value: &String| value.len() as u32,
        );
        assert_eq!(store.set(&key("big"), "x".repeat(64)), Err(StoreRejected));
        assert_eq!(store.get(&key("big")), None);
        store.set(&key("small"), "ok".into()).unwrap();
        assert_eq!(store.get(&key("small")).as_deref(), Some("ok"));
    }

    #[test]
    fn test_delete_and_clear() {
        let store = TlruStore::new(&CacheConfig::default(), |_, _, now| {
            now + Duration::from_secs(60)
        });
        store.set(&key("a"), 1u32).unwrap();
        store.set(&key("b"), 2).unwrap();

        store.delete(&key("a"));
        assert_eq!(store.get(&key("a")), None);
        assert_eq!(store.get(&key("b")), Some(2));

        store.clear();
        assert_eq!(store.get(&key("b")), None);
        store.run_pending_tasks();
        assert_eq!(store.keys().len(), 0);
    }
}
