//! Injectable sink for cache traffic events.
//!
//! The core never logs on its own; it reports hits, misses, joins, producer
//! failures and store rejections to whatever observer is wired in. The
//! default sink discards everything, [`TracingObserver`] forwards to
//! [`tracing`].

use crate::error::Error;
use crate::key::CacheKey;

/// Receives cache traffic events.
///
/// All methods default to no-ops, so implementors only pick the events they
/// care about. Observers are called synchronously from the resolution path
/// and must not block.
pub trait CacheObserver: Send + Sync {
    /// A lookup was served from a settled cache entry.
    fn on_hit(&self, _key: &CacheKey) {}

    /// A lookup found nothing usable; a producer is about to start.
    fn on_miss(&self, _key: &CacheKey) {}

    /// A lookup attached to another caller's in-flight computation.
    fn on_join(&self, _key: &CacheKey) {}

    /// A computation settled in a failure state.
    fn on_error(&self, _key: &CacheKey, _error: &Error) {}

    /// The store's admission policy refused to retain a value.
    fn on_store_rejected(&self, _key: &CacheKey) {}
}

/// The default observer: discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NopObserver;

impl CacheObserver for NopObserver {}

/// Emits every event as a [`tracing`] event, tagged with the cache name.
#[derive(Debug, Clone)]
pub struct TracingObserver {
    name: String,
}

impl TracingObserver {
    pub fn new(name: impl Into<String>) -> Self {
        TracingObserver { name: name.into() }
    }
}

impl CacheObserver for TracingObserver {
    fn on_hit(&self, key: &CacheKey) {
        tracing::trace!(cache = %self.name, %key, "cache hit");
    }

    fn on_miss(&self, key: &CacheKey) {
        tracing::trace!(cache = %self.name, %key, "cache miss");
    }

    fn on_join(&self, key: &CacheKey) {
        tracing::trace!(cache = %self.name, %key, "joined in-flight computation");
    }

    fn on_error(&self, key: &CacheKey, error: &Error) {
        tracing::debug!(cache = %self.name, %key, %error, "computation failed");
    }

    fn on_store_rejected(&self, key: &CacheKey) {
        tracing::debug!(cache = %self.name, %key, "store rejected value");
    }
}
