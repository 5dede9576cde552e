//! The adapter binding key derivation, store and coordinator to one wrapped
//! unit of work.
//!
//! This is the decorator-equivalent surface: build one [`Cached`] per
//! function you want memoized, then route every call through
//! [`Cached::call`] with that call's arguments and producer.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::computation::{Outcome, SharedComputation};
use crate::config::CacheConfig;
use crate::coordinator::Coordinator;
use crate::error::Error;
use crate::key::{CallArgs, IgnoreSet, KeyDeriver, Signature};
use crate::observer::{CacheObserver, NopObserver};
use crate::store::{KeyedStore, TlruStore};

/// A memoized, call-coalescing wrapper around one asynchronous unit of work.
///
/// The wrapped work must not have side effects that depend on running more
/// than once per unique argument key; that is the caller's responsibility,
/// not enforced here.
pub struct Cached<T: Clone> {
    deriver: KeyDeriver,
    store: Option<Arc<dyn KeyedStore<SharedComputation<T>>>>,
    coordinator: Option<Coordinator<T>>,
}

impl<T: Clone> std::fmt::Debug for Cached<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cached")
            .field("deriver", &self.deriver)
            .field("caching", &self.store.is_some())
            .finish()
    }
}

impl<T: Clone + Send + Sync + 'static> Cached<T> {
    pub fn builder(signature: Signature) -> CachedBuilder<T> {
        CachedBuilder {
            signature,
            ignore: IgnoreSet::new(),
            store: None,
            ttl: None,
            observer: Arc::new(NopObserver),
            config: CacheConfig::default(),
            info: false,
            lock: false,
        }
    }

    /// Derives the key for this call and resolves it through the
    /// coordinator.
    ///
    /// `producer` is only invoked on a miss. Without a configured store this
    /// degrades to a plain invocation.
    pub async fn call<F, Fut>(&self, args: CallArgs, producer: F) -> Result<T, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Outcome<T>> + Send + 'static,
    {
        let Some(coordinator) = &self.coordinator else {
            return producer().await.map_err(Error::Producer);
        };
        let key = self.deriver.derive(&args)?;
        coordinator.resolve(key, producer).await
    }

    /// Removes all entries from the associated store, synchronously.
    ///
    /// Takes effect for every call issued after it returns. Computations
    /// already joined still observe their original outcome.
    pub fn cache_clear(&self) {
        if let Some(coordinator) = &self.coordinator {
            coordinator.clear();
        }
    }

    /// The key deriver, for diagnostics.
    pub fn key_deriver(&self) -> &KeyDeriver {
        &self.deriver
    }

    /// The associated store, for diagnostics. `None` when caching is
    /// disabled.
    pub fn store(&self) -> Option<&Arc<dyn KeyedStore<SharedComputation<T>>>> {
        self.store.as_ref()
    }
}

/// Builder for [`Cached`].
pub struct CachedBuilder<T: Clone> {
    signature: Signature,
    ignore: IgnoreSet,
    store: Option<Arc<dyn KeyedStore<SharedComputation<T>>>>,
    ttl: Option<Duration>,
    observer: Arc<dyn CacheObserver>,
    config: CacheConfig,
    info: bool,
    lock: bool,
}

impl<T: Clone + Send + Sync + 'static> CachedBuilder<T> {
    /// Parameters to exclude from key derivation.
    pub fn ignore(mut self, ignore: IgnoreSet) -> Self {
        self.ignore = ignore;
        self
    }

    /// Uses an explicit store instead of building one.
    pub fn store(mut self, store: Arc<dyn KeyedStore<SharedComputation<T>>>) -> Self {
        self.store = Some(store);
        self
    }

    /// Builds a default store with a fixed relative time-to-live.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    pub fn observer(mut self, observer: impl CacheObserver + 'static) -> Self {
        self.observer = Arc::new(observer);
        self
    }

    /// Hit/miss accounting. Accepted for interface compatibility only;
    /// `build` fails when enabled.
    pub fn info(mut self, info: bool) -> Self {
        self.info = info;
        self
    }

    /// An external lock. Accepted for interface compatibility only; `build`
    /// fails when one is supplied — the coordinator's own per-key
    /// serialization is the only concurrency control.
    pub fn external_lock<L: Send + Sync>(mut self, _lock: L) -> Self {
        self.lock = true;
        self
    }

    /// Builds the adapter.
    ///
    /// Unsupported options fail here, at decoration time, never at call
    /// time. Without an explicit store, a ttl, or a configured
    /// `default_ttl`, caching is disabled and calls pass straight through.
    pub fn build(self) -> Result<Cached<T>, Error> {
        if self.info {
            return Err(Error::Unsupported("info"));
        }
        if self.lock {
            return Err(Error::Unsupported("lock"));
        }

        let store = self.store.or_else(|| {
            let ttl = self.ttl.or(self.config.default_ttl)?;
            let store = TlruStore::new(&self.config, move |_, _, now| now + ttl);
            Some(Arc::new(store) as Arc<dyn KeyedStore<SharedComputation<T>>>)
        });
        let coordinator = store.as_ref().map(|store| {
            Coordinator::new(
                Arc::clone(store),
                Arc::clone(&self.observer),
                self.config.failure_policy,
            )
        });

        Ok(Cached {
            deriver: KeyDeriver::new(self.signature, self.ignore),
            store,
            coordinator,
        })
    }
}
