//! # Flightcache
//!
//! An asynchronous memoizing cache with call coalescing ("singleflight")
//! semantics: it turns an arbitrary asynchronous computation into a cached,
//! deduplicated, time-bounded value producer.
//!
//! ## How a call flows
//!
//! - The [`KeyDeriver`] binds the call's positional/named arguments against
//!   the declared [`Signature`], filters the [`IgnoreSet`], and hashes the
//!   remaining values into a [`CacheKey`].
//! - The [`Coordinator`] consults the [`KeyedStore`]. A settled entry is a
//!   hit. An in-flight entry is joined: the caller awaits the existing
//!   [`SharedComputation`] without being able to cancel or corrupt it. On a
//!   miss, the producer is spawned on its own task and its pending handle is
//!   published *before* it completes, so concurrent callers join it rather
//!   than re-running it — this is the cache stampede protection.
//! - When the producer settles, its outcome (value, error, or cancellation)
//!   is propagated into the shared handle exactly once, and every waiter
//!   observes it regardless of whether other waiters went away.
//!
//! Whether a result could be *retained* never affects what a caller gets
//! back: a value the store refuses to admit is still returned, it is simply
//! not cached.
//!
//! ## Freshness
//!
//! The default store, [`TlruStore`], is a thin adapter over
//! [`moka`](https://docs.rs/moka): entries carry an absolute deadline
//! computed by a caller-supplied time-to-use function `(key, value, now) ->
//! deadline`, and capacity pressure is handled by moka's own eviction
//! policy. Expired entries are also reaped lazily on read.
//!
//! ## The adapter
//!
//! [`Cached`] is the decorator-equivalent surface: one instance per wrapped
//! function, carrying its signature, ignore-set, store and observer, with
//! `cache_clear` and introspection accessors. Hit-rate accounting (`info`)
//! and external locks are accepted for interface compatibility only and are
//! rejected at build time.
//!
//! [`token`] applies the same machinery to identity-provider tokens, with
//! freshness driven by the token's own expiry.

pub mod cached;
pub mod computation;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod key;
pub mod observer;
pub mod store;
pub mod token;
pub mod utils;

pub use cached::{Cached, CachedBuilder};
pub use computation::{ComputationState, Outcome, SharedComputation};
pub use config::{CacheConfig, FailurePolicy};
pub use coordinator::Coordinator;
pub use error::{BindingError, Error, ProducerError, StoreRejected};
pub use key::{ArgValue, CacheKey, CallArgs, IgnoreSet, KeyBuilder, KeyDeriver, Signature};
pub use observer::{CacheObserver, NopObserver, TracingObserver};
pub use store::{KeyedStore, TlruStore};
pub use token::{TokenCache, TokenEntry};
