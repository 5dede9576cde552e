//! The singleflight coordinator.
//!
//! `resolve` guarantees that for a fixed key, at most one producer executes
//! between two points where the store holds no entry for that key. All
//! concurrent callers observe that single producer's outcome; none of them
//! can cancel or corrupt it for the others.

use std::future::Future;
use std::sync::{Arc, Mutex};

use crate::computation::{ComputationState, Outcome, SharedComputation};
use crate::config::FailurePolicy;
use crate::error::Error;
use crate::key::CacheKey;
use crate::observer::CacheObserver;
use crate::store::KeyedStore;
use crate::utils::defer::defer;

/// Coalesces concurrent computations per key over a [`KeyedStore`].
///
/// The store holds [`SharedComputation`] handles: a pending handle is
/// published before its producer runs, so callers arriving during execution
/// join it instead of re-running the producer.
pub struct Coordinator<T: Clone> {
    store: Arc<dyn KeyedStore<SharedComputation<T>>>,
    observer: Arc<dyn CacheObserver>,
    failure_policy: FailurePolicy,
    /// Serializes check-then-publish across callers.
    publish_lock: Arc<Mutex<()>>,
}

impl<T: Clone> std::fmt::Debug for Coordinator<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("failure_policy", &self.failure_policy)
            .finish()
    }
}

impl<T: Clone> Clone for Coordinator<T> {
    fn clone(&self) -> Self {
        Coordinator {
            store: Arc::clone(&self.store),
            observer: Arc::clone(&self.observer),
            failure_policy: self.failure_policy,
            publish_lock: Arc::clone(&self.publish_lock),
        }
    }
}

enum Lookup<T: Clone> {
    /// A settled, fresh entry.
    Fresh(T),
    /// Someone else's computation is in flight.
    InFlight(SharedComputation<T>),
    /// A retained failure, replayed under [`FailurePolicy::Replay`].
    Replay(Error),
    Absent,
}

impl<T: Clone + Send + Sync + 'static> Coordinator<T> {
    pub fn new(
        store: Arc<dyn KeyedStore<SharedComputation<T>>>,
        observer: Arc<dyn CacheObserver>,
        failure_policy: FailurePolicy,
    ) -> Self {
        Coordinator {
            store,
            observer,
            failure_policy,
            publish_lock: Arc::new(Mutex::new(())),
        }
    }

    /// The underlying store, for diagnostics.
    pub fn store(&self) -> &Arc<dyn KeyedStore<SharedComputation<T>>> {
        &self.store
    }

    /// Removes all entries, synchronously.
    ///
    /// Computations already joined are unaffected; they settle through their
    /// own channel and do not re-occupy the cleared slot.
    pub fn clear(&self) {
        let _guard = self.publish_lock.lock().unwrap();
        self.store.clear();
    }

    /// Returns the cached result for `key`, joins an in-flight computation
    /// for it, or starts `producer` as a new one.
    ///
    /// The producer runs on its own task: cancelling this call's future
    /// abandons only this caller's wait. Whether the result could be
    /// retained in the store never affects the value returned here.
    pub async fn resolve<F, Fut>(&self, key: CacheKey, producer: F) -> Result<T, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Outcome<T>> + Send + 'static,
    {
        let computation = {
            // No suspension point is reachable while this lock is held, so
            // check-then-publish is atomic with respect to all other callers
            // and a lookup/publish race cannot start a second producer.
            let _guard = self.publish_lock.lock().unwrap();
            match self.lookup(&key) {
                Lookup::Fresh(value) => {
                    self.observer.on_hit(&key);
                    return Ok(value);
                }
                Lookup::Replay(error) => {
                    self.observer.on_error(&key, &error);
                    return Err(error);
                }
                Lookup::InFlight(computation) => {
                    self.observer.on_join(&key);
                    computation
                }
                Lookup::Absent => {
                    self.observer.on_miss(&key);
                    self.start(key.clone(), producer())
                }
            }
        };

        computation.join().await
    }

    fn lookup(&self, key: &CacheKey) -> Lookup<T> {
        let Some(computation) = self.store.get(key) else {
            return Lookup::Absent;
        };
        match computation.state() {
            ComputationState::Pending => Lookup::InFlight(computation),
            ComputationState::Succeeded(value) => Lookup::Fresh(value),
            ComputationState::Failed(err) => self.settled_failure(key, Error::Producer(err)),
            ComputationState::Cancelled => self.settled_failure(key, Error::Cancelled),
        }
    }

    /// A settled failure is never a cache hit; the policy only decides
    /// between eager eviction and replaying the failure until the store
    /// evicts it.
    fn settled_failure(&self, key: &CacheKey, error: Error) -> Lookup<T> {
        match self.failure_policy {
            FailurePolicy::Retry => {
                self.store.delete(key);
                Lookup::Absent
            }
            FailurePolicy::Replay => Lookup::Replay(error),
        }
    }

    /// Publishes a pending handle and spawns the producer as a detached
    /// task.
    ///
    /// This is deliberately not `async`: the producer is scheduled eagerly
    /// and independently of the calling task's lifetime.
    fn start<Fut>(&self, key: CacheKey, producer: Fut) -> SharedComputation<T>
    where
        Fut: Future<Output = Outcome<T>> + Send + 'static,
    {
        let (sender, computation) = SharedComputation::new();

        // Publish before the producer can run, so callers arriving while it
        // executes join instead of re-starting it. Rejection is not an
        // error: the result is simply not retained.
        if self.store.set(&key, computation.clone()).is_err() {
            self.observer.on_store_rejected(&key);
        }

        let this = self.clone();
        let handle = computation.clone();
        tokio::spawn(async move {
            // If this task dies before settling, the dead pending handle
            // must not keep satisfying lookups.
            let reap = defer({
                let this = this.clone();
                let key = key.clone();
                let computation = computation.clone();
                move || this.evict_if_current(&key, &computation)
            });

            let outcome = producer.await;
            reap.disarm();

            // Settle first: the refresh below re-evaluates the time-to-use
            // function, which must see the terminal state.
            sender.settle(outcome.clone());
            this.finish(&key, &computation, &outcome);
        });

        handle
    }

    /// Completion-side bookkeeping, run by the producer task itself so that
    /// caller cancellation cannot skip it.
    fn finish(&self, key: &CacheKey, computation: &SharedComputation<T>, outcome: &Outcome<T>) {
        match outcome {
            Ok(_) => self.refresh_if_current(key, computation),
            Err(err) => {
                self.observer.on_error(key, &Error::Producer(err.clone()));
                if self.failure_policy == FailurePolicy::Retry {
                    self.evict_if_current(key, computation);
                }
            }
        }
    }

    /// Re-sets the entry so its deadline is recomputed from the settled
    /// value, and admission re-checked against it.
    ///
    /// A `clear` or a newer computation that took the slot in the meantime
    /// wins; this computation then settles through its channel only.
    fn refresh_if_current(&self, key: &CacheKey, computation: &SharedComputation<T>) {
        let _guard = self.publish_lock.lock().unwrap();
        let Some(current) = self.store.get(key) else {
            return;
        };
        if !current.same_computation(computation) {
            return;
        }
        if self.store.set(key, computation.clone()).is_err() {
            self.observer.on_store_rejected(key);
            self.store.delete(key);
        }
    }

    fn evict_if_current(&self, key: &CacheKey, computation: &SharedComputation<T>) {
        let _guard = self.publish_lock.lock().unwrap();
        let current = self.store.get(key);
        if current.is_some_and(|current| current.same_computation(computation)) {
            self.store.delete(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use flightcache_test::CountingProducer;

    use super::*;
    use crate::config::CacheConfig;
    use crate::error::ProducerError;
    use crate::observer::NopObserver;
    use crate::store::TlruStore;

    fn coordinator(policy: FailurePolicy) -> Coordinator<u32> {
        let store = TlruStore::new(
            &CacheConfig::default(),
            |_, _: &SharedComputation<u32>, now| now + Duration::from_secs(5),
        );
        Coordinator::new(Arc::new(store), Arc::new(NopObserver), policy)
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_execution() {
        flightcache_test::setup();
        let coordinator = coordinator(FailurePolicy::Retry);
        let producer = CountingProducer::new();
        let key = CacheKey::of("add:1:2");

        let (a, b, c) = tokio::join!(
            coordinator.resolve(key.clone(), || producer.produce(3, Duration::from_millis(50))),
            coordinator.resolve(key.clone(), || producer.produce(3, Duration::from_millis(50))),
            coordinator.resolve(key.clone(), || producer.produce(3, Duration::from_millis(50))),
        );
        assert_eq!(a, Ok(3));
        assert_eq!(b, Ok(3));
        assert_eq!(c, Ok(3));
        assert_eq!(producer.invocations(), 1);

        // settled entry is now a plain hit
        let again = coordinator
            .resolve(key, || producer.produce(3, Duration::from_millis(50)))
            .await;
        assert_eq!(again, Ok(3));
        assert_eq!(producer.invocations(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_caller_does_not_corrupt_the_result() {
        flightcache_test::setup();
        let coordinator = coordinator(FailurePolicy::Retry);
        let producer = CountingProducer::new();
        let key = CacheKey::of("slow");

        // the caller that *started* the computation goes away mid-flight
        let starter = tokio::spawn({
            let coordinator = coordinator.clone();
            let key = key.clone();
            let fut = producer.produce(7, Duration::from_millis(100));
            async move { coordinator.resolve(key, move || fut).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let joiner = tokio::spawn({
            let coordinator = coordinator.clone();
            let key = key.clone();
            let fut = producer.produce(7, Duration::from_millis(100));
            async move { coordinator.resolve(key, move || fut).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        starter.abort();
        assert!(starter.await.unwrap_err().is_cancelled());

        // the joiner and the cache still observe the true outcome
        assert_eq!(joiner.await.unwrap(), Ok(7));
        assert_eq!(producer.invocations(), 1);
        let hit = coordinator
            .resolve(key, || producer.produce(7, Duration::from_millis(100)))
            .await;
        assert_eq!(hit, Ok(7));
        assert_eq!(producer.invocations(), 1);
    }

    #[tokio::test]
    async fn test_failed_computation_is_retried_by_default() {
        flightcache_test::setup();
        let coordinator = coordinator(FailurePolicy::Retry);
        let producer = CountingProducer::new();
        let key = CacheKey::of("flaky");

        let first = coordinator
            .resolve(key.clone(), || {
                producer.fail::<u32>("backend down", Duration::from_millis(10))
            })
            .await;
        assert_eq!(
            first,
            Err(Error::Producer(ProducerError::new("backend down")))
        );

        // the failure was not retained, so the next call re-runs
        let second = coordinator
            .resolve(key, || producer.produce(9, Duration::from_millis(10)))
            .await;
        assert_eq!(second, Ok(9));
        assert_eq!(producer.invocations(), 2);
    }

    #[tokio::test]
    async fn test_failed_computation_is_replayed_when_configured() {
        flightcache_test::setup();
        let coordinator = coordinator(FailurePolicy::Replay);
        let producer = CountingProducer::new();
        let key = CacheKey::of("flaky");

        let first = coordinator
            .resolve(key.clone(), || {
                producer.fail::<u32>("backend down", Duration::from_millis(10))
            })
            .await;
        assert!(first.is_err());

        let second = coordinator
            .resolve(key, || producer.produce(9, Duration::from_millis(10)))
            .await;
        assert_eq!(
            second,
            Err(Error::Producer(ProducerError::new("backend down")))
        );
        assert_eq!(producer.invocations(), 1);
    }

    #[tokio::test]
    async fn test_joiners_observe_the_same_failure() {
        flightcache_test::setup();
        let coordinator = coordinator(FailurePolicy::Retry);
        let producer = CountingProducer::new();
        let key = CacheKey::of("flaky");

        let (a, b) = tokio::join!(
            coordinator.resolve(key.clone(), || {
                producer.fail::<u32>("boom", Duration::from_millis(50))
            }),
            coordinator.resolve(key.clone(), || {
                producer.fail::<u32>("boom", Duration::from_millis(50))
            }),
        );
        assert_eq!(a, Err(Error::Producer(ProducerError::new("boom"))));
        assert_eq!(a, b);
        assert_eq!(producer.invocations(), 1);
    }

    #[tokio::test]
    async fn test_store_rejection_does_not_affect_the_caller() {
        flightcache_test::setup();
        let config = CacheConfig {
            max_entry_weight: Some(4),
            ..Default::default()
        };
        let store = TlruStore::with_weigher(
            &config,
            |_, _, now| now + Duration::from_secs(5),
            |_, computation: &SharedComputation<String>| match computation.state() {
                ComputationState::Succeeded(value) => value.len() as u32,
                _ => 0,
            },
        );
        let coordinator: Coordinator<String> =
            Coordinator::new(Arc::new(store), Arc::new(NopObserver), FailurePolicy::Retry);
        let producer = CountingProducer::new();
        let key = CacheKey::of("big");

        let first = coordinator
            .resolve(key.clone(), || {
                producer.produce("way too large".to_string(), Duration::from_millis(10))
            })
            .await;
        assert_eq!(first.as_deref(), Ok("way too large"));

        // wait for the detached producer task to run its completion path
        tokio::time::sleep(Duration::from_millis(20)).await;

        // nothing was retained, so the next call recomputes
        let second = coordinator
            .resolve(key, || {
                producer.produce("way too large".to_string(), Duration::from_millis(10))
            })
            .await;
        assert_eq!(second.as_deref(), Ok("way too large"));
        assert_eq!(producer.invocations(), 2);
    }

    #[tokio::test]
    async fn test_expired_entry_recomputes() {
        flightcache_test::setup();
        // a time-to-use that expires entries as soon as they settle
        let store = TlruStore::new(
            &CacheConfig::default(),
            |_, computation: &SharedComputation<u32>, now| {
                if computation.state().is_settled() {
                    now
                } else {
                    now + Duration::from_secs(5)
                }
            },
        );
        let coordinator = Coordinator::new(Arc::new(store), Arc::new(NopObserver), FailurePolicy::Retry);
        let producer = CountingProducer::new();
        let key = CacheKey::of("short-lived");

        let first = coordinator
            .resolve(key.clone(), || producer.produce(1, Duration::from_millis(10)))
            .await;
        assert_eq!(first, Ok(1));
        tokio::time::sleep(Duration::from_millis(20)).await;

        let second = coordinator
            .resolve(key, || producer.produce(1, Duration::from_millis(10)))
            .await;
        assert_eq!(second, Ok(1));
        assert_eq!(producer.invocations(), 2);
    }
}
