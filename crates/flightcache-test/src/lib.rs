//! Helpers for testing the cache crates.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every async test, call [`setup`]. This will set up the logger so
//!    that all console output is captured by the test runner.
//!
//!  - A [`CountingProducer`] counts *executions*, not constructions: a
//!    future it hands out that is never polled (because the call was served
//!    from the cache or joined another computation) does not count.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use flightcache::ProducerError;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the
///    `flightcache` crate and mutes all other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("flightcache=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// A probe standing in for the wrapped unit of work.
///
/// Hands out producer futures and counts how many of them actually ran, so
/// tests can assert the exactly-once property.
#[derive(Clone, Default)]
pub struct CountingProducer {
    invocations: Arc<AtomicUsize>,
}

impl CountingProducer {
    pub fn new() -> Self {
        Self::default()
    }

    /// How many produced futures have started executing.
    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    /// A producer future yielding `value` after `delay`.
    pub fn produce<T>(
        &self,
        value: T,
        delay: Duration,
    ) -> impl Future<Output = Result<T, ProducerError>> + Send + 'static
    where
        T: Send + 'static,
    {
        let invocations = Arc::clone(&self.invocations);
        async move {
            invocations.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(delay).await;
            Ok(value)
        }
    }

    /// A producer future failing with `message` after `delay`.
    pub fn fail<T>(
        &self,
        message: impl Into<String>,
        delay: Duration,
    ) -> impl Future<Output = Result<T, ProducerError>> + Send + 'static
    where
        T: Send + 'static,
    {
        let invocations = Arc::clone(&self.invocations);
        let message = message.into();
        async move {
            invocations.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(delay).await;
            Err(ProducerError::new(message))
        }
    }
}
