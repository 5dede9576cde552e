//! The shared handle for one in-flight or settled computation.
//!
//! A [`SharedComputation`] is a detached, join-only view: the producer runs
//! on its own spawned task, and every caller (the one that started it and
//! any that joined meanwhile) awaits a clone of the same shared channel.
//! Dropping a handle, or cancelling a caller that is awaiting one, never
//! affects the producer or the other joiners.

use std::sync::Arc;

use futures::FutureExt;
use futures::channel::oneshot;
use futures::future::Shared;

use crate::error::{Error, ProducerError};

/// The terminal (or not-yet-terminal) outcome of a computation.
pub type Outcome<T> = Result<T, ProducerError>;

type OutcomeChannel<T> = Shared<oneshot::Receiver<Outcome<T>>>;

/// The observable state of a [`SharedComputation`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComputationState<T> {
    /// The producer has not settled yet.
    Pending,
    /// The producer returned a value.
    Succeeded(T),
    /// The producer returned an error; replayed to every joiner.
    Failed(ProducerError),
    /// The producer task went away without settling (runtime cancellation).
    Cancelled,
}

impl<T> ComputationState<T> {
    /// Whether this state is terminal.
    pub fn is_settled(&self) -> bool {
        !matches!(self, ComputationState::Pending)
    }
}

/// A clonable handle to one unit of asynchronous work for a given key.
///
/// Exactly one [`CompletionSender`] exists per computation; everyone else is
/// a consumer. The handle is what gets published into the store, so callers
/// arriving while the producer still runs join it instead of re-running.
#[derive(Clone)]
pub struct SharedComputation<T: Clone> {
    channel: OutcomeChannel<T>,
    /// Identity of the underlying computation, shared by all clones.
    identity: Arc<()>,
}

impl<T: Clone> std::fmt::Debug for SharedComputation<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedComputation")
            .field("settled", &!self.is_pending())
            .finish()
    }
}

impl<T: Clone> SharedComputation<T> {
    /// Creates a pending computation and the sender that settles it.
    pub fn new() -> (CompletionSender<T>, Self) {
        let (sender, receiver) = oneshot::channel();
        let computation = SharedComputation {
            channel: receiver.shared(),
            identity: Arc::new(()),
        };
        (CompletionSender { sender }, computation)
    }

    /// The current state, without waiting.
    pub fn state(&self) -> ComputationState<T> {
        // a settled channel resolves on the first poll, so probing a clone
        // observes the terminal state without suspending
        match self.channel.clone().now_or_never() {
            None => ComputationState::Pending,
            Some(Ok(Ok(value))) => ComputationState::Succeeded(value),
            Some(Ok(Err(err))) => ComputationState::Failed(err),
            Some(Err(_cancelled)) => ComputationState::Cancelled,
        }
    }

    pub fn is_pending(&self) -> bool {
        !self.state().is_settled()
    }

    /// Whether two handles view the same underlying computation.
    pub fn same_computation(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.identity, &other.identity)
    }

    /// Awaits the terminal state.
    ///
    /// Cancelling this wait abandons only this caller; the producer task and
    /// all other joiners are isolated from it.
    pub async fn join(&self) -> Result<T, Error> {
        match self.channel.clone().await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(Error::Producer(err)),
            Err(_cancelled) => Err(Error::Cancelled),
        }
    }
}

/// The producing side of a [`SharedComputation`].
///
/// Settling consumes the sender, so an outcome can be propagated at most
/// once; dropping it unsettled is what joiners observe as
/// [`ComputationState::Cancelled`].
pub struct CompletionSender<T> {
    sender: oneshot::Sender<Outcome<T>>,
}

impl<T> CompletionSender<T> {
    /// Transfers the producer's outcome into the shared handle.
    pub fn settle(self, outcome: Outcome<T>) {
        // a send error only means no joiner is left to care
        self.sender.send(outcome).ok();
    }
}
