use std::sync::Arc;

use thiserror::Error;

/// An error binding call arguments against a declared [`Signature`](crate::Signature).
///
/// Binding failures indicate a caller mistake and are always surfaced, never
/// swallowed or retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BindingError {
    /// More positional arguments were supplied than the signature declares.
    #[error("expected at most {expected} positional arguments, got {got}")]
    TooManyPositional { expected: usize, got: usize },
    /// A named argument does not match any declared parameter.
    #[error("unknown parameter `{0}`")]
    UnknownParameter(String),
    /// The same parameter was supplied both positionally and by name,
    /// or by name more than once.
    #[error("parameter `{0}` supplied more than once")]
    DuplicateParameter(String),
}

/// A failure reported by a wrapped computation.
///
/// This error is intended for replay: every caller joined to the same
/// computation receives the same instance, so it is cheap to clone and
/// carries an opaque message rather than the original error value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ProducerError {
    message: Arc<str>,
}

impl ProducerError {
    /// Creates a new error from a message.
    pub fn new(message: impl Into<String>) -> Self {
        ProducerError {
            message: message.into().into(),
        }
    }

    /// Wraps an arbitrary error, logging it at the point of conversion.
    #[track_caller]
    pub fn from_std_error<E: std::error::Error + 'static>(e: E) -> Self {
        let dynerr: &dyn std::error::Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr, "producer failed");
        Self::new(e.to_string())
    }

    /// The error message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<std::io::Error> for ProducerError {
    #[track_caller]
    fn from(err: std::io::Error) -> Self {
        Self::from_std_error(err)
    }
}

/// A candidate value was refused by the store's admission policy.
///
/// This never reaches a caller of [`resolve`](crate::Coordinator::resolve):
/// the computation's result is returned regardless, the cache simply does
/// not retain it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("value exceeds the store's admission limit")]
pub struct StoreRejected;

/// The error type surfaced by cache lookups and calls.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Argument binding against the declared signature failed.
    #[error(transparent)]
    Binding(#[from] BindingError),
    /// The computation itself failed; replayed to every joiner.
    #[error(transparent)]
    Producer(#[from] ProducerError),
    /// The computation was cancelled by the runtime before settling.
    #[error("computation was cancelled")]
    Cancelled,
    /// An option accepted only for interface compatibility was supplied.
    ///
    /// Raised synchronously at build time, never deferred to call time.
    #[error("unsupported option: {0}")]
    Unsupported(&'static str),
}
