//! Structured errors surfaced by the graph runtime.

use std::sync::Mutex;
use thiserror::Error as ThisError;

/// The error kinds the core emits, per the error handling design.
#[derive(ThisError, Debug, Clone)]
pub enum Error {
    /// Duplicate executor name, unknown stream, reserved name misuse, bad config.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Observer/poller attached to a non-existent stream; unknown side packet name.
    #[error("not found: {0}")]
    NotFound(String),
    /// Duplicate executor or side packet registration.
    #[error("already exists: {0}")]
    AlreadyExists(String),
    /// The graph is throttled, or a side packet is not yet available.
    #[error("unavailable: {0}")]
    Unavailable(String),
    /// A framework invariant was violated.
    #[error("internal error: {0}")]
    Internal(String),
    /// The run was cancelled.
    #[error("aborted: {0}")]
    Aborted(String),
    /// Reserved for handlers; never raised internally.
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),
    /// A calculator's `Open`, `Process`, or `Close` returned an error, wrapped
    /// with the producing node's debug name.
    #[error("calculator {node} failed: {source}")]
    Calculator {
        /// Debug name of the node whose calculator call failed.
        node: String,
        /// The underlying error.
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Shorthand for [`Error::Internal`].
    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    /// Shorthand for [`Error::InvalidArgument`].
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    /// Shorthand for [`Error::Unavailable`].
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Error::Unavailable(msg.into())
    }

    /// Wraps this error as having originated from the named calculator node.
    pub fn into_calculator_error(self, node: impl Into<String>) -> Self {
        Error::Calculator { node: node.into(), source: Box::new(self) }
    }

    /// A calculator's `Process` returning this sentinel means "this node is
    /// done"; it is not treated as a run error.
    pub fn is_stop(&self) -> bool {
        matches!(self, Error::Aborted(reason) if reason == STOP_SENTINEL)
    }

    /// The sentinel a `Calculator::process` implementation returns to request
    /// that its node be closed without the run being marked as errored.
    pub fn stop() -> Self {
        Error::Aborted(STOP_SENTINEL.to_string())
    }
}

const STOP_SENTINEL: &str = "__status_stop__";

/// A run is allowed to accumulate at most this many errors before the process
/// aborts to bound unbounded growth (§4.5.6).
pub const MAX_ERRORS: usize = 1000;

/// An ordered collection of errors accumulated over the course of one run.
///
/// Errors are appended under a single internal mutex in the order they are
/// observed; `into_result` joins them into one `Result` in that same order.
#[derive(Default)]
pub struct GraphRunError {
    errors: Mutex<Vec<Error>>,
}

impl GraphRunError {
    /// Creates an empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an error, aborting the process if the accumulated count
    /// exceeds [`MAX_ERRORS`].
    pub fn push(&self, error: Error) {
        let mut errors = self.errors.lock().unwrap();
        errors.push(error);
        if errors.len() > MAX_ERRORS {
            drop(errors);
            std::process::abort();
        }
    }

    /// Whether any error has been recorded.
    pub fn has_error(&self) -> bool {
        !self.errors.lock().unwrap().is_empty()
    }

    /// Joins all recorded errors, in record order, into a single result.
    pub fn into_result(self) -> Result<(), Error> {
        let errors = self.errors.into_inner().unwrap();
        Self::join(errors)
    }

    /// Non-consuming counterpart of [`Self::into_result`], for a scheduler
    /// that outlives any individual `wait_until_done` call.
    pub fn to_result(&self) -> Result<(), Error> {
        Self::join(self.snapshot())
    }

    fn join(errors: Vec<Error>) -> Result<(), Error> {
        if errors.is_empty() {
            Ok(())
        } else {
            let joined = errors.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ");
            Err(Error::Internal(format!("{} error(s): {}", errors.len(), joined)))
        }
    }

    /// A snapshot of the currently recorded errors.
    pub fn snapshot(&self) -> Vec<Error> {
        self.errors.lock().unwrap().clone()
    }
}
