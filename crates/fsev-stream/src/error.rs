//! Error types for the fsev-stream crate.
//!
//! - [`WatchError`] - creating, scheduling, and hosting a watch
//! - [`CreateError`] - a failed creation, handing the durable handler
//!   reference back to the caller
//! - [`HandlerError`] - a handler refusing a batch
//! - [`DispatchError`] - why a callback stopped forwarding early
//!
//! # Error Recovery Strategy
//!
//! Errors are local to the operation that produced them and nothing is
//! retried automatically:
//!
//! - **Creation failures** leave no watch behind; the caller owns the
//!   returned [`DurableRef`] and decides when to release it.
//! - **Forwarding failures** abort the remaining chunks of one callback
//!   invocation only; the stream keeps delivering later callbacks.

use std::path::PathBuf;

use camino::Utf8PathBuf;

use crate::events::StreamId;
use crate::handler::DurableRef;
use crate::runloop::LoopId;
use crate::stream::StreamState;

/// Errors that can occur while creating, scheduling, or hosting a watch.
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    /// The watch path has no UTF-8 representation.
    #[error("path is not valid UTF-8: {}", _0.display())]
    NonUtf8Path(PathBuf),

    /// The watch path is empty.
    #[error("watch path is empty")]
    EmptyPath,

    /// The watch path does not exist.
    #[error("path does not exist: {0}")]
    PathNotFound(Utf8PathBuf),

    /// The watch path exists but is not a directory.
    #[error("path is not a directory: {0}")]
    NotADirectory(Utf8PathBuf),

    /// The native layer refused to allocate an event stream.
    #[error("unable to create event stream for {0}")]
    StreamUnavailable(Utf8PathBuf),

    /// The notify watcher failed to initialize or operate.
    #[error("notify watcher error: {0}")]
    Notify(#[from] notify::Error),

    /// The operation is not valid in the stream's current lifecycle state.
    #[error("{stream} cannot {operation} while {state:?}")]
    InvalidState {
        /// The stream the operation targeted.
        stream: StreamId,
        /// The stream's state at the time.
        state: StreamState,
        /// The rejected operation.
        operation: &'static str,
    },

    /// A run loop was used from a thread that does not own it.
    #[error("run loop {0} belongs to another thread")]
    WrongThread(LoopId),

    /// The dedicated watch thread could not be started.
    #[error("failed to spawn watch thread: {0}")]
    ThreadSpawn(#[source] std::io::Error),

    /// The watch thread ended before reporting its run loop.
    #[error("watch thread exited before its run loop started")]
    ThreadExited,

    /// The watch thread panicked.
    #[error("watch thread panicked")]
    ThreadPanicked,

    /// An I/O error occurred while validating the watch path.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl WatchError {
    /// Creates a new [`WatchError::PathNotFound`] error.
    #[inline]
    pub fn path_not_found(path: impl Into<Utf8PathBuf>) -> Self {
        Self::PathNotFound(path.into())
    }

    /// Creates a new [`WatchError::NonUtf8Path`] error.
    #[inline]
    pub fn non_utf8_path(path: impl Into<PathBuf>) -> Self {
        Self::NonUtf8Path(path.into())
    }

    /// Returns `true` if retrying the same request may succeed.
    ///
    /// Only resource exhaustion qualifies; bad paths and misuse stay bad.
    #[inline]
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::StreamUnavailable(_) | Self::ThreadSpawn(_))
    }

    /// Returns `true` if this error is fatal for the request.
    #[inline]
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        !self.is_recoverable()
    }

    /// Returns the watch path associated with this error, if any.
    #[must_use]
    pub fn path(&self) -> Option<&Utf8PathBuf> {
        match self {
            Self::PathNotFound(path) | Self::NotADirectory(path) | Self::StreamUnavailable(path) => {
                Some(path)
            }
            _ => None,
        }
    }
}

/// A watch that could not be created.
///
/// No handle exists, so the core cannot release the durable handler
/// reference it acquired; it travels back inside this error. Dropping the
/// error releases it, or use [`into_parts`](Self::into_parts) to keep it.
#[derive(Debug, thiserror::Error)]
#[error("failed to create watch: {error}")]
pub struct CreateError {
    #[source]
    error: WatchError,
    handler: DurableRef,
}

impl CreateError {
    pub(crate) fn new(error: WatchError, handler: DurableRef) -> Self {
        Self { error, handler }
    }

    /// Returns the underlying failure.
    #[must_use]
    pub fn error(&self) -> &WatchError {
        &self.error
    }

    /// Splits the error into the failure and the durable reference.
    #[must_use]
    pub fn into_parts(self) -> (WatchError, DurableRef) {
        (self.error, self.handler)
    }

    /// Releases the durable reference and returns the failure.
    #[must_use]
    pub fn release_handler(self) -> WatchError {
        self.handler.release();
        self.error
    }
}

/// Errors a handler reports when it cannot accept a batch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    /// The consumer behind the handler has gone away.
    #[error("handler channel closed")]
    Closed,

    /// The handler refused the batch.
    #[error("handler rejected batch: {0}")]
    Rejected(String),
}

impl HandlerError {
    /// Creates a new [`HandlerError::Rejected`] error.
    #[inline]
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected(reason.into())
    }
}

/// Why a callback invocation stopped forwarding before its last chunk.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// A path could not be turned into text, so its batch was never built.
    #[error("event {index} has a path that is not valid UTF-8: {}", path.display())]
    Representation {
        /// Index of the event within the callback.
        index: usize,
        /// The offending native path.
        path: PathBuf,
    },

    /// The handler returned an error for the batch at `offset`.
    #[error("handler failed on batch at offset {offset}: {source}")]
    Forward {
        /// Index of the batch's first event within the callback.
        offset: usize,
        /// The handler's error.
        source: HandlerError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watch_error_path_not_found() {
        let err = WatchError::path_not_found("/tmp/missing");
        assert!(err.is_fatal());
        assert_eq!(err.path().map(|p| p.as_str()), Some("/tmp/missing"));
        assert_eq!(err.to_string(), "path does not exist: /tmp/missing");
    }

    #[test]
    fn test_stream_unavailable_is_recoverable() {
        let err = WatchError::StreamUnavailable(Utf8PathBuf::from("/tmp/a"));
        assert!(err.is_recoverable());
        assert!(err.to_string().contains("/tmp/a"));
    }

    #[test]
    fn test_non_utf8_display() {
        let err = WatchError::non_utf8_path(PathBuf::from("odd"));
        assert!(err.is_fatal());
        assert!(err.path().is_none());
        assert!(err.to_string().contains("not valid UTF-8"));
    }

    #[test]
    fn test_handler_error_display() {
        assert_eq!(HandlerError::Closed.to_string(), "handler channel closed");
        assert_eq!(
            HandlerError::rejected("full").to_string(),
            "handler rejected batch: full"
        );
    }

    #[test]
    fn test_dispatch_error_forward_display() {
        let err = DispatchError::Forward {
            offset: 65_536,
            source: HandlerError::Closed,
        };
        assert_eq!(
            err.to_string(),
            "handler failed on batch at offset 65536: handler channel closed"
        );
    }
}
