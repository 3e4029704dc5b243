//! Handler contexts and durable references.
//!
//! A [`HandlerContext`] is the consumer-side target that receives batches.
//! It is shared as an `Arc`, but the core does not rely on ordinary `Arc`
//! lifetimes to keep it alive while a watch is live. Instead it holds a
//! [`DurableRef`]: a move-only strong reference that is acquired when the
//! watch is created and released exactly once, after the run loop that
//! delivers the watch's callbacks has stopped pumping.
//!
//! The delivery path itself only keeps a `Weak` to the context. If it ever
//! finds the context gone, the callback is dropped instead of forwarded.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use serde::{Deserialize, Serialize};

use crate::error::HandlerError;
use crate::events::EventBatch;
use crate::runloop::{RunLoopToken, WeakRunLoopToken};

/// Receives batches forwarded by the dispatcher.
///
/// Called on the run loop thread that hosts the stream, once per chunk,
/// in order. Implementations should return promptly; the loop cannot pump
/// anything else while a batch is being handled.
///
/// Returning an error drops the remaining chunks of the current callback.
///
/// # Examples
///
/// ```
/// use fsev_stream::{BatchHandler, EventBatch, HandlerError};
///
/// struct PrintPaths;
///
/// impl BatchHandler for PrintPaths {
///     fn on_batch(&self, batch: &EventBatch<'_>) -> Result<(), HandlerError> {
///         for path in batch.paths() {
///             let _ = path;
///         }
///         Ok(())
///     }
/// }
/// ```
pub trait BatchHandler: Send + Sync + 'static {
    /// Handles one batch.
    fn on_batch(&self, batch: &EventBatch<'_>) -> Result<(), HandlerError>;
}

impl<F> BatchHandler for F
where
    F: Fn(&EventBatch<'_>) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    fn on_batch(&self, batch: &EventBatch<'_>) -> Result<(), HandlerError> {
        self(batch)
    }
}

/// Identity of a [`HandlerContext`], usable across threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandlerId(u64);

impl HandlerId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw identifier.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler#{}", self.0)
    }
}

/// The consumer-side target of one stream's batches.
pub struct HandlerContext {
    id: HandlerId,
    handler: Box<dyn BatchHandler>,
    /// Set once, when a watch using this context is scheduled.
    current_loop: OnceLock<WeakRunLoopToken>,
}

impl HandlerContext {
    /// Wraps a handler in a shareable context.
    #[must_use]
    pub fn new(handler: impl BatchHandler) -> Arc<Self> {
        Arc::new(Self {
            id: HandlerId::next(),
            handler: Box::new(handler),
            current_loop: OnceLock::new(),
        })
    }

    /// Wraps a closure in a shareable context.
    ///
    /// # Examples
    ///
    /// ```
    /// use fsev_stream::HandlerContext;
    ///
    /// let context = HandlerContext::from_fn(|batch| {
    ///     assert!(!batch.is_empty());
    ///     Ok(())
    /// });
    /// assert!(context.current_loop().is_none());
    /// ```
    #[must_use]
    pub fn from_fn<F>(handler: F) -> Arc<Self>
    where
        F: Fn(&EventBatch<'_>) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        Self::new(handler)
    }

    /// Returns this context's identity.
    #[inline]
    #[must_use]
    pub const fn id(&self) -> HandlerId {
        self.id
    }

    /// Returns the run loop delivering to this context, if one was bound
    /// and is still alive.
    #[must_use]
    pub fn current_loop(&self) -> Option<RunLoopToken> {
        self.current_loop.get().and_then(WeakRunLoopToken::upgrade)
    }

    /// Records the run loop this context is scheduled on.
    ///
    /// Returns `false` if a loop was already bound.
    pub(crate) fn bind_loop(&self, token: &RunLoopToken) -> bool {
        self.current_loop.set(token.downgrade()).is_ok()
    }

    #[inline]
    pub(crate) fn forward(&self, batch: &EventBatch<'_>) -> Result<(), HandlerError> {
        self.handler.on_batch(batch)
    }
}

impl fmt::Debug for HandlerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerContext")
            .field("id", &self.id)
            .field("current_loop", &self.current_loop.get().map(WeakRunLoopToken::id))
            .finish_non_exhaustive()
    }
}

/// A strong reference to a [`HandlerContext`] with an explicit release.
///
/// Move-only: it cannot be cloned, so it is released at most once.
/// Dropping it is a release too; [`release`](Self::release) just makes the
/// point of release visible and logged.
pub struct DurableRef {
    context: Arc<HandlerContext>,
}

impl DurableRef {
    pub(crate) fn acquire(context: &Arc<HandlerContext>) -> Self {
        tracing::trace!(handler = %context.id, "durable handler reference acquired");
        Self {
            context: Arc::clone(context),
        }
    }

    /// The referenced context's identity.
    #[inline]
    #[must_use]
    pub fn handler_id(&self) -> HandlerId {
        self.context.id
    }

    /// The referenced context.
    #[inline]
    #[must_use]
    pub fn context(&self) -> &Arc<HandlerContext> {
        &self.context
    }

    pub(crate) fn downgrade(&self) -> Weak<HandlerContext> {
        Arc::downgrade(&self.context)
    }

    /// Releases the reference.
    pub fn release(self) {
        tracing::debug!(handler = %self.context.id, "durable handler reference released");
    }
}

impl fmt::Debug for DurableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DurableRef").field(&self.context.id).finish()
    }
}
