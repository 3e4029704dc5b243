//! Event stream handles.
//!
//! # Lifecycle
//!
//! ```text
//!  create ──► Created ──schedule──► Running ──dispose──► Stopping ──► Released
//!     │                  (Scheduled is internal to schedule)
//!     └──► Err(CreateError)    the durable handler reference comes back
//! ```
//!
//! Creation acquires the durable handler reference and allocates the native
//! stream, but nothing is delivered until [`WatchHandle::schedule`] binds
//! the stream to the calling thread's run loop and starts it. The handler
//! context is therefore fully attached before any callback can fire.
//!
//! [`WatchHandle::dispose`] consumes the handle, so a stream cannot be
//! stopped twice. Dropping a handle disposes it.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use fsev_core::{CreateFlags, WatchConfig};

use crate::error::{CreateError, WatchError};
use crate::events::StreamId;
use crate::handler::{DurableRef, HandlerContext};
use crate::native::{NativeBackend, NativeStream, NotifyBackend};
use crate::runloop::{self, RunLoopToken};
use crate::source::{EventSink, SourceState};

/// Lifecycle state of a [`WatchHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamState {
    /// Allocated, not delivering.
    Created,
    /// Bound to a run loop, not yet started.
    Scheduled,
    /// Delivering callbacks on its run loop.
    Running,
    /// Being torn down.
    Stopping,
    /// The native resource has been released.
    Released,
}

/// Per-stream settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamOptions {
    /// How long a burst may accumulate before it is delivered.
    pub latency: Duration,

    /// Stream creation flags.
    pub flags: CreateFlags,

    /// Maximum number of events per forwarded batch.
    pub max_chunk_size: usize,
}

impl StreamOptions {
    /// Creates options from a latency in (fractional) seconds.
    ///
    /// Negative or non-finite latencies become zero.
    #[must_use]
    pub fn new(latency_secs: f64, flags: CreateFlags) -> Self {
        Self {
            latency: Duration::try_from_secs_f64(latency_secs).unwrap_or(Duration::ZERO),
            flags,
            max_chunk_size: WatchConfig::default().max_chunk_size,
        }
    }

    /// Creates options from a watch configuration.
    #[must_use]
    pub fn from_config(config: &WatchConfig) -> Self {
        Self {
            latency: config.latency(),
            flags: config.flags,
            max_chunk_size: config.max_chunk_size,
        }
    }

    /// Sets the maximum batch size.
    #[must_use]
    pub const fn with_max_chunk_size(mut self, max_chunk_size: usize) -> Self {
        self.max_chunk_size = max_chunk_size;
        self
    }
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self::from_config(&WatchConfig::default())
    }
}

/// An owned native event stream for one watched directory.
///
/// Move-only. The native resource is released exactly once, by
/// [`dispose`](Self::dispose) or on drop.
pub struct WatchHandle {
    stream: StreamId,
    root: Utf8PathBuf,
    options: StreamOptions,
    state: StreamState,
    source: Arc<SourceState>,
    native: Option<Box<dyn NativeStream>>,
    /// Held until the run loop takes it over in `schedule`.
    durable: Option<DurableRef>,
    token: Option<RunLoopToken>,
}

impl WatchHandle {
    /// Creates a stream for `path` delivering to `handler`.
    ///
    /// The stream reports only changes made after it starts.
    ///
    /// # Errors
    ///
    /// Fails if the path is empty or not UTF-8, or if the backend refuses
    /// it. The returned [`CreateError`] carries the durable handler
    /// reference acquired for the watch; releasing it is up to the caller.
    pub fn create(
        backend: &dyn NativeBackend,
        path: impl AsRef<Path>,
        options: &StreamOptions,
        handler: &Arc<HandlerContext>,
    ) -> Result<Self, CreateError> {
        let durable = DurableRef::acquire(handler);

        let root = match validate_path(path.as_ref()).and_then(|path| backend.resolve_root(path)) {
            Ok(root) => root,
            Err(error) => return Err(CreateError::new(error, durable)),
        };

        let stream = StreamId::next();
        let source = Arc::new(SourceState::new(stream, root.clone(), options, durable.downgrade()));
        let native = match backend.create_stream(&root, options, EventSink::new(Arc::clone(&source))) {
            Ok(native) => native,
            Err(error) => {
                source.invalidate();
                tracing::warn!(%stream, root = %root, error = %error, "native stream allocation failed");
                return Err(CreateError::new(error, durable));
            }
        };

        tracing::info!(
            %stream,
            root = %root,
            handler = %handler.id(),
            latency_ms = options.latency.as_millis(),
            flags = %options.flags.bits(),
            "watch created"
        );

        Ok(Self {
            stream,
            root,
            options: *options,
            state: StreamState::Created,
            source,
            native: Some(native),
            durable: Some(durable),
            token: None,
        })
    }

    /// Binds the stream to `token`'s run loop and starts it.
    ///
    /// Must be called on the thread that owns `token`; that thread then
    /// receives the stream's callbacks while it is inside [`runloop::run`].
    /// The loop takes over the durable handler reference.
    ///
    /// # Errors
    ///
    /// Fails if the stream was already scheduled, if `token` belongs to
    /// another thread, or if the native stream cannot start. A stream that
    /// failed to start is released.
    pub fn schedule(&mut self, token: &RunLoopToken) -> Result<(), WatchError> {
        if self.state != StreamState::Created || self.native.is_none() {
            return Err(self.invalid_state("schedule"));
        }
        if !token.is_current() {
            return Err(WatchError::WrongThread(token.id()));
        }

        self.state = StreamState::Scheduled;
        runloop::add_source(Arc::clone(&self.source));
        self.source.attach(token.sender());
        self.token = Some(token.clone());

        let started = self.native.as_mut().map_or(Ok(()), |native| native.start());
        if let Err(error) = started {
            tracing::warn!(stream = %self.stream, error = %error, "native stream failed to start");
            self.release();
            return Err(error);
        }

        if let Some(durable) = self.durable.take() {
            if !durable.context().bind_loop(token) {
                tracing::debug!(stream = %self.stream, handler = %durable.handler_id(), "handler already bound to a run loop");
            }
            token.retain(self.stream, durable);
        }

        self.state = StreamState::Running;
        self.source.arm_if_pending();
        tracing::debug!(stream = %self.stream, loop_id = %token.id(), "watch scheduled");
        Ok(())
    }

    /// Schedules the stream on the calling thread's run loop.
    ///
    /// Returns the loop's token, for [`runloop::request_loop_stop`].
    pub fn schedule_on_current_thread(&mut self) -> Result<RunLoopToken, WatchError> {
        let token = runloop::current_token();
        self.schedule(&token)?;
        Ok(token)
    }

    /// Stops delivery, unschedules, and releases the native stream.
    ///
    /// No callback for this stream begins after this returns. One that is
    /// already running on the loop thread finishes first.
    pub fn dispose(mut self) {
        self.release();
    }

    /// The stream's identity.
    #[inline]
    #[must_use]
    pub fn stream_id(&self) -> StreamId {
        self.stream
    }

    /// The resolved root directory.
    #[inline]
    #[must_use]
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// The options the stream was created with.
    #[inline]
    #[must_use]
    pub fn options(&self) -> &StreamOptions {
        &self.options
    }

    /// Current lifecycle state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Returns `true` while callbacks may be delivered.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state == StreamState::Running
    }

    fn invalid_state(&self, operation: &'static str) -> WatchError {
        WatchError::InvalidState {
            stream: self.stream,
            state: self.state,
            operation,
        }
    }

    fn release(&mut self) {
        if self.state == StreamState::Released {
            return;
        }
        let was_running = self.state == StreamState::Running;
        self.state = StreamState::Stopping;
        self.source.invalidate();

        let mut native = self.native.take();
        if was_running {
            if let Some(native) = native.as_mut() {
                native.stop();
            }
        }

        if let Some(token) = self.token.take() {
            if token.is_current() {
                runloop::remove_source(self.stream);
            } else if !token.unschedule(self.stream) {
                tracing::trace!(stream = %self.stream, "run loop already gone");
            }
        }
        drop(native);

        // Never handed to a loop: no callback can reference it.
        if let Some(durable) = self.durable.take() {
            durable.release();
        }

        self.state = StreamState::Released;
        tracing::info!(stream = %self.stream, root = %self.root, "watch disposed");
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchHandle")
            .field("stream", &self.stream)
            .field("root", &self.root)
            .field("state", &self.state)
            .field("native", &self.native)
            .field("token", &self.token.as_ref().map(RunLoopToken::id))
            .finish_non_exhaustive()
    }
}

/// Creates a watch on a real directory with the platform backend.
///
/// # Errors
///
/// See [`WatchHandle::create`].
pub fn create_watch(
    path: impl AsRef<Path>,
    latency_secs: f64,
    flags: CreateFlags,
    handler: &Arc<HandlerContext>,
) -> Result<WatchHandle, CreateError> {
    WatchHandle::create(&NotifyBackend, path, &StreamOptions::new(latency_secs, flags), handler)
}

fn validate_path(path: &Path) -> Result<&Utf8Path, WatchError> {
    if path.as_os_str().is_empty() {
        return Err(WatchError::EmptyPath);
    }
    Utf8Path::from_path(path).ok_or_else(|| WatchError::non_utf8_path(path))
}
