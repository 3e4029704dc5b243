//! Per-stream event sources.
//!
//! A [`SourceState`] sits between a native stream and the run loop it is
//! scheduled on. The native side pushes events into it from whatever thread
//! the OS uses; the loop side drains it in one callback when the burst's
//! latency timer fires.

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use crossbeam_channel::Sender;
use fsev_core::{CreateFlags, EventFlags, diag};
use parking_lot::Mutex;

use crate::dispatch::Dispatcher;
use crate::events::{RawEvents, StreamId, next_event_id};
use crate::handler::HandlerContext;
use crate::runloop::LoopMessage;
use crate::stream::StreamOptions;

#[derive(Debug, Default)]
struct PendingBurst {
    events: RawEvents,
    /// A loop timer is outstanding for `events`.
    armed: bool,
    last_flush: Option<Instant>,
}

pub(crate) struct SourceState {
    stream: StreamId,
    root: Utf8PathBuf,
    latency: Duration,
    flags: CreateFlags,
    handler: Weak<HandlerContext>,
    dispatcher: Dispatcher,
    pending: Mutex<PendingBurst>,
    loop_tx: OnceLock<Sender<LoopMessage>>,
    invalidated: AtomicBool,
}

impl SourceState {
    pub(crate) fn new(
        stream: StreamId,
        root: Utf8PathBuf,
        options: &StreamOptions,
        handler: Weak<HandlerContext>,
    ) -> Self {
        Self {
            stream,
            root,
            latency: options.latency,
            flags: options.flags,
            handler,
            dispatcher: Dispatcher::new(options.max_chunk_size),
            pending: Mutex::new(PendingBurst::default()),
            loop_tx: OnceLock::new(),
            invalidated: AtomicBool::new(false),
        }
    }

    #[inline]
    pub(crate) fn stream(&self) -> StreamId {
        self.stream
    }

    /// Connects the source to the loop it was scheduled on.
    pub(crate) fn attach(&self, tx: Sender<LoopMessage>) -> bool {
        self.loop_tx.set(tx).is_ok()
    }

    /// Stops accepting events and drops whatever is pending.
    pub(crate) fn invalidate(&self) {
        self.invalidated.store(true, Ordering::Release);
        self.pending.lock().events = RawEvents::new();
    }

    pub(crate) fn is_invalidated(&self) -> bool {
        self.invalidated.load(Ordering::Acquire)
    }

    /// Appends events, assigning sequence ids in arrival order.
    fn push(&self, events: impl IntoIterator<Item = (PathBuf, EventFlags)>) -> usize {
        if self.is_invalidated() {
            return 0;
        }
        let mut pending = self.pending.lock();
        let before = pending.events.len();
        for (path, flags) in events {
            pending.events.push(path, flags, next_event_id());
        }
        let pushed = pending.events.len() - before;
        if pushed > 0 {
            self.arm(&mut pending);
        }
        pushed
    }

    /// Appends events that already carry sequence ids.
    fn push_raw(&self, events: RawEvents) -> usize {
        if self.is_invalidated() || events.is_empty() {
            return 0;
        }
        let pushed = events.len();
        let mut pending = self.pending.lock();
        pending.events.append(events);
        self.arm(&mut pending);
        pushed
    }

    /// Arms the loop timer for a burst pushed before the source was attached.
    pub(crate) fn arm_if_pending(&self) {
        let mut pending = self.pending.lock();
        if !pending.events.is_empty() {
            self.arm(&mut pending);
        }
    }

    fn arm(&self, pending: &mut PendingBurst) {
        if pending.armed {
            return;
        }
        let Some(tx) = self.loop_tx.get() else {
            return;
        };

        let now = Instant::now();
        let quiet = pending
            .last_flush
            .is_none_or(|flushed| now.duration_since(flushed) >= self.latency);
        let due = if self.flags.contains(CreateFlags::NO_DEFER) && quiet {
            now
        } else {
            now + self.latency
        };

        if tx.send(LoopMessage::Signal { stream: self.stream, due }).is_ok() {
            pending.armed = true;
        }
    }

    /// Delivers the pending burst. Runs on the hosting loop's thread.
    pub(crate) fn perform(&self) {
        if self.is_invalidated() {
            return;
        }
        let events = {
            let mut pending = self.pending.lock();
            pending.armed = false;
            pending.last_flush = Some(Instant::now());
            std::mem::take(&mut pending.events)
        };
        if events.is_empty() {
            return;
        }

        let Some(handler) = self.handler.upgrade() else {
            diag!(stream = %self.stream, events = events.len(), "handler context gone, callback dropped");
            return;
        };

        let outcome = self.dispatcher.dispatch(self.stream, &events, &handler);
        if let Some(error) = &outcome.error {
            tracing::warn!(
                stream = %self.stream,
                forwarded = outcome.forwarded,
                dropped = outcome.dropped,
                error = %error,
                "forwarding stopped early; remaining events of this callback dropped"
            );
        }
    }
}

impl fmt::Debug for SourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceState")
            .field("stream", &self.stream)
            .field("root", &self.root)
            .field("latency", &self.latency)
            .field("flags", &self.flags)
            .field("invalidated", &self.is_invalidated())
            .finish_non_exhaustive()
    }
}

/// Where a native stream delivers the events it observes.
///
/// Cheap to clone; every clone feeds the same stream. Pushing after the
/// stream was disposed is a no-op.
#[derive(Clone)]
pub struct EventSink {
    source: Arc<SourceState>,
}

impl EventSink {
    pub(crate) fn new(source: Arc<SourceState>) -> Self {
        Self { source }
    }

    /// Pushes events, stamping each with the next sequence id.
    ///
    /// Returns how many events were accepted.
    pub fn push(&self, events: impl IntoIterator<Item = (PathBuf, EventFlags)>) -> usize {
        self.source.push(events)
    }

    /// Pushes events with the sequence ids they already carry.
    ///
    /// Returns how many events were accepted.
    pub fn push_raw(&self, events: RawEvents) -> usize {
        self.source.push_raw(events)
    }

    /// The stream this sink feeds.
    #[inline]
    #[must_use]
    pub fn stream_id(&self) -> StreamId {
        self.source.stream
    }

    /// The stream's resolved root directory.
    #[inline]
    #[must_use]
    pub fn root(&self) -> &Utf8Path {
        &self.source.root
    }

    /// The stream's creation flags.
    #[inline]
    #[must_use]
    pub fn flags(&self) -> CreateFlags {
        self.source.flags
    }

    /// Returns `false` once the stream has been disposed.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.source.is_invalidated()
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("EventSink").field(&self.source.stream).finish()
    }
}
