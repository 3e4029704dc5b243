//! Per-thread run loops.
//!
//! Every thread lazily owns one run loop. Streams are scheduled on the loop
//! of the thread that calls [`WatchHandle::schedule`], and their callbacks
//! run only while that thread is blocked inside [`run`].
//!
//! ```text
//!  native watcher thread          hosting thread
//!  ─────────────────────          ─────────────────────────────────
//!  EventSink::push ──Signal──►    run()
//!                                   ├─ timers: due bursts fire
//!                                   │    └─ SourceState::perform
//!                                   │         └─ Dispatcher ─► handler
//!  any thread                       │
//!  request_loop_stop ──Wake──►      └─ StopRequested: return, release
//!                                      durable handler references
//! ```
//!
//! The loop keeps the durable handler references of the streams scheduled
//! on it. A reference is released only at a point where no callback can be
//! running: once the loop stops pumping, or, for a stream unscheduled from
//! a loop that keeps pumping, at the top of the loop's next iteration.
//!
//! [`WatchHandle::schedule`]: crate::WatchHandle::schedule

use std::cell::RefCell;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use std::time::Instant;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use fsev_core::diag;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::events::StreamId;
use crate::handler::{DurableRef, HandlerContext, HandlerId};
use crate::source::SourceState;

/// Identity of a run loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LoopId(u64);

impl LoopId {
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

impl fmt::Display for LoopId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "loop#{}", self.0)
    }
}

/// Lifecycle of a run loop.
///
/// Only the hosting thread moves the loop to `Pumping` (by calling [`run`])
/// and to `Stopped` (by returning from it). Any thread may request a stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoopState {
    /// Not pumping; no stop requested.
    Idle,
    /// Blocked inside [`run`], processing sources.
    Pumping,
    /// A stop was requested; [`run`] returns at its next iteration, or
    /// immediately if it has not started yet.
    StopRequested,
    /// [`run`] has returned.
    Stopped,
}

/// Messages delivered to a loop's hosting thread.
#[derive(Debug)]
pub(crate) enum LoopMessage {
    /// A stream has a pending burst due at `due`.
    Signal { stream: StreamId, due: Instant },
    /// Unschedule a stream (sent when it is disposed from another thread).
    Remove(StreamId),
    /// Re-check the loop state.
    Wake,
}

struct LoopControl {
    state: LoopState,
    pumping: bool,
    retained: Vec<(StreamId, DurableRef)>,
    release_requested: SmallVec<[HandlerId; 4]>,
}

impl LoopControl {
    /// Removes and returns the retained references selected by `release`.
    fn drain_where(&mut self, mut release: impl FnMut(StreamId, HandlerId) -> bool) -> Vec<DurableRef> {
        let mut released = Vec::new();
        let mut index = 0;
        while index < self.retained.len() {
            let (stream, durable) = &self.retained[index];
            if release(*stream, durable.handler_id()) {
                released.push(self.retained.swap_remove(index).1);
            } else {
                index += 1;
            }
        }
        released
    }
}

struct LoopShared {
    id: LoopId,
    thread: ThreadId,
    tx: Sender<LoopMessage>,
    control: Mutex<LoopControl>,
}

/// A thread's run loop, as seen from any thread.
///
/// Tokens are cheap to clone and compare equal when they name the same
/// loop. Scheduling requires a token for the calling thread's own loop.
#[derive(Clone)]
pub struct RunLoopToken {
    shared: Arc<LoopShared>,
}

impl RunLoopToken {
    /// Returns the loop's identity.
    #[inline]
    #[must_use]
    pub fn id(&self) -> LoopId {
        self.shared.id
    }

    /// Returns the loop's current state.
    #[must_use]
    pub fn state(&self) -> LoopState {
        self.shared.control.lock().state
    }

    /// Returns `true` if the calling thread hosts this loop.
    #[must_use]
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.shared.thread
    }

    /// Returns a reference that does not keep the loop alive.
    #[must_use]
    pub fn downgrade(&self) -> WeakRunLoopToken {
        WeakRunLoopToken {
            id: self.shared.id,
            shared: Arc::downgrade(&self.shared),
        }
    }

    pub(crate) fn sender(&self) -> Sender<LoopMessage> {
        self.shared.tx.clone()
    }

    /// Hands a stream's durable handler reference to the loop.
    pub(crate) fn retain(&self, stream: StreamId, durable: DurableRef) {
        self.shared.control.lock().retained.push((stream, durable));
    }

    /// Unschedules `stream` from a thread other than the loop's own.
    ///
    /// A loop that is not pumping cannot be running a callback, so the
    /// stream's durable reference is released before this returns.
    /// Otherwise the loop releases it between callbacks. Returns `false` if
    /// the loop can no longer receive messages.
    pub(crate) fn unschedule(&self, stream: StreamId) -> bool {
        let released = {
            let mut control = self.shared.control.lock();
            if control.pumping {
                Vec::new()
            } else {
                control.drain_where(|retained, _| retained == stream)
            }
        };
        for durable in released {
            durable.release();
        }
        self.shared.tx.send(LoopMessage::Remove(stream)).is_ok()
    }
}

impl PartialEq for RunLoopToken {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for RunLoopToken {}

impl fmt::Debug for RunLoopToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunLoopToken")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .finish()
    }
}

/// A [`RunLoopToken`] that does not keep its loop alive.
#[derive(Debug, Clone)]
pub struct WeakRunLoopToken {
    id: LoopId,
    shared: Weak<LoopShared>,
}

impl WeakRunLoopToken {
    /// Returns the loop's identity, even if the loop is gone.
    #[inline]
    #[must_use]
    pub fn id(&self) -> LoopId {
        self.id
    }

    /// Returns a strong token if the loop still exists.
    #[must_use]
    pub fn upgrade(&self) -> Option<RunLoopToken> {
        self.shared.upgrade().map(|shared| RunLoopToken { shared })
    }
}

struct LoopCore {
    shared: Arc<LoopShared>,
    rx: Receiver<LoopMessage>,
    sources: RefCell<FxHashMap<StreamId, Arc<SourceState>>>,
    timers: RefCell<BinaryHeap<Reverse<(Instant, StreamId)>>>,
    /// Unscheduled while pumping; references released at the next iteration.
    unscheduled: RefCell<SmallVec<[StreamId; 4]>>,
}

thread_local! {
    static CORE: LoopCore = LoopCore::new();
}

impl LoopCore {
    fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        let id = LoopId::next();
        tracing::trace!(loop_id = %id, "run loop created");
        Self {
            shared: Arc::new(LoopShared {
                id,
                thread: thread::current().id(),
                tx,
                control: Mutex::new(LoopControl {
                    state: LoopState::Idle,
                    pumping: false,
                    retained: Vec::new(),
                    release_requested: SmallVec::new(),
                }),
            }),
            rx,
            sources: RefCell::new(FxHashMap::default()),
            timers: RefCell::new(BinaryHeap::new()),
            unscheduled: RefCell::new(SmallVec::new()),
        }
    }

    fn run(&self) {
        {
            let mut control = self.shared.control.lock();
            match control.state {
                LoopState::Pumping => {
                    tracing::warn!(loop_id = %self.shared.id, "run loop is already pumping");
                    return;
                }
                LoopState::StopRequested => {
                    drop(control);
                    tracing::debug!(loop_id = %self.shared.id, "stop requested before run");
                    self.finish();
                    return;
                }
                LoopState::Idle | LoopState::Stopped => {
                    control.state = LoopState::Pumping;
                    control.pumping = true;
                }
            }
        }

        tracing::debug!(loop_id = %self.shared.id, sources = self.sources.borrow().len(), "run loop pumping");
        loop {
            if self.shared.control.lock().state == LoopState::StopRequested {
                break;
            }

            self.release_unscheduled();
            self.fire_due_timers();

            let next_due = self.timers.borrow().peek().map(|Reverse((due, _))| *due);
            let message = match next_due {
                Some(due) => match self.rx.recv_deadline(due) {
                    Ok(message) => message,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                },
                None => match self.rx.recv() {
                    Ok(message) => message,
                    Err(_) => break,
                },
            };
            self.handle(message);
        }

        self.finish();
    }

    fn handle(&self, message: LoopMessage) {
        match message {
            LoopMessage::Signal { stream, due } => {
                if self.sources.borrow().contains_key(&stream) {
                    self.timers.borrow_mut().push(Reverse((due, stream)));
                }
            }
            LoopMessage::Remove(stream) => {
                self.unschedule(stream);
            }
            LoopMessage::Wake => {}
        }
    }

    fn fire_due_timers(&self) {
        let now = Instant::now();
        loop {
            let stream = {
                let mut timers = self.timers.borrow_mut();
                match timers.peek() {
                    Some(Reverse((due, _))) if *due <= now => timers.pop().map(|Reverse((_, stream))| stream),
                    _ => None,
                }
            };
            let Some(stream) = stream else {
                break;
            };

            // Cloned out so a handler may schedule or dispose streams.
            let source = self.sources.borrow().get(&stream).map(Arc::clone);
            if let Some(source) = source {
                source.perform();
            }
        }
    }

    /// Removes a source. Its durable reference is released at once when no
    /// callback can be running, otherwise at the top of the next iteration.
    fn unschedule(&self, stream: StreamId) -> bool {
        let removed = self.sources.borrow_mut().remove(&stream).is_some();
        self.unscheduled.borrow_mut().push(stream);
        if !self.shared.control.lock().pumping {
            self.release_unscheduled();
        }
        removed
    }

    fn release_unscheduled(&self) {
        let streams = std::mem::take(&mut *self.unscheduled.borrow_mut());
        if streams.is_empty() {
            return;
        }
        let released = self
            .shared
            .control
            .lock()
            .drain_where(|stream, _| streams.contains(&stream));
        for durable in released {
            diag!(loop_id = %self.shared.id, handler = %durable.handler_id(), "unscheduled stream released");
            durable.release();
        }
    }

    /// Marks the loop stopped and releases what it no longer needs.
    fn finish(&self) {
        let requested = {
            let mut control = self.shared.control.lock();
            control.state = LoopState::Stopped;
            control.pumping = false;
            std::mem::take(&mut control.release_requested)
        };

        // Messages posted after the last iteration. Removals take effect now;
        // signals re-arm their timers for the next `run`.
        for message in self.rx.try_iter() {
            self.handle(message);
        }

        let released = {
            let mut control = self.shared.control.lock();
            let sources = self.sources.borrow();
            control.drain_where(|stream, handler| requested.contains(&handler) || !sources.contains_key(&stream))
        };

        tracing::debug!(loop_id = %self.shared.id, released = released.len(), "run loop stopped");
        for durable in released {
            durable.release();
        }
    }
}

/// Returns the calling thread's run loop.
///
/// The loop is created on first use and lives as long as the thread or any
/// token to it.
#[must_use]
pub fn current_token() -> RunLoopToken {
    CORE.with(|core| RunLoopToken {
        shared: Arc::clone(&core.shared),
    })
}

/// Pumps the calling thread's run loop until a stop is requested.
///
/// Returns immediately if a stop was requested before the call. Calling it
/// again after it returned pumps the loop again.
pub fn run() {
    CORE.with(LoopCore::run);
}

/// Asks the loop behind `token` to return from [`run`] and releases the
/// durable reference the loop holds for `handler`.
///
/// May be called from any thread and returns without waiting. If the loop
/// is pumping, the release happens on the hosting thread after it stops
/// pumping; otherwise it happens before this returns.
pub fn request_loop_stop(token: &RunLoopToken, handler: &HandlerContext) {
    let shared = &token.shared;
    let (pumping, released) = {
        let mut control = shared.control.lock();
        if matches!(control.state, LoopState::Idle | LoopState::Pumping) {
            control.state = LoopState::StopRequested;
        }
        if control.pumping {
            // Released by the hosting thread once it stops pumping.
            control.release_requested.push(handler.id());
            (true, Vec::new())
        } else {
            let id = handler.id();
            (false, control.drain_where(|_, retained| retained == id))
        }
    };

    diag!(loop_id = %shared.id, handler = %handler.id(), deferred = pumping, "loop stop requested");
    if pumping {
        // The loop owns its receiver, so this only fails while the thread exits.
        let _ = shared.tx.send(LoopMessage::Wake);
    }
    for durable in released {
        durable.release();
    }
}

/// Registers a source with the calling thread's loop.
pub(crate) fn add_source(source: Arc<SourceState>) {
    CORE.with(|core| {
        core.sources.borrow_mut().insert(source.stream(), source);
    });
}

/// Unregisters a source from the calling thread's loop.
///
/// Returns `false` if it was not registered or the thread is exiting.
pub(crate) fn remove_source(stream: StreamId) -> bool {
    CORE.try_with(|core| core.unschedule(stream)).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::native::ManualBackend;
    use crate::stream::{StreamOptions, WatchHandle};

    fn noop() -> Arc<HandlerContext> {
        HandlerContext::from_fn(|_| Ok(()))
    }

    #[test]
    fn test_current_token_is_per_thread() {
        let here = current_token();
        assert_eq!(here, current_token());
        assert!(here.is_current());
        assert_eq!(here.state(), LoopState::Idle);

        let there = thread::spawn(current_token).join().unwrap();
        assert_ne!(here, there);
        assert_ne!(here.id(), there.id());
        assert!(!there.is_current());
    }

    #[test]
    fn test_weak_token_upgrade() {
        let token = current_token();
        let weak = token.downgrade();
        assert_eq!(weak.id(), token.id());
        assert_eq!(weak.upgrade(), Some(token));

        let orphan = thread::spawn(|| current_token().downgrade()).join().unwrap();
        assert!(orphan.upgrade().is_none());
    }

    #[test]
    fn test_stop_before_run_returns_immediately() {
        let handler = noop();
        let state = thread::spawn(move || {
            let token = current_token();
            request_loop_stop(&token, &handler);
            assert_eq!(token.state(), LoopState::StopRequested);
            run();
            token.state()
        })
        .join()
        .unwrap();
        assert_eq!(state, LoopState::Stopped);
    }

    #[test]
    fn test_stop_from_another_thread() {
        let handler = noop();
        let (token_tx, token_rx) = crossbeam_channel::bounded(1);
        let host = thread::spawn(move || {
            token_tx.send(current_token()).unwrap();
            run();
        });

        let token = token_rx.recv().unwrap();
        while token.state() != LoopState::Pumping {
            thread::sleep(Duration::from_millis(1));
        }
        request_loop_stop(&token, &handler);
        host.join().unwrap();
        assert_eq!(token.state(), LoopState::Stopped);
    }

    #[test]
    fn test_idle_stop_releases_only_requested_handler() {
        let handler = noop();
        let weak = Arc::downgrade(&handler);
        let token = thread::spawn(current_token).join().unwrap();
        token.retain(StreamId::next(), DurableRef::acquire(&handler));
        drop(handler);

        request_loop_stop(&token, &noop());
        assert_eq!(token.state(), LoopState::StopRequested);
        assert!(weak.upgrade().is_some());

        let context = weak.upgrade().unwrap();
        request_loop_stop(&token, &context);
        drop(context);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_finish_releases_requested_handler() {
        let handler = noop();
        let weak = Arc::downgrade(&handler);
        let stream = StreamId::next();

        let (token_tx, token_rx) = crossbeam_channel::bounded(1);
        let durable = DurableRef::acquire(&handler);
        let host = thread::spawn(move || {
            let token = current_token();
            token.retain(stream, durable);
            token_tx.send(token).unwrap();
            run();
        });

        let token = token_rx.recv().unwrap();
        while token.state() != LoopState::Pumping {
            thread::sleep(Duration::from_millis(1));
        }
        request_loop_stop(&token, &handler);
        host.join().unwrap();

        drop(handler);
        assert!(weak.upgrade().is_none());
        assert!(token.shared.control.lock().retained.is_empty());
    }

    #[test]
    fn test_idle_stop_cycles_leave_no_bookkeeping() {
        let backend = ManualBackend::new();
        let handler = noop();
        let token = current_token();

        for _ in 0..1000 {
            let mut handle = WatchHandle::create(&backend, "/tmp/a", &StreamOptions::default(), &handler).unwrap();
            handle.schedule_on_current_thread().unwrap();
            request_loop_stop(&token, &handler);
            handle.dispose();
        }

        {
            let control = token.shared.control.lock();
            assert!(control.release_requested.is_empty());
            assert!(control.retained.is_empty());
        }
        assert_eq!(token.shared.tx.len(), 0);
        assert_eq!(backend.live_streams(), 0);
        assert_eq!(Arc::strong_count(&handler), 1);
    }

    #[test]
    fn test_disposed_stream_on_live_loop_frees_its_handler() {
        let backend = ManualBackend::new();
        let keeper = noop();
        let churned = noop();
        let weak = Arc::downgrade(&churned);

        let kept = WatchHandle::create(&backend, "/tmp/keep", &StreamOptions::default(), &keeper).unwrap();
        let other = WatchHandle::create(&backend, "/tmp/other", &StreamOptions::default(), &churned).unwrap();
        drop(churned);

        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        let host = thread::spawn(move || {
            let (mut kept, mut other) = (kept, other);
            let token = kept.schedule_on_current_thread().unwrap();
            other.schedule(&token).unwrap();
            ready_tx.send((token, other)).unwrap();
            run();
            kept.dispose();
        });

        let (token, other) = ready_rx.recv().unwrap();
        while token.state() != LoopState::Pumping {
            thread::sleep(Duration::from_millis(1));
        }
        other.dispose();

        let deadline = Instant::now() + Duration::from_secs(5);
        while weak.strong_count() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(weak.strong_count(), 0);
        assert_eq!(token.shared.control.lock().retained.len(), 1);

        request_loop_stop(&token, &keeper);
        host.join().unwrap();
        assert_eq!(Arc::strong_count(&keeper), 1);
        assert_eq!(backend.live_streams(), 0);
    }

    #[test]
    fn test_finish_drains_messages_posted_while_idle() {
        let backend = ManualBackend::new();
        let handler = noop();
        let weak = Arc::downgrade(&handler);
        let other = WatchHandle::create(&backend, "/tmp/a", &StreamOptions::default(), &handler).unwrap();
        drop(handler);

        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        let (gate_tx, gate_rx) = crossbeam_channel::bounded::<()>(1);
        let host = thread::spawn(move || {
            let mut other = other;
            let token = other.schedule_on_current_thread().unwrap();
            ready_tx.send((token.clone(), other)).unwrap();
            let _ = gate_rx.recv();
            run();
            let sources = CORE.with(|core| core.sources.borrow().len());
            (token.shared.tx.len(), sources)
        });

        let (token, other) = ready_rx.recv().unwrap();
        other.dispose();
        // The loop is idle, so nothing can be running a callback.
        assert!(weak.upgrade().is_none());
        assert_eq!(token.shared.tx.len(), 1);

        request_loop_stop(&token, &noop());
        gate_tx.send(()).unwrap();
        let (pending, sources) = host.join().unwrap();
        assert_eq!(pending, 0);
        assert_eq!(sources, 0);
    }
}
