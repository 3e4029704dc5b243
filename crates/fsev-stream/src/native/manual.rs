//! An in-process backend driven by explicit injection.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use camino::{Utf8Path, Utf8PathBuf};
use fsev_core::EventFlags;
use parking_lot::Mutex;

use super::{NativeBackend, NativeStream};
use crate::error::WatchError;
use crate::events::{RawEvents, StreamId};
use crate::source::EventSink;
use crate::stream::StreamOptions;

/// A backend whose events come from [`inject`](Self::inject).
///
/// Roots are taken as given and never touch the filesystem. Clones share
/// the same set of streams, so a test can keep one clone for injection
/// and hand another to the code under test.
///
/// # Examples
///
/// ```
/// use fsev_stream::{HandlerContext, ManualBackend, StreamOptions, WatchHandle};
///
/// let backend = ManualBackend::new();
/// let handler = HandlerContext::from_fn(|_| Ok(()));
/// let handle = WatchHandle::create(&backend, "/tmp/a", &StreamOptions::default(), &handler).unwrap();
/// assert_eq!(backend.live_streams(), 1);
///
/// handle.dispose();
/// assert_eq!(backend.live_streams(), 0);
/// ```
#[derive(Debug, Clone, Default)]
pub struct ManualBackend {
    inner: Arc<ManualInner>,
}

#[derive(Debug, Default)]
struct ManualInner {
    streams: Mutex<Vec<ManualEntry>>,
    allocated: AtomicUsize,
    refuse_next: AtomicBool,
}

#[derive(Debug)]
struct ManualEntry {
    stream: StreamId,
    root: Utf8PathBuf,
    sink: EventSink,
    running: bool,
}

impl ManualBackend {
    /// Creates a backend with no streams.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next stream allocation fail with
    /// [`WatchError::StreamUnavailable`].
    pub fn refuse_next_create(&self) {
        self.inner.refuse_next.store(true, Ordering::SeqCst);
    }

    /// Streams allocated and not yet released.
    #[must_use]
    pub fn live_streams(&self) -> usize {
        self.inner.streams.lock().len()
    }

    /// Streams ever allocated by this backend.
    #[must_use]
    pub fn allocated_streams(&self) -> usize {
        self.inner.allocated.load(Ordering::SeqCst)
    }

    /// Delivers events to every running stream rooted at `root`.
    ///
    /// Each event gets the next sequence id. Returns the number of streams
    /// that received the events.
    pub fn inject(&self, root: impl AsRef<Utf8Path>, events: impl IntoIterator<Item = (PathBuf, EventFlags)>) -> usize {
        let events: Vec<_> = events.into_iter().collect();
        let sinks = self.running_sinks(|entry| entry.root.as_path() == root.as_ref());
        for sink in &sinks {
            sink.push(events.iter().cloned());
        }
        sinks.len()
    }

    /// Like [`inject`](Self::inject), keeping the ids `events` carries.
    pub fn inject_raw(&self, root: impl AsRef<Utf8Path>, events: &RawEvents) -> usize {
        let sinks = self.running_sinks(|entry| entry.root.as_path() == root.as_ref());
        for sink in &sinks {
            sink.push_raw(events.clone());
        }
        sinks.len()
    }

    /// Delivers events to one stream. Returns `false` if it is not running.
    pub fn inject_to(&self, stream: StreamId, events: &RawEvents) -> bool {
        let sinks = self.running_sinks(|entry| entry.stream == stream);
        for sink in &sinks {
            sink.push_raw(events.clone());
        }
        !sinks.is_empty()
    }

    /// Sinks are cloned out so pushing never happens under the lock.
    fn running_sinks(&self, select: impl Fn(&ManualEntry) -> bool) -> Vec<EventSink> {
        self.inner
            .streams
            .lock()
            .iter()
            .filter(|entry| entry.running && select(entry))
            .map(|entry| entry.sink.clone())
            .collect()
    }
}

impl NativeBackend for ManualBackend {
    fn create_stream(
        &self,
        root: &Utf8Path,
        _options: &StreamOptions,
        sink: EventSink,
    ) -> Result<Box<dyn NativeStream>, WatchError> {
        if self.inner.refuse_next.swap(false, Ordering::SeqCst) {
            return Err(WatchError::StreamUnavailable(root.to_owned()));
        }

        let stream = sink.stream_id();
        self.inner.streams.lock().push(ManualEntry {
            stream,
            root: root.to_owned(),
            sink,
            running: false,
        });
        self.inner.allocated.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(ManualStream {
            stream,
            inner: Arc::clone(&self.inner),
        }))
    }
}

#[derive(Debug)]
struct ManualStream {
    stream: StreamId,
    inner: Arc<ManualInner>,
}

impl ManualStream {
    fn set_running(&self, running: bool) {
        let mut streams = self.inner.streams.lock();
        if let Some(entry) = streams.iter_mut().find(|entry| entry.stream == self.stream) {
            entry.running = running;
        }
    }
}

impl NativeStream for ManualStream {
    fn start(&mut self) -> Result<(), WatchError> {
        self.set_running(true);
        Ok(())
    }

    fn stop(&mut self) {
        self.set_running(false);
    }
}

impl Drop for ManualStream {
    fn drop(&mut self) {
        self.inner.streams.lock().retain(|entry| entry.stream != self.stream);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::HandlerContext;
    use crate::stream::WatchHandle;

    #[test]
    fn test_refuse_next_create() {
        let backend = ManualBackend::new();
        let handler = HandlerContext::from_fn(|_| Ok(()));
        backend.refuse_next_create();

        let err = WatchHandle::create(&backend, "/tmp/a", &StreamOptions::default(), &handler).unwrap_err();
        assert!(matches!(err.error(), WatchError::StreamUnavailable(_)));
        assert!(err.error().is_recoverable());
        assert_eq!(backend.allocated_streams(), 0);

        // Only the next allocation is refused.
        let handle = WatchHandle::create(&backend, "/tmp/a", &StreamOptions::default(), &handler).unwrap();
        assert_eq!(backend.live_streams(), 1);
        drop(handle);
        assert_eq!(backend.live_streams(), 0);
        assert_eq!(backend.allocated_streams(), 1);
    }

    #[test]
    fn test_inject_skips_streams_not_started() {
        let backend = ManualBackend::new();
        let handler = HandlerContext::from_fn(|_| Ok(()));
        let _handle = WatchHandle::create(&backend, "/tmp/a", &StreamOptions::default(), &handler).unwrap();

        let delivered = backend.inject("/tmp/a", [(PathBuf::from("/tmp/a/x"), EventFlags::ITEM_CREATED)]);
        assert_eq!(delivered, 0);
    }
}
