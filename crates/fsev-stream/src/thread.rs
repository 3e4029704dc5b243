//! Dedicated watch threads.
//!
//! [`WatchThread`] is the usual way to host a watch: one named thread per
//! stream, blocked in [`runloop::run`] for the stream's lifetime.
//!
//! # Lifecycle
//!
//! 1. **Spawn**: the stream is created on the caller's thread, so creation
//!    errors are reported synchronously. The new thread schedules it on
//!    its own run loop and publishes the loop's token.
//! 2. **Pump**: the thread stays inside [`runloop::run`], delivering
//!    callbacks to the handler.
//! 3. **Stop**: [`WatchThread::stop`] requests the loop stop and joins.
//!    The loop releases the durable handler reference once it stops
//!    pumping, then the thread disposes the stream.

use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use camino::{Utf8Path, Utf8PathBuf};
use crossbeam_channel::Sender;

use crate::error::{CreateError, WatchError};
use crate::events::StreamId;
use crate::handler::HandlerContext;
use crate::native::NativeBackend;
use crate::runloop::{self, RunLoopToken};
use crate::stream::{StreamOptions, WatchHandle};

/// A watch running on its own thread.
///
/// # Examples
///
/// ```
/// use fsev_stream::{HandlerContext, ManualBackend, StreamOptions, WatchThread};
///
/// let backend = ManualBackend::new();
/// let handler = HandlerContext::from_fn(|batch| {
///     assert!(!batch.is_empty());
///     Ok(())
/// });
///
/// let watch = WatchThread::spawn(&backend, "/tmp/a", &StreamOptions::default(), &handler).unwrap();
/// assert!(watch.is_running());
/// watch.stop().unwrap();
/// assert_eq!(backend.live_streams(), 0);
/// ```
#[derive(Debug)]
pub struct WatchThread {
    stream: StreamId,
    root: Utf8PathBuf,
    token: RunLoopToken,
    handler: Arc<HandlerContext>,
    join: Option<JoinHandle<()>>,
}

impl WatchThread {
    /// Creates a watch for `path` and starts a thread hosting it.
    ///
    /// # Errors
    ///
    /// Returns the creation error if the watch cannot be created (the
    /// durable handler reference is released first), or an error if the
    /// thread cannot be started or fails before its loop is ready.
    pub fn spawn(
        backend: &dyn NativeBackend,
        path: impl AsRef<Path>,
        options: &StreamOptions,
        handler: &Arc<HandlerContext>,
    ) -> Result<Self, WatchError> {
        let handle = WatchHandle::create(backend, path, options, handler).map_err(CreateError::release_handler)?;
        let stream = handle.stream_id();
        let root = handle.root().to_owned();

        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        let join = thread::Builder::new()
            .name(format!("fsev-{}", stream.get()))
            .spawn(move || host(handle, &ready_tx))
            .map_err(WatchError::ThreadSpawn)?;

        let token = match ready_rx.recv() {
            Ok(Ok(token)) => token,
            Ok(Err(error)) => {
                let _ = join.join();
                return Err(error);
            }
            Err(_) => {
                return Err(if join.join().is_err() {
                    WatchError::ThreadPanicked
                } else {
                    WatchError::ThreadExited
                });
            }
        };

        tracing::info!(%stream, root = %root, loop_id = %token.id(), "watch thread started");
        Ok(Self {
            stream,
            root,
            token,
            handler: Arc::clone(handler),
            join: Some(join),
        })
    }

    /// The hosted stream's identity.
    #[inline]
    #[must_use]
    pub fn stream_id(&self) -> StreamId {
        self.stream
    }

    /// The watched root.
    #[inline]
    #[must_use]
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// The hosting thread's run loop.
    #[inline]
    #[must_use]
    pub fn token(&self) -> &RunLoopToken {
        &self.token
    }

    /// Returns `true` until the hosting thread has finished.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.join.as_ref().is_some_and(|join| !join.is_finished())
    }

    /// Stops the loop, waits for the thread, and leaves the stream released.
    ///
    /// # Errors
    ///
    /// Returns [`WatchError::ThreadPanicked`] if the hosting thread
    /// panicked.
    pub fn stop(mut self) -> Result<(), WatchError> {
        runloop::request_loop_stop(&self.token, &self.handler);
        let result = match self.join.take() {
            Some(join) => join.join().map_err(|_| WatchError::ThreadPanicked),
            None => Ok(()),
        };
        tracing::info!(stream = %self.stream, "watch thread stopped");
        result
    }
}

impl Drop for WatchThread {
    fn drop(&mut self) {
        if self.join.is_some() {
            runloop::request_loop_stop(&self.token, &self.handler);
        }
    }
}

/// Body of a watch thread.
fn host(mut handle: WatchHandle, ready: &Sender<Result<RunLoopToken, WatchError>>) {
    let token = match handle.schedule_on_current_thread() {
        Ok(token) => token,
        Err(error) => {
            let _ = ready.send(Err(error));
            return;
        }
    };
    if ready.send(Ok(token)).is_err() {
        return;
    }

    runloop::run();
    handle.dispose();
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use fsev_core::{CreateFlags, EventFlags};

    use super::*;
    use crate::error::HandlerError;
    use crate::events::{OwnedBatch, RawEvents};
    use crate::native::{ManualBackend, NotifyBackend};

    fn channel_handler() -> (Arc<HandlerContext>, crossbeam_channel::Receiver<OwnedBatch>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let handler = HandlerContext::from_fn(move |batch| {
            tx.send(batch.to_owned_batch()).map_err(|_| HandlerError::Closed)
        });
        (handler, rx)
    }

    #[test]
    fn test_three_events_arrive_as_one_batch() {
        let backend = ManualBackend::new();
        let (handler, rx) = channel_handler();
        let options = StreamOptions::new(0.1, CreateFlags::NONE);
        let watch = WatchThread::spawn(&backend, "/tmp/a", &options, &handler).unwrap();

        let events: RawEvents = [10, 11, 12]
            .into_iter()
            .map(|id| {
                (
                    PathBuf::from(format!("/tmp/a/file{id}")),
                    EventFlags::ITEM_MODIFIED | EventFlags::ITEM_IS_FILE,
                    id,
                )
            })
            .collect();
        assert_eq!(backend.inject_raw("/tmp/a", &events), 1);

        let batch = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(batch.stream, watch.stream_id());
        let ids: Vec<u64> = batch.iter().map(|event| event.id).collect();
        assert_eq!(ids, vec![10, 11, 12]);
        let paths: Vec<&str> = batch.iter().map(|event| event.path.as_str()).collect();
        assert_eq!(paths, vec!["/tmp/a/file10", "/tmp/a/file11", "/tmp/a/file12"]);

        watch.stop().unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(backend.live_streams(), 0);
    }

    #[test]
    fn test_stop_before_any_event() {
        let backend = ManualBackend::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let handler = HandlerContext::from_fn(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let watch = WatchThread::spawn(&backend, "/tmp/a", &StreamOptions::default(), &handler).unwrap();
        watch.stop().unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(backend.live_streams(), 0);
        assert_eq!(Arc::strong_count(&handler), 1);
    }

    #[test]
    fn test_repeated_start_stop_leaks_nothing() {
        let backend = ManualBackend::new();
        let handler = HandlerContext::from_fn(|_| Ok(()));
        let options = StreamOptions::new(0.0, CreateFlags::NO_DEFER);

        for i in 0..1000 {
            let watch = WatchThread::spawn(&backend, "/tmp/a", &options, &handler).unwrap();
            if i % 2 == 0 {
                backend.inject("/tmp/a", [(PathBuf::from("/tmp/a/x"), EventFlags::ITEM_CREATED)]);
            }
            watch.stop().unwrap();
        }

        assert_eq!(backend.allocated_streams(), 1000);
        assert_eq!(backend.live_streams(), 0);
        assert_eq!(Arc::strong_count(&handler), 1);
    }

    #[test]
    fn test_no_callbacks_after_stop() {
        let backend = ManualBackend::new();
        let (handler, rx) = channel_handler();
        let options = StreamOptions::new(0.0, CreateFlags::NONE);
        let watch = WatchThread::spawn(&backend, "/tmp/a", &options, &handler).unwrap();
        let stream = watch.stream_id();
        watch.stop().unwrap();

        let events: RawEvents = std::iter::once((PathBuf::from("/tmp/a/late"), EventFlags::ITEM_CREATED, 1)).collect();
        assert!(!backend.inject_to(stream, &events));
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn test_spawn_create_failure_releases_handler() {
        let backend = ManualBackend::new();
        backend.refuse_next_create();
        let handler = HandlerContext::from_fn(|_| Ok(()));

        let err = WatchThread::spawn(&backend, "/tmp/a", &StreamOptions::default(), &handler).unwrap_err();
        assert!(matches!(err, WatchError::StreamUnavailable(_)));
        assert_eq!(Arc::strong_count(&handler), 1);
    }

    #[test]
    fn test_handler_error_keeps_stream_alive() {
        let backend = ManualBackend::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let (tx, rx) = crossbeam_channel::unbounded();
        let handler = HandlerContext::from_fn(move |batch| {
            let call = counter.fetch_add(1, Ordering::SeqCst) + 1;
            let _ = tx.send(batch.offset());
            if call == 2 {
                return Err(HandlerError::rejected("second chunk"));
            }
            Ok(())
        });

        let options = StreamOptions::new(0.0, CreateFlags::NONE).with_max_chunk_size(2);
        let watch = WatchThread::spawn(&backend, "/tmp/a", &options, &handler).unwrap();

        let burst: RawEvents = (0..6)
            .map(|i| (PathBuf::from(format!("/tmp/a/{i}")), EventFlags::ITEM_CREATED, i))
            .collect();
        backend.inject_raw("/tmp/a", &burst);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 0);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 2);
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        // The next callback is delivered normally.
        backend.inject_raw("/tmp/a", &burst);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 0);

        watch.stop().unwrap();
        assert!(calls.load(Ordering::SeqCst) >= 3);
    }

    #[test]
    fn test_notify_backend_reports_created_file() {
        let dir = tempfile::tempdir().unwrap();
        let (handler, rx) = channel_handler();
        let options = StreamOptions::new(0.05, CreateFlags::FILE_EVENTS | CreateFlags::WATCH_ROOT);
        let watch = WatchThread::spawn(&NotifyBackend, dir.path(), &options, &handler).unwrap();

        let root = watch.root().to_owned();
        std::fs::write(root.join("created.txt"), "hello").unwrap();

        let batch = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert!(batch.iter().all(|event| event.path.starts_with(&root)));

        watch.stop().unwrap();
    }
}
