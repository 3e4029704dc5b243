//! The callback dispatcher.
//!
//! One native callback can carry any number of events. The dispatcher cuts
//! it into chunks of at most `max_chunk` events, builds each chunk into a
//! complete [`EventBatch`], and forwards the batches in order, synchronously,
//! to the stream's [`HandlerContext`].
//!
//! # Loss Condition
//!
//! If a chunk cannot be built (a path has no text representation) or the
//! handler returns an error for it, the remaining chunks of that callback
//! are dropped. Nothing is retried; the stream keeps delivering later
//! callbacks normally. [`DispatchOutcome`] reports how much was dropped.

use std::ops::Range;

use camino::{Utf8Path, Utf8PathBuf};
use fsev_core::{MAX_CHUNK_LIMIT, diag};

use crate::error::DispatchError;
use crate::events::{EventBatch, RawEvents, StreamId};
use crate::handler::HandlerContext;

/// Splits callbacks into bounded batches and forwards them.
///
/// # Examples
///
/// ```
/// use fsev_stream::Dispatcher;
///
/// let dispatcher = Dispatcher::new(65_536);
/// let sizes: Vec<usize> = dispatcher.chunk_ranges(150_000).map(|r| r.len()).collect();
/// assert_eq!(sizes, vec![65_536, 65_536, 18_928]);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dispatcher {
    max_chunk: usize,
}

impl Dispatcher {
    /// Creates a dispatcher forwarding at most `max_chunk` events per batch.
    ///
    /// The limit is clamped to `1..=MAX_CHUNK_LIMIT`.
    #[must_use]
    pub const fn new(max_chunk: usize) -> Self {
        let max_chunk = if max_chunk == 0 {
            1
        } else if max_chunk > MAX_CHUNK_LIMIT {
            MAX_CHUNK_LIMIT
        } else {
            max_chunk
        };
        Self { max_chunk }
    }

    /// The effective per-batch limit.
    #[inline]
    #[must_use]
    pub const fn max_chunk(&self) -> usize {
        self.max_chunk
    }

    /// Index ranges of the chunks for a callback of `total` events.
    ///
    /// Each chunk holds `min(remaining, max_chunk)` events.
    pub fn chunk_ranges(&self, total: usize) -> impl Iterator<Item = Range<usize>> + use<> {
        let max = self.max_chunk;
        (0..total)
            .step_by(max)
            .map(move |start| start..total.min(start.saturating_add(max)))
    }

    /// Forwards one callback's events to `handler`.
    ///
    /// Never blocks except inside the handler's own forwarding calls.
    pub fn dispatch(&self, stream: StreamId, events: &RawEvents, handler: &HandlerContext) -> DispatchOutcome {
        let total = events.len();
        diag!(%stream, total, max_chunk = self.max_chunk, "callback entered");

        let mut outcome = DispatchOutcome::default();
        for range in self.chunk_ranges(total) {
            diag!(%stream, start = range.start, end = range.end, "chunk");

            let result = build_batch(stream, events, range.clone()).and_then(|batch| {
                handler.forward(&batch).map_err(|source| DispatchError::Forward {
                    offset: range.start,
                    source,
                })
            });

            if let Err(error) = result {
                diag!(%stream, offset = range.start, %error, "chunk failed");
                outcome.dropped = total - range.start;
                outcome.error = Some(error);
                return outcome;
            }

            outcome.batches += 1;
            outcome.forwarded += range.len();
        }

        outcome
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(fsev_core::config::DEFAULT_MAX_CHUNK_SIZE)
    }
}

/// What happened to one callback's events.
#[derive(Debug, Default)]
pub struct DispatchOutcome {
    /// Batches the handler accepted.
    pub batches: usize,
    /// Events in accepted batches.
    pub forwarded: usize,
    /// Events not forwarded because a chunk failed.
    pub dropped: usize,
    /// Why forwarding stopped, if it stopped early.
    pub error: Option<DispatchError>,
}

impl DispatchOutcome {
    /// Returns `true` if every event was forwarded.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.error.is_none()
    }
}

/// Builds the whole batch before anything is forwarded.
fn build_batch(stream: StreamId, events: &RawEvents, range: Range<usize>) -> Result<EventBatch<'_>, DispatchError> {
    let paths = events.paths()[range.clone()]
        .iter()
        .enumerate()
        .map(|(i, path)| {
            Utf8Path::from_path(path)
                .map(Utf8Path::to_path_buf)
                .ok_or_else(|| DispatchError::Representation {
                    index: range.start + i,
                    path: path.clone(),
                })
        })
        .collect::<Result<Vec<Utf8PathBuf>, _>>()?;

    Ok(EventBatch::new(
        stream,
        range.start,
        paths,
        &events.flags()[range.clone()],
        &events.ids()[range],
    ))
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Arc;

    use fsev_core::EventFlags;
    use parking_lot::Mutex;

    use super::*;
    use crate::error::HandlerError;

    #[derive(Debug)]
    struct Seen {
        offset: usize,
        count: i32,
        paths: Vec<String>,
        flags: Vec<EventFlags>,
        ids: Vec<u64>,
    }

    /// A handler recording every batch, failing on the given call number.
    fn recorder(fail_on: Option<usize>) -> (Arc<HandlerContext>, Arc<Mutex<Vec<Seen>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let context = HandlerContext::from_fn(move |batch| {
            let mut seen = sink.lock();
            seen.push(Seen {
                offset: batch.offset(),
                count: batch.count(),
                paths: batch.paths().iter().map(ToString::to_string).collect(),
                flags: batch.flags().to_vec(),
                ids: batch.ids().to_vec(),
            });
            if fail_on == Some(seen.len()) {
                return Err(HandlerError::rejected("refused"));
            }
            Ok(())
        });
        (context, seen)
    }

    fn burst(n: usize, first_id: u64) -> RawEvents {
        (0..n)
            .map(|i| {
                let flags = if i % 2 == 0 {
                    EventFlags::ITEM_CREATED | EventFlags::ITEM_IS_FILE
                } else {
                    EventFlags::ITEM_REMOVED | EventFlags::ITEM_IS_DIR
                };
                (PathBuf::from(format!("/tmp/a/{i}")), flags, first_id + i as u64)
            })
            .collect()
    }

    #[test]
    fn test_small_callback_is_one_batch() {
        let (handler, seen) = recorder(None);
        let events = burst(3, 10);

        let outcome = Dispatcher::new(65_536).dispatch(StreamId::next(), &events, &handler);
        assert!(outcome.is_complete());
        assert_eq!(outcome.batches, 1);

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].count, 3);
        assert_eq!(seen[0].ids, vec![10, 11, 12]);
        assert_eq!(seen[0].paths, vec!["/tmp/a/0", "/tmp/a/1", "/tmp/a/2"]);
    }

    #[test]
    fn test_large_callback_is_chunked_in_order() {
        let (handler, seen) = recorder(None);
        let events = burst(150_000, 1);

        let outcome = Dispatcher::new(65_536).dispatch(StreamId::next(), &events, &handler);
        assert!(outcome.is_complete());
        assert_eq!(outcome.batches, 3);
        assert_eq!(outcome.forwarded, 150_000);

        let seen = seen.lock();
        let sizes: Vec<i32> = seen.iter().map(|s| s.count).collect();
        assert_eq!(sizes, vec![65_536, 65_536, 18_928]);
        assert_eq!(seen.iter().map(|s| s.offset).collect::<Vec<_>>(), vec![0, 65_536, 131_072]);

        let ids: Vec<u64> = seen.iter().flat_map(|s| s.ids.iter().copied()).collect();
        assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
        assert_eq!(ids, events.ids());
    }

    #[test]
    fn test_concatenated_batches_equal_input() {
        let (handler, seen) = recorder(None);
        let events = burst(25, 500);

        Dispatcher::new(7).dispatch(StreamId::next(), &events, &handler);

        let seen = seen.lock();
        assert_eq!(seen.len(), 4);
        let paths: Vec<PathBuf> = seen.iter().flat_map(|s| s.paths.iter().map(PathBuf::from)).collect();
        let flags: Vec<EventFlags> = seen.iter().flat_map(|s| s.flags.iter().copied()).collect();
        assert_eq!(paths, events.paths());
        assert_eq!(flags, events.flags());
    }

    #[test]
    fn test_empty_callback_forwards_nothing() {
        let (handler, seen) = recorder(None);
        let outcome = Dispatcher::new(10).dispatch(StreamId::next(), &RawEvents::new(), &handler);
        assert!(outcome.is_complete());
        assert_eq!(outcome.batches, 0);
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn test_handler_error_drops_remaining_chunks() {
        let (handler, seen) = recorder(Some(2));
        let events = burst(150_000, 1);

        let outcome = Dispatcher::new(65_536).dispatch(StreamId::next(), &events, &handler);
        assert_eq!(seen.lock().len(), 2);
        assert_eq!(outcome.batches, 1);
        assert_eq!(outcome.forwarded, 65_536);
        assert_eq!(outcome.dropped, 150_000 - 65_536);
        assert!(matches!(
            outcome.error,
            Some(DispatchError::Forward { offset: 65_536, source: HandlerError::Rejected(_) })
        ));
    }

    #[test]
    fn test_dispatcher_recovers_on_next_callback() {
        let (handler, seen) = recorder(Some(1));
        let dispatcher = Dispatcher::new(2);

        let first = dispatcher.dispatch(StreamId::next(), &burst(4, 1), &handler);
        assert!(!first.is_complete());
        let second = dispatcher.dispatch(StreamId::next(), &burst(4, 5), &handler);
        assert!(second.is_complete());
        assert_eq!(seen.lock().len(), 3);
    }

    #[cfg(unix)]
    #[test]
    fn test_unrepresentable_path_stops_before_forwarding() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let (handler, seen) = recorder(None);
        let mut events = RawEvents::new();
        events.push(PathBuf::from("/tmp/a/0"), EventFlags::ITEM_CREATED, 1);
        events.push(PathBuf::from("/tmp/a/1"), EventFlags::ITEM_CREATED, 2);
        events.push(
            PathBuf::from(OsStr::from_bytes(b"/tmp/a/\xff")),
            EventFlags::ITEM_CREATED,
            3,
        );
        events.push(PathBuf::from("/tmp/a/3"), EventFlags::ITEM_CREATED, 4);

        let outcome = Dispatcher::new(2).dispatch(StreamId::next(), &events, &handler);
        assert_eq!(seen.lock().len(), 1);
        assert_eq!(outcome.dropped, 2);
        assert!(matches!(outcome.error, Some(DispatchError::Representation { index: 2, .. })));
    }

    #[test]
    fn test_chunk_limit_is_clamped() {
        assert_eq!(Dispatcher::new(0).max_chunk(), 1);
        assert_eq!(Dispatcher::new(usize::MAX).max_chunk(), MAX_CHUNK_LIMIT);
        assert_eq!(Dispatcher::default().max_chunk(), 65_536);
        assert_eq!(Dispatcher::new(5).chunk_ranges(0).count(), 0);
    }
}
