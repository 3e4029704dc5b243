//! Event records and batches.
//!
//! # Event Flow
//!
//! ```text
//! Native watcher (path, flags)
//!        │  sequence id assigned on arrival
//!        ▼
//!   RawEvents        one callback's burst, parallel arrays
//!        │  split into chunks of at most max_chunk_size
//!        ▼
//!   EventBatch<'_>   paths as UTF-8 text, flags/ids borrowed
//!        │  forwarded synchronously
//!        ▼
//!   BatchHandler     may copy into an OwnedBatch to keep it
//! ```

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use camino::{Utf8Path, Utf8PathBuf};
use fsev_core::EventFlags;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Identity of one native event stream, used to correlate batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(u64);

impl StreamId {
    pub(crate) fn next() -> Self {
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

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream#{}", self.0)
    }
}

/// Hands out process-wide event sequence ids.
///
/// Ids only ever increase, so ids assigned in arrival order for one
/// stream are strictly increasing within that stream.
pub(crate) fn next_event_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// One native callback's worth of events.
///
/// Stored as three parallel arrays, the shape the OS delivers: entry `i`
/// of each array describes the same event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawEvents {
    paths: Vec<PathBuf>,
    flags: Vec<EventFlags>,
    ids: Vec<u64>,
}

impl RawEvents {
    /// Creates an empty burst.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty burst with room for `capacity` events.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            paths: Vec::with_capacity(capacity),
            flags: Vec::with_capacity(capacity),
            ids: Vec::with_capacity(capacity),
        }
    }

    /// Builds a burst from parallel arrays.
    ///
    /// Returns `None` if the arrays differ in length.
    #[must_use]
    pub fn from_parts(paths: Vec<PathBuf>, flags: Vec<EventFlags>, ids: Vec<u64>) -> Option<Self> {
        (paths.len() == flags.len() && flags.len() == ids.len()).then_some(Self { paths, flags, ids })
    }

    /// Appends one event.
    #[inline]
    pub fn push(&mut self, path: PathBuf, flags: EventFlags, id: u64) {
        self.paths.push(path);
        self.flags.push(flags);
        self.ids.push(id);
    }

    /// Moves every event of `other` to the end of this burst.
    pub(crate) fn append(&mut self, mut other: Self) {
        self.paths.append(&mut other.paths);
        self.flags.append(&mut other.flags);
        self.ids.append(&mut other.ids);
    }

    /// Returns the number of events.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Returns `true` if there are no events.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Native paths, in arrival order.
    #[inline]
    #[must_use]
    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    /// Per-event flag words, parallel to [`paths`](Self::paths).
    #[inline]
    #[must_use]
    pub fn flags(&self) -> &[EventFlags] {
        &self.flags
    }

    /// Per-event sequence ids, parallel to [`paths`](Self::paths).
    #[inline]
    #[must_use]
    pub fn ids(&self) -> &[u64] {
        &self.ids
    }
}

impl FromIterator<(PathBuf, EventFlags, u64)> for RawEvents {
    fn from_iter<T: IntoIterator<Item = (PathBuf, EventFlags, u64)>>(iter: T) -> Self {
        let mut events = Self::new();
        for (path, flags, id) in iter {
            events.push(path, flags, id);
        }
        events
    }
}

/// A bounded, ordered chunk of one callback's events, as seen by a handler.
///
/// Paths are owned text built for this batch. Flags and ids are borrowed
/// sub-ranges of the callback's arrays; the lifetime keeps a handler from
/// holding on to them past the forwarding call. Use
/// [`to_owned_batch`](Self::to_owned_batch) to keep a copy.
#[derive(Debug)]
pub struct EventBatch<'a> {
    stream: StreamId,
    offset: usize,
    paths: Vec<Utf8PathBuf>,
    flags: &'a [EventFlags],
    ids: &'a [u64],
}

impl<'a> EventBatch<'a> {
    /// Assembles a batch. Callers guarantee the three ranges are parallel.
    pub(crate) fn new(
        stream: StreamId,
        offset: usize,
        paths: Vec<Utf8PathBuf>,
        flags: &'a [EventFlags],
        ids: &'a [u64],
    ) -> Self {
        debug_assert_eq!(paths.len(), flags.len());
        debug_assert_eq!(paths.len(), ids.len());
        Self {
            stream,
            offset,
            paths,
            flags,
            ids,
        }
    }

    /// The stream that produced this batch.
    #[inline]
    #[must_use]
    pub const fn stream(&self) -> StreamId {
        self.stream
    }

    /// Index of this batch's first event within its callback invocation.
    #[inline]
    #[must_use]
    pub const fn offset(&self) -> usize {
        self.offset
    }

    /// Number of events in the batch.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    /// Returns `true` if the batch has no events.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Event count as the signed 32-bit value consumers receive.
    ///
    /// Chunk sizes are capped below `i32::MAX`, so this never saturates for
    /// batches built by the dispatcher.
    #[must_use]
    pub fn count(&self) -> i32 {
        i32::try_from(self.len()).unwrap_or(i32::MAX)
    }

    /// Changed paths, in arrival order.
    #[inline]
    #[must_use]
    pub fn paths(&self) -> &[Utf8PathBuf] {
        &self.paths
    }

    /// Flag words for exactly [`len`](Self::len) events.
    #[inline]
    #[must_use]
    pub const fn flags(&self) -> &'a [EventFlags] {
        self.flags
    }

    /// Sequence ids for exactly [`len`](Self::len) events.
    #[inline]
    #[must_use]
    pub const fn ids(&self) -> &'a [u64] {
        self.ids
    }

    /// Iterates `(path, flags, id)` triples in order.
    pub fn iter(&self) -> impl Iterator<Item = (&Utf8Path, EventFlags, u64)> + '_ {
        self.paths
            .iter()
            .zip(self.flags)
            .zip(self.ids)
            .map(|((path, flags), id)| (path.as_path(), *flags, *id))
    }

    /// Copies the batch into an [`OwnedBatch`] that outlives the callback.
    #[must_use]
    pub fn to_owned_batch(&self) -> OwnedBatch {
        OwnedBatch {
            stream: self.stream,
            events: self
                .iter()
                .map(|(path, flags, id)| ChangeEvent {
                    path: path.to_owned(),
                    flags,
                    id,
                })
                .collect(),
            received_at: Instant::now(),
        }
    }
}

/// One forwarded event, detached from its callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// The changed path.
    pub path: Utf8PathBuf,

    /// The native flag word.
    #[serde(with = "flag_word")]
    pub flags: EventFlags,

    /// The event's sequence id.
    pub id: u64,
}

impl fmt::Display for ChangeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:>12} {} {}", self.id, self.flags, self.path)
    }
}

/// A batch copied out of a callback.
///
/// Uses [`SmallVec`] with inline storage for up to 8 events; most
/// callbacks carry only a handful of paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OwnedBatch {
    /// The stream that produced the batch.
    pub stream: StreamId,

    /// The events, in arrival order.
    pub events: SmallVec<[ChangeEvent; 8]>,

    /// When the batch was copied out of its callback.
    #[serde(skip, default = "Instant::now")]
    pub received_at: Instant,
}

impl OwnedBatch {
    /// Returns the number of events.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Returns `true` if the batch has no events.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Returns an iterator over the events.
    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = &ChangeEvent> {
        self.events.iter()
    }
}

impl<'a> IntoIterator for &'a OwnedBatch {
    type Item = &'a ChangeEvent;
    type IntoIter = std::slice::Iter<'a, ChangeEvent>;

    fn into_iter(self) -> Self::IntoIter {
        self.events.iter()
    }
}

/// Summary counts for an [`OwnedBatch`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchStats {
    /// Total number of events.
    pub total_events: usize,

    /// Events about regular files.
    pub files: usize,

    /// Events about directories.
    pub directories: usize,

    /// Events asking the consumer to rescan because events were lost.
    pub rescans: usize,

    /// Events reporting that the watched root moved.
    pub root_changes: usize,
}

impl BatchStats {
    /// Computes statistics for a batch.
    #[must_use]
    pub fn from_batch(batch: &OwnedBatch) -> Self {
        batch.iter().fold(
            Self {
                total_events: batch.len(),
                ..Self::default()
            },
            |mut stats, event| {
                stats.files += usize::from(event.flags.contains(EventFlags::ITEM_IS_FILE));
                stats.directories += usize::from(event.flags.contains(EventFlags::ITEM_IS_DIR));
                stats.rescans += usize::from(event.flags.requires_rescan());
                stats.root_changes += usize::from(event.flags.contains(EventFlags::ROOT_CHANGED));
                stats
            },
        )
    }
}

/// Serializes [`EventFlags`] as the raw word, keeping unknown bits.
mod flag_word {
    use fsev_core::EventFlags;
    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(flags: &EventFlags, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(flags.bits())
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<EventFlags, D::Error> {
        u32::deserialize(deserializer).map(EventFlags::from_bits_retain)
    }
}
