//! Native event stream backends.
//!
//! A backend allocates one [`NativeStream`] per watched root and feeds the
//! events it observes into the stream's [`EventSink`]. Streams always start
//! "since now": a backend never replays events that happened before
//! [`NativeStream::start`].
//!
//! - [`NotifyBackend`] - the platform watcher, through `notify`
//! - [`ManualBackend`] - in-process injection for tests and tools

mod manual;
mod os;

use std::fmt;

use camino::{Utf8Path, Utf8PathBuf};

pub use manual::ManualBackend;
pub use os::NotifyBackend;

use crate::error::WatchError;
use crate::source::EventSink;
use crate::stream::StreamOptions;

/// Allocates native event streams.
pub trait NativeBackend: Send + Sync + fmt::Debug {
    /// Turns the requested path into the root the stream will report.
    ///
    /// The default accepts the path as given.
    fn resolve_root(&self, path: &Utf8Path) -> Result<Utf8PathBuf, WatchError> {
        Ok(path.to_owned())
    }

    /// Allocates a stream for `root`, delivering into `sink` once started.
    ///
    /// # Errors
    ///
    /// Fails if the platform refuses to allocate a stream for `root`.
    fn create_stream(
        &self,
        root: &Utf8Path,
        options: &StreamOptions,
        sink: EventSink,
    ) -> Result<Box<dyn NativeStream>, WatchError>;
}

/// An allocated native stream.
///
/// Dropping it releases the native resource.
pub trait NativeStream: Send + fmt::Debug {
    /// Begins delivering events.
    fn start(&mut self) -> Result<(), WatchError>;

    /// Stops delivering events. No new deliveries begin after it returns.
    fn stop(&mut self);
}
