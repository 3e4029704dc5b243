//! Per-directory native event streams with bounded, ordered batch delivery.
//!
//! This crate is the native-event core of fsev. It owns:
//!
//! - [`WatchHandle`] - the lifecycle of one native stream: create,
//!   schedule, dispose
//! - [`runloop`] - per-thread run loops that pump stream callbacks
//! - [`Dispatcher`] - splitting a callback's burst into bounded batches
//!   forwarded in order
//! - [`HandlerContext`] and [`DurableRef`] - the consumer-side target and
//!   the reference that keeps it alive while callbacks can fire
//! - [`WatchThread`] - a dedicated thread hosting one stream
//! - [`ChannelHandler`] - a handler feeding a tokio channel
//!
//! # Architecture
//!
//! ```text
//!   NativeBackend (notify / manual)
//!        │ EventSink::push         (any thread)
//!        ▼
//!   SourceState ── latency timer ──► run loop (hosting thread)
//!                                        │ Dispatcher
//!                                        ▼
//!                                   HandlerContext ──► BatchHandler
//! ```
//!
//! # Example
//!
//! ```no_run
//! use fsev_stream::{ChannelHandler, NotifyBackend, StreamOptions, WatchThread};
//!
//! # async fn watch_project() -> Result<(), fsev_stream::WatchError> {
//! let (handler, mut batches) = ChannelHandler::channel(64);
//! let watch = WatchThread::spawn(&NotifyBackend, "/tmp/project", &StreamOptions::default(), &handler)?;
//!
//! while let Some(batch) = batches.recv().await {
//!     for event in &batch {
//!         println!("{event}");
//!     }
//! }
//!
//! watch.stop()?;
//! # Ok(())
//! # }
//! ```

#![deny(clippy::all)]
#![warn(missing_docs)]

pub mod bridge;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod handler;
pub mod native;
pub mod runloop;
mod source;
pub mod stream;
pub mod thread;

pub use bridge::ChannelHandler;
pub use dispatch::{DispatchOutcome, Dispatcher};
pub use error::{CreateError, DispatchError, HandlerError, WatchError};
pub use events::{BatchStats, ChangeEvent, EventBatch, OwnedBatch, RawEvents, StreamId};
pub use handler::{BatchHandler, DurableRef, HandlerContext, HandlerId};
pub use native::{ManualBackend, NativeBackend, NativeStream, NotifyBackend};
pub use runloop::{LoopId, LoopState, RunLoopToken, WeakRunLoopToken, current_token, request_loop_stop, run};
pub use source::EventSink;
pub use stream::{StreamOptions, StreamState, WatchHandle, create_watch};
pub use thread::WatchThread;
