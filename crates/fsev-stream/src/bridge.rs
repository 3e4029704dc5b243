//! Bridge from run loop threads to async consumers.
//!
//! ```text
//! ┌─────────────── watch thread ───────────────┐
//! │ Dispatcher ─► ChannelHandler ──blocking_send │──► mpsc::Receiver<OwnedBatch>
//! └─────────────────────────────────────────────┘      (tokio task)
//! ```
//!
//! The handler copies each batch into an [`OwnedBatch`] and sends it on a
//! bounded tokio channel. A full channel blocks the watch thread, which
//! holds back further callbacks for that stream until the consumer catches
//! up. A closed channel is a forwarding failure.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::error::HandlerError;
use crate::events::{EventBatch, OwnedBatch};
use crate::handler::{BatchHandler, HandlerContext};

/// Default channel capacity, in batches.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 100;

/// Forwards batches into a tokio mpsc channel.
///
/// Must only be invoked from threads outside the tokio runtime, which is
/// always the case for run loop threads.
#[derive(Debug, Clone)]
pub struct ChannelHandler {
    tx: mpsc::Sender<OwnedBatch>,
}

impl ChannelHandler {
    /// Wraps an existing sender.
    #[must_use]
    pub fn new(tx: mpsc::Sender<OwnedBatch>) -> Self {
        Self { tx }
    }

    /// Creates a handler context and the receiver it feeds.
    ///
    /// A capacity of zero uses [`DEFAULT_CHANNEL_CAPACITY`].
    #[must_use]
    pub fn channel(capacity: usize) -> (Arc<HandlerContext>, mpsc::Receiver<OwnedBatch>) {
        let capacity = if capacity == 0 { DEFAULT_CHANNEL_CAPACITY } else { capacity };
        let (tx, rx) = mpsc::channel(capacity);
        (HandlerContext::new(Self::new(tx)), rx)
    }
}

impl BatchHandler for ChannelHandler {
    fn on_batch(&self, batch: &EventBatch<'_>) -> Result<(), HandlerError> {
        self.tx.blocking_send(batch.to_owned_batch()).map_err(|_| {
            tracing::debug!(stream = %batch.stream(), "batch channel closed");
            HandlerError::Closed
        })
    }
}
