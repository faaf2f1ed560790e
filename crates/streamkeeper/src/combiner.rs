//! Per-call FIFO serialization of completion events.
//!
//! Every asynchronous operation submitted for one call reports back through
//! the call's [`Combiner`]. The attempt drains the paired [`CombinerQueue`]
//! from a single task, so no two completions for the same call are ever
//! processed concurrently and the attempt's transient buffers need no locking
//! of their own.
//!
//! Ordering: events are processed strictly in submission order. The relative
//! order of independent completions (say, a message read and the trailing
//! status) is whatever order the transport fires them in.

use std::fmt;

use tokio::sync::mpsc;
use tonic::{metadata::MetadataMap, Status};

use crate::{
    error::StreamError,
    transport::{CallRef, MessageBody},
};

/// A completion event fired by the transport for one submitted operation.
pub enum CallEvent {
    /// The combined outbound batch (headers, request, trailers) finished.
    SendBatchComplete(Result<(), StreamError>),

    /// Initial metadata arrived from the peer.
    HeadersReady(Result<MetadataMap, StreamError>),

    /// A receive-one-message operation resolved. `Ok(None)` means the peer
    /// will send no further messages; the stream is winding down.
    MessageReady(Result<Option<Box<dyn MessageBody>>, StreamError>),

    /// The trailing status arrived. Fires exactly once per call, even after a
    /// cancel, and carries the final status of the stream.
    TrailingReady(Status),

    /// The cancel batch finished.
    CancelDone,
}

impl fmt::Debug for CallEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SendBatchComplete(r) => write!(f, "SendBatchComplete({r:?})"),
            Self::HeadersReady(r) => {
                write!(f, "HeadersReady({})", if r.is_ok() { "Ok" } else { "Err" })
            },
            Self::MessageReady(Ok(Some(_))) => write!(f, "MessageReady(Some)"),
            Self::MessageReady(Ok(None)) => write!(f, "MessageReady(None)"),
            Self::MessageReady(Err(e)) => write!(f, "MessageReady(Err({e}))"),
            Self::TrailingReady(status) => write!(f, "TrailingReady({:?})", status.code()),
            Self::CancelDone => write!(f, "CancelDone"),
        }
    }
}

/// Submit side of a call's completion queue. Cheap to clone.
#[derive(Clone)]
pub struct Combiner {
    tx: mpsc::UnboundedSender<CallEvent>,
}

impl Combiner {
    /// Creates a combiner and its single-consumer queue.
    #[must_use]
    pub fn new() -> (Combiner, CombinerQueue) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Combiner { tx }, CombinerQueue { rx })
    }

    /// Submits an event for serialized processing.
    ///
    /// Events submitted after the queue has been dropped (the attempt has
    /// already ended) are discarded.
    pub fn submit(&self, event: CallEvent) {
        let _ = self.tx.send(event);
    }
}

impl fmt::Debug for Combiner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Combiner").finish_non_exhaustive()
    }
}

/// Consume side of a call's completion queue, drained by the attempt's drive
/// task.
pub struct CombinerQueue {
    rx: mpsc::UnboundedReceiver<CallEvent>,
}

impl CombinerQueue {
    /// Waits for the next completion event, in submission order.
    ///
    /// Returns `None` once every [`Combiner`] handle has been dropped.
    pub async fn next(&mut self) -> Option<CallEvent> {
        self.rx.recv().await
    }
}

impl fmt::Debug for CombinerQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CombinerQueue").finish_non_exhaustive()
    }
}

/// One-shot completion handle handed to the transport with each submitted
/// operation.
///
/// The handle owns a strong reference to the call object; firing (or
/// dropping) the completion releases that reference. This is the ownership
/// discipline that keeps the call alive exactly as long as any operation on
/// it is still pending.
pub struct Completion {
    combiner: Combiner,
    /// Strong reference on the call, released when the completion resolves.
    _call: CallRef,
}

impl Completion {
    /// Creates a completion that will deliver into `combiner` and holds
    /// `call` alive until it fires.
    #[must_use]
    pub fn new(combiner: Combiner, call: CallRef) -> Self {
        Self { combiner, _call: call }
    }

    /// Fires the completion, delivering `event` and releasing the call
    /// reference.
    pub fn fire(self, event: CallEvent) {
        self.combiner.submit(event);
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion").finish_non_exhaustive()
    }
}
