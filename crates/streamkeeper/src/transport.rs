//! Transport collaborator interface.
//!
//! The stream client drives a single already-connected transport handle; it
//! never establishes connections or retries at the transport level. The
//! traits here describe the capability set the client consumes:
//!
//! - [`ConnectedTransport`] allocates call objects on the connection.
//! - [`TransportCall`] accepts operation batches and reports an after-teardown
//!   notification.
//! - [`MessageBody`] is the lazy pull source for one incoming message.
//!
//! Contract for implementations: every [`Completion`] handed over in a batch
//! must eventually fire with the event its operation names, and the trailing
//! status must fire exactly once per call, including after a cancel, where it
//! carries a cancellation-derived status.

use std::{fmt, sync::Arc, time::Instant};

use bytes::Bytes;

use crate::{
    combiner::{Combiner, Completion},
    error::{Result, StreamError},
};

/// Default per-call accumulation buffer capacity hint, used when a transport
/// does not override [`ConnectedTransport::initial_buffer_estimate`].
pub const DEFAULT_BUFFER_ESTIMATE: usize = 4096;

/// Shared handle to an in-flight call object.
///
/// The call is reference-counted independently of the attempt that created
/// it: every pending asynchronous operation holds a clone (inside its
/// [`Completion`]), and the call object is torn down only once all clones have
/// been released.
pub type CallRef = Arc<dyn TransportCall>;

/// Arguments for allocating a call on the connection.
pub struct CallArgs {
    /// Logical RPC path for the call (supplied by the event handler).
    pub path: Bytes,

    /// Absolute deadline. `None` means no deadline: the stream is meant to
    /// live until the peer or transport ends it.
    pub deadline: Option<Instant>,

    /// Submit handle for this call's completion queue. Every completion the
    /// transport fires for this call goes through it.
    pub combiner: Combiner,
}

impl fmt::Debug for CallArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallArgs")
            .field("path", &self.path)
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

/// A single operation inside a [`Batch`].
pub enum BatchOp {
    /// Send initial metadata carrying the call path.
    SendHeaders {
        /// Logical RPC path.
        path: Bytes,
    },

    /// Send the single outbound request message.
    SendMessage {
        /// Encoded request payload.
        payload: Bytes,
    },

    /// Send empty trailing metadata, signalling no more requests.
    SendTrailers,

    /// Receive initial metadata; resolves with
    /// [`CallEvent::HeadersReady`](crate::CallEvent::HeadersReady).
    RecvHeaders {
        /// Fired when the metadata arrives.
        ready: Completion,
    },

    /// Receive one message; resolves with
    /// [`CallEvent::MessageReady`](crate::CallEvent::MessageReady).
    RecvMessage {
        /// Fired when a message (or end-of-messages) is available.
        ready: Completion,
    },

    /// Receive the trailing status; resolves with
    /// [`CallEvent::TrailingReady`](crate::CallEvent::TrailingReady).
    RecvTrailers {
        /// Fired exactly once when the stream terminates.
        ready: Completion,
    },

    /// Cancel the stream; resolves with
    /// [`CallEvent::CancelDone`](crate::CallEvent::CancelDone).
    Cancel {
        /// Fired when the cancel has been processed.
        done: Completion,
    },
}

impl fmt::Debug for BatchOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::SendHeaders { .. } => "SendHeaders",
            Self::SendMessage { .. } => "SendMessage",
            Self::SendTrailers => "SendTrailers",
            Self::RecvHeaders { .. } => "RecvHeaders",
            Self::RecvMessage { .. } => "RecvMessage",
            Self::RecvTrailers { .. } => "RecvTrailers",
            Self::Cancel { .. } => "Cancel",
        };
        f.write_str(name)
    }
}

/// A composable set of operations submitted to the transport as one unit.
///
/// The transport preserves the relative order of the send operations within
/// one batch.
#[derive(Debug)]
pub struct Batch {
    /// Operations in this batch.
    pub ops: Vec<BatchOp>,

    /// Fired once the batch's send operations have been flushed; resolves
    /// with [`CallEvent::SendBatchComplete`](crate::CallEvent::SendBatchComplete).
    pub on_complete: Option<Completion>,
}

impl Batch {
    /// Creates a batch with no completion for the send side.
    #[must_use]
    pub fn new(ops: Vec<BatchOp>) -> Self {
        Self { ops, on_complete: None }
    }
}

/// An already-connected transport handle capable of allocating calls.
pub trait ConnectedTransport: Send + Sync + 'static {
    /// Allocates a call on the connection.
    ///
    /// Invoked while the client's internal mutex is held, so implementations
    /// must not block and must not call back into the client synchronously;
    /// doing so would deadlock. Defer any such work onto the runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the call object cannot be created; the client
    /// treats this as a no-progress failure and retries with backoff.
    fn create_call(&self, args: CallArgs) -> Result<CallRef>;

    /// Capacity hint for the per-attempt message accumulation buffer.
    fn initial_buffer_estimate(&self) -> usize {
        DEFAULT_BUFFER_ESTIMATE
    }
}

/// One in-flight call on the connection.
pub trait TransportCall: Send + Sync + 'static {
    /// Submits a batch of operations for asynchronous execution.
    ///
    /// Completions embedded in the batch fire through the call's combiner as
    /// each operation resolves.
    fn submit_batch(&self, batch: Batch);

    /// Registers a one-shot notification fired when the call object's
    /// resources have been fully released by the transport.
    fn set_teardown_notify(&self, notify: tokio::sync::oneshot::Sender<()>);
}

/// Lazy pull source for one incoming message.
///
/// The declared length is known up front; chunks become available as wire
/// data arrives and each pull may suspend until more data is readable.
#[tonic::async_trait]
pub trait MessageBody: Send + 'static {
    /// Declared length of the fully assembled message, in bytes.
    fn message_len(&self) -> usize;

    /// Pulls the next chunk of the message.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying read fails; the attempt cancels
    /// itself and stops draining.
    async fn next_chunk(&mut self) -> Result<Bytes, StreamError>;
}
