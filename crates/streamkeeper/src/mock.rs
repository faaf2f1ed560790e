//! Scriptable in-process transport and handler for tests.
//!
//! [`MockTransport`] implements [`ConnectedTransport`] without any network:
//! each created call is handed back to the test through
//! [`next_call`](MockTransport::next_call), and the test then drives it by
//! delivering headers, messages (whole or chunk by chunk), and the trailing
//! status on its own schedule. [`RecordingHandler`] implements
//! [`StreamEventHandler`] by recording every callback for later assertion.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};
use tonic::{metadata::MetadataMap, Code, Status};

use crate::{
    combiner::{CallEvent, Combiner},
    error::{CallCreationSnafu, RejectedSnafu, Result, StreamError},
    handler::StreamEventHandler,
    transport::{Batch, BatchOp, CallArgs, CallRef, ConnectedTransport, MessageBody, TransportCall},
    StreamClient, DEFAULT_BUFFER_ESTIMATE,
};

/// In-process transport whose calls are driven explicitly by the test.
#[derive(Clone)]
pub struct MockTransport {
    inner: Arc<TransportInner>,
}

struct TransportInner {
    fail_next_create: AtomicUsize,
    calls_created: AtomicUsize,
    buffer_estimate: AtomicUsize,
    created_tx: tokio::sync::mpsc::UnboundedSender<Arc<MockCall>>,
    created_rx: tokio::sync::Mutex<tokio::sync::mpsc::UnboundedReceiver<Arc<MockCall>>>,
}

impl MockTransport {
    /// Creates a transport that accepts every call.
    #[must_use]
    pub fn new() -> Self {
        let (created_tx, created_rx) = tokio::sync::mpsc::unbounded_channel();
        Self {
            inner: Arc::new(TransportInner {
                fail_next_create: AtomicUsize::new(0),
                calls_created: AtomicUsize::new(0),
                buffer_estimate: AtomicUsize::new(DEFAULT_BUFFER_ESTIMATE),
                created_tx,
                created_rx: tokio::sync::Mutex::new(created_rx),
            }),
        }
    }

    /// Returns the transport as the trait object the client consumes.
    #[must_use]
    pub fn transport(&self) -> Arc<dyn ConnectedTransport> {
        Arc::new(self.clone())
    }

    /// Makes the next `n` call creations fail.
    pub fn fail_next_create(&self, n: usize) {
        self.inner.fail_next_create.store(n, Ordering::SeqCst);
    }

    /// Overrides the accumulation-buffer capacity hint.
    pub fn set_buffer_estimate(&self, estimate: usize) {
        self.inner.buffer_estimate.store(estimate, Ordering::SeqCst);
    }

    /// Number of calls successfully created so far.
    #[must_use]
    pub fn calls_created(&self) -> usize {
        self.inner.calls_created.load(Ordering::SeqCst)
    }

    /// Waits for the next call to be created and returns its control handle.
    ///
    /// # Panics
    ///
    /// Panics if the transport is dropped while waiting.
    pub async fn next_call(&self) -> Arc<MockCall> {
        let mut rx = self.inner.created_rx.lock().await;
        rx.recv().await.expect("mock transport dropped")
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectedTransport for MockTransport {
    fn create_call(&self, args: CallArgs) -> Result<CallRef> {
        let pending = self.inner.fail_next_create.load(Ordering::SeqCst);
        if pending > 0 {
            self.inner.fail_next_create.store(pending - 1, Ordering::SeqCst);
            return CallCreationSnafu { message: "injected create failure" }.fail();
        }

        self.inner.calls_created.fetch_add(1, Ordering::SeqCst);
        let call = Arc::new(MockCall::new(args.combiner));
        let _ = self.inner.created_tx.send(Arc::clone(&call));
        Ok(call)
    }

    fn initial_buffer_estimate(&self) -> usize {
        self.inner.buffer_estimate.load(Ordering::SeqCst)
    }
}

/// One scripted chunk of a message body.
pub enum MockChunk {
    /// Yields the bytes.
    Data(Bytes),
    /// Suspends the pull until the [`Notify`] is notified.
    Pause(Arc<Notify>),
    /// Fails the pull.
    Fail(StreamError),
}

struct ScriptedBody {
    len: usize,
    chunks: VecDeque<MockChunk>,
}

#[tonic::async_trait]
impl MessageBody for ScriptedBody {
    fn message_len(&self) -> usize {
        self.len
    }

    async fn next_chunk(&mut self) -> Result<Bytes, StreamError> {
        loop {
            match self.chunks.pop_front() {
                Some(MockChunk::Data(bytes)) => return Ok(bytes),
                Some(MockChunk::Pause(notify)) => notify.notified().await,
                Some(MockChunk::Fail(err)) => return Err(err),
                // Script exhausted below the declared length; the reader
                // treats the empty chunk as truncation.
                None => return Ok(Bytes::new()),
            }
        }
    }
}

/// Parked operations and captured sends for one mock call.
///
/// Parked receives are recorded as flags, not as the submitted completions:
/// a stored completion would hold a reference back to the call that stores
/// it, and an abandoned call would never be freed. Results are fired through
/// the call's own combiner handle instead.
#[derive(Default)]
struct CallState {
    sent_path: Option<Bytes>,
    sent_request: Option<Bytes>,
    pending_headers: bool,
    pending_message: bool,
    pending_trailers: bool,
    teardown: Option<oneshot::Sender<()>>,
    trailing_fired: bool,
    manual_trailing: bool,
}

/// Control handle for one call created on a [`MockTransport`].
///
/// Send operations complete instantly; receive operations park until the
/// test delivers a result. A cancel fires the trailing
/// status with [`Code::Cancelled`] on its own, unless
/// [`set_manual_trailing`](Self::set_manual_trailing) was used to keep that
/// under test control.
pub struct MockCall {
    combiner: Combiner,
    state: Mutex<CallState>,
    cancel_count: AtomicUsize,
}

impl MockCall {
    fn new(combiner: Combiner) -> Self {
        Self { combiner, state: Mutex::new(CallState::default()), cancel_count: AtomicUsize::new(0) }
    }

    /// Path captured from the send-headers operation.
    #[must_use]
    pub fn sent_path(&self) -> Option<Bytes> {
        self.state.lock().sent_path.clone()
    }

    /// Request payload captured from the send-message operation.
    #[must_use]
    pub fn sent_request(&self) -> Option<Bytes> {
        self.state.lock().sent_request.clone()
    }

    /// Number of cancel operations submitted so far.
    #[must_use]
    pub fn cancel_count(&self) -> usize {
        self.cancel_count.load(Ordering::SeqCst)
    }

    /// True while a receive-one-message operation is parked.
    #[must_use]
    pub fn has_pending_message(&self) -> bool {
        self.state.lock().pending_message
    }

    /// Keeps the trailing status under test control even across a cancel.
    pub fn set_manual_trailing(&self) {
        self.state.lock().manual_trailing = true;
    }

    /// Resolves the pending receive-headers operation with empty metadata.
    pub fn deliver_headers(&self) {
        if std::mem::take(&mut self.state.lock().pending_headers) {
            self.combiner.submit(CallEvent::HeadersReady(Ok(MetadataMap::new())));
        }
    }

    /// Resolves the pending receive-message operation with a single-chunk
    /// message.
    pub fn deliver_message(&self, payload: impl Into<Bytes>) {
        let payload = payload.into();
        self.deliver_body(payload.len(), vec![MockChunk::Data(payload)]);
    }

    /// Resolves the pending receive-message operation with a scripted body of
    /// declared length `len`.
    pub fn deliver_body(&self, len: usize, chunks: Vec<MockChunk>) {
        if std::mem::take(&mut self.state.lock().pending_message) {
            let body = ScriptedBody { len, chunks: chunks.into() };
            self.combiner.submit(CallEvent::MessageReady(Ok(Some(Box::new(body)))));
        }
    }

    /// Resolves the pending receive-message operation with end-of-messages.
    pub fn end_messages(&self) {
        if std::mem::take(&mut self.state.lock().pending_message) {
            self.combiner.submit(CallEvent::MessageReady(Ok(None)));
        }
    }

    /// Resolves the pending receive-trailers operation with `status`.
    pub fn deliver_trailing(&self, status: Status) {
        let pending = {
            let mut state = self.state.lock();
            state.trailing_fired = true;
            std::mem::take(&mut state.pending_trailers)
        };
        if pending {
            self.combiner.submit(CallEvent::TrailingReady(status));
        }
    }

    /// Fires the after-teardown notification, releasing the attempt.
    pub fn fire_teardown(&self) {
        if let Some(notify) = self.state.lock().teardown.take() {
            let _ = notify.send(());
        }
    }
}

impl TransportCall for MockCall {
    fn submit_batch(&self, batch: Batch) {
        let mut fire_cancel_trailing = false;
        {
            let mut state = self.state.lock();
            for op in batch.ops {
                match op {
                    BatchOp::SendHeaders { path } => state.sent_path = Some(path),
                    BatchOp::SendMessage { payload } => state.sent_request = Some(payload),
                    BatchOp::SendTrailers => {},
                    // The completions are dropped here; see `CallState`.
                    BatchOp::RecvHeaders { .. } => state.pending_headers = true,
                    BatchOp::RecvMessage { .. } => state.pending_message = true,
                    BatchOp::RecvTrailers { .. } => state.pending_trailers = true,
                    BatchOp::Cancel { done } => {
                        self.cancel_count.fetch_add(1, Ordering::SeqCst);
                        done.fire(CallEvent::CancelDone);
                        if !state.manual_trailing && !state.trailing_fired {
                            fire_cancel_trailing = true;
                        }
                    },
                }
            }
            if let Some(on_complete) = batch.on_complete {
                on_complete.fire(CallEvent::SendBatchComplete(Ok(())));
            }
        }
        if fire_cancel_trailing {
            self.deliver_trailing(Status::cancelled("call cancelled"));
        }
    }

    fn set_teardown_notify(&self, notify: oneshot::Sender<()>) {
        self.state.lock().teardown = Some(notify);
    }
}

/// Events a [`RecordingHandler`] observes, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerEvent {
    /// A call attempt started.
    CallStarted,
    /// A retry delay was armed.
    RetryTimerStarted,
    /// A response message was delivered.
    Response(Vec<u8>),
    /// An attempt ended with the given status code.
    CallEnded(Code),
}

struct HandlerInner {
    path: Bytes,
    request: Bytes,
    events: Mutex<Vec<HandlerEvent>>,
    reject_next: AtomicUsize,
}

/// Event handler that records every callback.
///
/// Clones share the same event log, so a test can keep one handle while the
/// client owns another.
#[derive(Clone)]
pub struct RecordingHandler {
    inner: Arc<HandlerInner>,
}

impl RecordingHandler {
    /// Creates a handler with a fixed default path and request payload.
    #[must_use]
    pub fn new() -> Self {
        Self::with_request("/test.Watch/Watch", b"request".as_slice())
    }

    /// Creates a handler with an explicit path and request payload.
    #[must_use]
    pub fn with_request(path: &'static str, request: impl Into<Bytes>) -> Self {
        Self {
            inner: Arc::new(HandlerInner {
                path: Bytes::from_static(path.as_bytes()),
                request: request.into(),
                events: Mutex::new(Vec::new()),
                reject_next: AtomicUsize::new(0),
            }),
        }
    }

    /// Returns the handler boxed for [`StreamClient`] construction.
    #[must_use]
    pub fn boxed(&self) -> Box<dyn StreamEventHandler> {
        Box::new(self.clone())
    }

    /// Makes the next `n` response deliveries fail as parse errors.
    pub fn reject_next_responses(&self, n: usize) {
        self.inner.reject_next.store(n, Ordering::SeqCst);
    }

    /// Snapshot of every event recorded so far.
    #[must_use]
    pub fn events(&self) -> Vec<HandlerEvent> {
        self.inner.events.lock().clone()
    }

    /// Number of recorded [`HandlerEvent::Response`] events.
    #[must_use]
    pub fn responses(&self) -> usize {
        self.inner
            .events
            .lock()
            .iter()
            .filter(|e| matches!(e, HandlerEvent::Response(_)))
            .count()
    }

    /// Number of recorded [`HandlerEvent::CallStarted`] events.
    #[must_use]
    pub fn call_starts(&self) -> usize {
        self.inner
            .events
            .lock()
            .iter()
            .filter(|e| matches!(e, HandlerEvent::CallStarted))
            .count()
    }

    fn record(&self, event: HandlerEvent) {
        self.inner.events.lock().push(event);
    }
}

impl Default for RecordingHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamEventHandler for RecordingHandler {
    fn on_call_start(&mut self, _client: &StreamClient) {
        self.record(HandlerEvent::CallStarted);
    }

    fn on_retry_timer_start(&mut self, _client: &StreamClient) {
        self.record(HandlerEvent::RetryTimerStarted);
    }

    fn request_path(&self) -> Bytes {
        self.inner.path.clone()
    }

    fn encode_request(&self) -> Bytes {
        self.inner.request.clone()
    }

    fn on_response(&mut self, _client: &StreamClient, payload: &[u8]) -> Result<(), StreamError> {
        let pending = self.inner.reject_next.load(Ordering::SeqCst);
        if pending > 0 {
            self.inner.reject_next.store(pending - 1, Ordering::SeqCst);
            return RejectedSnafu { message: "injected parse failure" }.fail();
        }
        self.record(HandlerEvent::Response(payload.to_vec()));
        Ok(())
    }

    fn on_call_ended(&mut self, _client: &StreamClient, code: Code) {
        self.record(HandlerEvent::CallEnded(code));
    }
}
