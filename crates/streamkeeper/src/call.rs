//! One streaming-call attempt.
//!
//! A [`CallAttempt`] covers a single execution of the call, from creation on
//! the transport through the terminal status and teardown. Its drive task
//! drains the attempt's combiner queue, assembling incoming messages chunk by
//! chunk and delivering them to the event handler, until the trailing status
//! arrives. The terminal path reports to the handler, hands the
//! retry-or-restart decision back to the client, and then waits for the
//! transport's teardown notification before the attempt is released.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, OnceLock,
};

use bytes::{Bytes, BytesMut};
use tokio::sync::oneshot;
use tonic::{Code, Status};
use tracing::{debug, warn};

use crate::{
    client::{ClientShared, ClientState},
    combiner::{CallEvent, Combiner, CombinerQueue, Completion},
    transport::{Batch, BatchOp, CallArgs, CallRef, MessageBody},
};

/// Result of processing one incoming message.
enum MessageOutcome {
    /// Delivered to the handler; keep reading.
    Accepted,
    /// The handler refused the payload; cancel the attempt.
    Rejected,
    /// Pulling the message body failed; cancel the attempt.
    ReadFailed,
}

/// One execution of the streaming call.
pub(crate) struct CallAttempt {
    client: Arc<ClientShared>,
    /// Set once the transport call is created; stays `None` when creation
    /// failed.
    call: OnceLock<CallRef>,
    combiner: Combiner,
    cancelled: AtomicBool,
    seen_response: AtomicBool,
}

impl CallAttempt {
    /// Creates an attempt and the queue its drive task will drain.
    pub(crate) fn new(client: Arc<ClientShared>) -> (Arc<Self>, CombinerQueue) {
        let (combiner, queue) = Combiner::new();
        let attempt = Arc::new(Self {
            client,
            call: OnceLock::new(),
            combiner,
            cancelled: AtomicBool::new(false),
            seen_response: AtomicBool::new(false),
        });
        (attempt, queue)
    }

    /// Creates the transport call, submits the initial batches, and spawns
    /// the drive task. Called with the client mutex held.
    ///
    /// On creation failure the attempt ends synchronously as a no-progress
    /// failure; no drive task is spawned.
    pub(crate) fn start_locked(self: &Arc<Self>, state: &mut ClientState, queue: CombinerQueue) {
        let Some(handler) = state.handler.as_ref() else {
            return;
        };
        let path = handler.request_path();
        let payload = handler.encode_request();

        let args =
            CallArgs { path: path.clone(), deadline: None, combiner: self.combiner.clone() };
        let call = match self.client.transport.create_call(args) {
            Ok(call) => call,
            Err(err) => {
                warn!(
                    client = self.client.name,
                    error = %err,
                    "error creating stream; will retry"
                );
                self.call_ended_locked(state, true);
                return;
            },
        };
        let _ = self.call.set(Arc::clone(&call));

        let (teardown_tx, teardown_rx) = oneshot::channel();
        call.set_teardown_notify(teardown_tx);

        // All outbound operations go out as one batch; the send side of the
        // stream is closed before the first byte comes back.
        call.submit_batch(Batch {
            ops: vec![
                BatchOp::SendHeaders { path },
                BatchOp::SendMessage { payload },
                BatchOp::SendTrailers,
            ],
            on_complete: Some(self.completion(&call)),
        });
        call.submit_batch(Batch::new(vec![BatchOp::RecvHeaders {
            ready: self.completion(&call),
        }]));
        call.submit_batch(Batch::new(vec![BatchOp::RecvTrailers {
            ready: self.completion(&call),
        }]));
        call.submit_batch(Batch::new(vec![BatchOp::RecvMessage {
            ready: self.completion(&call),
        }]));

        let attempt = Arc::clone(self);
        tokio::spawn(attempt.drive(queue, teardown_rx));
    }

    /// Requests cancellation of the call. Idempotent: only the first caller
    /// submits the cancel batch.
    pub(crate) fn cancel(&self) {
        if self
            .cancelled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            if let Some(call) = self.call.get() {
                debug!(client = self.client.name, "cancelling call attempt");
                call.submit_batch(Batch::new(vec![BatchOp::Cancel {
                    done: self.completion(call),
                }]));
            }
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn completion(&self, call: &CallRef) -> Completion {
        Completion::new(self.combiner.clone(), Arc::clone(call))
    }

    /// Drains the combiner queue until the trailing status arrives, then
    /// waits for the transport to release the call object.
    async fn drive(self: Arc<Self>, mut queue: CombinerQueue, teardown: oneshot::Receiver<()>) {
        let buffer_estimate = self.client.transport.initial_buffer_estimate();

        while let Some(event) = queue.next().await {
            match event {
                CallEvent::SendBatchComplete(Ok(())) => {},
                CallEvent::SendBatchComplete(Err(err)) => {
                    // The trailing status carries the authoritative failure;
                    // nothing to do here but note it.
                    debug!(client = self.client.name, error = %err, "outbound batch failed");
                },
                CallEvent::HeadersReady(_) => {
                    // Initial metadata is not interpreted.
                },
                CallEvent::MessageReady(Ok(Some(body))) => {
                    match self.read_message(body, buffer_estimate).await {
                        MessageOutcome::Accepted => self.arm_next_read(),
                        MessageOutcome::Rejected | MessageOutcome::ReadFailed => self.cancel(),
                    }
                },
                CallEvent::MessageReady(Ok(None)) => {
                    // Peer closed the message stream; the trailing status is
                    // on its way.
                },
                CallEvent::MessageReady(Err(err)) => {
                    debug!(client = self.client.name, error = %err, "message receive failed");
                    self.cancel();
                },
                CallEvent::TrailingReady(status) => {
                    self.finish(&status);
                    break;
                },
                CallEvent::CancelDone => {},
            }
        }

        // The attempt is released only after both halves have happened: the
        // terminal report above and the transport's own teardown of the call
        // object. The two can resolve in either order.
        let _ = teardown.await;
    }

    /// Pulls every chunk of one message, assembles the payload, and delivers
    /// it to the handler under the client mutex.
    async fn read_message(&self, mut body: Box<dyn MessageBody>, estimate: usize) -> MessageOutcome {
        let len = body.message_len();
        let mut first_chunk: Option<Bytes> = None;
        let mut buf: Option<BytesMut> = None;
        let mut assembled = 0usize;

        while assembled < len {
            let mut chunk = match body.next_chunk().await {
                Ok(chunk) => chunk,
                Err(err) => {
                    debug!(
                        client = self.client.name,
                        error = %err,
                        "failed reading response message"
                    );
                    return MessageOutcome::ReadFailed;
                },
            };
            if chunk.is_empty() {
                debug!(client = self.client.name, "response message truncated");
                return MessageOutcome::ReadFailed;
            }
            // Only the declared length belongs to this message; clip a chunk
            // that runs past it.
            if assembled + chunk.len() > len {
                chunk.truncate(len - assembled);
            }
            assembled += chunk.len();

            if first_chunk.is_none() && buf.is_none() {
                // A message that arrives in one chunk is passed through
                // without copying.
                first_chunk = Some(chunk);
            } else {
                let buf = buf.get_or_insert_with(|| BytesMut::with_capacity(estimate.max(len)));
                if let Some(first) = first_chunk.take() {
                    buf.extend_from_slice(&first);
                }
                buf.extend_from_slice(&chunk);
            }
        }

        let payload = match (first_chunk, buf) {
            (Some(chunk), None) => chunk,
            (None, Some(buf)) => buf.freeze(),
            _ => Bytes::new(),
        };

        let rejected = {
            let mut state = self.client.state.lock();
            let handle = self.client.handle();
            match state.handler.as_mut() {
                Some(handler) => match handler.on_response(&handle, &payload) {
                    Ok(()) => false,
                    Err(err) => {
                        debug!(
                            client = self.client.name,
                            error = %err,
                            "handler rejected response message"
                        );
                        true
                    },
                },
                // Shut down while the message was in flight; drop it.
                None => false,
            }
        };

        // Recorded whether or not the handler accepted the payload: the
        // stream demonstrably made progress either way.
        self.seen_response.store(true, Ordering::Release);

        if rejected {
            MessageOutcome::Rejected
        } else {
            MessageOutcome::Accepted
        }
    }

    /// Arms the next receive-one-message operation, unless the attempt has
    /// been cancelled.
    fn arm_next_read(&self) {
        if self.is_cancelled() {
            return;
        }
        if let Some(call) = self.call.get() {
            call.submit_batch(Batch::new(vec![BatchOp::RecvMessage {
                ready: self.completion(call),
            }]));
        }
    }

    /// Terminal report: delivers the final status to the handler and lets the
    /// client decide whether and when to restart.
    fn finish(self: &Arc<Self>, status: &Status) {
        debug!(client = self.client.name, code = ?status.code(), "stream terminated");
        let mut state = self.client.state.lock();
        let handle = self.client.handle();
        if let Some(handler) = state.handler.as_mut() {
            handler.on_call_ended(&handle, status.code());
        }
        // A peer that does not implement the method will not start
        // implementing it on retry.
        let retry = status.code() != Code::Unimplemented;
        self.call_ended_locked(&mut state, retry);
    }

    /// Clears this attempt out of the client's slot and, when retrying,
    /// either restarts immediately (progress was made, backoff reset) or arms
    /// the retry timer.
    fn call_ended_locked(self: &Arc<Self>, state: &mut ClientState, retry: bool) {
        // Only act if this attempt still occupies the slot; otherwise the
        // call was deliberately ended and no restart is wanted.
        let active = state.attempt.as_ref().is_some_and(|a| Arc::ptr_eq(a, self));
        if !active {
            return;
        }
        state.attempt = None;

        if !retry {
            debug!(
                client = self.client.name,
                "peer does not implement the method; not retrying"
            );
            return;
        }
        if state.handler.is_none() {
            return;
        }

        if self.seen_response.load(Ordering::Acquire) {
            // The failure came after real progress; reconnect right away.
            state.backoff.reset();
            self.client.start_attempt_locked(state);
        } else {
            self.client.arm_retry_timer_locked(state);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use parking_lot::Mutex;

    use super::*;
    use crate::{
        backoff::{Backoff, BackoffConfig},
        mock::{MockTransport, RecordingHandler},
    };

    fn started_attempt(transport: &MockTransport) -> Arc<CallAttempt> {
        let shared = Arc::new(ClientShared {
            transport: transport.transport(),
            name: "cancel-test",
            state: Mutex::new(ClientState {
                handler: Some(RecordingHandler::new().boxed()),
                attempt: None,
                backoff: Backoff::new(BackoffConfig::default()),
                retry_timer: None,
            }),
        });
        let (attempt, queue) = CallAttempt::new(Arc::clone(&shared));
        let mut state = shared.state.lock();
        state.attempt = Some(Arc::clone(&attempt));
        attempt.start_locked(&mut state, queue);
        attempt
    }

    #[tokio::test]
    async fn repeated_cancels_submit_one_batch() {
        let transport = MockTransport::new();
        let attempt = started_attempt(&transport);
        let call = transport.next_call().await;

        attempt.cancel();
        attempt.cancel();
        attempt.cancel();

        assert_eq!(call.cancel_count(), 1);
    }

    #[tokio::test]
    async fn concurrent_cancels_submit_one_batch() {
        let transport = MockTransport::new();
        let attempt = started_attempt(&transport);
        let call = transport.next_call().await;

        let first = Arc::clone(&attempt);
        let second = Arc::clone(&attempt);
        let tasks =
            [tokio::spawn(async move { first.cancel() }), tokio::spawn(async move { second.cancel() })];
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(call.cancel_count(), 1);
    }
}
