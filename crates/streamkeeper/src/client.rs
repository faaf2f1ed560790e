//! Stream-client orchestrator.
//!
//! [`StreamClient`] owns the retry policy, the single currently-active call
//! attempt, and the pluggable event handler. It starts the first attempt at
//! construction, restarts on failure (immediately after progress, after a
//! backoff delay otherwise), and tears everything down on
//! [`shutdown`](StreamClient::shutdown).
//!
//! All shared state lives behind one mutex: the timer task, an attempt's
//! terminal report, and an external shutdown can arrive concurrently from
//! different tasks, and each takes the lock before touching the handler,
//! attempt slot, or timer.

use std::{fmt, sync::Arc};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    backoff::{Backoff, BackoffConfig},
    call::CallAttempt,
    handler::StreamEventHandler,
    transport::ConnectedTransport,
};

/// Configuration for a [`StreamClient`].
#[derive(Debug, Clone)]
pub struct StreamClientConfig {
    /// Label attached to every log event this client emits.
    pub name: &'static str,

    /// Retry backoff parameters.
    pub backoff: BackoffConfig,
}

impl Default for StreamClientConfig {
    fn default() -> Self {
        Self { name: "stream-client", backoff: BackoffConfig::default() }
    }
}

/// Persistent, self-healing streaming RPC client bound to one transport
/// connection.
///
/// The client opens a long-lived server-streaming call, reports each response
/// message to its [`StreamEventHandler`], and automatically restarts the call
/// when it fails: immediately (with the backoff reset) if the failed attempt
/// delivered at least one response, after an exponentially growing delay if
/// it never made progress. A terminal [`Code::Unimplemented`](tonic::Code)
/// status stops retries for good.
///
/// Cloning produces another handle to the same client. Construction must
/// happen within a tokio runtime; it starts the first attempt immediately and
/// cannot fail.
#[derive(Clone)]
pub struct StreamClient {
    pub(crate) shared: Arc<ClientShared>,
}

pub(crate) struct ClientShared {
    pub(crate) transport: Arc<dyn ConnectedTransport>,
    pub(crate) name: &'static str,
    pub(crate) state: Mutex<ClientState>,
}

/// Mutable state guarded by the client mutex.
///
/// `handler: None` is the shutdown signal: once observed, no new attempt or
/// timer may ever be armed. `attempt` and `retry_timer` are mutually
/// exclusive except during the transition of restarting after the timer
/// fires.
pub(crate) struct ClientState {
    pub(crate) handler: Option<Box<dyn StreamEventHandler>>,
    pub(crate) attempt: Option<Arc<CallAttempt>>,
    pub(crate) backoff: Backoff,
    pub(crate) retry_timer: Option<CancellationToken>,
}

impl StreamClient {
    /// Creates a stream client with default configuration and starts the
    /// first call attempt.
    #[must_use]
    pub fn new(
        transport: Arc<dyn ConnectedTransport>,
        handler: Box<dyn StreamEventHandler>,
    ) -> Self {
        Self::with_config(transport, handler, StreamClientConfig::default())
    }

    /// Creates a stream client with explicit configuration and starts the
    /// first call attempt.
    #[must_use]
    pub fn with_config(
        transport: Arc<dyn ConnectedTransport>,
        handler: Box<dyn StreamEventHandler>,
        config: StreamClientConfig,
    ) -> Self {
        let shared = Arc::new(ClientShared {
            transport,
            name: config.name,
            state: Mutex::new(ClientState {
                handler: Some(handler),
                attempt: None,
                backoff: Backoff::new(config.backoff),
                retry_timer: None,
            }),
        });
        debug!(client = shared.name, "created stream client");

        {
            let mut state = shared.state.lock();
            shared.start_attempt_locked(&mut state);
        }

        Self { shared }
    }

    /// Shuts the client down.
    ///
    /// Discards the event handler (all future retries become no-ops),
    /// requests cancellation of the active attempt without waiting for its
    /// teardown, and cancels a pending retry timer. Safe to call more than
    /// once.
    pub fn shutdown(&self) {
        debug!(client = self.shared.name, "stream client shutting down");
        let attempt = {
            let mut state = self.shared.state.lock();
            state.handler = None;
            if let Some(token) = state.retry_timer.take() {
                token.cancel();
            }
            state.attempt.take()
        };
        // Cancel outside the lock; the attempt's terminal path re-acquires it.
        if let Some(attempt) = attempt {
            attempt.cancel();
        }
    }

    /// Returns true once [`shutdown`](Self::shutdown) has been called.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shared.state.lock().handler.is_none()
    }
}

impl fmt::Debug for StreamClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamClient").field("name", &self.shared.name).finish_non_exhaustive()
    }
}

impl ClientShared {
    /// Returns a public handle to this client, for handler callbacks.
    pub(crate) fn handle(self: &Arc<Self>) -> StreamClient {
        StreamClient { shared: Arc::clone(self) }
    }

    /// Starts a new call attempt. No-op after shutdown.
    pub(crate) fn start_attempt_locked(self: &Arc<Self>, state: &mut ClientState) {
        if state.handler.is_none() {
            return;
        }
        debug_assert!(state.attempt.is_none(), "attempt already in flight");

        let handle = self.handle();
        if let Some(handler) = state.handler.as_mut() {
            handler.on_call_start(&handle);
        }

        let (attempt, queue) = CallAttempt::new(Arc::clone(self));
        debug!(client = self.name, "starting call attempt");
        state.attempt = Some(Arc::clone(&attempt));
        attempt.start_locked(state, queue);
    }

    /// Arms the retry timer with the next backoff delay. No-op after
    /// shutdown.
    pub(crate) fn arm_retry_timer_locked(self: &Arc<Self>, state: &mut ClientState) {
        if state.handler.is_none() {
            return;
        }

        let handle = self.handle();
        if let Some(handler) = state.handler.as_mut() {
            handler.on_retry_timer_start(&handle);
        }

        let delay = state.backoff.next_delay();
        debug!(
            client = self.name,
            delay_ms = delay.as_millis() as u64,
            "stream lost with no progress; will retry after backoff"
        );

        let token = CancellationToken::new();
        state.retry_timer = Some(token.clone());

        // The spawned task holds its own reference to the client for as long
        // as the timer is pending.
        let client = Arc::clone(self);
        tokio::spawn(async move {
            let fired = tokio::select! {
                biased;
                () = token.cancelled() => false,
                () = tokio::time::sleep(delay) => true,
            };
            client.on_retry_timer(fired);
        });
    }

    /// Timer callback: clears the pending flag and restarts the call if the
    /// timer fired cleanly and nothing else got there first.
    fn on_retry_timer(self: &Arc<Self>, fired: bool) {
        let mut state = self.state.lock();
        state.retry_timer = None;
        if fired && state.handler.is_some() && state.attempt.is_none() {
            debug!(client = self.name, "restarting stream after retry delay");
            self.start_attempt_locked(&mut state);
        }
    }
}
