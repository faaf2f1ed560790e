//! Persistent, self-healing streaming RPC client.
//!
//! `streamkeeper` keeps one long-lived server-streaming call alive on an
//! already-connected transport. It sends a single request, closes the send
//! side, and then drains response messages indefinitely, reporting each one
//! to a pluggable event handler. When the call fails it heals itself:
//!
//! - an attempt that delivered at least one response restarts immediately,
//!   with the retry backoff reset;
//! - an attempt that made no progress restarts after an exponentially
//!   growing, jittered delay;
//! - a terminal `Unimplemented` status stops retries permanently, because the
//!   peer does not speak the protocol at all.
//!
//! The crate never establishes connections itself: the transport is handed in
//! as a [`ConnectedTransport`] trait object, and the client only allocates
//! calls on it. Response messages are pulled lazily, chunk by chunk, through
//! [`MessageBody`], so a message is assembled only as wire data arrives.
//!
//! # Structure
//!
//! - [`StreamClient`] is the orchestrator: retry policy, the single active
//!   attempt, shutdown.
//! - Each attempt drains its own completion queue (the [`Combiner`]) from one
//!   task, so per-call events are processed strictly in order.
//! - [`StreamEventHandler`] is the owner-side collaborator: it names the RPC,
//!   encodes the request, and consumes responses and terminal statuses.
//! - [`mock`] provides a scriptable transport and a recording handler for
//!   tests.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use streamkeeper::StreamClient;
//! # fn transport() -> Arc<dyn streamkeeper::ConnectedTransport> { unimplemented!() }
//! # fn handler() -> Box<dyn streamkeeper::StreamEventHandler> { unimplemented!() }
//!
//! # async fn run() {
//! // Starts the first call attempt immediately.
//! let client = StreamClient::new(transport(), handler());
//!
//! // ... the client restarts the call on failure until ...
//! client.shutdown();
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backoff;
mod call;
mod client;
mod combiner;
mod error;
mod handler;
pub mod mock;
mod transport;

pub use backoff::{Backoff, BackoffConfig};
pub use client::{StreamClient, StreamClientConfig};
pub use combiner::{CallEvent, Combiner, CombinerQueue, Completion};
pub use error::{Result, StreamError};
pub use handler::StreamEventHandler;
pub use transport::{
    Batch, BatchOp, CallArgs, CallRef, ConnectedTransport, MessageBody, TransportCall,
    DEFAULT_BUFFER_ESTIMATE,
};
