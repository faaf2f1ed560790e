//! Pluggable event-handler collaborator.
//!
//! The stream client decides nothing about *what* RPC it keeps alive or how
//! to interpret response bytes; both are delegated to a
//! [`StreamEventHandler`] supplied at construction.

use bytes::Bytes;
use tonic::Code;

use crate::{client::StreamClient, error::StreamError};

/// Capability set the stream client requires from its owner.
///
/// All methods are invoked while the client's internal mutex is held, so the
/// handler's state is never observed concurrently with shutdown.
/// Implementations must not call back into `client` synchronously (for
/// example [`StreamClient::shutdown`]); doing so would deadlock. Re-schedule
/// such work onto the runtime instead.
pub trait StreamEventHandler: Send + 'static {
    /// Notified when a new call attempt begins.
    fn on_call_start(&mut self, client: &StreamClient);

    /// Notified when a retry delay has been armed.
    fn on_retry_timer_start(&mut self, client: &StreamClient);

    /// Returns the fixed logical RPC path for the call.
    fn request_path(&self) -> Bytes;

    /// Produces the single outbound request payload.
    fn encode_request(&self) -> Bytes;

    /// Delivers one fully assembled response message.
    ///
    /// # Errors
    ///
    /// Returning an error (typically a parse failure) cancels the current
    /// attempt.
    fn on_response(&mut self, client: &StreamClient, payload: &[u8]) -> Result<(), StreamError>;

    /// Delivers the terminal status of an attempt.
    fn on_call_ended(&mut self, client: &StreamClient, code: Code);
}
