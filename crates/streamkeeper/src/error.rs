//! Error types for the stream client.
//!
//! Errors here are local to a single call attempt: none of them are fatal to
//! the [`StreamClient`](crate::StreamClient), which always has a recovery path
//! (immediate restart or delayed retry). The one permanent case, a terminal
//! [`Code::Unimplemented`] status, is classified at the status level, not
//! here, because it arrives as a trailing status rather than as an error.

use snafu::{Location, Snafu};
use tonic::{Code, Status};

/// Result type alias for stream-client operations.
pub type Result<T, E = StreamError> = std::result::Result<T, E>;

/// Errors raised by the transport collaborators or the event handler while an
/// attempt is in flight.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StreamError {
    /// The transport could not allocate a call on the connection.
    #[snafu(display("failed to create call at {location}: {message}"))]
    CallCreation {
        /// Error description from the transport.
        message: String,
        /// Source location.
        #[snafu(implicit)]
        location: Location,
    },

    /// A message-body read failed partway through assembly.
    #[snafu(display("message read failed: {message}"))]
    Read {
        /// Failure description.
        message: String,
    },

    /// An RPC-level failure carrying a status code.
    #[snafu(display("rpc error (code={code:?}): {message}"))]
    Rpc {
        /// Status code reported by the peer or transport.
        code: Code,
        /// Error message.
        message: String,
    },

    /// The event handler rejected a fully assembled response message.
    #[snafu(display("handler rejected response message: {message}"))]
    Rejected {
        /// Rejection reason (typically a parse failure).
        message: String,
    },
}

impl StreamError {
    /// Returns the status code associated with this error, if any.
    #[must_use]
    pub fn code(&self) -> Option<Code> {
        match self {
            Self::Rpc { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<Status> for StreamError {
    fn from(status: Status) -> Self {
        Self::Rpc { code: status.code(), message: status.message().to_owned() }
    }
}

impl From<StreamError> for Status {
    fn from(err: StreamError) -> Self {
        match err {
            StreamError::Rpc { code, message } => Status::new(code, message),
            StreamError::CallCreation { message, .. } => Status::unavailable(message),
            StreamError::Read { message } => Status::internal(message),
            StreamError::Rejected { message } => Status::invalid_argument(message),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn from_status_preserves_code_and_message() {
        let status = Status::unavailable("server going away");
        let err = StreamError::from(status);
        assert!(matches!(err, StreamError::Rpc { code: Code::Unavailable, .. }));
        assert_eq!(err.code(), Some(Code::Unavailable));
        assert!(err.to_string().contains("server going away"));
    }

    #[test]
    fn round_trip_rpc_error_to_status() {
        let err = StreamError::Rpc { code: Code::Aborted, message: "conflict".to_owned() };
        let status = Status::from(err);
        assert_eq!(status.code(), Code::Aborted);
        assert_eq!(status.message(), "conflict");
    }

    #[test]
    fn creation_failure_maps_to_unavailable() {
        let err = CallCreationSnafu { message: "no transport slots" }.build();
        assert_eq!(err.code(), None);
        let status = Status::from(err);
        assert_eq!(status.code(), Code::Unavailable);
    }

    #[test]
    fn rejection_maps_to_invalid_argument() {
        let err = StreamError::Rejected { message: "truncated payload".to_owned() };
        let status = Status::from(err);
        assert_eq!(status.code(), Code::InvalidArgument);
    }
}
