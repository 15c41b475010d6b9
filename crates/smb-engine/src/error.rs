use std::time::Duration;

use smb_dtyp::Guid;
use smb_msg::{Command, ResponseContent, SmbMsgError, Status};
use smb_transport::TransportError;

/// Classification of engine errors, used by the recovery loop to decide between
/// retrying, surfacing and tearing down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The channel is gone; recovery is attempted before the caller sees anything.
    TransportFatal,
    /// A message could not be framed, decoded or matched.
    ProtocolMalformed,
    /// A non-blocking request found no credits.
    CreditExhausted,
    /// The server refused the operation; the status is passed through.
    Semantic,
    /// Lease or durable-handle state disagrees with what the server returned.
    LeaseInconsistency,
    /// Recovery failed; the session is unusable.
    Connectivity,
    /// The engine, a handle or the configuration is not in a usable state.
    State,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Message processing error: {0}")]
    Message(#[from] SmbMsgError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Operation timed out after {0:?}")]
    OperationTimeout(Duration),
    #[error("Out of credits: {needed} needed, {available} available")]
    OutOfCredits { needed: u16, available: usize },
    #[error("{command} failed: {}", Status::try_display_as_status(*status))]
    ServerStatus {
        status: u32,
        command: Command,
        /// The command body the server sent along with the failure, when there is one.
        aux: Option<Box<ResponseContent>>,
    },
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Negotiation error: {0}")]
    NegotiationError(String),
    #[error("Negotiate validation failed: {0} differs from the original negotiation")]
    NegotiateMismatch(&'static str),
    #[error("Authentication failed: {0}")]
    AuthenticationError(String),
    #[error("Unexpected message: {0}")]
    InvalidMessage(String),
    #[error("Lease key mismatch: expected {expected}, got {actual}")]
    LeaseKeyMismatch { expected: Guid, actual: Guid },
    #[error("Lease inconsistency: {0}")]
    LeaseInconsistency(String),
    #[error("Transform error: {0}")]
    Transform(String),
    #[error("Handle was revoked after a failed reconnect")]
    HandleRevoked,
    #[error("Operation cancelled")]
    Cancelled,
    #[error("Callback failed: {0}")]
    Callback(String),
    #[error("Unable to re-establish the connection: {0}")]
    Connectivity(Box<Error>),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Transport(e) if e.is_fatal() => ErrorKind::TransportFatal,
            Error::Transport(_) => ErrorKind::Connectivity,
            Error::ConnectionClosed | Error::OperationTimeout(_) => ErrorKind::TransportFatal,
            Error::Message(_)
            | Error::InvalidMessage(_)
            | Error::LeaseKeyMismatch { .. }
            | Error::Transform(_)
            | Error::NegotiationError(_)
            | Error::NegotiateMismatch(_) => ErrorKind::ProtocolMalformed,
            Error::OutOfCredits { .. } => ErrorKind::CreditExhausted,
            Error::ServerStatus { .. }
            | Error::AuthenticationError(_)
            | Error::Cancelled
            | Error::Callback(_) => ErrorKind::Semantic,
            Error::LeaseInconsistency(_) => ErrorKind::LeaseInconsistency,
            Error::Connectivity(_) => ErrorKind::Connectivity,
            Error::InvalidConfiguration(_)
            | Error::InvalidState(_)
            | Error::InvalidArgument(_)
            | Error::HandleRevoked => ErrorKind::State,
        }
    }

    /// Whether the failure means the channel must be rebuilt.
    pub fn is_transport_fatal(&self) -> bool {
        self.kind() == ErrorKind::TransportFatal
    }

    /// The NT status the server returned, for semantic failures.
    pub fn status(&self) -> Option<u32> {
        match self {
            Error::ServerStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}
