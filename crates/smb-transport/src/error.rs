use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Not connected.")]
    NotConnected,
    #[error("Already connected.")]
    AlreadyConnected,
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("Peer closed the connection.")]
    Closed,
    #[error("Invalid message: {0}")]
    InvalidMessage(String),
    #[error("Binrw error: {0}")]
    BinRWError(#[from] binrw::Error),
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
}

impl TransportError {
    /// Whether the connection can no longer be used and must be re-established.
    ///
    /// Framing errors count as fatal: once a length prefix is wrong the stream
    /// cannot be resynchronized.
    pub fn is_fatal(&self) -> bool {
        match self {
            TransportError::IoError(e) => !matches!(
                e.kind(),
                std::io::ErrorKind::InvalidInput | std::io::ErrorKind::Unsupported
            ),
            TransportError::NotConnected
            | TransportError::Timeout(_)
            | TransportError::Closed
            | TransportError::InvalidMessage(_)
            | TransportError::BinRWError(_) => true,
            TransportError::AlreadyConnected | TransportError::InvalidAddress(_) => false,
        }
    }
}
