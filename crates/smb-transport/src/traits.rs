use futures_core::future::BoxFuture;

use crate::Result;

/// Sending half of a transport.
pub trait SmbTransportWrite: Send {
    /// Sends one complete SMB2 message (or compound chain), adding any framing.
    fn send<'a>(&'a mut self, message: &'a [u8]) -> BoxFuture<'a, Result<()>>;
}

/// Receiving half of a transport.
pub trait SmbTransportRead: Send {
    /// Receives the next complete message, with framing removed.
    fn receive(&mut self) -> BoxFuture<'_, Result<Vec<u8>>>;
}

/// A connected, bidirectional transport.
pub trait SmbTransport: SmbTransportRead + SmbTransportWrite {
    /// Splits the transport into independently owned halves.
    fn split(self: Box<Self>) -> Result<(Box<dyn SmbTransportRead>, Box<dyn SmbTransportWrite>)>;

    /// A printable peer name, used in logs.
    fn peer(&self) -> String;
}
