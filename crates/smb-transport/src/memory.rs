//! In-process transport: two ends joined by message channels.
//!
//! Messages keep their boundaries, so no framing is added. Dropping either end's
//! writer closes the other end's reader.

use futures_core::future::BoxFuture;
use tokio::sync::mpsc;

use crate::{Result, SmbTransport, SmbTransportRead, SmbTransportWrite, TransportError};

pub struct MemoryTransport {
    reader: MemoryReader,
    writer: MemoryWriter,
    name: String,
}

impl MemoryTransport {
    /// Creates two connected ends, e.g. a client and a stub server.
    pub fn pair(name: &str) -> (MemoryTransport, MemoryTransport) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            MemoryTransport {
                reader: MemoryReader { rx: b_rx },
                writer: MemoryWriter { tx: Some(a_tx) },
                name: format!("{name}/client"),
            },
            MemoryTransport {
                reader: MemoryReader { rx: a_rx },
                writer: MemoryWriter { tx: Some(b_tx) },
                name: format!("{name}/server"),
            },
        )
    }

    /// Closes the sending direction; the peer's next `receive` fails.
    pub fn shutdown(&mut self) {
        self.writer.tx = None;
    }
}

struct MemoryReader {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl SmbTransportRead for MemoryReader {
    fn receive(&mut self) -> BoxFuture<'_, Result<Vec<u8>>> {
        Box::pin(async move { self.rx.recv().await.ok_or(TransportError::Closed) })
    }
}

struct MemoryWriter {
    tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

impl SmbTransportWrite for MemoryWriter {
    fn send<'a>(&'a mut self, message: &'a [u8]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let tx = self.tx.as_ref().ok_or(TransportError::NotConnected)?;
            tx.send(message.to_vec()).map_err(|_| TransportError::Closed)
        })
    }
}

impl SmbTransportRead for MemoryTransport {
    fn receive(&mut self) -> BoxFuture<'_, Result<Vec<u8>>> {
        self.reader.receive()
    }
}

impl SmbTransportWrite for MemoryTransport {
    fn send<'a>(&'a mut self, message: &'a [u8]) -> BoxFuture<'a, Result<()>> {
        self.writer.send(message)
    }
}

impl SmbTransport for MemoryTransport {
    fn split(self: Box<Self>) -> Result<(Box<dyn SmbTransportRead>, Box<dyn SmbTransportWrite>)> {
        let MemoryTransport { reader, writer, .. } = *self;
        Ok((Box::new(reader), Box::new(writer)))
    }

    fn peer(&self) -> String {
        self.name.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_log::test(tokio::test)]
    async fn test_pair_exchange() {
        let (client, mut server) = MemoryTransport::pair("t");
        let (mut read, mut write) = Box::new(client).split().unwrap();
        write.send(b"ping").await.unwrap();
        assert_eq!(server.receive().await.unwrap(), b"ping");
        server.send(b"pong").await.unwrap();
        assert_eq!(read.receive().await.unwrap(), b"pong");
    }

    #[test_log::test(tokio::test)]
    async fn test_shutdown_closes_peer() {
        let (mut client, mut server) = MemoryTransport::pair("t");
        server.shutdown();
        let err = client.receive().await.unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(
            server.send(b"late").await,
            Err(TransportError::NotConnected)
        ));
    }
}
