//! Direct TCP (port 445) transport.
//!
//! Every message is preceded by a 4-byte header: a zero byte, then the message
//! length as a 24-bit big-endian integer.

use std::io::Cursor;
use std::net::SocketAddr;
use std::time::Duration;

use binrw::prelude::*;
use futures_core::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use crate::{Result, SmbTransport, SmbTransportRead, SmbTransportWrite, TransportError};

#[binrw::binrw]
#[brw(big, magic(b"\x00"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmbTcpMessageHeader {
    #[br(parse_with = binrw::helpers::read_u24)]
    #[bw(write_with = binrw::helpers::write_u24)]
    pub stream_protocol_length: u32,
}

impl SmbTcpMessageHeader {
    pub const SIZE: usize = 4;
    pub const MAX_LENGTH: usize = 0x00ff_ffff;

    pub fn to_bytes(self) -> Result<[u8; Self::SIZE]> {
        let mut cursor = Cursor::new([0u8; Self::SIZE]);
        self.write(&mut cursor)?;
        Ok(cursor.into_inner())
    }
}

async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &[u8],
    timeout: Duration,
) -> Result<()> {
    if message.len() > SmbTcpMessageHeader::MAX_LENGTH {
        return Err(TransportError::InvalidMessage(format!(
            "message of {} bytes does not fit a direct TCP frame",
            message.len()
        )));
    }
    let header = SmbTcpMessageHeader {
        stream_protocol_length: message.len() as u32,
    }
    .to_bytes()?;
    let send = async {
        writer.write_all(&header).await?;
        writer.write_all(message).await?;
        writer.flush().await
    };
    tokio::time::timeout(timeout, send)
        .await
        .map_err(|_| TransportError::Timeout(timeout))??;
    Ok(())
}

async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let mut header = [0u8; SmbTcpMessageHeader::SIZE];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(TransportError::Closed);
        }
        Err(e) => return Err(e.into()),
    }
    let header = SmbTcpMessageHeader::read(&mut Cursor::new(&header))?;
    let mut message = vec![0u8; header.stream_protocol_length as usize];
    reader.read_exact(&mut message).await?;
    log::trace!("Received {} bytes frame", message.len());
    Ok(message)
}

pub struct TcpTransport {
    stream: TcpStream,
    peer: SocketAddr,
    timeout: Duration,
}

impl TcpTransport {
    /// Connects to `address`, giving up after `timeout`.
    pub async fn connect(address: SocketAddr, timeout: Duration) -> Result<TcpTransport> {
        log::debug!("Connecting to {address}");
        let stream = tokio::time::timeout(timeout, TcpStream::connect(address))
            .await
            .map_err(|_| TransportError::Timeout(timeout))??;
        stream.set_nodelay(true)?;
        Ok(TcpTransport {
            stream,
            peer: address,
            timeout,
        })
    }
}

impl SmbTransportWrite for TcpTransport {
    fn send<'a>(&'a mut self, message: &'a [u8]) -> BoxFuture<'a, Result<()>> {
        Box::pin(write_frame(&mut self.stream, message, self.timeout))
    }
}

impl SmbTransportRead for TcpTransport {
    fn receive(&mut self) -> BoxFuture<'_, Result<Vec<u8>>> {
        Box::pin(read_frame(&mut self.stream))
    }
}

impl SmbTransport for TcpTransport {
    fn split(self: Box<Self>) -> Result<(Box<dyn SmbTransportRead>, Box<dyn SmbTransportWrite>)> {
        let (read, write) = self.stream.into_split();
        Ok((
            Box::new(TcpReader { read }),
            Box::new(TcpWriter {
                write,
                timeout: self.timeout,
            }),
        ))
    }

    fn peer(&self) -> String {
        self.peer.to_string()
    }
}

struct TcpReader {
    read: OwnedReadHalf,
}

impl SmbTransportRead for TcpReader {
    fn receive(&mut self) -> BoxFuture<'_, Result<Vec<u8>>> {
        Box::pin(read_frame(&mut self.read))
    }
}

struct TcpWriter {
    write: OwnedWriteHalf,
    timeout: Duration,
}

impl SmbTransportWrite for TcpWriter {
    fn send<'a>(&'a mut self, message: &'a [u8]) -> BoxFuture<'a, Result<()>> {
        Box::pin(write_frame(&mut self.write, message, self.timeout))
    }
}
