#![forbid(unsafe_code)]
//! Transports carrying whole SMB2 messages between client and server.
//!
//! A transport is split once into a read half, owned by a connection's receive
//! worker, and a write half shared by every sender.

pub mod error;
pub mod memory;
pub mod tcp;
pub mod traits;

pub use error::TransportError;
pub use memory::MemoryTransport;
pub use tcp::{SmbTcpMessageHeader, TcpTransport};
pub use traits::*;

pub type Result<T> = std::result::Result<T, TransportError>;
