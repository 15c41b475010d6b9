#![forbid(unsafe_code)]
//! SMB2/3 client protocol engine.
//!
//! The engine negotiates a dialect, establishes sessions over one or more channels,
//! multiplexes requests with credit-based flow control and recovers in-flight work
//! across disconnects using durable handles, leases and replayed requests.
//!
//! Transports, authentication and the cryptographic transform are collaborators
//! supplied by the caller; see [`Connector`], [`AuthenticatorFactory`] and
//! [`TransformProvider`].

pub mod breaks;
pub mod bulk;
pub mod config;
pub mod connection;
pub mod credits;
pub mod dialects;
pub mod durable;
pub mod engine;
pub mod error;
pub mod handle;
pub mod lease;
pub mod locks;
pub mod multiplexer;
pub mod negotiate;
pub mod quantum;
pub mod reconnect;
pub mod session;
pub mod transform;
pub mod tree;

pub use config::{ConnectionConfig, DialectMask, QuantumConfig};
pub use dialects::DialectImpl;
pub use durable::{DurableHandle, HandleState, get_epoch_delta};
pub use engine::{Connector, FsCallbacks, NoCallbacks, SmbEngine};
pub use error::{Error, ErrorKind};
pub use handle::{CreateArgs, Durability, NotifyWatch, OpenHandle, copychunk_limits};
pub use lease::{LeaseEntry, LeaseRegistry, NodeId};
pub use locks::{ByteRangeLocks, HeldLock, LockId};
pub use multiplexer::{ChannelSelector, InFlight, Multiplexer, Request};
pub use quantum::{QuantumController, QuantumPlan};
pub use reconnect::Attempt;
pub use session::{Authenticator, AuthenticatorFactory, Session, SessionState};
pub use transform::{NoTransform, SealMode, TransformProvider};
pub use tree::{Share, TID_UNKNOWN};

pub use smb_dtyp::*;
pub use smb_msg::*;
pub use smb_transport as transport;

/// SMB engine result type.
pub type Result<T, E = crate::Error> = std::result::Result<T, E>;
