//! SMB2/3 message definitions, read and written with [`binrw`].
//!
//! Every message is read and written from the start of its 64-byte [`Header`], so
//! the absolute offsets the protocol stores are stream positions. A body's leading
//! `StructureSize` word is asserted before any other field is read, and a mismatch
//! surfaces as [`SmbMsgError::BadStructureSize`].

pub mod create;
pub mod create_context;
pub mod echo;
pub mod error;
pub mod file;
pub mod header;
pub mod info;
pub mod ioctl;
pub mod lock;
pub mod message;
pub mod negotiate;
pub mod notify;
pub mod oplock;
pub mod plain;
pub mod query_dir;
pub mod session_setup;
pub mod tree_connect;


pub use create::*;
pub use create_context::*;
pub use echo::*;
pub use error::*;
pub use file::*;
pub use header::*;
pub use info::*;
pub use ioctl::*;
pub use lock::*;
pub use message::*;
pub use negotiate::*;
pub use notify::*;
pub use oplock::*;
pub use plain::*;
pub use query_dir::*;
pub use session_setup::*;
pub use tree_connect::*;

/// Errors produced while encoding or decoding SMB2 messages.
#[derive(thiserror::Error, Debug)]
pub enum SmbMsgError {
    #[error("binrw error: {0}")]
    BinRw(binrw::Error),
    #[error("data type error: {0}")]
    Dtyp(#[from] smb_dtyp::DtypError),
    #[error("{name}: bad structure size (expected {expected}, got {actual})")]
    BadStructureSize {
        name: &'static str,
        expected: u16,
        actual: u16,
    },
    #[error("message truncated: needed {needed} bytes at offset {offset}, buffer has {available}")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },
    #[error("invalid protocol id {0:#010x}")]
    InvalidProtocolId(u32),
    #[error("unknown command {0:#06x}")]
    UnknownCommand(u16),
    #[error("invalid dialect {0:#06x}")]
    InvalidDialect(u16),
    #[error("context chain runs past its declared length at offset {0}")]
    ContextChainOverrun(usize),
    #[error("context at offset {0} is not 8-byte aligned")]
    MisalignedContext(usize),
    #[error("unknown create context {0:?}")]
    UnknownCreateContext(String),
    #[error("invalid create context {name:?}: {reason}")]
    InvalidCreateContext { name: String, reason: &'static str },
    #[error("invalid compound chain: next command offset {0}")]
    InvalidCompoundOffset(u32),
    #[error("unexpected content: expected {expected}, got {actual}")]
    UnexpectedContent {
        expected: &'static str,
        actual: &'static str,
    },
    #[error("invalid data: {0}")]
    InvalidData(String),
    #[error("missing error code definition for {0:#010x}")]
    MissingErrorCodeDefinition(u32),
}

pub type Result<T> = std::result::Result<T, SmbMsgError>;

/// Where a buffer stored at an absolute `offset` starts. Servers may leave any
/// offset on an empty buffer, so those are read in place.
pub(crate) fn buffer_start(offset: u64, length: u64) -> std::io::SeekFrom {
    if length == 0 {
        std::io::SeekFrom::Current(0)
    } else {
        std::io::SeekFrom::Start(offset)
    }
}

impl From<binrw::Error> for SmbMsgError {
    fn from(err: binrw::Error) -> Self {
        framing_error(&err).unwrap_or(SmbMsgError::BinRw(err))
    }
}

/// Finds the first framing failure raised while reading, looking through
/// backtraces and the errors of every enum variant tried.
fn framing_error(err: &binrw::Error) -> Option<SmbMsgError> {
    match err {
        binrw::Error::Backtrace(backtrace) => framing_error(&backtrace.error),
        binrw::Error::EnumErrors { variant_errors, .. } => variant_errors
            .iter()
            .find_map(|(_, variant_err)| framing_error(variant_err)),
        binrw::Error::Custom { err, .. } => {
            if let Some(msg_err) = err.downcast_ref::<SmbMsgError>() {
                return msg_err.clone_framing();
            }
            match err.downcast_ref::<smb_dtyp::DtypError>()? {
                smb_dtyp::DtypError::ChainOverrun(pos) => {
                    Some(SmbMsgError::ContextChainOverrun(*pos as usize))
                }
                smb_dtyp::DtypError::MisalignedChainItem(pos) => {
                    Some(SmbMsgError::MisalignedContext(*pos as usize))
                }
                _ => None,
            }
        }
        _ => None,
    }
}

impl SmbMsgError {
    fn clone_framing(&self) -> Option<SmbMsgError> {
        Some(match self {
            SmbMsgError::BadStructureSize {
                name,
                expected,
                actual,
            } => SmbMsgError::BadStructureSize {
                name: *name,
                expected: *expected,
                actual: *actual,
            },
            SmbMsgError::ContextChainOverrun(pos) => SmbMsgError::ContextChainOverrun(*pos),
            SmbMsgError::MisalignedContext(pos) => SmbMsgError::MisalignedContext(*pos),
            SmbMsgError::UnknownCreateContext(name) => {
                SmbMsgError::UnknownCreateContext(name.clone())
            }
            SmbMsgError::InvalidCreateContext { name, reason } => {
                SmbMsgError::InvalidCreateContext {
                    name: name.clone(),
                    reason: *reason,
                }
            }
            SmbMsgError::InvalidDialect(dialect) => SmbMsgError::InvalidDialect(*dialect),
            SmbMsgError::MissingErrorCodeDefinition(code) => {
                SmbMsgError::MissingErrorCodeDefinition(*code)
            }
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_framing_error_found_through_enum_variants() {
        let err = binrw::Error::EnumErrors {
            pos: 64,
            variant_errors: vec![
                (
                    "Create",
                    binrw::Error::AssertFail {
                        pos: 64,
                        message: "pre_assert".into(),
                    },
                ),
                (
                    "Close",
                    binrw::Error::Custom {
                        pos: 64,
                        err: Box::new(SmbMsgError::BadStructureSize {
                            name: "CloseResponse",
                            expected: 60,
                            actual: 59,
                        }),
                    },
                ),
            ],
        };
        assert!(matches!(
            SmbMsgError::from(err),
            SmbMsgError::BadStructureSize {
                name: "CloseResponse",
                expected: 60,
                actual: 59
            }
        ));
    }

    #[test]
    fn test_chain_errors_mapped() {
        let err = binrw::Error::Custom {
            pos: 8,
            err: Box::new(smb_dtyp::DtypError::ChainOverrun(8)),
        };
        assert!(matches!(
            SmbMsgError::from(err),
            SmbMsgError::ContextChainOverrun(8)
        ));
    }

    #[test]
    fn test_other_errors_kept() {
        let err = binrw::Error::Io(std::io::ErrorKind::UnexpectedEof.into());
        assert!(matches!(SmbMsgError::from(err), SmbMsgError::BinRw(_)));
    }
}
