//! Common data types shared by the SMB2/3 protocol crates.
#![forbid(unsafe_code)]

pub mod binrw_util;
pub mod file_time;
pub mod guid;

pub use file_time::FileTime;
pub use guid::Guid;
pub use smb_dtyp_derive::mbitfield;

/// Errors produced while converting shared data types.
#[derive(thiserror::Error, Debug)]
pub enum DtypError {
    #[error("Invalid GUID string: {0}")]
    InvalidGuid(String),
    #[error("Invalid UTF-16 data: {0}")]
    InvalidUtf16(#[from] std::string::FromUtf16Error),
    #[error("Odd UTF-16 byte count: {0}")]
    OddUtf16Length(usize),
    #[error("Chained item at {0:#x} points past the end of its buffer")]
    ChainOverrun(u64),
    #[error("Chained item at {0:#x} is not aligned")]
    MisalignedChainItem(u64),
}
