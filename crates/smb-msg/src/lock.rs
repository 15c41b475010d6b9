//! Byte-range LOCK request and response.

use binrw::prelude::*;
use modular_bitfield::prelude::*;
use smb_msg_derive::*;

use crate::{FileId, SmbMsgError};

/// Locks or unlocks one or more ranges of a single open file.
///
/// Reference: MS-SMB2 2.2.26
#[smb_request(size = 48)]
pub struct LockRequest {
    #[bw(try_calc = locks.len().try_into())]
    #[br(temp)]
    _lock_count: u16,
    pub lock_sequence: LockSequence,
    pub file_id: FileId,
    /// Must not be empty.
    #[br(count = _lock_count)]
    #[bw(assert(
        !locks.is_empty(),
        SmbMsgError::InvalidData("lock request without elements".into())
    ))]
    pub locks: Vec<LockElement>,
}

/// Reserved on SMB 2.0.2; a 4-bit sequence number and its 1..=64 index otherwise.
#[smb_dtyp::mbitfield]
pub struct LockSequence {
    pub number: B4,
    pub index: B28,
}

/// Reference: MS-SMB2 2.2.26.1
#[smb_request_binrw]
#[derive(Copy)]
pub struct LockElement {
    pub offset: u64,
    pub length: u64,
    pub flags: LockFlag,
    reserved: u32,
}

#[smb_dtyp::mbitfield]
pub struct LockFlag {
    pub shared: bool,
    pub exclusive: bool,
    pub unlock: bool,
    pub fail_immediately: bool,
    #[skip]
    __: B28,
}

impl LockRequest {
    /// True if any element takes a lock, as opposed to only releasing ranges.
    pub fn acquires(&self) -> bool {
        self.locks
            .iter()
            .any(|l| l.flags.shared() || l.flags.exclusive())
    }
}

#[smb_response(size = 4)]
#[derive(Default)]
pub struct LockResponse {
    reserved: u16,
}
