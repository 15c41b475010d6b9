//! OPLOCK_BREAK: classic oplock breaks, lease break notifications and their acknowledgments.
//!
//! All of them share command code 0x12 and are told apart by their structure size.

use binrw::prelude::*;
use modular_bitfield::prelude::*;
use smb_dtyp::Guid;
use smb_msg_derive::*;

use crate::{FileId, LeaseState, OplockLevel};

/// Oplock break notification, acknowledgment and response; the layout is shared.
///
/// On a notification the level is the most the server will allow; on the
/// acknowledgment it is what the client keeps.
///
/// Reference: MS-SMB2 2.2.23.1, 2.2.24.1, 2.2.25.1
#[smb_request_response(size = 24)]
#[derive(Copy)]
pub struct OplockBreakMsg {
    pub oplock_level: OplockLevel,
    reserved: u8,
    reserved: u32,
    pub file_id: FileId,
}

pub type OplockBreakNotify = OplockBreakMsg;
pub type OplockBreakAck = OplockBreakMsg;
pub type OplockBreakResponse = OplockBreakMsg;

#[smb_dtyp::mbitfield]
pub struct LeaseBreakFlags {
    pub ack_required: bool,
    #[skip]
    __: B31,
}

/// Sent by the server, unsolicited, when a lease must shrink.
///
/// Reference: MS-SMB2 2.2.23.2
#[smb_response(size = 44)]
#[derive(Copy)]
pub struct LeaseBreakNotify {
    /// Only meaningful on SMB 3.x with V2 leases.
    pub new_epoch: u16,
    pub flags: LeaseBreakFlags,
    pub lease_key: Guid,
    pub current_lease_state: LeaseState,
    pub new_lease_state: LeaseState,
    /// BreakReason, AccessMaskHint, ShareMaskHint
    reserved: [u8; 12],
}

/// Lease break acknowledgment (client) and its response (server).
///
/// Reference: MS-SMB2 2.2.24.2, 2.2.25.2
#[smb_request_response(size = 36)]
#[derive(Copy)]
pub struct LeaseBreakAckResponse {
    reserved: u16,
    /// Flags
    reserved: u32,
    pub lease_key: Guid,
    /// On the acknowledgment, a subset of the new state the server offered.
    pub lease_state: LeaseState,
    /// LeaseDuration
    reserved: u64,
}

pub type LeaseBreakAck = LeaseBreakAckResponse;
pub type LeaseBreakResponse = LeaseBreakAckResponse;
