//! SESSION_SETUP and LOGOFF.

use binrw::prelude::*;
use modular_bitfield::prelude::*;
use smb_dtyp::binrw_util::prelude::*;
use smb_msg_derive::*;

use crate::buffer_start;

/// Carries one leg of the GSS exchange. The whole token must fit in a single
/// request: a 16-bit length, and nothing larger than the negotiated transact size.
///
/// Reference: MS-SMB2 2.2.5
#[smb_request(size = 25)]
pub struct SessionSetupRequest {
    pub flags: SetupRequestFlags,
    pub security_mode: SessionSecurityMode,
    pub capabilities: NegotiateCapabilities,
    // Channel
    reserved: u32,
    #[bw(calc = PosMarker::default())]
    #[br(temp)]
    _security_buffer_offset: PosMarker<u16>,
    #[bw(try_calc = buffer.len().try_into())]
    #[br(temp)]
    _security_buffer_length: u16,
    /// Set when re-establishing a session that was lost with the previous connection.
    pub previous_session_id: u64,
    #[br(seek_before = buffer_start(_security_buffer_offset.value.into(), _security_buffer_length.into()))]
    #[br(count = _security_buffer_length)]
    #[bw(write_with = PosMarker::write_aoff, args(&_security_buffer_offset))]
    pub buffer: Vec<u8>,
}

#[smb_dtyp::mbitfield]
pub struct SessionSecurityMode {
    pub signing_enabled: bool,
    pub signing_required: bool,
    #[skip]
    __: B6,
}

#[smb_dtyp::mbitfield]
pub struct SetupRequestFlags {
    /// Bind an existing session to a new channel.
    pub binding: bool,
    #[skip]
    __: B7,
}

#[smb_dtyp::mbitfield]
pub struct NegotiateCapabilities {
    pub dfs: bool,
    #[skip]
    __: B31,
}

/// Reference: MS-SMB2 2.2.6
#[smb_response(size = 9)]
pub struct SessionSetupResponse {
    pub session_flags: SessionFlags,
    #[bw(calc = PosMarker::default())]
    #[br(temp)]
    _security_buffer_offset: PosMarker<u16>,
    #[bw(try_calc = buffer.len().try_into())]
    #[br(temp)]
    _security_buffer_length: u16,
    #[br(seek_before = buffer_start(_security_buffer_offset.value.into(), _security_buffer_length.into()))]
    #[br(count = _security_buffer_length)]
    #[bw(write_with = PosMarker::write_aoff, args(&_security_buffer_offset))]
    pub buffer: Vec<u8>,
}

#[smb_dtyp::mbitfield]
pub struct SessionFlags {
    pub is_guest: bool,
    pub is_null_session: bool,
    pub encrypt_data: bool,
    #[skip]
    __: B13,
}

impl SessionFlags {
    pub fn is_guest_or_null_session(&self) -> bool {
        self.is_guest() || self.is_null_session()
    }
}

#[smb_request(size = 4)]
#[derive(Default)]
pub struct LogoffRequest {
    reserved: u16,
}

#[smb_response(size = 4)]
#[derive(Default)]
pub struct LogoffResponse {
    reserved: u16,
}
