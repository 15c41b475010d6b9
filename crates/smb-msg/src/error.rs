//! SMB2 ERROR response body.

use binrw::io::Cursor;
use binrw::prelude::*;
use smb_msg_derive::*;

use crate::Result;

/// Sent instead of the command's own response body when a request fails, and
/// with an interim STATUS_PENDING.
///
/// Reference: MS-SMB2 2.2.2
#[smb_response(size = 9)]
#[derive(Default)]
pub struct ErrorResponse {
    /// Nonzero only on 3.1.1, where `error_data` holds that many error contexts.
    pub error_context_count: u8,
    reserved: u8,
    #[bw(try_calc = error_data.len().try_into())]
    #[br(temp)]
    _byte_count: u32,
    // A zero byte count may still be followed by one pad byte, left unread.
    #[br(count = _byte_count)]
    pub error_data: Vec<u8>,
}

/// One 3.1.1 error context, as found in [`ErrorResponse::error_data`].
///
/// Reference: MS-SMB2 2.2.2.1
#[smb_response_binrw]
pub struct ErrorContext {
    #[brw(align_before = 8)]
    #[bw(try_calc = data.len().try_into())]
    #[br(temp)]
    _data_length: u32,
    pub error_id: ErrorId,
    #[br(count = _data_length)]
    pub data: Vec<u8>,
}

#[smb_response_binrw]
#[derive(Copy, Hash)]
#[brw(repr(u32))]
pub enum ErrorId {
    Default = 0,
    ShareRedirect = 0x72645253,
}

impl ErrorResponse {
    /// Parses `error_data` as a list of 3.1.1 error contexts, each aligned to 8 bytes.
    pub fn contexts(&self) -> Result<Vec<ErrorContext>> {
        let mut cursor = Cursor::new(self.error_data.as_slice());
        (0..self.error_context_count)
            .map(|_| Ok(ErrorContext::read_le(&mut cursor)?))
            .collect()
    }

    /// Interprets the data as a single little-endian u32, as sent with
    /// STATUS_BUFFER_TOO_SMALL to report the required size.
    pub fn as_u32(&self) -> Option<u32> {
        let bytes: [u8; 4] = self.error_data.as_slice().try_into().ok()?;
        Some(u32::from_le_bytes(bytes))
    }
}
