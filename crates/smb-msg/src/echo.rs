//! ECHO and CANCEL, both bare four-byte bodies.

use binrw::prelude::*;
use smb_msg_derive::*;

/// SMB2 ECHO request and response.
///
/// Reference: MS-SMB2 2.2.28, 2.2.29
#[smb_request_response(size = 4)]
#[derive(Default)]
pub struct EchoMessage {
    reserved: u16,
}

pub use EchoMessage as EchoRequest;
pub use EchoMessage as EchoResponse;

/// Cancels a pending request. Sent with the message id (or async id) of the
/// request being cancelled, and never charged credits.
///
/// Reference: MS-SMB2 2.2.30
#[smb_request(size = 4)]
#[derive(Default)]
pub struct CancelRequest {
    reserved: u16,
}
