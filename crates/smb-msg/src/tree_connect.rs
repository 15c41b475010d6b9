//! TREE_CONNECT and TREE_DISCONNECT.

use std::io::SeekFrom;

use binrw::prelude::*;
use modular_bitfield::prelude::*;
use smb_dtyp::binrw_util::prelude::*;
use smb_msg_derive::*;

/// Reference: MS-SMB2 2.2.9
#[smb_request(size = 9)]
pub struct TreeConnectRequest {
    // Flags; no tree connect extension is ever sent.
    reserved: u16,
    #[bw(calc = PosMarker::default())]
    #[br(temp)]
    _path_offset: PosMarker<u16>,
    #[bw(try_calc = path.size().try_into())]
    #[br(temp)]
    _path_length: u16,
    /// UNC path, `\\server\share`.
    #[br(seek_before = SeekFrom::Start(_path_offset.value.into()))]
    #[br(args { size: SizedStringSize::bytes16(_path_length) })]
    #[bw(write_with = PosMarker::write_aoff, args(&_path_offset))]
    pub path: SizedWideString,
}

impl TreeConnectRequest {
    pub fn new(path: &str) -> TreeConnectRequest {
        TreeConnectRequest { path: path.into() }
    }
}

#[smb_response_binrw]
#[derive(Copy)]
#[brw(repr(u8))]
pub enum ShareType {
    Disk = 0x1,
    Pipe = 0x2,
    Print = 0x3,
}

#[smb_dtyp::mbitfield]
pub struct ShareFlags {
    pub caching_mode: B4,
    pub dfs: bool,
    pub dfs_root: bool,
    #[skip]
    __: B2,
    pub restrict_exclusive_opens: bool,
    pub force_shared_delete: bool,
    pub allow_namespace_caching: bool,
    pub access_based_directory_enum: bool,
    pub force_levelii_oplock: bool,
    pub enable_hash_v1: bool,
    pub enable_hash_v2: bool,
    pub encrypt_data: bool,
    #[skip]
    __: B2,
    pub identity_remoting: bool,
    #[skip]
    __: B1,
    pub compress_data: bool,
    pub isolated_transport: bool,
    #[skip]
    __: B10,
}

#[smb_dtyp::mbitfield]
pub struct TreeCapabilities {
    #[skip]
    __: B3,
    pub dfs: bool,
    pub continuous_availability: bool,
    pub scaleout: bool,
    pub cluster: bool,
    pub asymmetric: bool,
    pub redirect_to_owner: bool,
    #[skip]
    __: B23,
}

/// Reference: MS-SMB2 2.2.10
#[smb_response(size = 16)]
pub struct TreeConnectResponse {
    pub share_type: ShareType,
    reserved: u8,
    pub share_flags: ShareFlags,
    pub capabilities: TreeCapabilities,
    pub maximal_access: u32,
}

#[smb_request(size = 4)]
#[derive(Default)]
pub struct TreeDisconnectRequest {
    reserved: u16,
}

#[smb_response(size = 4)]
#[derive(Default)]
pub struct TreeDisconnectResponse {
    reserved: u16,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::*;
    use crate::*;

    test_request! {
        TreeConnect {
            path: r"\\127.0.0.1\MyShare".into(),
        } => "0900000048002600
        5c005c003100320037002e0030002e0030002e0031005c004d007900530068006100720065
        00"
    }

    test_response! {
        TreeConnect {
            share_type: ShareType::Disk,
            share_flags: ShareFlags::new().with_access_based_directory_enum(true),
            capabilities: TreeCapabilities::new(),
            maximal_access: 0x001f01ff,
        } => "100001000008000000000000ff011f00"
    }

    test_response! {
        TreeDisconnect {} => "04000000"
    }

    #[test]
    fn test_unknown_share_type_rejected() {
        let err = response_behind_header(
            Command::TreeConnect,
            &smb_tests::hex_to_u8_array! { "100007000008000000000000ff011f00" },
        )
        .unwrap_err();
        assert!(matches!(err, SmbMsgError::BinRw(_)));
    }
}
