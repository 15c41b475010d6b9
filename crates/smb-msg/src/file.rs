//! FLUSH, READ and WRITE.

use binrw::prelude::*;
use modular_bitfield::prelude::*;
use smb_dtyp::binrw_util::prelude::*;
use smb_msg_derive::*;

use crate::{FileId, buffer_start};

/// Reference: MS-SMB2 2.2.17
#[smb_request(size = 24)]
pub struct FlushRequest {
    reserved: u16,
    reserved: u32,
    pub file_id: FileId,
}

#[smb_response(size = 4)]
#[derive(Default)]
pub struct FlushResponse {
    reserved: u16,
}

/// Reference: MS-SMB2 2.2.19
#[smb_request(size = 49)]
pub struct ReadRequest {
    #[bw(calc = 0)]
    #[br(temp)]
    _padding: u8,
    pub flags: ReadFlags,
    pub length: u32,
    pub offset: u64,
    pub file_id: FileId,
    pub minimum_count: u32,
    #[bw(calc = CommunicationChannel::None)]
    #[br(temp)]
    #[br(assert(channel == CommunicationChannel::None))]
    channel: CommunicationChannel,
    #[bw(calc = 0)]
    #[br(temp)]
    #[br(assert(_remaining_bytes == 0))]
    _remaining_bytes: u32,
    #[bw(calc = 0)]
    #[br(temp)]
    _read_channel_info_offset: u16,
    #[bw(calc = 0)]
    #[br(temp)]
    #[br(assert(_read_channel_info_length == 0))]
    _read_channel_info_length: u16,
    // The buffer must hold at least one byte even with no channel info.
    reserved: u8,
}

#[smb_dtyp::mbitfield]
pub struct ReadFlags {
    pub read_unbuffered: bool,
    pub read_compressed: bool,
    #[skip]
    __: B6,
}

/// RDMA channels are never negotiated, so only `None` is read or written.
#[smb_request_binrw]
#[derive(Copy)]
#[brw(repr(u32))]
pub enum CommunicationChannel {
    None = 0,
    RdmaV1 = 1,
    RdmaV1Invalidate = 2,
}

/// Reference: MS-SMB2 2.2.20
#[smb_response(size = 17)]
pub struct ReadResponse {
    #[bw(calc = PosMarker::default())]
    #[br(temp)]
    _data_offset: PosMarker<u8>,
    reserved: u8,
    #[bw(calc = PosMarker::default())]
    #[br(temp)]
    _data_length: PosMarker<u32>,
    #[bw(calc = 0)]
    #[br(temp)]
    _data_remaining: u32,
    reserved: u32,
    #[br(seek_before = buffer_start(_data_offset.value.into(), _data_length.value.into()))]
    #[br(count = _data_length.value)]
    #[bw(write_with = PosMarker::write_aoff_size, args(&_data_offset, &_data_length))]
    pub buffer: Vec<u8>,
}

/// Reference: MS-SMB2 2.2.21
#[smb_request(size = 49)]
pub struct WriteRequest {
    #[bw(calc = PosMarker::default())]
    #[br(temp)]
    _data_offset: PosMarker<u16>,
    #[bw(try_calc = data.len().try_into())]
    #[br(temp)]
    _length: u32,
    pub offset: u64,
    pub file_id: FileId,
    #[bw(calc = CommunicationChannel::None)]
    #[br(temp)]
    #[br(assert(channel == CommunicationChannel::None))]
    channel: CommunicationChannel,
    #[bw(calc = 0)]
    #[br(temp)]
    _remaining_bytes: u32,
    #[bw(calc = 0)]
    #[br(temp)]
    _write_channel_info_offset: u16,
    #[bw(calc = 0)]
    #[br(temp)]
    #[br(assert(_write_channel_info_length == 0))]
    _write_channel_info_length: u16,
    pub flags: WriteFlags,
    #[br(seek_before = buffer_start(_data_offset.value.into(), _length.into()))]
    #[br(count = _length)]
    #[bw(write_with = PosMarker::write_aoff, args(&_data_offset))]
    pub data: Vec<u8>,
}

#[smb_dtyp::mbitfield]
pub struct WriteFlags {
    pub write_unbuffered: bool,
    pub write_through: bool,
    #[skip]
    __: B30,
}

/// Reference: MS-SMB2 2.2.22
#[smb_response(size = 17)]
pub struct WriteResponse {
    reserved: u16,
    pub count: u32,
    // Remaining, WriteChannelInfoOffset and WriteChannelInfoLength.
    reserved: u32,
    reserved: u16,
    reserved: u16,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::*;
    use crate::*;

    const FILE_ID: FileId = FileId {
        persistent: 0x0000000c00000414,
        volatile: 0x0000000c00100051,
    };

    test_request! {
        Flush { file_id: FILE_ID } => "1800000000000000140400000c000000510010000c000000"
    }

    test_response! {
        Flush {} => "04 00 00 00"
    }

    test_request! {
        Read {
            flags: ReadFlags::new(),
            length: 0x10203040,
            offset: 0x5060708090a0b0c,
            file_id: FileId {
                persistent: 0x0000000c00000303,
                volatile: 0x0000000c000000c5,
            },
            minimum_count: 1,
        } => "31000000403020100c0b0a0908070605030300000c000000c50000000c0000000100000000000000000000000000000000"
    }

    test_response! {
        Read {
            buffer: b"bbbbbb".to_vec(),
        } => "11005000060000000000000000000000626262626262"
    }

    test_response! {
        read_empty: Read { buffer: vec![] } => "11000000000000000000000000000000"
    }

    test_request! {
        Write {
            offset: 0x1234abcd,
            file_id: FILE_ID,
            flags: WriteFlags::new(),
            data: b"MeFriend!THIS IS FINE!".to_vec(),
        } => "3100700016000000cdab341200000000140400000c000000510010000c00000000000000000000000000000000000000
        4d65467269656e6421544849532049532046494e4521"
    }

    test_response! {
        Write { count: 0xbeefbaaf } => "11000000afbaefbe0000000000000000"
    }

    #[test]
    fn test_read_response_data_past_end() {
        let err = response_behind_header(
            Command::Read,
            &smb_tests::hex_to_u8_array! { "110050000a0000000000000000000000626262" },
        )
        .unwrap_err();
        assert!(matches!(err, SmbMsgError::BinRw(_)));
    }
}
