//! QUERY_INFO and SET_INFO.
//!
//! Information buffers travel as raw bytes; interpreting file information classes
//! is left to the filesystem layer above the engine, with the exception of the
//! few classes the engine itself sets.

use binrw::prelude::*;
use modular_bitfield::prelude::*;
use smb_dtyp::binrw_util::prelude::*;
use smb_msg_derive::*;

use crate::{FileId, buffer_start};

#[smb_message_binrw]
#[derive(Copy)]
#[brw(repr(u8))]
pub enum InfoType {
    File = 0x1,
    FileSystem = 0x2,
    Security = 0x3,
    Quota = 0x4,
}

/// File information class numbers used with [`InfoType::File`].
pub mod file_info_class {
    pub const BASIC: u8 = 4;
    pub const STANDARD: u8 = 5;
    pub const INTERNAL: u8 = 6;
    pub const RENAME: u8 = 10;
    pub const ALL: u8 = 18;
    pub const ALLOCATION: u8 = 19;
    pub const END_OF_FILE: u8 = 20;
    pub const NETWORK_OPEN: u8 = 34;
    pub const DISPOSITION: u8 = 13;
}

#[smb_dtyp::mbitfield]
pub struct AdditionalInfo {
    pub owner_security_information: bool,
    pub group_security_information: bool,
    pub dacl_security_information: bool,
    pub sacl_security_information: bool,
    pub label_security_information: bool,
    pub attribute_security_information: bool,
    pub scope_security_information: bool,
    #[skip]
    __: B9,
    pub backup_security_information: bool,
    #[skip]
    __: B15,
}

#[smb_dtyp::mbitfield]
pub struct QueryInfoFlags {
    pub restart_scan: bool,
    pub return_single_entry: bool,
    pub index_specified: bool,
    #[skip]
    __: B29,
}

/// Reference: MS-SMB2 2.2.37
#[smb_request(size = 41)]
pub struct QueryInfoRequest {
    pub info_type: InfoType,
    /// Zero for security and quota queries.
    pub info_class: u8,
    pub output_buffer_length: u32,
    #[bw(calc = PosMarker::default())]
    #[br(temp)]
    _input_buffer_offset: PosMarker<u16>,
    reserved: u16,
    #[bw(try_calc = input.len().try_into())]
    #[br(temp)]
    _input_buffer_length: u32,
    pub additional_info: AdditionalInfo,
    pub flags: QueryInfoFlags,
    pub file_id: FileId,
    /// Quota and EA queries only.
    #[br(seek_before = buffer_start(_input_buffer_offset.value.into(), _input_buffer_length.into()))]
    #[br(count = _input_buffer_length)]
    #[bw(write_with = PosMarker::write_aoff, args(&_input_buffer_offset))]
    pub input: Vec<u8>,
}

/// Reference: MS-SMB2 2.2.38
#[smb_response(size = 9)]
pub struct QueryInfoResponse {
    #[bw(calc = PosMarker::default())]
    #[br(temp)]
    _output_buffer_offset: PosMarker<u16>,
    #[bw(calc = PosMarker::default())]
    #[br(temp)]
    _output_buffer_length: PosMarker<u32>,
    #[br(seek_before = buffer_start(_output_buffer_offset.value.into(), _output_buffer_length.value.into()))]
    #[br(count = _output_buffer_length.value)]
    #[bw(write_with = PosMarker::write_aoff_size, args(&_output_buffer_offset, &_output_buffer_length))]
    pub data: Vec<u8>,
}

/// Reference: MS-SMB2 2.2.39
#[smb_request(size = 33)]
pub struct SetInfoRequest {
    pub info_type: InfoType,
    pub info_class: u8,
    #[bw(calc = PosMarker::default())]
    #[br(temp)]
    _buffer_length: PosMarker<u32>,
    #[bw(calc = PosMarker::default())]
    #[br(temp)]
    _buffer_offset: PosMarker<u16>,
    reserved: u16,
    pub additional_information: AdditionalInfo,
    pub file_id: FileId,
    #[br(seek_before = buffer_start(_buffer_offset.value.into(), _buffer_length.value.into()))]
    #[br(count = _buffer_length.value)]
    #[bw(write_with = PosMarker::write_aoff_size, args(&_buffer_offset, &_buffer_length))]
    pub data: Vec<u8>,
}

impl SetInfoRequest {
    /// FileEndOfFileInformation: truncates or extends the file.
    pub fn end_of_file(file_id: FileId, end_of_file: u64) -> SetInfoRequest {
        Self::file_info(file_id, file_info_class::END_OF_FILE, end_of_file.to_le_bytes().to_vec())
    }

    /// FileAllocationInformation: reserves space without changing the size.
    pub fn allocation(file_id: FileId, allocation_size: u64) -> SetInfoRequest {
        Self::file_info(file_id, file_info_class::ALLOCATION, allocation_size.to_le_bytes().to_vec())
    }

    pub fn file_info(file_id: FileId, info_class: u8, data: Vec<u8>) -> SetInfoRequest {
        SetInfoRequest {
            info_type: InfoType::File,
            info_class,
            additional_information: AdditionalInfo::new(),
            file_id,
            data,
        }
    }

    /// Whether a successful set changes size or attributes the caller may have cached.
    pub fn invalidates_attributes(&self) -> bool {
        self.info_type == InfoType::File
    }
}

#[smb_response(size = 2)]
#[derive(Default)]
pub struct SetInfoResponse {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::*;
    use crate::*;

    test_request! {
        query_security: QueryInfo {
            info_type: InfoType::Security,
            info_class: 0,
            output_buffer_length: 0,
            additional_info: AdditionalInfo::new()
                .with_owner_security_information(true)
                .with_group_security_information(true)
                .with_dacl_security_information(true)
                .with_sacl_security_information(true),
            flags: QueryInfoFlags::new(),
            file_id: FileId {
                persistent: 0x0000000d0000002b,
                volatile: 0x0000000d00000031,
            },
            input: vec![],
        } => "290003000000000068000000000000000f000000000000002b0000000d000000310000000d000000"
    }

    test_response! {
        QueryInfo {
            data: smb_tests::hex_to_u8_array! {
                "5b6c44ce6a58db01048fa10d516bdb01048fa10d516bdb01048fa10d516bdb012000000000000000"
            },
        } => "09004800280000005b6c44ce6a58db01048fa10d516bdb01048fa10d516bdb01048fa10d516bdb012000000000000000"
    }

    fn rename_information(name: &str) -> Vec<u8> {
        let name = encode_utf16le(name);
        let mut data = vec![0u8; 16];
        data.extend_from_slice(&(name.len() as u32).to_le_bytes());
        data.extend_from_slice(&name);
        data
    }

    test_request! {
        set_rename: SetInfo {
            info_type: InfoType::File,
            info_class: file_info_class::RENAME,
            additional_information: AdditionalInfo::new(),
            file_id: FileId {
                persistent: 0x0000000e00000042,
                volatile: 0x0000000e00100005,
            },
            data: rename_information("hello\\myNewFile.txt"),
        } => "2100010a3a0000006000000000000000420000000e000000050010000e0000000000000000000000000000000000000026000000680065006c006c006f005c006d0079004e0065007700460069006c0065002e00740078007400"
    }

    test_response! {
        SetInfo {} => "0200"
    }

    #[test]
    fn test_end_of_file() {
        let req = SetInfoRequest::end_of_file(FileId::EMPTY, 0x1000);
        assert_eq!(req.info_class, 20);
        assert_eq!(req.data, [0, 0x10, 0, 0, 0, 0, 0, 0]);
        assert!(req.invalidates_attributes());
    }

    #[test]
    fn test_unknown_info_type_rejected() {
        let mut cursor = binrw::io::Cursor::new(smb_tests::hex_to_u8_array! {
            "2100090a0000000000000000000000000000000000000000000000000000000000"
        });
        assert!(SetInfoRequest::read_le(&mut cursor).is_err());
    }
}
