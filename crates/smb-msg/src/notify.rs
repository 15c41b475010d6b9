//! CHANGE_NOTIFY request and response.

use binrw::io::TakeSeekExt;
use binrw::prelude::*;
use modular_bitfield::prelude::*;
use smb_dtyp::binrw_util::prelude::*;
use smb_msg_derive::*;

use crate::{FileId, buffer_start};

/// Reference: MS-SMB2 2.2.35
#[smb_request(size = 32)]
pub struct ChangeNotifyRequest {
    pub flags: NotifyFlags,
    pub output_buffer_length: u32,
    pub file_id: FileId,
    pub completion_filter: NotifyFilter,
    reserved: u32,
}

#[smb_dtyp::mbitfield]
pub struct NotifyFlags {
    pub watch_tree: bool,
    #[skip]
    __: B15,
}

#[smb_dtyp::mbitfield]
pub struct NotifyFilter {
    pub file_name: bool,
    pub dir_name: bool,
    pub attributes: bool,
    pub size: bool,

    pub last_write: bool,
    pub last_access: bool,
    pub creation: bool,
    pub ea: bool,

    pub security: bool,
    pub stream_name: bool,
    pub stream_size: bool,
    pub stream_write: bool,

    #[skip]
    __: B20,
}

impl NotifyFilter {
    pub fn all() -> Self {
        Self::new()
            .with_file_name(true)
            .with_dir_name(true)
            .with_attributes(true)
            .with_size(true)
            .with_last_write(true)
            .with_last_access(true)
            .with_creation(true)
            .with_ea(true)
            .with_security(true)
            .with_stream_name(true)
            .with_stream_size(true)
            .with_stream_write(true)
    }
}

#[smb_response_binrw]
#[derive(Copy)]
#[brw(repr(u32))]
pub enum NotifyAction {
    Added = 0x1,
    Removed = 0x2,
    Modified = 0x3,
    RenamedOldName = 0x4,
    RenamedNewName = 0x5,
    AddedStream = 0x6,
    RemovedStream = 0x7,
    ModifiedStream = 0x8,
    RemovedByDelete = 0x9,
    IdNotTunnelled = 0xa,
    TunnelledIdCollision = 0xb,
}

/// FILE_NOTIFY_INFORMATION, without its next entry offset.
#[smb_response_binrw]
pub struct FileNotifyInformation {
    pub action: NotifyAction,
    #[bw(try_calc = file_name.size().try_into())]
    #[br(temp)]
    _file_name_length: u32,
    #[br(args { size: SizedStringSize::bytes32(_file_name_length) })]
    pub file_name: SizedWideString,
}

/// An empty buffer means the server overflowed its notify buffer
/// (STATUS_NOTIFY_ENUM_DIR) and the directory must be re-enumerated.
///
/// Reference: MS-SMB2 2.2.36
#[smb_response(size = 9)]
#[derive(Default)]
pub struct ChangeNotifyResponse {
    #[bw(calc = PosMarker::default())]
    #[br(temp)]
    _output_buffer_offset: PosMarker<u16>,
    #[bw(calc = PosMarker::default())]
    #[br(temp)]
    _output_buffer_length: PosMarker<u32>,
    #[br(seek_before = buffer_start(_output_buffer_offset.value.into(), _output_buffer_length.value.into()))]
    #[br(map_stream = |s| s.take_seek(_output_buffer_length.value.into()))]
    #[bw(if(!buffer.is_empty()))]
    #[bw(write_with = PosMarker::write_aoff_size, args(&_output_buffer_offset, &_output_buffer_length))]
    pub buffer: ChainedItemList<FileNotifyInformation, 4>,
}
