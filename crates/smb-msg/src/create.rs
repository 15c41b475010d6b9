//! CREATE and CLOSE.

use std::fmt::{Debug, Display};
use std::io::SeekFrom;

use binrw::io::TakeSeekExt;
use binrw::prelude::*;
use modular_bitfield::prelude::*;
use smb_dtyp::binrw_util::prelude::*;
use smb_dtyp::{FileTime, Guid};
use smb_msg_derive::*;

use crate::{
    CreateContextRequest, CreateContextRequestEntry, CreateContextResponse,
    CreateContextResponseEntry, SmbMsgError, write_context_chain,
};

/// SMB2_FILEID: the (persistent, volatile) pair naming an open on the server.
///
/// Reference: MS-SMB2 2.2.14.1
#[binrw::binrw]
#[derive(PartialEq, Eq, Clone, Copy, Default, Hash)]
pub struct FileId {
    pub persistent: u64,
    pub volatile: u64,
}

impl FileId {
    pub const EMPTY: FileId = FileId {
        persistent: 0,
        volatile: 0,
    };
    /// Refers to the file opened by the previous request of a related compound chain.
    pub const FULL: FileId = FileId {
        persistent: u64::MAX,
        volatile: u64::MAX,
    };
}

impl From<[u8; 16]> for FileId {
    fn from(data: [u8; 16]) -> Self {
        let (p, v) = data.split_at(8);
        let mut persistent = [0u8; 8];
        let mut volatile = [0u8; 8];
        persistent.copy_from_slice(p);
        volatile.copy_from_slice(v);
        FileId {
            persistent: u64::from_le_bytes(persistent),
            volatile: u64::from_le_bytes(volatile),
        }
    }
}

impl From<Guid> for FileId {
    fn from(guid: Guid) -> Self {
        Self::from(guid.to_bytes())
    }
}

impl Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{{:x}|{:x}}}", self.persistent, self.volatile)
    }
}

impl Debug for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FileId({})", self)
    }
}

#[smb_message_binrw]
#[derive(Copy, Hash)]
#[brw(repr(u8))]
pub enum OplockLevel {
    None = 0,
    II = 1,
    Exclusive = 8,
    Batch = 9,
    Lease = 0xff,
}

#[smb_request_binrw]
#[derive(Copy)]
#[brw(repr(u32))]
pub enum ImpersonationLevel {
    Anonymous = 0x0,
    Identification = 0x1,
    Impersonation = 0x2,
    Delegate = 0x3,
}

/// What the server does when the file already exists, or does not.
///
/// Reference: MS-SMB2 2.2.13
#[smb_request_binrw]
#[derive(Copy, Default)]
#[brw(repr(u32))]
pub enum CreateDisposition {
    Superseded = 0x0,
    #[default]
    Open = 0x1,
    Create = 0x2,
    OpenIf = 0x3,
    Overwrite = 0x4,
    OverwriteIf = 0x5,
}

#[smb_response_binrw]
#[derive(Copy)]
#[brw(repr(u32))]
pub enum CreateAction {
    Superseded = 0x0,
    Opened = 0x1,
    Created = 0x2,
    Overwritten = 0x3,
}

/// Access rights, for files, pipes and printers alike.
///
/// Reference: MS-SMB2 2.2.13.1.1
#[smb_dtyp::mbitfield]
pub struct FileAccessMask {
    pub file_read_data: bool,
    pub file_write_data: bool,
    pub file_append_data: bool,
    pub file_read_ea: bool,
    pub file_write_ea: bool,
    pub file_execute: bool,
    pub file_delete_child: bool,
    pub file_read_attributes: bool,
    pub file_write_attributes: bool,
    #[skip]
    __: B7,
    pub delete: bool,
    pub read_control: bool,
    pub write_dac: bool,
    pub write_owner: bool,
    pub synchronize: bool,
    #[skip]
    __: B3,
    pub access_system_security: bool,
    pub maximum_allowed: bool,
    #[skip]
    __: B2,
    pub generic_all: bool,
    pub generic_execute: bool,
    pub generic_write: bool,
    pub generic_read: bool,
}

impl From<u32> for FileAccessMask {
    fn from(value: u32) -> Self {
        FileAccessMask::from_bytes(value.to_le_bytes())
    }
}

#[smb_dtyp::mbitfield]
pub struct FileAttributes {
    pub readonly: bool,
    pub hidden: bool,
    pub system: bool,
    #[skip]
    __: B1,
    pub directory: bool,
    pub archive: bool,
    #[skip]
    __: B1,
    pub normal: bool,
    pub temporary: bool,
    pub sparse_file: bool,
    pub reparse_point: bool,
    pub compressed: bool,
    pub offline: bool,
    pub not_content_indexed: bool,
    pub encrypted: bool,
    pub integrity_stream: bool,
    #[skip]
    __: B1,
    pub no_scrub_data: bool,
    pub recall_on_open: bool,
    pub pinned: bool,
    pub unpinned: bool,
    #[skip]
    __: B1,
    pub recall_on_data_access: bool,
    #[skip]
    __: B9,
}

#[smb_dtyp::mbitfield]
pub struct ShareAccessFlags {
    pub read: bool,
    pub write: bool,
    pub delete: bool,
    #[skip]
    __: B29,
}

/// Reference: MS-SMB2 2.2.13
#[smb_dtyp::mbitfield]
pub struct CreateOptions {
    pub directory_file: bool,
    pub write_through: bool,
    pub sequential_only: bool,
    pub no_intermediate_buffering: bool,
    pub synchronous_io_alert: bool,
    pub synchronous_io_nonalert: bool,
    pub non_directory_file: bool,
    #[skip]
    __: B1,
    pub complete_if_oplocked: bool,
    pub no_ea_knowledge: bool,
    pub open_remote_instance: bool,
    pub random_access: bool,
    pub delete_on_close: bool,
    pub open_by_file_id: bool,
    pub open_for_backup_intent: bool,
    pub no_compression: bool,
    pub open_requiring_oplock: bool,
    pub disallow_exclusive: bool,
    #[skip]
    __: B2,
    pub reserve_opfilter: bool,
    pub open_reparse_point: bool,
    pub open_no_recall: bool,
    pub open_for_free_space_query: bool,
    #[skip]
    __: B8,
}

/// Opens or creates a file, directory or pipe.
///
/// The name and the context chain follow the fixed part, each on an 8-byte boundary.
///
/// Reference: MS-SMB2 2.2.13
#[smb_request(size = 57)]
pub struct CreateRequest {
    /// SecurityFlags
    reserved: u8,
    pub requested_oplock_level: OplockLevel,
    pub impersonation_level: ImpersonationLevel,
    /// SmbCreateFlags
    reserved: u64,
    reserved: u64,
    pub desired_access: FileAccessMask,
    pub file_attributes: FileAttributes,
    pub share_access: ShareAccessFlags,
    pub create_disposition: CreateDisposition,
    pub create_options: CreateOptions,
    #[bw(calc = PosMarker::default())]
    #[br(temp)]
    _name_offset: PosMarker<u16>,
    #[bw(try_calc = name.size().try_into())]
    #[br(temp)]
    _name_length: u16,
    #[bw(calc = PosMarker::default())]
    #[br(temp)]
    _create_contexts_offset: PosMarker<u32>,
    #[bw(calc = PosMarker::default())]
    #[br(temp)]
    _create_contexts_length: PosMarker<u32>,

    /// Path relative to the share root, without a leading separator.
    #[brw(align_before = 8)]
    #[br(seek_before = SeekFrom::Start(_name_offset.value.into()))]
    #[br(args { size: SizedStringSize::bytes16(_name_length) })]
    #[bw(write_with = PosMarker::write_aoff, args(&_name_offset))]
    pub name: SizedWideString,

    #[bw(align_before = 8)]
    #[br(seek_before = crate::buffer_start(_create_contexts_offset.value.into(), _create_contexts_length.value.into()))]
    #[br(map_stream = |s| s.take_seek(_create_contexts_length.value.into()))]
    #[br(map = |chain: ChainedItemList<CreateContextRequestEntry, 8>| chain.into_vec().into_iter().map(|entry| entry.data).collect())]
    #[bw(write_with = write_context_chain::<CreateContextRequestEntry, _, _>, args(&_create_contexts_offset, &_create_contexts_length))]
    pub contexts: Vec<CreateContextRequest>,
}

/// Where a context chain starts, or the current position when there is none.
#[smb_dtyp::mbitfield]
pub struct CreateResponseFlags {
    pub reparsepoint: bool,
    #[skip]
    __: B7,
}

/// Reference: MS-SMB2 2.2.14
#[smb_response(size = 89)]
pub struct CreateResponse {
    pub oplock_level: OplockLevel,
    pub flags: CreateResponseFlags,
    pub create_action: CreateAction,
    pub creation_time: FileTime,
    pub last_access_time: FileTime,
    pub last_write_time: FileTime,
    pub change_time: FileTime,
    pub allocation_size: u64,
    pub end_of_file: u64,
    pub file_attributes: FileAttributes,
    reserved: u32,
    pub file_id: FileId,
    #[br(assert(
        _create_contexts_offset.value % 8 == 0,
        SmbMsgError::MisalignedContext(_create_contexts_offset.value as usize)
    ))]
    #[bw(calc = PosMarker::default())]
    #[br(temp)]
    _create_contexts_offset: PosMarker<u32>,
    #[bw(calc = PosMarker::default())]
    #[br(temp)]
    _create_contexts_length: PosMarker<u32>,

    #[bw(align_before = 8)]
    #[br(seek_before = crate::buffer_start(_create_contexts_offset.value.into(), _create_contexts_length.value.into()))]
    #[br(map_stream = |s| s.take_seek(_create_contexts_length.value.into()))]
    #[br(map = |chain: ChainedItemList<CreateContextResponseEntry, 8>| chain.into_vec().into_iter().map(|entry| entry.data).collect())]
    #[bw(write_with = write_context_chain::<CreateContextResponseEntry, _, _>, args(&_create_contexts_offset, &_create_contexts_length))]
    pub create_contexts: Vec<CreateContextResponse>,
}

impl CreateResponse {
    pub fn lease(&self) -> Option<&crate::LeaseContext> {
        self.create_contexts.iter().find_map(|c| match c {
            CreateContextResponse::Lease(l) => Some(l),
            _ => None,
        })
    }

    pub fn maximal_access(&self) -> Option<FileAccessMask> {
        self.create_contexts.iter().find_map(|c| match c {
            CreateContextResponse::MaximalAccess {
                query_status: 0,
                maximal_access,
            } => Some(*maximal_access),
            _ => None,
        })
    }
}

#[smb_dtyp::mbitfield]
pub struct CloseFlags {
    pub postquery_attrib: bool,
    #[skip]
    __: B15,
}

/// Reference: MS-SMB2 2.2.15
#[smb_request(size = 24)]
pub struct CloseRequest {
    pub flags: CloseFlags,
    reserved: u32,
    pub file_id: FileId,
}

/// Attributes are only filled in when the request asked for them with
/// [`CloseFlags::postquery_attrib`].
///
/// Reference: MS-SMB2 2.2.16
#[smb_response(size = 60)]
#[derive(Default)]
pub struct CloseResponse {
    pub flags: CloseFlags,
    reserved: u32,
    pub creation_time: FileTime,
    pub last_access_time: FileTime,
    pub last_write_time: FileTime,
    pub change_time: FileTime,
    pub allocation_size: u64,
    pub end_of_file: u64,
    pub file_attributes: FileAttributes,
}
