//! CREATE context chains.
//!
//! A chain is a run of entries linked by a relative `Next` offset, each starting on an
//! 8-byte boundary. Entries are read and written through [`ChainedItemList`]; the
//! entry types here cover what follows the `Next` field.

use std::io::{Seek, Write};

use binrw::io::TakeSeekExt;
use binrw::{Endian, prelude::*};
use modular_bitfield::prelude::*;
use smb_dtyp::binrw_util::prelude::*;
use smb_dtyp::{FileTime, Guid};
use smb_msg_derive::*;

use crate::{FileAccessMask, FileId, SmbMsgError};

/// Four-byte ASCII context names.
pub mod names {
    pub const AAPL: &[u8; 4] = b"AAPL";
    pub const TIME_WARP: &[u8; 4] = b"TWrp";
    pub const MAXIMAL_ACCESS: &[u8; 4] = b"MxAc";
    pub const DURABLE_HANDLE_REQUEST: &[u8; 4] = b"DHnQ";
    pub const DURABLE_HANDLE_RECONNECT: &[u8; 4] = b"DHnC";
    pub const DURABLE_HANDLE_REQUEST_V2: &[u8; 4] = b"DH2Q";
    pub const DURABLE_HANDLE_RECONNECT_V2: &[u8; 4] = b"DH2C";
    pub const REQUEST_LEASE: &[u8; 4] = b"RqLs";
    pub const QUERY_ON_DISK_ID: &[u8; 4] = b"QFid";

    const ALL: [&[u8; 4]; 9] = [
        AAPL,
        TIME_WARP,
        MAXIMAL_ACCESS,
        DURABLE_HANDLE_REQUEST,
        DURABLE_HANDLE_RECONNECT,
        DURABLE_HANDLE_REQUEST_V2,
        DURABLE_HANDLE_RECONNECT_V2,
        REQUEST_LEASE,
        QUERY_ON_DISK_ID,
    ];

    pub fn is_known(name: &[u8]) -> bool {
        ALL.iter().any(|known| known.as_slice() == name)
    }
}

/// Reference: MS-SMB2 2.2.13.2.8
#[smb_dtyp::mbitfield]
#[derive(Hash)]
pub struct LeaseState {
    pub read_caching: bool,
    pub handle_caching: bool,
    pub write_caching: bool,
    #[skip]
    __: B29,
}

impl LeaseState {
    pub const NONE: LeaseState = LeaseState::new();

    pub fn rwh() -> LeaseState {
        LeaseState::new()
            .with_read_caching(true)
            .with_write_caching(true)
            .with_handle_caching(true)
    }

    pub fn is_none(&self) -> bool {
        *self == Self::NONE
    }

    /// True when every bit of `self` is also set in `other`.
    pub fn is_subset_of(&self, other: &LeaseState) -> bool {
        let mine = u32::from_le_bytes(self.into_bytes());
        let theirs = u32::from_le_bytes(other.into_bytes());
        mine & !theirs == 0
    }
}

impl std::fmt::Display for LeaseState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_none() {
            return write!(f, "NONE");
        }
        let bits = [
            (self.read_caching(), "R"),
            (self.write_caching(), "W"),
            (self.handle_caching(), "H"),
        ];
        for (set, c) in bits {
            if set {
                write!(f, "{c}")?;
            }
        }
        Ok(())
    }
}

#[smb_dtyp::mbitfield]
pub struct LeaseFlags {
    #[skip]
    __: B1,
    pub break_in_progress: bool,
    pub parent_lease_key_set: bool,
    #[skip]
    __: B29,
}

/// The directory-aware tail of a V2 lease context.
#[smb_message_binrw]
#[derive(Copy)]
pub struct LeaseV2 {
    pub parent_lease_key: Guid,
    pub epoch: u16,
    reserved: u16,
}

/// RqLs, in either the 32-byte V1 or 52-byte V2 form. Same layout both ways.
///
/// Reference: MS-SMB2 2.2.13.2.8, 2.2.13.2.10
#[smb_message_binrw]
#[derive(Copy)]
pub struct LeaseContext {
    pub lease_key: Guid,
    pub lease_state: LeaseState,
    pub lease_flags: LeaseFlags,
    pub lease_duration: u64,
    #[br(parse_with = binread_if_has_data)]
    pub v2: Option<LeaseV2>,
}

#[smb_dtyp::mbitfield]
pub struct DurableHandleV2Flags {
    #[skip]
    __: B1,
    pub persistent: bool,
    #[skip]
    __: B30,
}

/// Apple extension command codes carried in the AAPL context.
pub mod aapl {
    pub const SERVER_QUERY: u32 = 1;
    pub const RESOLVE_ID: u32 = 3;

    pub const REQUEST_SERVER_CAPS: u64 = 0x1;
    pub const REQUEST_VOLUME_CAPS: u64 = 0x2;
    pub const REQUEST_MODEL_INFO: u64 = 0x4;
}

/// Server reply to an AAPL server query. Fields appear on the wire only when their
/// bit is set in `reply_bitmap`.
#[smb_response_binrw]
pub struct AaplServerInfo {
    pub reply_bitmap: u64,
    #[brw(if(reply_bitmap & aapl::REQUEST_SERVER_CAPS != 0))]
    pub server_capabilities: u64,
    #[brw(if(reply_bitmap & aapl::REQUEST_VOLUME_CAPS != 0))]
    pub volume_capabilities: u64,
    #[brw(if(reply_bitmap & aapl::REQUEST_MODEL_INFO != 0), pad_before = 4)]
    #[bw(try_calc = model.size().try_into())]
    #[br(temp)]
    _model_length: u32,
    #[brw(if(reply_bitmap & aapl::REQUEST_MODEL_INFO != 0))]
    #[br(args { size: SizedStringSize::bytes32(_model_length) })]
    pub model: SizedWideString,
}

/// Create contexts a client attaches to a CREATE request.
///
/// Reference: MS-SMB2 2.2.13.2
#[smb_request_binrw]
#[br(import(name: &Vec<u8>))]
pub enum CreateContextRequest {
    #[br(pre_assert(name.as_slice() == names::AAPL))]
    #[brw(magic(1u32))]
    AppleServerQuery {
        #[brw(pad_before = 4)]
        request_bitmap: u64,
        client_capabilities: u64,
    },
    #[br(pre_assert(name.as_slice() == names::AAPL))]
    #[brw(magic(3u32))]
    AppleResolveId {
        #[brw(pad_before = 4)]
        file_id: u64,
    },
    #[br(pre_assert(name.as_slice() == names::TIME_WARP))]
    TimeWarp(FileTime),
    /// With a timestamp, access is evaluated as of that time.
    #[br(pre_assert(name.as_slice() == names::MAXIMAL_ACCESS))]
    QueryMaximalAccess(#[br(parse_with = binread_if_has_data)] Option<FileTime>),
    #[br(pre_assert(name.as_slice() == names::DURABLE_HANDLE_REQUEST))]
    #[bw(magic(0u128))]
    DurableHandleRequest,
    #[br(pre_assert(name.as_slice() == names::DURABLE_HANDLE_RECONNECT))]
    DurableHandleReconnect { file_id: FileId },
    #[br(pre_assert(name.as_slice() == names::DURABLE_HANDLE_REQUEST_V2))]
    DurableHandleRequestV2 {
        timeout: u32,
        flags: DurableHandleV2Flags,
        #[brw(pad_before = 8)]
        create_guid: Guid,
    },
    #[br(pre_assert(name.as_slice() == names::DURABLE_HANDLE_RECONNECT_V2))]
    DurableHandleReconnectV2 {
        file_id: FileId,
        create_guid: Guid,
        flags: DurableHandleV2Flags,
    },
    #[br(pre_assert(name.as_slice() == names::REQUEST_LEASE))]
    RequestLease(LeaseContext),
    #[br(pre_assert(name.as_slice() == names::QUERY_ON_DISK_ID))]
    QueryOnDiskId,
}

impl CreateContextRequest {
    pub fn name(&self) -> &'static [u8; 4] {
        match self {
            CreateContextRequest::AppleServerQuery { .. }
            | CreateContextRequest::AppleResolveId { .. } => names::AAPL,
            CreateContextRequest::TimeWarp(_) => names::TIME_WARP,
            CreateContextRequest::QueryMaximalAccess(_) => names::MAXIMAL_ACCESS,
            CreateContextRequest::DurableHandleRequest => names::DURABLE_HANDLE_REQUEST,
            CreateContextRequest::DurableHandleReconnect { .. } => names::DURABLE_HANDLE_RECONNECT,
            CreateContextRequest::DurableHandleRequestV2 { .. } => names::DURABLE_HANDLE_REQUEST_V2,
            CreateContextRequest::DurableHandleReconnectV2 { .. } => {
                names::DURABLE_HANDLE_RECONNECT_V2
            }
            CreateContextRequest::RequestLease(_) => names::REQUEST_LEASE,
            CreateContextRequest::QueryOnDiskId => names::QUERY_ON_DISK_ID,
        }
    }

    /// Position in the generic-to-specific assembly order.
    pub fn rank(&self) -> u8 {
        match self {
            CreateContextRequest::AppleServerQuery { .. } => 0,
            CreateContextRequest::AppleResolveId { .. } => 1,
            CreateContextRequest::TimeWarp(_) => 2,
            CreateContextRequest::QueryMaximalAccess(_) => 3,
            CreateContextRequest::DurableHandleRequest
            | CreateContextRequest::DurableHandleReconnect { .. }
            | CreateContextRequest::DurableHandleRequestV2 { .. }
            | CreateContextRequest::DurableHandleReconnectV2 { .. } => 4,
            CreateContextRequest::RequestLease(_) => 5,
            CreateContextRequest::QueryOnDiskId => 6,
        }
    }

    pub fn is_durable(&self) -> bool {
        self.rank() == 4
    }

    /// Sorts contexts into assembly order, keeping relative order within a rank.
    pub fn sort_for_assembly(contexts: &mut [CreateContextRequest]) {
        contexts.sort_by_key(|c| c.rank());
    }
}

/// Create contexts a server may return in a CREATE response.
///
/// Reference: MS-SMB2 2.2.14.2
#[smb_response_binrw]
#[br(import(name: &Vec<u8>))]
pub enum CreateContextResponse {
    #[br(pre_assert(name.as_slice() == names::AAPL))]
    #[brw(magic(1u32))]
    AppleServerQuery(#[brw(pad_before = 4)] AaplServerInfo),
    #[br(pre_assert(name.as_slice() == names::AAPL))]
    #[brw(magic(3u32))]
    AppleResolveId {
        #[brw(pad_before = 4)]
        status: u32,
        #[bw(try_calc = path.size().try_into())]
        #[br(temp)]
        _path_length: u32,
        #[br(args { size: SizedStringSize::bytes32(_path_length) })]
        path: SizedWideString,
    },
    /// A nonzero `query_status` means the server could not evaluate the access.
    #[br(pre_assert(name.as_slice() == names::MAXIMAL_ACCESS))]
    MaximalAccess {
        query_status: u32,
        maximal_access: FileAccessMask,
    },
    #[br(pre_assert(name.as_slice() == names::DURABLE_HANDLE_REQUEST))]
    #[bw(magic(0u64))]
    DurableHandle,
    #[br(pre_assert(name.as_slice() == names::DURABLE_HANDLE_RECONNECT))]
    DurableHandleReconnect,
    #[br(pre_assert(name.as_slice() == names::DURABLE_HANDLE_REQUEST_V2))]
    DurableHandleV2 {
        timeout: u32,
        flags: DurableHandleV2Flags,
    },
    #[br(pre_assert(name.as_slice() == names::DURABLE_HANDLE_RECONNECT_V2))]
    DurableHandleReconnectV2,
    #[br(pre_assert(name.as_slice() == names::REQUEST_LEASE))]
    Lease(LeaseContext),
    #[br(pre_assert(name.as_slice() == names::QUERY_ON_DISK_ID))]
    OnDiskId {
        file_id: u64,
        #[brw(pad_after = 16)]
        volume_id: u64,
    },
}

impl CreateContextResponse {
    pub fn name(&self) -> &'static [u8; 4] {
        match self {
            CreateContextResponse::AppleServerQuery(_)
            | CreateContextResponse::AppleResolveId { .. } => names::AAPL,
            CreateContextResponse::MaximalAccess { .. } => names::MAXIMAL_ACCESS,
            CreateContextResponse::DurableHandle => names::DURABLE_HANDLE_REQUEST,
            CreateContextResponse::DurableHandleReconnect => names::DURABLE_HANDLE_RECONNECT,
            CreateContextResponse::DurableHandleV2 { .. } => names::DURABLE_HANDLE_REQUEST_V2,
            CreateContextResponse::DurableHandleReconnectV2 => names::DURABLE_HANDLE_RECONNECT_V2,
            CreateContextResponse::Lease(_) => names::REQUEST_LEASE,
            CreateContextResponse::OnDiskId { .. } => names::QUERY_ON_DISK_ID,
        }
    }
}

/// The lease context has exactly two valid sizes, V1 and V2.
fn lease_size_valid(name: &[u8], data_length: u32) -> bool {
    name != names::REQUEST_LEASE || matches!(data_length, 32 | 52)
}

macro_rules! create_context_entry {
    ($attr:ident, $entry:ident, $data:ident) => {
        #[doc = concat!("One [`", stringify!($data), "`] entry of a chain, after its `Next` field.")]
        ///
        /// Offsets are relative to the start of the entry, so they count the
        /// [`CHAINED_ITEM_PREFIX_SIZE`] bytes of `Next` in front of the first field.
        ///
        /// Reference: MS-SMB2 2.2.13.2
        #[$attr]
        pub struct $entry {
            #[bw(calc = PosMarker::default())]
            #[br(temp)]
            _name_offset: PosMarker<u16>,
            #[bw(try_calc = u16::try_from(name.len()))]
            #[br(temp)]
            _name_length: u16,
            reserved: u16,
            #[bw(calc = PosMarker::default())]
            #[br(temp)]
            _data_offset: PosMarker<u16>,
            #[bw(calc = PosMarker::default())]
            #[br(temp)]
            _data_length: PosMarker<u32>,

            #[br(seek_before = _name_offset.seek_from(
                u64::from(_name_offset.value).saturating_sub(CHAINED_ITEM_PREFIX_SIZE as u64)
            ))]
            #[br(count = _name_length)]
            #[br(assert(
                names::is_known(&name),
                SmbMsgError::UnknownCreateContext(String::from_utf8_lossy(&name).into_owned())
            ))]
            #[br(assert(
                lease_size_valid(&name, _data_length.value),
                SmbMsgError::InvalidCreateContext {
                    name: String::from_utf8_lossy(&name).into_owned(),
                    reason: "lease context is neither 32 nor 52 bytes",
                }
            ))]
            #[bw(write_with = PosMarker::write_roff_plus, args(&_name_offset, CHAINED_ITEM_PREFIX_SIZE as u64))]
            pub name: Vec<u8>,

            #[bw(align_before = 8)]
            #[br(assert(
                _data_offset.value % 8 == 0,
                SmbMsgError::MisalignedContext(_data_offset.value.into())
            ))]
            #[br(seek_before = _name_offset.seek_from_if(
                u64::from(_data_offset.value).saturating_sub(CHAINED_ITEM_PREFIX_SIZE as u64),
                _data_length.value > 0
            ))]
            #[br(map_stream = |s| s.take_seek(_data_length.value.into()), args(&name))]
            #[bw(write_with = PosMarker::write_roff_size_b_plus, args(&_data_offset, &_data_length, &_name_offset, CHAINED_ITEM_PREFIX_SIZE as u64))]
            pub data: $data,
        }

        impl From<$data> for $entry {
            fn from(data: $data) -> Self {
                $entry {
                    name: data.name().to_vec(),
                    data,
                }
            }
        }
    };
}

create_context_entry!(smb_request_binrw, CreateContextRequestEntry, CreateContextRequest);
create_context_entry!(smb_response_binrw, CreateContextResponseEntry, CreateContextResponse);

/// Writes `contexts` as an 8-byte aligned chain, storing its absolute offset and
/// length in the enclosing message's markers. An empty list gets a zero offset.
pub fn write_context_chain<E, T, W>(
    contexts: &Vec<T>,
    writer: &mut W,
    endian: Endian,
    (offset, length): (&PosMarker<u32>, &PosMarker<u32>),
) -> BinResult<()>
where
    T: Clone + Into<E>,
    E: BinWrite,
    for<'a> E::Args<'a>: Default,
    W: Write + Seek,
{
    let chain: ChainedItemList<E, 8> = contexts.iter().cloned().map(Into::into).collect();
    PosMarker::write_aoff_size(&chain, writer, endian, (offset, length))
}
