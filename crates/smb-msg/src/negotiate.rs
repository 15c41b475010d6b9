//! NEGOTIATE request/response and the 3.1.1 negotiate context list.

use std::io::{Read, Seek, SeekFrom, Write};

use binrw::io::TakeSeekExt;
use binrw::prelude::*;
use binrw::Endian;
use modular_bitfield::prelude::*;
use smb_dtyp::binrw_util::prelude::*;
use smb_dtyp::{FileTime, Guid};
use smb_msg_derive::*;

use crate::{Result, SmbMsgError, buffer_start};

/// Dialects this engine can speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u16)]
pub enum Dialect {
    Smb0202 = 0x0202,
    Smb021 = 0x0210,
    Smb030 = 0x0300,
    Smb0302 = 0x0302,
    Smb0311 = 0x0311,
}

impl Dialect {
    pub const MAX: Dialect = Dialect::Smb0311;
    pub const MIN: Dialect = Dialect::Smb0202;
    /// Oldest to newest, the order in which dialects are offered.
    pub const ALL: [Dialect; 5] = [
        Dialect::Smb0202,
        Dialect::Smb021,
        Dialect::Smb030,
        Dialect::Smb0302,
        Dialect::Smb0311,
    ];

    #[inline]
    pub fn is_smb3(&self) -> bool {
        self >= &Dialect::Smb030
    }
}

impl TryFrom<u16> for Dialect {
    type Error = SmbMsgError;

    fn try_from(value: u16) -> Result<Self> {
        match value {
            0x0202 => Ok(Dialect::Smb0202),
            0x0210 => Ok(Dialect::Smb021),
            0x0300 => Ok(Dialect::Smb030),
            0x0302 => Ok(Dialect::Smb0302),
            0x0311 => Ok(Dialect::Smb0311),
            _ => Err(SmbMsgError::InvalidDialect(value)),
        }
    }
}

// Equivalent of `#[br(try_map = |value: u16| Dialect::try_from(value))]`, which
// binrw's derive does not accept on unit-only enums.
impl BinRead for Dialect {
    type Args<'a> = ();

    fn read_options<R: Read + Seek>(reader: &mut R, endian: Endian, _: Self::Args<'_>) -> BinResult<Self> {
        let pos = reader.stream_position()?;
        let value = u16::read_options(reader, endian, ())?;
        Dialect::try_from(value).map_err(|e| binrw::Error::Custom { pos, err: Box::new(e) })
    }
}

// Equivalent of `#[bw(map = |dialect: &Dialect| *dialect as u16)]`.
impl BinWrite for Dialect {
    type Args<'a> = ();

    fn write_options<W: Write + Seek>(&self, writer: &mut W, endian: Endian, _: Self::Args<'_>) -> BinResult<()> {
        (*self as u16).write_options(writer, endian, ())
    }
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let v = *self as u16;
        write!(f, "SMB {}.{}.{}", v >> 8, (v >> 4) & 0xf, v & 0xf)
    }
}

/// The dialect field of a NEGOTIATE response, which may also be the 2.x wildcard.
#[derive(BinRead, BinWrite, Debug, Clone, Copy, PartialEq, Eq)]
#[br(try_map = |value: u16| NegotiateDialect::try_from(value))]
#[bw(map = |dialect: &NegotiateDialect| dialect.to_u16())]
pub enum NegotiateDialect {
    Smb02Wildcard,
    Dialect(Dialect),
}

impl NegotiateDialect {
    const WILDCARD: u16 = 0x02FF;

    fn to_u16(self) -> u16 {
        match self {
            NegotiateDialect::Smb02Wildcard => Self::WILDCARD,
            NegotiateDialect::Dialect(d) => d as u16,
        }
    }
}

impl TryFrom<u16> for NegotiateDialect {
    type Error = SmbMsgError;

    fn try_from(value: u16) -> Result<Self> {
        if value == Self::WILDCARD {
            return Ok(NegotiateDialect::Smb02Wildcard);
        }
        Dialect::try_from(value).map(NegotiateDialect::Dialect)
    }
}

#[smb_dtyp::mbitfield]
pub struct NegotiateSecurityMode {
    pub signing_enabled: bool,
    pub signing_required: bool,
    #[skip]
    __: B14,
}

#[smb_dtyp::mbitfield]
pub struct GlobalCapabilities {
    pub dfs: bool,
    pub leasing: bool,
    pub large_mtu: bool,
    pub multi_channel: bool,

    pub persistent_handles: bool,
    pub directory_leasing: bool,
    pub encryption: bool,
    pub notifications: bool,

    #[skip]
    __: B24,
}

/// Reference: MS-SMB2 2.2.3
#[smb_request(size = 36)]
pub struct NegotiateRequest {
    #[bw(try_calc = dialects.len().try_into())]
    #[br(temp)]
    _dialect_count: u16,
    pub security_mode: NegotiateSecurityMode,
    reserved: u16,
    pub capabilities: GlobalCapabilities,
    pub client_guid: Guid,
    #[bw(calc = PosMarker::default())]
    #[br(temp)]
    _negotiate_context_offset: PosMarker<u32>,
    #[bw(try_calc = context_count(negotiate_context_list))]
    #[br(temp)]
    _negotiate_context_count: u16,
    reserved: u16,
    #[br(count = _dialect_count)]
    pub dialects: Vec<Dialect>,
    /// Only sent when 3.1.1 is offered.
    #[brw(if(dialects.contains(&Dialect::Smb0311)))]
    #[br(seek_before = SeekFrom::Start(_negotiate_context_offset.value.into()))]
    #[br(parse_with = read_negotiate_contexts, args(_negotiate_context_count))]
    #[bw(align_before = 8)]
    #[bw(write_with = write_negotiate_contexts, args(&_negotiate_context_offset))]
    pub negotiate_context_list: Option<Vec<NegotiateContext>>,
}

/// Reference: MS-SMB2 2.2.4
#[smb_response(size = 65)]
pub struct NegotiateResponse {
    pub security_mode: NegotiateSecurityMode,
    pub dialect_revision: NegotiateDialect,
    #[bw(try_calc = context_count(negotiate_context_list))]
    #[br(temp)]
    _negotiate_context_count: u16,
    pub server_guid: Guid,
    pub capabilities: GlobalCapabilities,
    pub max_transact_size: u32,
    pub max_read_size: u32,
    pub max_write_size: u32,
    pub system_time: FileTime,
    pub server_start_time: FileTime,
    #[bw(calc = PosMarker::default())]
    #[br(temp)]
    _security_buffer_offset: PosMarker<u16>,
    #[bw(try_calc = buffer.len().try_into())]
    #[br(temp)]
    _security_buffer_length: u16,
    #[bw(calc = PosMarker::default())]
    #[br(temp)]
    _negotiate_context_offset: PosMarker<u32>,
    /// Initial GSS token from the server.
    #[br(seek_before = buffer_start(_security_buffer_offset.value.into(), _security_buffer_length.into()))]
    #[br(count = _security_buffer_length)]
    #[bw(write_with = PosMarker::write_aoff, args(&_security_buffer_offset))]
    pub buffer: Vec<u8>,
    /// Present only when the selected dialect is 3.1.1.
    #[brw(if(matches!(dialect_revision, NegotiateDialect::Dialect(Dialect::Smb0311))))]
    #[br(seek_before = SeekFrom::Start(_negotiate_context_offset.value.into()))]
    #[br(parse_with = read_negotiate_contexts, args(_negotiate_context_count))]
    #[bw(align_before = 8)]
    #[bw(write_with = write_negotiate_contexts, args(&_negotiate_context_offset))]
    pub negotiate_context_list: Option<Vec<NegotiateContext>>,
}

impl NegotiateResponse {
    pub fn dialect(&self) -> Result<Dialect> {
        match self.dialect_revision {
            NegotiateDialect::Dialect(d) => Ok(d),
            NegotiateDialect::Smb02Wildcard => Err(SmbMsgError::InvalidDialect(
                NegotiateDialect::WILDCARD,
            )),
        }
    }

    pub fn contexts(&self) -> &[NegotiateContext] {
        self.negotiate_context_list.as_deref().unwrap_or_default()
    }
}

fn context_count(
    list: &Option<Vec<NegotiateContext>>,
) -> std::result::Result<u16, std::num::TryFromIntError> {
    list.as_ref().map_or(0, Vec::len).try_into()
}

#[smb_message_binrw]
#[derive(Copy, Hash)]
#[brw(repr(u16))]
pub enum HashAlgorithm {
    Sha512 = 0x01,
}

#[smb_message_binrw]
#[derive(Copy, Hash)]
#[brw(repr(u16))]
pub enum EncryptionCipher {
    None = 0x0000,
    Aes128Ccm = 0x0001,
    Aes128Gcm = 0x0002,
    Aes256Ccm = 0x0003,
    Aes256Gcm = 0x0004,
}

#[smb_message_binrw]
#[derive(Copy, Hash)]
#[brw(repr(u16))]
pub enum CompressionAlgorithm {
    None = 0x0000,
    LZNT1 = 0x0001,
    LZ77 = 0x0002,
    LZ77Huffman = 0x0003,
    PatternV1 = 0x0004,
    LZ4 = 0x0005,
}

#[smb_message_binrw]
#[derive(Copy, Hash)]
#[brw(repr(u16))]
pub enum SigningAlgorithm {
    HmacSha256 = 0x0000,
    AesCmac = 0x0001,
    AesGmac = 0x0002,
}

/// Reference: MS-SMB2 2.2.3.1.1
#[smb_message_binrw]
pub struct PreauthIntegrityCapabilities {
    #[bw(try_calc = hash_algorithms.len().try_into())]
    #[br(temp)]
    _hash_algorithm_count: u16,
    #[bw(try_calc = salt.len().try_into())]
    #[br(temp)]
    _salt_length: u16,
    #[br(count = _hash_algorithm_count)]
    pub hash_algorithms: Vec<HashAlgorithm>,
    #[br(count = _salt_length)]
    pub salt: Vec<u8>,
}

#[smb_message_binrw]
pub struct EncryptionCapabilities {
    #[bw(try_calc = ciphers.len().try_into())]
    #[br(temp)]
    _cipher_count: u16,
    #[br(count = _cipher_count)]
    pub ciphers: Vec<EncryptionCipher>,
}

/// Reference: MS-SMB2 2.2.3.1.3
#[smb_message_binrw]
pub struct CompressionCapabilities {
    #[bw(try_calc = compression_algorithms.len().try_into())]
    #[br(temp)]
    _compression_algorithm_count: u16,
    #[bw(calc = 0)]
    #[br(temp)]
    _padding: u16,
    /// SMB2_COMPRESSION_CAPABILITIES_FLAG_CHAINED.
    #[br(map = |flags: u32| flags & 1 != 0)]
    #[bw(map = |chained: &bool| u32::from(*chained))]
    pub chained: bool,
    #[br(count = _compression_algorithm_count)]
    pub compression_algorithms: Vec<CompressionAlgorithm>,
}

#[smb_message_binrw]
pub struct SigningCapabilities {
    #[bw(try_calc = signing_algorithms.len().try_into())]
    #[br(temp)]
    _signing_algorithm_count: u16,
    #[br(count = _signing_algorithm_count)]
    pub signing_algorithms: Vec<SigningAlgorithm>,
}

/// One entry of the 3.1.1 negotiate context list.
///
/// Reference: MS-SMB2 2.2.3.1
#[smb_message_binrw]
#[br(import(context_type: u16))]
pub enum NegotiateContext {
    #[br(pre_assert(context_type == NegotiateContext::PREAUTH_INTEGRITY))]
    PreauthIntegrity(PreauthIntegrityCapabilities),
    #[br(pre_assert(context_type == NegotiateContext::ENCRYPTION))]
    Encryption(EncryptionCapabilities),
    #[br(pre_assert(context_type == NegotiateContext::COMPRESSION))]
    Compression(CompressionCapabilities),
    /// Server name, as the caller originally spelled it.
    #[br(pre_assert(context_type == NegotiateContext::NETNAME))]
    Netname(
        #[br(parse_with = read_utf16_to_end)]
        #[bw(map = |name: &String| encode_utf16le(name))]
        String,
    ),
    #[br(pre_assert(context_type == NegotiateContext::SIGNING))]
    Signing(SigningCapabilities),
    /// A context this engine does not interpret (transport, RDMA transform).
    #[br(pre_assert(!NegotiateContext::is_known(context_type)))]
    Other {
        #[br(calc = context_type)]
        #[bw(ignore)]
        context_type: u16,
        #[br(parse_with = binrw::helpers::until_eof)]
        data: Vec<u8>,
    },
}

impl NegotiateContext {
    pub const PREAUTH_INTEGRITY: u16 = 0x0001;
    pub const ENCRYPTION: u16 = 0x0002;
    pub const COMPRESSION: u16 = 0x0003;
    pub const NETNAME: u16 = 0x0005;
    pub const SIGNING: u16 = 0x0008;

    pub fn context_type(&self) -> u16 {
        match self {
            NegotiateContext::PreauthIntegrity(_) => Self::PREAUTH_INTEGRITY,
            NegotiateContext::Encryption(_) => Self::ENCRYPTION,
            NegotiateContext::Compression(_) => Self::COMPRESSION,
            NegotiateContext::Netname(_) => Self::NETNAME,
            NegotiateContext::Signing(_) => Self::SIGNING,
            NegotiateContext::Other { context_type, .. } => *context_type,
        }
    }

    fn is_known(context_type: u16) -> bool {
        matches!(
            context_type,
            Self::PREAUTH_INTEGRITY
                | Self::ENCRYPTION
                | Self::COMPRESSION
                | Self::NETNAME
                | Self::SIGNING
        )
    }
}

#[binrw::parser(reader)]
fn read_utf16_to_end() -> BinResult<String> {
    let pos = reader.stream_position()?;
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes)?;
    decode_utf16le(&bytes).map_err(|err| binrw::Error::Custom {
        pos,
        err: Box::new(err),
    })
}

/// Context header and data. Each entry starts on an 8-byte boundary from the header.
#[smb_message_binrw]
struct NegotiateContextEntry {
    #[brw(align_before = 8)]
    #[bw(calc = data.context_type())]
    #[br(temp)]
    context_type: u16,
    #[bw(calc = PosMarker::default())]
    #[br(temp)]
    data_length: PosMarker<u16>,
    reserved: u32,
    #[br(args(context_type))]
    #[br(map_stream = |s| s.take_seek(data_length.value.into()))]
    #[bw(write_with = PosMarker::write_size, args(&data_length))]
    data: NegotiateContext,
}

/// Reads `count` contexts. Running out of message before the last one is a chain overrun.
#[binrw::parser(reader, endian)]
fn read_negotiate_contexts(count: u16) -> BinResult<Option<Vec<NegotiateContext>>> {
    let mut contexts = Vec::with_capacity(count.into());
    for _ in 0..count {
        let pos = reader.stream_position()?;
        let entry = NegotiateContextEntry::read_options(reader, endian, ()).map_err(|err| {
            if err.is_eof() {
                binrw::Error::Custom {
                    pos,
                    err: Box::new(SmbMsgError::ContextChainOverrun(pos as usize)),
                }
            } else {
                err
            }
        })?;
        contexts.push(entry.data);
    }
    Ok(Some(contexts))
}

fn write_negotiate_contexts<W: Write + Seek>(
    contexts: &Option<Vec<NegotiateContext>>,
    writer: &mut W,
    endian: Endian,
    (offset,): (&PosMarker<u32>,),
) -> BinResult<()> {
    let Some(contexts) = contexts else {
        return Ok(());
    };
    offset.write_back(writer.stream_position()?, writer, endian)?;
    for context in contexts {
        NegotiateContextEntry {
            data: context.clone(),
        }
        .write_options(writer, endian, ())?;
    }
    Ok(())
}

/// Finds the first context matching `pat` in a context list.
#[macro_export]
macro_rules! find_negotiate_context {
    ($list:expr, $variant:ident) => {
        $list.iter().find_map(|c| match c {
            $crate::NegotiateContext::$variant(v) => Some(v),
            _ => None,
        })
    };
}
