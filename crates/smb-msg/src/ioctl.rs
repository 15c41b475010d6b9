//! IOCTL request/response and the FSCTL payloads the engine issues.

use binrw::io::Cursor;
use binrw::prelude::*;
use modular_bitfield::prelude::*;
use smb_dtyp::Guid;
use smb_dtyp::binrw_util::prelude::*;
use smb_msg_derive::*;

use crate::{
    Dialect, FileId, GlobalCapabilities, NegotiateSecurityMode, Result, SmbMsgError, buffer_start,
};

/// The FSCTL codes this crate knows how to build or parse.
#[smb_message_binrw]
#[derive(Copy)]
#[brw(repr(u32))]
pub enum FsctlCode {
    PipeTransceive = 0x0011C017,
    SrvRequestResumeKey = 0x00140078,
    ValidateNegotiateInfo = 0x00140204,
    SrvCopychunk = 0x001440F2,
    SrvCopychunkWrite = 0x001480F2,
}

#[smb_dtyp::mbitfield]
pub struct IoctlRequestFlags {
    pub is_fsctl: bool,
    #[skip]
    __: B31,
}

/// Reference: MS-SMB2 2.2.31
#[smb_request(size = 57)]
pub struct IoctlRequest {
    reserved: u16,
    pub ctl_code: u32,
    pub file_id: FileId,
    #[bw(calc = PosMarker::default())]
    #[br(temp)]
    _input_offset: PosMarker<u32>,
    #[bw(calc = PosMarker::default())]
    #[br(temp)]
    _input_count: PosMarker<u32>,
    pub max_input_response: u32,
    #[bw(calc = 0)]
    #[br(temp)]
    _output_offset: u32,
    #[bw(calc = 0)]
    #[br(temp)]
    _output_count: u32,
    pub max_output_response: u32,
    pub flags: IoctlRequestFlags,
    reserved: u32,
    #[br(seek_before = buffer_start(_input_offset.value.into(), _input_count.value.into()))]
    #[br(count = _input_count.value)]
    #[bw(write_with = PosMarker::write_aoff_size, args(&_input_offset, &_input_count))]
    pub buffer: Vec<u8>,
}

impl IoctlRequest {
    /// Builds an FSCTL request carrying `payload` as its input buffer.
    pub fn fsctl<T: FsctlRequest>(
        file_id: FileId,
        payload: &T,
        max_output_response: u32,
    ) -> Result<IoctlRequest> {
        let mut cursor = Cursor::new(Vec::new());
        payload.write_le(&mut cursor)?;
        Ok(IoctlRequest {
            ctl_code: payload.code() as u32,
            file_id,
            max_input_response: 0,
            max_output_response,
            flags: IoctlRequestFlags::new().with_is_fsctl(true),
            buffer: cursor.into_inner(),
        })
    }
}

/// Reference: MS-SMB2 2.2.32
#[smb_response(size = 49)]
pub struct IoctlResponse {
    reserved: u16,
    pub ctl_code: u32,
    pub file_id: FileId,
    #[bw(calc = PosMarker::default())]
    #[br(temp)]
    _input_offset: PosMarker<u32>,
    #[bw(try_calc = in_buffer.len().try_into())]
    #[br(temp)]
    _input_count: u32,
    #[bw(calc = PosMarker::default())]
    #[br(temp)]
    _output_offset: PosMarker<u32>,
    #[bw(try_calc = out_buffer.len().try_into())]
    #[br(temp)]
    _output_count: u32,
    reserved: u32,
    reserved: u32,
    /// Empty except for pass-through operations.
    #[br(seek_before = buffer_start(_input_offset.value.into(), _input_count.into()))]
    #[br(count = _input_count)]
    #[bw(write_with = PosMarker::write_aoff, args(&_input_offset))]
    pub in_buffer: Vec<u8>,
    // Output follows input. Both share an offset when input is empty.
    #[br(seek_before = buffer_start(_output_offset.value.into(), _output_count.into()))]
    #[br(count = _output_count)]
    #[bw(align_before = 8)]
    #[bw(write_with = PosMarker::write_aoff, args(&_output_offset))]
    pub out_buffer: Vec<u8>,
}

impl IoctlResponse {
    /// Parses the output buffer as the response of FSCTL request `T`.
    pub fn parse_fsctl<T: FsctlRequest>(&self) -> Result<T::Response> {
        if !T::accepts(self.ctl_code) {
            return Err(SmbMsgError::InvalidData(format!(
                "expected FSCTL {:?}, got {:#x}",
                T::CODE,
                self.ctl_code
            )));
        }
        let mut cursor = Cursor::new(&self.out_buffer);
        Ok(T::Response::read_le(&mut cursor)?)
    }
}

/// An FSCTL input payload, tied to its control code and output type.
pub trait FsctlRequest: for<'a> BinWrite<Args<'a> = ()> {
    type Response: for<'a> BinRead<Args<'a> = ()>;
    const CODE: FsctlCode;

    fn code(&self) -> FsctlCode {
        Self::CODE
    }

    /// Whether a response carrying `ctl_code` answers this request type.
    fn accepts(ctl_code: u32) -> bool {
        ctl_code == Self::CODE as u32
    }
}

/// FSCTL_VALIDATE_NEGOTIATE_INFO input. Echoes what the client sent in NEGOTIATE.
#[smb_request_binrw]
pub struct ValidateNegotiateInfoRequest {
    pub capabilities: GlobalCapabilities,
    pub guid: Guid,
    pub security_mode: NegotiateSecurityMode,
    #[bw(try_calc = dialects.len().try_into())]
    #[br(temp)]
    dialect_count: u16,
    #[br(count = dialect_count)]
    pub dialects: Vec<Dialect>,
}

impl FsctlRequest for ValidateNegotiateInfoRequest {
    type Response = ValidateNegotiateInfoResponse;
    const CODE: FsctlCode = FsctlCode::ValidateNegotiateInfo;
}

/// What the server believes was negotiated on this connection.
#[smb_response_binrw]
pub struct ValidateNegotiateInfoResponse {
    pub capabilities: GlobalCapabilities,
    pub guid: Guid,
    pub security_mode: NegotiateSecurityMode,
    pub dialect: Dialect,
}

pub const SRV_KEY_LENGTH: usize = 24;

/// FSCTL_SRV_REQUEST_RESUME_KEY carries no input.
#[smb_request_binrw]
#[derive(Copy, Default)]
pub struct SrvRequestResumeKeyRequest;

impl FsctlRequest for SrvRequestResumeKeyRequest {
    type Response = SrvRequestResumeKey;
    const CODE: FsctlCode = FsctlCode::SrvRequestResumeKey;
}

/// Opaque key naming the source file of a server-side copy.
#[smb_response_binrw]
pub struct SrvRequestResumeKey {
    pub resume_key: [u8; SRV_KEY_LENGTH],
    #[bw(try_calc = context.len().try_into())]
    #[br(temp)]
    context_length: u32,
    /// Unused by servers; normally empty.
    #[br(count = context_length)]
    pub context: Vec<u8>,
}

/// Reference: MS-SMB2 2.2.31.1
#[smb_request_binrw]
pub struct SrvCopychunkCopy {
    pub source_key: [u8; SRV_KEY_LENGTH],
    #[bw(try_calc = chunks.len().try_into())]
    #[br(temp)]
    chunk_count: u32,
    reserved: u32,
    #[br(count = chunk_count)]
    pub chunks: Vec<SrvCopychunkItem>,
    /// Selects FSCTL_SRV_COPYCHUNK_WRITE, for targets opened without read access.
    #[brw(ignore)]
    pub write: bool,
}

#[smb_request_binrw]
#[derive(Copy)]
pub struct SrvCopychunkItem {
    pub source_offset: u64,
    pub target_offset: u64,
    pub length: u32,
    reserved: u32,
}

impl FsctlRequest for SrvCopychunkCopy {
    type Response = SrvCopychunkResponse;
    const CODE: FsctlCode = FsctlCode::SrvCopychunk;

    fn code(&self) -> FsctlCode {
        if self.write {
            FsctlCode::SrvCopychunkWrite
        } else {
            FsctlCode::SrvCopychunk
        }
    }

    fn accepts(ctl_code: u32) -> bool {
        ctl_code == FsctlCode::SrvCopychunk as u32 || ctl_code == FsctlCode::SrvCopychunkWrite as u32
    }
}

/// Copy totals. When the server answers STATUS_INVALID_PARAMETER, the same
/// fields hold its limits instead: max chunks, max chunk size, max total bytes.
#[smb_response_binrw]
#[derive(Copy, Default)]
pub struct SrvCopychunkResponse {
    pub chunks_written: u32,
    pub chunk_bytes_written: u32,
    pub total_bytes_written: u32,
}

impl SrvCopychunkResponse {
    /// Parses the totals out of a raw IOCTL output buffer, whichever code it carries.
    pub fn from_output(out: &[u8]) -> Result<Self> {
        Ok(Self::read_le(&mut Cursor::new(out))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::*;
    use crate::*;

    const FILE_ID: FileId = FileId {
        persistent: 0x0000000c00000528,
        volatile: 0x0000000c00000085,
    };

    const REQ_IOCTL_BUFFER_CONTENT: &str = "0500000310000000980000000300000080000000010039000000000013f8a58f166fb54482c28f2dae140df50000000001000000000000000000020000000000010000000000000000000200000000000500000000000000010500000000000515000000173da72e955653f915dff280e9030000000000000000000000000000000000000000000001000000000000000000000002000000";

    test_request! {
        Ioctl {
            ctl_code: FsctlCode::PipeTransceive as u32,
            file_id: FILE_ID,
            max_input_response: 0,
            max_output_response: 1024,
            flags: IoctlRequestFlags::new().with_is_fsctl(true),
            buffer: smb_tests::hex_to_u8_array! {REQ_IOCTL_BUFFER_CONTENT},
        } => const_format::concatcp!("3900000017c01100280500000c000000850000000c0000007800000098000000000000000000000000000000000400000100000000000000", REQ_IOCTL_BUFFER_CONTENT)
    }

    test_request! {
        ioctl_no_input: Ioctl {
            ctl_code: FsctlCode::SrvRequestResumeKey as u32,
            file_id: FILE_ID,
            max_input_response: 0,
            max_output_response: 32,
            flags: IoctlRequestFlags::new().with_is_fsctl(true),
            buffer: vec![],
        } => "390000007800140028050000 0c000000850000000c000000000000000000000000000000000000000000000020000000 0100000000000000"
    }

    const IOCTL_TEST_BUFFER_CONTENT: &str = "05000203100000000401000003000000ec00000001000000000002000000000001000000000000000000020000000000200000000000000001000000000000000c000e000000000000000200000000000000020000000000070000000000000000000000000000000600000000000000410056004900560056004d00000000000400000000000000010400000000000515000000173da72e955653f915dff28001000000000000000000020000000000010000000000000001000000000000000a000c00000000000000020000000000000000000000000006000000000000000000000000000000050000000000000061007600690076006e0000000100000000000000";

    test_response! {
        Ioctl {
            ctl_code: FsctlCode::PipeTransceive as u32,
            file_id: FILE_ID,
            in_buffer: vec![],
            out_buffer: smb_tests::hex_to_u8_array! {IOCTL_TEST_BUFFER_CONTENT},
        } => const_format::concatcp!("3100000017c01100280500000c000000850000000c000000700000000000000070000000040100000000000000000000", IOCTL_TEST_BUFFER_CONTENT)
    }

    const SOURCE_KEY: [u8; SRV_KEY_LENGTH] = [
        0x2d, 0x3, 0x0, 0x0, 0x1c, 0x0, 0x0, 0x0, 0x27, 0x11, 0x6a, 0x26, 0x30, 0xd2, 0xdb, 0x1,
        0xff, 0xfe, 0x0, 0x0, 0x0, 0x0, 0x0, 0x0,
    ];

    #[test]
    fn test_resume_key() {
        let response = IoctlResponse {
            ctl_code: FsctlCode::SrvRequestResumeKey as u32,
            file_id: FILE_ID,
            in_buffer: vec![],
            out_buffer: smb_tests::hex_to_u8_array! {"2d0300001c00000027116a2630d2db01fffe00000000000000000000"},
        };
        let key = response.parse_fsctl::<SrvRequestResumeKeyRequest>().unwrap();
        assert_eq!(
            key,
            SrvRequestResumeKey {
                resume_key: SOURCE_KEY,
                context: vec![],
            }
        );
    }

    #[test]
    fn test_copychunk_request() {
        const CHUNK_SIZE: u32 = 1 << 20;
        const TOTAL_SIZE: u32 = 10417096;
        const BLOCK_NUM: u32 = TOTAL_SIZE.div_ceil(CHUNK_SIZE);
        let copy = SrvCopychunkCopy {
            source_key: SOURCE_KEY,
            chunks: (0..BLOCK_NUM)
                .map(|i| SrvCopychunkItem {
                    source_offset: (i * CHUNK_SIZE) as u64,
                    target_offset: (i * CHUNK_SIZE) as u64,
                    length: if i == BLOCK_NUM - 1 {
                        TOTAL_SIZE % CHUNK_SIZE
                    } else {
                        CHUNK_SIZE
                    },
                })
                .collect(),
            write: false,
        };
        let request = IoctlRequest::fsctl(FileId::EMPTY, &copy, 12).unwrap();
        assert_eq!(request.ctl_code, 0x001440F2);
        assert_eq!(
            request.buffer,
            smb_tests::hex_to_u8_array! {"2d0300001c00000027116a2630d2db01fffe0000000000000a000000000000000
        00000000000000000000000000000000000100000000000000010000000000000001000
        00000000000010000000000000002000000000000000200000000000000010000000000
        00000300000000000000030000000000000001000000000000000400000000000000040
        00000000000000100000000000000050000000000000005000000000000000100000000
        00000006000000000000000600000000000000010000000000000007000000000000000
        70000000000000001000000000000000800000000000000080000000000000001000000
        0000000009000000000000000900000000000c8f30e0000000000"}
        );

        let write = SrvCopychunkCopy { write: true, ..copy };
        let request = IoctlRequest::fsctl(FileId::EMPTY, &write, 12).unwrap();
        assert_eq!(request.ctl_code, FsctlCode::SrvCopychunkWrite as u32);
    }

    #[test]
    fn test_copychunk_response() {
        let response = IoctlResponse {
            ctl_code: FsctlCode::SrvCopychunk as u32,
            file_id: FILE_ID,
            in_buffer: vec![],
            out_buffer: smb_tests::hex_to_u8_array! {"0a00000000000000c8f39e00"},
        };
        let totals = response.parse_fsctl::<SrvCopychunkCopy>().unwrap();
        assert_eq!(
            totals,
            SrvCopychunkResponse {
                chunks_written: 10,
                chunk_bytes_written: 0,
                total_bytes_written: 10417096,
            }
        );
        assert!(response.parse_fsctl::<ValidateNegotiateInfoRequest>().is_err());
    }

    #[test]
    fn test_copychunk_response_short_output() {
        let err = SrvCopychunkResponse::from_output(&[0x0a, 0, 0, 0]).unwrap_err();
        assert!(matches!(err, SmbMsgError::BinRw(_)));
    }

    #[test]
    fn test_validate_negotiate_payload() {
        let request = ValidateNegotiateInfoRequest {
            capabilities: GlobalCapabilities::new().with_leasing(true),
            guid: Guid::from(0x11u128),
            security_mode: NegotiateSecurityMode::new().with_signing_enabled(true),
            dialects: vec![Dialect::Smb030, Dialect::Smb0302],
        };
        let ioctl = IoctlRequest::fsctl(FileId::FULL, &request, 24).unwrap();
        assert_eq!(ioctl.ctl_code, 0x00140204);
        assert_eq!(ioctl.buffer.len(), 4 + 16 + 2 + 2 + 4);
        let parsed = ValidateNegotiateInfoRequest::read_le(&mut Cursor::new(&ioctl.buffer)).unwrap();
        assert_eq!(parsed, request);
    }
}
