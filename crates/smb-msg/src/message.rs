//! Whole messages as they appear after transport framing: plain, transformed or compressed.

use binrw::io::Cursor;
use binrw::prelude::*;
use smb_msg_derive::*;

use crate::{Result, SmbMsgError};

/// The kind of message, told apart by the first byte of its protocol id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolId {
    /// `0xFE 'SMB'`: a header follows directly.
    Plain,
    /// `0xFD 'SMB'`: a transform header wraps an encrypted message.
    Transformed,
    /// `0xFC 'SMB'`: a compression transform header. Never negotiated in use here.
    Compressed,
}

impl ProtocolId {
    pub fn of(buf: &[u8]) -> Result<ProtocolId> {
        let magic: [u8; 4] = buf
            .get(..4)
            .and_then(|m| m.try_into().ok())
            .ok_or(SmbMsgError::Truncated {
                offset: 0,
                needed: 4,
                available: buf.len(),
            })?;
        match magic {
            [0xfe, b'S', b'M', b'B'] => Ok(ProtocolId::Plain),
            [0xfd, b'S', b'M', b'B'] => Ok(ProtocolId::Transformed),
            [0xfc, b'S', b'M', b'B'] => Ok(ProtocolId::Compressed),
            _ => Err(SmbMsgError::InvalidProtocolId(u32::from_be_bytes(magic))),
        }
    }
}

const SIGNATURE_SIZE: usize = 16;

/// The header of a transformed (encrypted) message.
///
/// Reference: MS-SMB2 2.2.41
#[smb_message_binrw]
#[brw(little, magic(b"\xfdSMB"))]
pub struct TransformHeader {
    pub signature: u128,
    /// Trimmed by the cipher to its nonce size; always 16 bytes on the wire.
    pub nonce: [u8; 16],
    pub original_message_size: u32,
    reserved: u16,
    /// Encrypted, the only flag defined.
    #[bw(calc = 1)]
    #[br(assert(_flags == 1))]
    #[br(temp)]
    _flags: u16,
    pub session_id: u64,
}

impl TransformHeader {
    pub const PROTOCOL_ID: [u8; 4] = *b"\xfdSMB";
    pub const STRUCT_SIZE: usize = 52;

    /// The header bytes after the protocol id and signature, which authenticate
    /// the ciphertext as associated data.
    pub fn aead_bytes(&self) -> Result<Vec<u8>> {
        let mut cursor = Cursor::new(Vec::with_capacity(Self::STRUCT_SIZE));
        self.write(&mut cursor)?;
        Ok(cursor.into_inner().split_off(Self::PROTOCOL_ID.len() + SIGNATURE_SIZE))
    }
}

/// A transform header followed by the encrypted message it covers.
#[smb_message_binrw]
#[brw(little)]
pub struct TransformedMessage {
    pub header: TransformHeader,
    #[br(parse_with = binrw::helpers::until_eof)]
    pub payload: Vec<u8>,
}

impl TransformedMessage {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut cursor = Cursor::new(Vec::with_capacity(
            TransformHeader::STRUCT_SIZE + self.payload.len(),
        ));
        self.write(&mut cursor)?;
        Ok(cursor.into_inner())
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        Ok(Self::read(&mut Cursor::new(buf))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> TransformHeader {
        TransformHeader {
            signature: u128::from_le_bytes([
                0x92, 0x2e, 0xe8, 0xf2, 0xa0, 0x6e, 0x7a, 0xd4, 0x70, 0x22, 0xd7, 0x1d, 0xb, 0x2,
                0x6b, 0x11,
            ]),
            nonce: [
                0xa, 0x57, 0x67, 0x55, 0x6d, 0xa0, 0x23, 0x73, 0x1, 0x0, 0x0, 0x0, 0x0, 0x0, 0x0,
                0x0,
            ],
            original_message_size: 104,
            session_id: 0x300024000055,
        }
    }

    smb_tests::test_binrw! {
        TransformHeader => transform_header: sample_header() => "fd534d42922ee8f2a06e7ad47022d71d0b026b110a5767556da023730100000000000000680000000000010055000024003000 00"
    }

    #[test]
    fn test_transform_header_bad_flags() {
        let mut bytes = smb_tests::hex_to_u8_array! {"fd534d42922ee8f2a06e7ad47022d71d0b026b110a5767556da023730100000000000000680000000000010055000024003000 00"};
        bytes[42] = 2;
        assert!(TransformedMessage::decode(&bytes).is_err());
    }

    #[test]
    fn test_aead_bytes() {
        let aad = sample_header().aead_bytes().unwrap();
        assert_eq!(aad.len(), 32);
        assert_eq!(&aad[..2], &[0x0a, 0x57]);
        assert_eq!(&aad[24..], &0x300024000055u64.to_le_bytes());
    }

    #[test]
    fn test_transformed_round_trip() {
        let message = TransformedMessage {
            header: sample_header(),
            payload: vec![0xaa; 104],
        };
        let bytes = message.encode().unwrap();
        assert_eq!(ProtocolId::of(&bytes).unwrap(), ProtocolId::Transformed);
        assert_eq!(TransformedMessage::decode(&bytes).unwrap(), message);
    }

    #[test]
    fn test_protocol_id() {
        assert_eq!(ProtocolId::of(b"\xfeSMB....").unwrap(), ProtocolId::Plain);
        assert_eq!(ProtocolId::of(b"\xfcSMB").unwrap(), ProtocolId::Compressed);
        assert!(matches!(
            ProtocolId::of(b"\xffSMB"),
            Err(SmbMsgError::InvalidProtocolId(0xff534d42))
        ));
        assert!(matches!(
            ProtocolId::of(b"\xfe"),
            Err(SmbMsgError::Truncated { .. })
        ));
    }
}
