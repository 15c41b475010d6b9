//! UTF-16LE strings, as carried by every SMB2 name/path field.
//!
//! The wire never carries a terminator: the length lives in a separate
//! (offset, length) pair owned by the enclosing structure.

use std::fmt::{Debug, Display};
use std::io::{Read, Seek, Write};
use std::ops::Deref;

use binrw::{Endian, NamedArgs, prelude::*};

use crate::DtypError;

/// The byte length of a [`SizedWideString`] on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SizedStringSize(u64);

impl SizedStringSize {
    pub fn bytes(size: u64) -> Self {
        SizedStringSize(size)
    }

    /// From a 16-bit length field.
    pub fn bytes16(size: u16) -> Self {
        SizedStringSize(size.into())
    }

    /// From a 32-bit length field.
    pub fn bytes32(size: u32) -> Self {
        SizedStringSize(size.into())
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

#[derive(NamedArgs, Clone)]
pub struct SizedStringArgs {
    pub size: SizedStringSize,
}

/// A UTF-16LE string whose byte length is stored elsewhere in the enclosing structure.
///
/// Trailing NUL characters are dropped on read.
#[derive(Clone, PartialEq, Eq, Default, Hash, PartialOrd, Ord)]
pub struct SizedWideString(String);

impl SizedWideString {
    /// Byte length once UTF-16 encoded.
    pub fn size(&self) -> u64 {
        utf16_size(&self.0) as u64
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl BinRead for SizedWideString {
    type Args<'a> = SizedStringArgs;

    fn read_options<R: Read + Seek>(
        reader: &mut R,
        _: Endian,
        args: Self::Args<'_>,
    ) -> BinResult<Self> {
        let pos = reader.stream_position()?;
        let size = args.size.get();
        let mut bytes = Vec::new();
        reader.take(size).read_to_end(&mut bytes)?;
        if (bytes.len() as u64) < size {
            return Err(binrw::Error::Io(std::io::ErrorKind::UnexpectedEof.into()));
        }
        let value = decode_utf16le(&bytes).map_err(|err| binrw::Error::Custom {
            pos,
            err: Box::new(err),
        })?;
        Ok(SizedWideString(value))
    }
}

impl BinWrite for SizedWideString {
    type Args<'a> = ();

    fn write_options<W: Write + Seek>(
        &self,
        writer: &mut W,
        _: Endian,
        _: Self::Args<'_>,
    ) -> BinResult<()> {
        writer.write_all(&encode_utf16le(&self.0))?;
        Ok(())
    }
}

impl Deref for SizedWideString {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<&str> for SizedWideString {
    fn from(value: &str) -> Self {
        SizedWideString(value.to_string())
    }
}

impl From<String> for SizedWideString {
    fn from(value: String) -> Self {
        SizedWideString(value)
    }
}

impl From<SizedWideString> for String {
    fn from(value: SizedWideString) -> Self {
        value.0
    }
}

impl PartialEq<str> for SizedWideString {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for SizedWideString {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

impl Display for SizedWideString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Debug for SizedWideString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(&self.0, f)
    }
}

/// Encodes `s` as UTF-16LE bytes, without a terminating NUL.
pub fn encode_utf16le(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(|c| c.to_le_bytes()).collect()
}

/// Decodes UTF-16LE bytes. Trailing NUL characters are stripped.
pub fn decode_utf16le(bytes: &[u8]) -> Result<String, DtypError> {
    if bytes.len() % 2 != 0 {
        return Err(DtypError::OddUtf16Length(bytes.len()));
    }
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    let mut s = String::from_utf16(&units)?;
    while s.ends_with('\0') {
        s.pop();
    }
    Ok(s)
}

/// Byte length of `s` once UTF-16 encoded.
pub fn utf16_size(s: &str) -> usize {
    s.encode_utf16().count() * 2
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_utf16_round_trip_non_ascii() {
        let name = SizedWideString::from("dir\\fïlé.txt");
        let mut cursor = Cursor::new(Vec::new());
        name.write_le(&mut cursor).unwrap();
        let bytes = cursor.into_inner();
        assert_eq!(bytes.len() as u64, name.size());

        let parsed = SizedWideString::read_le_args(
            &mut Cursor::new(&bytes),
            SizedStringArgs {
                size: SizedStringSize::bytes(bytes.len() as u64),
            },
        )
        .unwrap();
        assert_eq!(parsed, name);
    }

    #[test]
    fn test_trailing_nul_dropped() {
        let parsed = SizedWideString::read_le_args(
            &mut Cursor::new([0x41, 0x00, 0x00, 0x00]),
            SizedStringArgs {
                size: SizedStringSize::bytes16(4),
            },
        )
        .unwrap();
        assert_eq!(parsed, "A");
    }

    #[test]
    fn test_odd_length_rejected() {
        let err = SizedWideString::read_le_args(
            &mut Cursor::new([0x41, 0x00, 0x42]),
            SizedStringArgs {
                size: SizedStringSize::bytes16(3),
            },
        )
        .unwrap_err();
        assert!(matches!(
            err.custom_err::<DtypError>(),
            Some(DtypError::OddUtf16Length(3))
        ));
    }

    #[test]
    fn test_short_buffer_is_eof() {
        let err = SizedWideString::read_le_args(
            &mut Cursor::new([0x41, 0x00]),
            SizedStringArgs {
                size: SizedStringSize::bytes16(8),
            },
        )
        .unwrap_err();
        assert!(err.is_eof());
    }
}
