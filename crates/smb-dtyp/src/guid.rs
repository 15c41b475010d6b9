//! [`Guid`] implementation, as used on the SMB2 wire.

use binrw::{Endian, prelude::*};
use rand::RngCore;
use std::fmt::{Debug, Display};
use std::io::{Read, Seek, Write};
use std::str::FromStr;

use crate::DtypError;

/// A 128-bit GUID, in the mixed-endian layout defined by MS-DTYP 2.3.4.
///
/// Client GUIDs, create GUIDs and lease keys all use this representation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Guid {
    pub data1: u32,
    pub data2: u16,
    pub data3: u16,
    pub data4: [u8; 8],
}

impl Guid {
    pub const ZERO: Guid = Guid {
        data1: 0,
        data2: 0,
        data3: 0,
        data4: [0; 8],
    };

    /// Generates a new random (version 4) GUID.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        // Version 4, variant 1.
        bytes[7] = (bytes[7] & 0x0f) | 0x40;
        bytes[8] = (bytes[8] & 0x3f) | 0x80;
        Self::from(bytes)
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    /// Returns the wire (little-endian, mixed) representation of the GUID.
    pub fn to_bytes(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[0..4].copy_from_slice(&self.data1.to_le_bytes());
        out[4..6].copy_from_slice(&self.data2.to_le_bytes());
        out[6..8].copy_from_slice(&self.data3.to_le_bytes());
        out[8..16].copy_from_slice(&self.data4);
        out
    }
}

impl From<[u8; 16]> for Guid {
    fn from(bytes: [u8; 16]) -> Self {
        let mut data4 = [0u8; 8];
        data4.copy_from_slice(&bytes[8..16]);
        Guid {
            data1: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            data2: u16::from_le_bytes([bytes[4], bytes[5]]),
            data3: u16::from_le_bytes([bytes[6], bytes[7]]),
            data4,
        }
    }
}

impl From<u128> for Guid {
    fn from(value: u128) -> Self {
        Self::from(value.to_le_bytes())
    }
}

impl From<Guid> for u128 {
    fn from(value: Guid) -> Self {
        u128::from_le_bytes(value.to_bytes())
    }
}

impl FromStr for Guid {
    type Err = DtypError;

    /// Parses `xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx`, optionally wrapped in braces.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim_start_matches('{').trim_end_matches('}');
        let parts: Vec<&str> = trimmed.split('-').collect();
        let invalid = || DtypError::InvalidGuid(s.to_string());
        if parts.len() != 5
            || parts[0].len() != 8
            || parts[1].len() != 4
            || parts[2].len() != 4
            || parts[3].len() != 4
            || parts[4].len() != 12
        {
            return Err(invalid());
        }

        let data1 = u32::from_str_radix(parts[0], 16).map_err(|_| invalid())?;
        let data2 = u16::from_str_radix(parts[1], 16).map_err(|_| invalid())?;
        let data3 = u16::from_str_radix(parts[2], 16).map_err(|_| invalid())?;
        let tail = format!("{}{}", parts[3], parts[4]);
        let mut data4 = [0u8; 8];
        for (i, byte) in data4.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&tail[i * 2..i * 2 + 2], 16).map_err(|_| invalid())?;
        }
        Ok(Guid {
            data1,
            data2,
            data3,
            data4,
        })
    }
}

impl Display for Guid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:08x}-{:04x}-{:04x}-{:02x}{:02x}-",
            self.data1, self.data2, self.data3, self.data4[0], self.data4[1]
        )?;
        for b in &self.data4[2..] {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl Debug for Guid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Guid({self})")
    }
}

impl BinRead for Guid {
    type Args<'a> = ();

    fn read_options<R: Read + Seek>(
        reader: &mut R,
        _: Endian,
        _: Self::Args<'_>,
    ) -> BinResult<Self> {
        let bytes = <[u8; 16]>::read_options(reader, Endian::Little, ())?;
        Ok(Guid::from(bytes))
    }
}

impl BinWrite for Guid {
    type Args<'a> = ();

    fn write_options<W: Write + Seek>(
        &self,
        writer: &mut W,
        _: Endian,
        _: Self::Args<'_>,
    ) -> BinResult<()> {
        self.to_bytes().write_options(writer, Endian::Little, ())
    }
}
