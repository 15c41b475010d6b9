//! QUERY_DIRECTORY.

use std::io::SeekFrom;

use binrw::prelude::*;
use modular_bitfield::prelude::*;
use smb_dtyp::binrw_util::prelude::*;
use smb_msg_derive::*;

use crate::{FileId, Result, SmbMsgError, buffer_start};

/// Directory information classes, which select the entry layout of the output.
pub mod dir_info_class {
    pub const DIRECTORY: u8 = 0x01;
    pub const FULL_DIRECTORY: u8 = 0x02;
    pub const BOTH_DIRECTORY: u8 = 0x03;
    pub const NAMES: u8 = 0x0c;
    pub const ID_BOTH_DIRECTORY: u8 = 0x25;
    pub const ID_FULL_DIRECTORY: u8 = 0x26;
}

#[smb_dtyp::mbitfield]
pub struct QueryDirectoryFlags {
    pub restart_scans: bool,
    pub return_single_entry: bool,
    pub index_specified: bool,
    /// Restart with a new search pattern.
    pub reopen: bool,
    #[skip]
    __: B4,
}

/// Reference: MS-SMB2 2.2.33
#[smb_request(size = 33)]
pub struct QueryDirectoryRequest {
    pub file_information_class: u8,
    pub flags: QueryDirectoryFlags,
    /// Ignored by the server unless `index_specified` is set.
    #[bw(assert(
        flags.index_specified() || *file_index == 0,
        SmbMsgError::InvalidData("file index given without index_specified".into())
    ))]
    pub file_index: u32,
    pub file_id: FileId,
    #[bw(calc = PosMarker::default())]
    #[br(temp)]
    _file_name_offset: PosMarker<u16>,
    #[bw(try_calc = file_name.size().try_into())]
    #[br(temp)]
    _file_name_length: u16,
    pub output_buffer_length: u32,
    /// Search pattern, e.g. `*`.
    #[br(seek_before = SeekFrom::Start(_file_name_offset.value.into()))]
    #[br(args { size: SizedStringSize::bytes16(_file_name_length) })]
    #[bw(write_with = PosMarker::write_aoff, args(&_file_name_offset))]
    pub file_name: SizedWideString,
}

/// Reference: MS-SMB2 2.2.34
#[smb_response(size = 9)]
pub struct QueryDirectoryResponse {
    #[bw(calc = PosMarker::default())]
    #[br(temp)]
    _output_buffer_offset: PosMarker<u16>,
    #[bw(calc = PosMarker::default())]
    #[br(temp)]
    _output_buffer_length: PosMarker<u32>,
    #[br(seek_before = buffer_start(_output_buffer_offset.value.into(), _output_buffer_length.value.into()))]
    #[br(count = _output_buffer_length.value)]
    #[bw(write_with = PosMarker::write_aoff_size, args(&_output_buffer_offset, &_output_buffer_length))]
    pub output_buffer: Vec<u8>,
}

impl QueryDirectoryResponse {
    /// Splits the output into its entries, following each `NextEntryOffset`.
    pub fn entries(&self) -> Result<Vec<&[u8]>> {
        split_chained_entries(&self.output_buffer)
    }
}

/// Walks a buffer of entries chained by a leading u32 next-entry offset.
///
/// Entry layouts belong to the information class, so entries stay raw bytes.
fn split_chained_entries(buf: &[u8]) -> Result<Vec<&[u8]>> {
    let mut out = Vec::new();
    let mut pos = 0usize;
    while pos < buf.len() {
        let head = buf
            .get(pos..pos + CHAINED_ITEM_PREFIX_SIZE)
            .ok_or(SmbMsgError::ContextChainOverrun(pos))?;
        let next = u32::from_le_bytes([head[0], head[1], head[2], head[3]]) as usize;
        if next == 0 {
            out.push(&buf[pos..]);
            break;
        }
        let entry = pos
            .checked_add(next)
            .and_then(|end| buf.get(pos..end))
            .ok_or(SmbMsgError::ContextChainOverrun(pos))?;
        out.push(entry);
        pos += next;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::*;
    use crate::*;

    test_request! {
        QueryDirectory {
            file_information_class: dir_info_class::ID_BOTH_DIRECTORY,
            flags: QueryDirectoryFlags::new().with_restart_scans(true),
            file_index: 0,
            file_id: FileId {
                persistent: 0x0000000c00000149,
                volatile: 0x0000000c00000009,
            },
            output_buffer_length: 0x10000,
            file_name: "*".into(),
        } => "21002501 00000000 490100000c000000090000000c000000 6000 0200 00000100 2a00"
    }

    test_response! {
        QueryDirectory {
            output_buffer: smb_tests::hex_to_u8_array! { "00000000 aaaaaaaa" },
        } => "0900 4800 08000000 00000000 aaaaaaaa"
    }

    #[test]
    fn test_file_index_requires_flag() {
        let req = QueryDirectoryRequest {
            file_information_class: dir_info_class::NAMES,
            flags: QueryDirectoryFlags::new(),
            file_index: 7,
            file_id: FileId::EMPTY,
            output_buffer_length: 0x1000,
            file_name: "*".into(),
        };
        let err = req
            .write_le(&mut binrw::io::Cursor::new(Vec::new()))
            .unwrap_err();
        assert!(matches!(
            err.custom_err::<SmbMsgError>(),
            Some(SmbMsgError::InvalidData(_))
        ));
    }

    #[test]
    fn test_split_entries() {
        let response = QueryDirectoryResponse {
            output_buffer: smb_tests::hex_to_u8_array! {
                "08000000 aaaaaaaa 00000000 bbbb"
            },
        };
        let entries = response.entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].len(), 8);
        assert_eq!(entries[1], [0, 0, 0, 0, 0xbb, 0xbb]);
    }

    #[test]
    fn test_split_entries_overrun() {
        let buf = smb_tests::hex_to_u8_array! {"20000000 aaaaaaaa"};
        assert!(matches!(
            split_chained_entries(&buf),
            Err(SmbMsgError::ContextChainOverrun(0))
        ));
    }
}
