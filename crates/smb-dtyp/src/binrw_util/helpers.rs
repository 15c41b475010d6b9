//! Small parse helpers for optional trailing data.

use std::io::{Read, Seek, SeekFrom};

use binrw::{Endian, prelude::*};

/// Reads a `T` if the stream has any data left, `None` otherwise.
///
/// Meant for use with `#[br(parse_with = binread_if_has_data)]`, inside a stream
/// bounded by `take_seek`.
pub fn binread_if_has_data<T, R>(reader: &mut R, endian: Endian, _: ()) -> BinResult<Option<T>>
where
    T: BinRead,
    for<'a> T::Args<'a>: Default,
    R: Read + Seek,
{
    let position = reader.stream_position()?;
    let end = reader.seek(SeekFrom::End(0))?;
    reader.seek(SeekFrom::Start(position))?;
    if position >= end {
        return Ok(None);
    }
    T::read_options(reader, endian, Default::default()).map(Some)
}
