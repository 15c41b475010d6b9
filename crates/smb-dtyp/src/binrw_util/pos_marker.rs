//! [`PosMarker`] implementation for binrw.

use std::cell::Cell;
use std::fmt::Debug;
use std::io::{Read, Seek, SeekFrom, Write};

use binrw::{Endian, error::CustomError, prelude::*};

/// A field whose value depends on where, or how much, a later field is written:
/// offsets and lengths of variable-size buffers.
///
/// When writing, a zero placeholder is written and its position is recorded. One of
/// the `write_*` functions, used as the `write_with` of the later field, seeks back
/// and fills in the value.
///
/// When reading, [`value`][Self::value] holds the field as read, and
/// [`pos`][Self::pos] where it was read from.
#[derive(Default)]
pub struct PosMarker<T> {
    pub pos: Cell<u64>,
    pub value: T,
}

impl<T> PosMarker<T> {
    /// A seek target `offset` bytes after this marker.
    pub fn seek_from(&self, offset: u64) -> SeekFrom {
        SeekFrom::Start(self.pos.get() + offset)
    }

    /// Like [`seek_from`][Self::seek_from], but stays in place when `condition` is false.
    pub fn seek_from_if(&self, offset: u64, condition: bool) -> SeekFrom {
        if condition {
            self.seek_from(offset)
        } else {
            SeekFrom::Current(0)
        }
    }
}

impl<T: Debug> Debug for PosMarker<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PosMarker")
            .field("pos", &self.pos.get())
            .field("value", &self.value)
            .finish()
    }
}

impl<T> BinRead for PosMarker<T>
where
    T: BinRead,
{
    type Args<'a> = T::Args<'a>;

    fn read_options<R: Read + Seek>(
        reader: &mut R,
        endian: Endian,
        args: Self::Args<'_>,
    ) -> BinResult<Self> {
        let pos = reader.stream_position()?;
        let value = T::read_options(reader, endian, args)?;
        Ok(PosMarker {
            pos: Cell::new(pos),
            value,
        })
    }
}

impl<T> BinWrite for PosMarker<T>
where
    T: BinWrite + Default,
    for<'a> T::Args<'a>: Default,
{
    type Args<'a> = ();

    fn write_options<W: Write + Seek>(
        &self,
        writer: &mut W,
        endian: Endian,
        _: Self::Args<'_>,
    ) -> BinResult<()> {
        self.pos.set(writer.stream_position()?);
        T::default().write_options(writer, endian, Default::default())
    }
}

/// Writes `value` and returns where it started and how many bytes it took.
fn write_tracked<U, W>(value: &U, writer: &mut W, endian: Endian) -> BinResult<(u64, u64)>
where
    U: BinWrite,
    for<'a> U::Args<'a>: Default,
    W: Write + Seek,
{
    let start = writer.stream_position()?;
    value.write_options(writer, endian, Default::default())?;
    let end = writer.stream_position()?;
    Ok((start, end - start))
}

impl<T> PosMarker<T>
where
    T: BinWrite + TryFrom<u64>,
    <T as TryFrom<u64>>::Error: CustomError + 'static,
    for<'a> T::Args<'a>: Default,
{
    /// Fills in the placeholder written for this marker, then returns to the current position.
    pub fn write_back<W: Write + Seek>(
        &self,
        value: u64,
        writer: &mut W,
        endian: Endian,
    ) -> BinResult<()> {
        let value = T::try_from(value).map_err(|err| binrw::Error::Custom {
            pos: self.pos.get(),
            err: Box::new(err),
        })?;
        let return_to = writer.stream_position()?;
        writer.seek(SeekFrom::Start(self.pos.get()))?;
        value.write_options(writer, endian, Default::default())?;
        writer.seek(SeekFrom::Start(return_to))?;
        Ok(())
    }

    /// Writes `value`, storing its absolute offset in `offset`.
    pub fn write_aoff<U, W>(
        value: &U,
        writer: &mut W,
        endian: Endian,
        (offset,): (&Self,),
    ) -> BinResult<()>
    where
        U: BinWrite,
        for<'a> U::Args<'a>: Default,
        W: Write + Seek,
    {
        let (start, _) = write_tracked(value, writer, endian)?;
        offset.write_back(start, writer, endian)
    }

    /// Writes `value`, storing its length in bytes in `size`.
    pub fn write_size<U, W>(
        value: &U,
        writer: &mut W,
        endian: Endian,
        (size,): (&Self,),
    ) -> BinResult<()>
    where
        U: BinWrite,
        for<'a> U::Args<'a>: Default,
        W: Write + Seek,
    {
        let (_, len) = write_tracked(value, writer, endian)?;
        size.write_back(len, writer, endian)
    }

    /// Writes `value`, storing its absolute offset in `offset` and its length in `size`.
    /// An empty value gets a zero offset.
    pub fn write_aoff_size<S, U, W>(
        value: &U,
        writer: &mut W,
        endian: Endian,
        (offset, size): (&Self, &PosMarker<S>),
    ) -> BinResult<()>
    where
        S: BinWrite + TryFrom<u64>,
        <S as TryFrom<u64>>::Error: CustomError + 'static,
        for<'a> S::Args<'a>: Default,
        U: BinWrite,
        for<'a> U::Args<'a>: Default,
        W: Write + Seek,
    {
        let (start, len) = write_tracked(value, writer, endian)?;
        offset.write_back(if len == 0 { 0 } else { start }, writer, endian)?;
        size.write_back(len, writer, endian)
    }

    /// Writes `value`, storing in `offset` its distance from `offset` itself, plus `plus`.
    pub fn write_roff_plus<U, W>(
        value: &U,
        writer: &mut W,
        endian: Endian,
        (offset, plus): (&Self, u64),
    ) -> BinResult<()>
    where
        U: BinWrite,
        for<'a> U::Args<'a>: Default,
        W: Write + Seek,
    {
        let (start, _) = write_tracked(value, writer, endian)?;
        offset.write_back(start - offset.pos.get() + plus, writer, endian)
    }

    /// Writes `value`, storing in `offset` its distance from `base`, plus `plus`, and its
    /// length in `size`. An empty value gets a zero offset.
    pub fn write_roff_size_b_plus<S, B, U, W>(
        value: &U,
        writer: &mut W,
        endian: Endian,
        (offset, size, base, plus): (&Self, &PosMarker<S>, &PosMarker<B>, u64),
    ) -> BinResult<()>
    where
        S: BinWrite + TryFrom<u64>,
        <S as TryFrom<u64>>::Error: CustomError + 'static,
        for<'a> S::Args<'a>: Default,
        U: BinWrite,
        for<'a> U::Args<'a>: Default,
        W: Write + Seek,
    {
        let (start, len) = write_tracked(value, writer, endian)?;
        let relative = if len == 0 {
            0
        } else {
            start - base.pos.get() + plus
        };
        offset.write_back(relative, writer, endian)?;
        size.write_back(len, writer, endian)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[binrw::binrw]
    #[derive(Debug, PartialEq, Eq)]
    #[brw(little)]
    struct Blob {
        #[bw(calc = PosMarker::default())]
        #[br(temp)]
        _offset: PosMarker<u16>,
        #[bw(calc = PosMarker::default())]
        #[br(temp)]
        _length: PosMarker<u32>,
        #[brw(align_before = 8)]
        #[br(seek_before = SeekFrom::Start(_offset.value as u64), count = _length.value)]
        #[bw(write_with = PosMarker::write_aoff_size, args(&_offset, &_length))]
        data: Vec<u8>,
    }

    #[test]
    fn test_offset_and_length_back_patched() {
        let blob = Blob {
            data: vec![0xaa, 0xbb, 0xcc],
        };
        let mut cursor = Cursor::new(Vec::new());
        blob.write(&mut cursor).unwrap();
        let bytes = cursor.into_inner();
        assert_eq!(bytes, [8, 0, 3, 0, 0, 0, 0, 0, 0xaa, 0xbb, 0xcc]);
        assert_eq!(Blob::read(&mut Cursor::new(&bytes)).unwrap(), blob);
    }

    #[test]
    fn test_empty_value_zero_offset() {
        let mut cursor = Cursor::new(Vec::new());
        Blob { data: vec![] }.write(&mut cursor).unwrap();
        assert_eq!(cursor.into_inner(), [0u8; 8]);
    }

    #[test]
    fn test_value_too_large_for_marker() {
        let marker = PosMarker::<u8>::default();
        let mut cursor = Cursor::new(vec![0u8; 4]);
        let err = marker
            .write_back(0x100, &mut cursor, Endian::Little)
            .unwrap_err();
        assert!(matches!(err, binrw::Error::Custom { pos: 0, .. }));
    }
}
