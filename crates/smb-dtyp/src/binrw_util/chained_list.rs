//! Lists whose entries are linked by a leading "next entry offset" field.
//!
//! Create contexts and the FSCC query buffers share this layout.
//! See [`ChainedItemList<T>`] for how the list is written.

use std::io::{Read, Seek, SeekFrom, Write};

use binrw::{Endian, prelude::*};

use crate::DtypError;

const CHAINED_ITEM_DEFAULT_OFFSET_PAD: u32 = 4;

type NextEntryOffsetType = u32;

/// The size of the next entry offset written before each entry of a [`ChainedItemList<T>`].
///
/// Entries that store offsets relative to their own start must add this to the
/// position of their first field.
pub const CHAINED_ITEM_PREFIX_SIZE: usize = std::mem::size_of::<NextEntryOffsetType>();

/// A sequence of `T` entries, each preceded by the offset of the next one.
///
/// The last entry has a next entry offset of `0`. Every entry but the last is padded
/// so the next one starts on an `OFFSET_PAD` boundary. An empty stream reads as an
/// empty list.
///
/// Reading fails with [`DtypError::MisalignedChainItem`] if an entry does not start on
/// an `OFFSET_PAD` boundary, and with [`DtypError::ChainOverrun`] if a next entry
/// offset points past the end of the stream.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ChainedItemList<T, const OFFSET_PAD: u32 = CHAINED_ITEM_DEFAULT_OFFSET_PAD> {
    values: Vec<T>,
}

impl<T, const OFFSET_PAD: u32> ChainedItemList<T, OFFSET_PAD> {
    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.values.iter()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn into_vec(self) -> Vec<T> {
        self.values
    }
}

impl<T, const OFFSET_PAD: u32> BinWrite for ChainedItemList<T, OFFSET_PAD>
where
    T: BinWrite,
    for<'b> <T as BinWrite>::Args<'b>: Default,
{
    type Args<'a> = ();

    fn write_options<W: Write + Seek>(
        &self,
        writer: &mut W,
        endian: Endian,
        _args: Self::Args<'_>,
    ) -> BinResult<()> {
        for (i, item) in self.values.iter().enumerate() {
            let position_before = writer.stream_position()?;

            // Placeholder, patched once the item size is known.
            NextEntryOffsetType::write_options(&0, writer, endian, ())?;
            item.write_options(writer, endian, Default::default())?;

            if i == self.values.len() - 1 {
                break;
            }

            let position_after_item = writer.stream_position()?;
            let padding_needed =
                (OFFSET_PAD as u64 - (position_after_item % OFFSET_PAD as u64)) % OFFSET_PAD as u64;
            writer.write_all(&vec![0u8; padding_needed as usize])?;

            let position_after = writer.stream_position()?;
            let next_entry_offset = NextEntryOffsetType::try_from(position_after - position_before)
                .map_err(|err| binrw::Error::Custom {
                    pos: position_before,
                    err: Box::new(err),
                })?;

            writer.seek(SeekFrom::Start(position_before))?;
            NextEntryOffsetType::write_options(&next_entry_offset, writer, endian, ())?;
            writer.seek(SeekFrom::Start(position_after))?;
        }
        Ok(())
    }
}

impl<T, const OFFSET_PAD: u32> BinRead for ChainedItemList<T, OFFSET_PAD>
where
    T: BinRead,
    for<'b> <T as BinRead>::Args<'b>: Default,
{
    type Args<'a> = ();

    fn read_options<R: Read + Seek>(
        reader: &mut R,
        endian: Endian,
        _args: Self::Args<'_>,
    ) -> BinResult<Self> {
        let stream_end = {
            let current = reader.stream_position()?;
            let end = reader.seek(SeekFrom::End(0))?;
            reader.seek(SeekFrom::Start(current))?;
            end
        };
        if reader.stream_position()? >= stream_end {
            return Ok(Self { values: Vec::new() });
        }

        let mut values = Vec::new();
        loop {
            let position_before = reader.stream_position()?;
            if position_before % OFFSET_PAD as u64 != 0 {
                return Err(binrw::Error::Custom {
                    pos: position_before,
                    err: Box::new(DtypError::MisalignedChainItem(position_before)),
                });
            }

            let next_item_offset = NextEntryOffsetType::read_options(reader, endian, ())?;
            values.push(T::read_options(reader, endian, Default::default())?);

            if next_item_offset == 0 {
                break;
            }
            let next = position_before + next_item_offset as u64;
            if next >= stream_end {
                return Err(binrw::Error::Custom {
                    pos: position_before,
                    err: Box::new(DtypError::ChainOverrun(position_before)),
                });
            }
            reader.seek(SeekFrom::Start(next))?;
        }
        Ok(Self { values })
    }
}

impl<T, const OFFSET_PAD: u32> From<ChainedItemList<T, OFFSET_PAD>> for Vec<T> {
    fn from(value: ChainedItemList<T, OFFSET_PAD>) -> Self {
        value.values
    }
}

impl<T, const OFFSET_PAD: u32> From<Vec<T>> for ChainedItemList<T, OFFSET_PAD> {
    fn from(vec: Vec<T>) -> Self {
        Self { values: vec }
    }
}

impl<T, const OFFSET_PAD: u32> FromIterator<T> for ChainedItemList<T, OFFSET_PAD> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

impl<T, const OFFSET_PAD: u32> std::ops::Deref for ChainedItemList<T, OFFSET_PAD> {
    type Target = [T];

    fn deref(&self) -> &Self::Target {
        &self.values
    }
}

impl<T, const OFFSET_PAD: u32> std::ops::DerefMut for ChainedItemList<T, OFFSET_PAD> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.values
    }
}

impl<T, const OFFSET_PAD: u32> Default for ChainedItemList<T, OFFSET_PAD> {
    fn default() -> Self {
        Self { values: Vec::new() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    type Bytes3 = [u8; 3];

    #[test]
    fn test_items_padded_except_last() {
        let list: ChainedItemList<Bytes3, 8> = vec![[1, 2, 3], [4, 5, 6]].into();
        let mut cursor = Cursor::new(Vec::new());
        list.write_le(&mut cursor).unwrap();
        let bytes = cursor.into_inner();
        assert_eq!(
            bytes,
            [8, 0, 0, 0, 1, 2, 3, 0, 0, 0, 0, 0, 4, 5, 6]
        );
        let parsed = ChainedItemList::<Bytes3, 8>::read_le(&mut Cursor::new(&bytes)).unwrap();
        assert_eq!(parsed, list);
    }

    #[test]
    fn test_empty_stream_is_empty_list() {
        let parsed = ChainedItemList::<u32>::read_le(&mut Cursor::new([])).unwrap();
        assert!(parsed.is_empty());
    }

    #[test]
    fn test_offset_past_end_rejected() {
        let bytes = [0x40, 0, 0, 0, 1, 2, 3, 4];
        let err = ChainedItemList::<u32>::read_le(&mut Cursor::new(bytes)).unwrap_err();
        assert!(matches!(
            err.custom_err::<DtypError>(),
            Some(DtypError::ChainOverrun(0))
        ));
    }

    #[test]
    fn test_misaligned_item_rejected() {
        // First entry points at offset 6, not a multiple of 4.
        let bytes = [6, 0, 0, 0, 9, 9, 0, 0, 0, 0, 7, 7];
        let err = ChainedItemList::<u16>::read_le(&mut Cursor::new(bytes)).unwrap_err();
        assert!(matches!(
            err.custom_err::<DtypError>(),
            Some(DtypError::MisalignedChainItem(6))
        ));
    }
}
