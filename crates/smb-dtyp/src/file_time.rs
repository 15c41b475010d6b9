//! Windows FILETIME: 100-nanosecond intervals since 1601-01-01 UTC.

use std::fmt::Debug;

use binrw::prelude::*;
use time::{OffsetDateTime, macros::datetime};

/// A raw FILETIME value, as carried by CREATE/CLOSE responses and time-warp tokens.
#[derive(BinRead, BinWrite, Clone, Copy, PartialEq, Eq, Default, PartialOrd, Ord, Hash)]
#[brw(little)]
pub struct FileTime(pub u64);

impl FileTime {
    const EPOCH: OffsetDateTime = datetime!(1601-01-01 00:00:00 UTC);
    const TICKS_PER_SECOND: i128 = 10_000_000;

    pub fn to_datetime(self) -> OffsetDateTime {
        let nanos = self.0 as i128 * 100;
        Self::EPOCH + time::Duration::nanoseconds_i128(nanos)
    }
}

impl From<OffsetDateTime> for FileTime {
    fn from(value: OffsetDateTime) -> Self {
        let since = value - Self::EPOCH;
        let ticks = since.whole_nanoseconds() / 100;
        FileTime(ticks.clamp(0, u64::MAX as i128) as u64)
    }
}

impl From<u64> for FileTime {
    fn from(value: u64) -> Self {
        FileTime(value)
    }
}

impl Debug for FileTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0 == 0 {
            return write!(f, "FileTime(0)");
        }
        let secs = self.0 as i128 / Self::TICKS_PER_SECOND;
        write!(f, "FileTime({} = {}s)", self.to_datetime(), secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filetime_datetime() {
        let dt = datetime!(2025-01-18 16:24:39.4487464 UTC);
        let ft = FileTime::from(dt);
        assert_eq!(ft.0, 0x01db69c578d876a8);
        assert_eq!(ft.to_datetime(), dt);
    }

    smb_tests::test_binrw! {
        FileTime => wire: FileTime(0x01db69c578d876a8) => "a876d878c569db01"
    }
}
