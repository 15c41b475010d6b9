//! binrw helpers for SMB wire structures: back-patched offsets, sized UTF-16 strings
//! and offset-chained lists.

pub mod chained_list;
pub mod helpers;
pub mod pos_marker;
pub mod sized_wide_string;

pub mod prelude {
    pub use super::chained_list::*;
    pub use super::helpers::*;
    pub use super::pos_marker::*;
    pub use super::sized_wide_string::*;
}
