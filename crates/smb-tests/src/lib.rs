//! Helpers shared by the tests of the workspace crates.

pub use binrw;
pub use pastey;

/// Decodes a hex string into bytes. Whitespace (including newlines) is ignored.
///
/// # Panics
/// Panics on malformed input; only meant to be used in tests.
pub fn hex_to_vec(hex: &str) -> Vec<u8> {
    let digits: Vec<u8> = hex.bytes().filter(|b| !b.is_ascii_whitespace()).collect();
    assert!(digits.len() % 2 == 0, "odd number of hex digits");
    digits
        .chunks_exact(2)
        .map(|pair| {
            let s = std::str::from_utf8(pair).expect("hex digits must be ascii");
            u8::from_str_radix(s, 16).expect("invalid hex digit")
        })
        .collect()
}

/// Converts a hex string literal (or `&str` expression) into a `Vec<u8>`.
#[macro_export]
macro_rules! hex_to_u8_array {
    ($hex:expr) => {
        $crate::hex_to_vec($hex)
    };
}

/// Generates a test that reads `$hex` as a little-endian `$type` and compares it with `$value`.
///
/// Forms:
/// - `Type => test_name: value => "hex"`
/// - `Type: value => "hex"`
/// - `struct Type { field: value, .. } => "hex"`
#[macro_export]
macro_rules! test_binrw_read {
    (
        struct $type:ident { $($field:ident : $value:expr),* $(,)? } => $hex:expr
    ) => {
        $crate::test_binrw_read! {
            $type => $type: $type { $($field: $value),* } => $hex
        }
    };
    (
        $type:ty => $test_name:ident : $value:expr => $hex:expr
    ) => {
        $crate::pastey::paste! {
            #[test]
            fn [<test_ $test_name:snake _read>]() {
                use $crate::binrw::{BinReaderExt, io::Cursor};
                let mut cursor = Cursor::new($crate::hex_to_u8_array! { $hex });
                let value: $type = cursor.read_le().unwrap();
                assert_eq!(value, $value);
            }
        }
    };
    (
        $type:ident : $value:expr => $hex:expr
    ) => {
        $crate::test_binrw_read! {
            $type => $type: $value => $hex
        }
    };
}

/// Generates a test that writes `$value` as little-endian and compares the bytes with `$hex`.
///
/// Accepts the same forms as [`test_binrw_read!`].
#[macro_export]
macro_rules! test_binrw_write {
    (
        struct $type:ident { $($field:ident : $value:expr),* $(,)? } => $hex:expr
    ) => {
        $crate::test_binrw_write! {
            $type => $type: $type { $($field: $value),* } => $hex
        }
    };
    (
        $type:ty => $test_name:ident : $value:expr => $hex:expr
    ) => {
        $crate::pastey::paste! {
            #[test]
            fn [<test_ $test_name:snake _write>]() {
                use $crate::binrw::{BinWrite, io::Cursor};
                let value: $type = $value;
                let mut cursor = Cursor::new(Vec::new());
                value.write_le(&mut cursor).unwrap();
                assert_eq!(cursor.into_inner(), $crate::hex_to_u8_array! { $hex });
            }
        }
    };
    (
        $type:ident : $value:expr => $hex:expr
    ) => {
        $crate::test_binrw_write! {
            $type => $type: $value => $hex
        }
    };
}

/// Generates both [`test_binrw_read!`] and [`test_binrw_write!`] tests.
#[macro_export]
macro_rules! test_binrw {
    ($($v:tt)+) => {
        $crate::test_binrw_read! {
            $($v)+
        }
        $crate::test_binrw_write! {
            $($v)+
        }
    };
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_hex_to_vec_ignores_whitespace() {
        assert_eq!(hex_to_u8_array! {"fe53\n 4d42"}, vec![0xfe, 0x53, 0x4d, 0x42]);
    }

    test_binrw! {
        u32 => le_u32: 0x12345678u32 => "78563412"
    }
}
