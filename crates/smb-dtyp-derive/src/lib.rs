//! Attribute macros shared by the smb* crates.
//!
//! Re-exported by `smb-dtyp`; use them through that crate.

use proc_macro::TokenStream;
use quote::quote;
use syn::{ItemStruct, parse_macro_input};

/// Turns a struct into a `modular_bitfield` bitfield that reads and writes
/// itself through binrw as its raw little-endian bytes.
///
/// Also derives `Debug`, `Default`, `Clone`, `Copy`, `PartialEq` and `Eq`.
/// Additional derives may follow the attribute.
#[proc_macro_attribute]
pub fn mbitfield(attr: TokenStream, input: TokenStream) -> TokenStream {
    if !attr.is_empty() {
        return syn::Error::new(
            proc_macro2::Span::call_site(),
            "mbitfield takes no arguments",
        )
        .to_compile_error()
        .into();
    }

    let item = parse_macro_input!(input as ItemStruct);

    TokenStream::from(quote! {
        #[::modular_bitfield::bitfield]
        #[derive(::binrw::BinWrite, ::binrw::BinRead, Debug, Default, Clone, Copy, PartialEq, Eq)]
        #[bw(map = |&x| Self::into_bytes(x))]
        #[br(map = Self::from_bytes)]
        #item
    })
}
