//! Utility macros for building SMB messages.
//!
//! This should be used only within the `smb-msg` crate.
//! Common utilities shall be placed in `smb-dtyp-derive` and re-exported in `smb-dtyp`.

use proc_macro::TokenStream;
use quote::quote;
use syn::{
    DeriveInput, Expr, ExprLit, Fields, ItemStruct, Lit, Meta,
    parse::{Parse, ParseStream, Result},
    parse_macro_input,
};

#[derive(Debug)]
struct SmbReqResAttr {
    value: u16,
}

impl Parse for SmbReqResAttr {
    fn parse(input: ParseStream) -> Result<Self> {
        let meta: Meta = input.parse()?;

        match meta {
            Meta::NameValue(nv) if nv.path.is_ident("size") => {
                if let Expr::Lit(ExprLit {
                    lit: Lit::Int(lit), ..
                }) = nv.value
                {
                    let value: u16 = lit.base10_parse()?;
                    Ok(SmbReqResAttr { value })
                } else {
                    Err(syn::Error::new_spanned(
                        nv.value,
                        "expected integer literal",
                    ))
                }
            }
            _ => Err(syn::Error::new_spanned(meta, "expected `size = <u16>`")),
        }
    }
}

fn make_size_field(name: &syn::Ident, size: u16) -> syn::Field {
    // #[bw(calc = #size)]
    // #[br(temp)]
    // #[br(assert(_structure_size == #size, SmbMsgError::BadStructureSize { .. }))]
    // _structure_size: u16,
    syn::Field {
        attrs: vec![
            syn::parse_quote! {
                #[bw(calc = #size)]
            },
            syn::parse_quote! {
                #[br(temp)]
            },
            syn::parse_quote! {
                #[br(assert(_structure_size == #size, crate::SmbMsgError::BadStructureSize {
                    name: stringify!(#name),
                    expected: #size,
                    actual: _structure_size,
                }))]
            },
        ],
        vis: syn::Visibility::Inherited,
        ident: Some(syn::Ident::new(
            "_structure_size",
            proc_macro2::Span::call_site(),
        )),
        colon_token: Some(syn::token::Colon {
            spans: [proc_macro2::Span::call_site()],
        }),
        ty: syn::parse_quote! { u16 },
        mutability: syn::FieldMutability::None,
    }
}

/// Implementation for the [`smb_request`] and [`smb_response`] macros.
///
/// This function expands the input struct by:
/// - Adding a `_structure_size: u16` field at the beginning of the struct,
///   written from the declared size and asserted on read. A mismatch fails with
///   `SmbMsgError::BadStructureSize` before any other field is read.
/// - Adding a `STRUCTURE_SIZE` associated constant.
fn modify_smb_msg(item: TokenStream, attr: TokenStream) -> TokenStream {
    let item = common_struct_changes(item);

    let mut item = parse_macro_input!(item as ItemStruct);
    let attr = parse_macro_input!(attr as SmbReqResAttr);

    let size_field = make_size_field(&item.ident, attr.value);
    match item.fields {
        Fields::Named(ref mut fields) => {
            fields.named.insert(0, size_field);
        }
        _ => {
            return syn::Error::new_spanned(
                &item.fields,
                "Expected named fields for smb request/response",
            )
            .to_compile_error()
            .into();
        }
    }

    let name = &item.ident;
    let size = attr.value;
    let (impl_generics, ty_generics, where_clause) = item.generics.split_for_impl();

    TokenStream::from(quote! {
        #item

        impl #impl_generics #name #ty_generics #where_clause {
            /// The declared `StructureSize` of this message.
            pub const STRUCTURE_SIZE: u16 = #size;
        }
    })
}

/// Performs common changes to binrw structs.
///
/// - Adding the `binrw` attribute and the common derives.
/// - Modifying any field named `reserved` to have `#[br(temp)]` and `#[bw(calc = Default::default())]` attributes.
fn common_struct_changes(item: TokenStream) -> TokenStream {
    let input = parse_macro_input!(item as DeriveInput);

    let is_struct = matches!(input.data, syn::Data::Struct(_));

    let output_all = TokenStream::from(quote! {
        #[::binrw::binrw]
        #[derive(Debug, Clone, PartialEq, Eq)]
        #input
    });

    if !is_struct {
        return output_all;
    }

    let mut item = parse_macro_input!(output_all as ItemStruct);

    if let Fields::Named(ref mut fields) = item.fields {
        let mut reserved_index = 0usize;
        for field in fields.named.iter_mut() {
            if field.ident.as_ref().is_some_and(|id| *id == "reserved") {
                if field.vis != syn::Visibility::Inherited {
                    return syn::Error::new_spanned(
                        &field.vis,
                        "reserved field must have no visibility defined",
                    )
                    .to_compile_error()
                    .into();
                }

                // Each reserved field gets its own name.
                field.ident = Some(syn::Ident::new(
                    &format!("_reserved{}", reserved_index),
                    proc_macro2::Span::call_site(),
                ));
                reserved_index += 1;

                field.attrs.push(syn::parse_quote! {
                    #[br(temp)]
                });

                // If type is [u8; N], we can set it to zeroed array. Otherwise, use Default::default().
                let default_bw_calc = if let syn::Type::Array(arr) = &field.ty {
                    let len = arr.len.clone();
                    syn::parse_quote! {
                        #[bw(calc = [0; #len])]
                    }
                } else {
                    syn::parse_quote! {
                        #[bw(calc = Default::default())]
                    }
                };

                field.attrs.push(default_bw_calc);
            }
        }
    }

    TokenStream::from(quote! {
        #item
    })
}

/// Proc-macro for constructing SMB request messages.
///
/// Valid usage is `#[smb_request(size = <u16>)]` before a struct definition.
#[proc_macro_attribute]
pub fn smb_request(attr: TokenStream, input: TokenStream) -> TokenStream {
    modify_smb_msg(input, attr)
}

/// Proc-macro for constructing SMB response messages.
///
/// Valid usage is `#[smb_response(size = <u16>)]` before a struct definition.
#[proc_macro_attribute]
pub fn smb_response(attr: TokenStream, input: TokenStream) -> TokenStream {
    modify_smb_msg(input, attr)
}

/// Proc-macro for constructing SMB request and response messages.
///
/// Valid usage is `#[smb_request_response(size = <u16>)]` before a struct definition.
#[proc_macro_attribute]
pub fn smb_request_response(attr: TokenStream, input: TokenStream) -> TokenStream {
    modify_smb_msg(input, attr)
}

/// Proc-macro for adding binrw attributes to SMB request structures without a size sentinel.
#[proc_macro_attribute]
pub fn smb_request_binrw(_attr: TokenStream, input: TokenStream) -> TokenStream {
    common_struct_changes(input)
}

/// Proc-macro for adding binrw attributes to SMB response structures without a size sentinel.
#[proc_macro_attribute]
pub fn smb_response_binrw(_attr: TokenStream, input: TokenStream) -> TokenStream {
    common_struct_changes(input)
}

/// Proc-macro for adding binrw attributes to structures shared by requests and responses.
#[proc_macro_attribute]
pub fn smb_message_binrw(_attr: TokenStream, input: TokenStream) -> TokenStream {
    common_struct_changes(input)
}
