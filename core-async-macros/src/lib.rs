//! Attribute macros that drive `async fn` entry points and tests on the
//! workspace executor without depending on Tokio's own macros.
//!
//! `#[core_async::test]` and `#[core_async::main]` run the body on a
//! current-thread runtime. Passing `multi_thread` runs it on a multi-thread
//! runtime instead, for bodies that block a worker while others make progress.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{parse_macro_input, Ident, ItemFn};

#[proc_macro_attribute]
pub fn test(attr: TokenStream, item: TokenStream) -> TokenStream {
    expand(attr, item, MacroKind::Test)
}

#[proc_macro_attribute]
pub fn main(attr: TokenStream, item: TokenStream) -> TokenStream {
    expand(attr, item, MacroKind::Main)
}

enum MacroKind {
    Test,
    Main,
}

enum Flavor {
    CurrentThread,
    MultiThread,
}

fn parse_flavor(attr: TokenStream) -> syn::Result<Flavor> {
    if attr.is_empty() {
        return Ok(Flavor::CurrentThread);
    }

    let tokens = TokenStream2::from(attr);
    let ident: Ident = syn::parse2(tokens.clone())
        .map_err(|_| syn::Error::new_spanned(&tokens, "expected `multi_thread`"))?;

    if ident == "multi_thread" {
        Ok(Flavor::MultiThread)
    } else {
        Err(syn::Error::new_spanned(
            ident,
            "unknown runtime flavor, the only accepted argument is `multi_thread`",
        ))
    }
}

fn expand(attr: TokenStream, item: TokenStream, kind: MacroKind) -> TokenStream {
    let flavor = match parse_flavor(attr) {
        Ok(flavor) => flavor,
        Err(err) => return err.to_compile_error().into(),
    };

    let input = parse_macro_input!(item as ItemFn);

    if input.sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            input.sig.fn_token,
            "core_async attribute macros require `async fn`",
        )
        .to_compile_error()
        .into();
    }

    let mut sync_sig = input.sig.clone();
    sync_sig.asyncness = None;

    let attrs = input.attrs;
    let vis = input.vis;
    let block = input.block;

    let driver = match flavor {
        Flavor::CurrentThread => quote! {
            core_async::runtime::block_on(async move #block)
        },
        Flavor::MultiThread => quote! {
            core_async::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .expect("core_async: failed to build multi-thread runtime")
                .block_on(async move #block)
        },
    };

    let test_attr = match kind {
        MacroKind::Test => quote!(#[test]),
        MacroKind::Main => quote!(),
    };

    quote! {
        #(#attrs)*
        #test_attr
        #vis #sync_sig {
            #driver
        }
    }
    .into()
}
