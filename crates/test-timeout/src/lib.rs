//! Test attributes that run the body on a watchdog thread and fail the test
//! when it does not finish in time. Agent tests spawn processes and sockets;
//! a hung session should fail loudly rather than stall the whole suite.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{parse_macro_input, Attribute, ItemFn, LitInt};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// `#[tokio_timeout_test]` or `#[tokio_timeout_test(secs)]` on an `async fn`.
/// The body runs on a fresh current-thread runtime with all drivers enabled.
#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let secs = match parse_timeout(attr) {
        Ok(secs) => secs,
        Err(err) => return err.to_compile_error().into(),
    };
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(&sig.fn_token, "tokio_timeout_test needs an async fn")
            .to_compile_error()
            .into();
    }
    sig.asyncness = None;

    let attrs = strip(attrs, |path| *path == ["tokio", "test"]);
    let name = sig.ident.to_string();
    let body = quote! {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("build test runtime");
        runtime.block_on(async {
            if tokio::time::timeout(__limit, async move #block).await.is_err() {
                panic!("{} exceeded {:?}", #name, __limit);
            }
        });
    };
    let watched = watchdog(secs, &name, body);

    quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            #watched
        }
    }
    .into()
}

/// `#[timeout]` or `#[timeout(secs)]` on a synchronous test fn.
#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let secs = match parse_timeout(attr) {
        Ok(secs) => secs,
        Err(err) => return err.to_compile_error().into(),
    };
    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if let Some(asyncness) = sig.asyncness {
        return syn::Error::new_spanned(
            asyncness,
            "timeout is for sync tests; use tokio_timeout_test",
        )
        .to_compile_error()
        .into();
    }

    let attrs = strip(attrs, |path| *path == ["test"]);
    let name = sig.ident.to_string();
    let watched = watchdog(secs, &name, quote! { #block });

    quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            #watched
        }
    }
    .into()
}

fn parse_timeout(attr: TokenStream) -> syn::Result<u64> {
    if attr.is_empty() {
        return Ok(DEFAULT_TIMEOUT_SECS);
    }
    let lit: LitInt = syn::parse(attr)?;
    let secs: u64 = lit.base10_parse()?;
    if secs == 0 {
        return Err(syn::Error::new_spanned(lit, "timeout must be at least one second"));
    }
    Ok(secs)
}

/// Drops attributes the generated `#[test]` would duplicate.
fn strip(attrs: Vec<Attribute>, is_dup: impl Fn(&[String]) -> bool) -> Vec<Attribute> {
    attrs
        .into_iter()
        .filter(|attr| {
            let path: Vec<String> = attr
                .path()
                .segments
                .iter()
                .map(|seg| seg.ident.to_string())
                .collect();
            !is_dup(&path)
        })
        .collect()
}

/// Runs `body` on its own thread and waits at most `secs` for it. Panics in
/// the body are re-raised on the test thread so assertion output survives.
fn watchdog(secs: u64, name: &str, body: TokenStream2) -> TokenStream2 {
    quote! {
        let __limit = std::time::Duration::from_secs(#secs);
        let (__done_tx, __done_rx) = std::sync::mpsc::channel();
        std::thread::Builder::new()
            .name(format!("watched-{}", #name))
            .spawn(move || {
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    #body
                }));
                let _ = __done_tx.send(outcome);
            })
            .expect("spawn watched test thread");
        match __done_rx.recv_timeout(__limit) {
            Ok(Ok(_)) => {}
            Ok(Err(payload)) => std::panic::resume_unwind(payload),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                panic!("{} exceeded {:?}", #name, __limit)
            }
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                panic!("{} exited without reporting a result", #name)
            }
        }
    }
}
