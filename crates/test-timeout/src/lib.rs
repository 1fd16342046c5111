//! Test attributes that fail a test which runs longer than its budget.
//!
//! `#[timeout]` wraps a synchronous test, `#[tokio_timeout_test]` an async
//! one. Both accept an optional budget in seconds (default 60). The async
//! form also accepts `paused`, which starts the runtime with a paused clock
//! so timers auto-advance; the budget is then enforced by a wall-clock
//! watchdog only.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::parse::Parser;
use syn::punctuated::Punctuated;
use syn::{Attribute, Expr, ExprLit, ItemFn, Lit, Token};

const DEFAULT_BUDGET_SECS: u64 = 60;

struct Options {
    budget_secs: u64,
    paused: bool,
}

fn parse_options(attr: TokenStream, allow_paused: bool) -> syn::Result<Options> {
    let mut options = Options {
        budget_secs: DEFAULT_BUDGET_SECS,
        paused: false,
    };
    let args = Punctuated::<Expr, Token![,]>::parse_terminated.parse(attr)?;
    for arg in args {
        match &arg {
            Expr::Lit(ExprLit {
                lit: Lit::Int(lit), ..
            }) => {
                let secs: u64 = lit.base10_parse()?;
                if secs == 0 {
                    return Err(syn::Error::new_spanned(lit, "timeout must be greater than zero"));
                }
                options.budget_secs = secs;
            }
            Expr::Path(path) if allow_paused && path.path.is_ident("paused") => {
                options.paused = true;
            }
            other => {
                let expected = if allow_paused {
                    "expected a timeout in seconds or `paused`"
                } else {
                    "expected a timeout in seconds"
                };
                return Err(syn::Error::new_spanned(other, expected));
            }
        }
    }
    Ok(options)
}

/// Runs `body` on a fresh thread and panics if it does not report back
/// within the budget.
fn watchdog(budget_secs: u64, body: TokenStream2) -> TokenStream2 {
    quote! {
        let budget = std::time::Duration::from_secs(#budget_secs);
        let (report, outcome) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| { #body }));
            let _ = report.send(result);
        });
        match outcome.recv_timeout(budget) {
            Ok(Ok(_)) => {}
            Ok(Err(payload)) => std::panic::resume_unwind(payload),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                panic!("test exceeded its {}s budget", #budget_secs)
            }
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                panic!("test thread exited without reporting a result")
            }
        }
    }
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let options = match parse_options(attr, true) {
        Ok(options) => options,
        Err(err) => return err.to_compile_error().into(),
    };
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = syn::parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(&sig.ident, "tokio_timeout_test expects an async fn")
            .to_compile_error()
            .into();
    }
    sig.asyncness = None;
    let attrs: Vec<Attribute> = attrs.into_iter().filter(|a| !is_path(a, &["tokio", "test"])).collect();

    let budget = options.budget_secs;
    let runtime = if options.paused {
        quote! {
            tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .start_paused(true)
                .build()
                .expect("failed to build paused Tokio runtime")
                .block_on(async move #block)
        }
    } else {
        // The in-runtime timeout reports a hang as a test failure instead of
        // relying on the watchdog alone.
        quote! {
            tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("failed to build Tokio runtime")
                .block_on(async {
                    tokio::time::timeout(std::time::Duration::from_secs(#budget), async move #block)
                        .await
                        .expect("test timed out")
                })
        }
    };
    let body = watchdog(budget, runtime);

    quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            #body
        }
    }
    .into()
}

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let options = match parse_options(attr, false) {
        Ok(options) => options,
        Err(err) => return err.to_compile_error().into(),
    };
    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = syn::parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_some() {
        return syn::Error::new_spanned(&sig.ident, "timeout expects a synchronous fn")
            .to_compile_error()
            .into();
    }
    let attrs: Vec<Attribute> = attrs.into_iter().filter(|a| !is_path(a, &["test"])).collect();
    let body = watchdog(options.budget_secs, quote! { #block });

    quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            #body
        }
    }
    .into()
}

fn is_path(attr: &Attribute, expected: &[&str]) -> bool {
    let segments = &attr.path().segments;
    segments.len() == expected.len()
        && segments
            .iter()
            .zip(expected)
            .all(|(segment, name)| segment.ident == name)
}
