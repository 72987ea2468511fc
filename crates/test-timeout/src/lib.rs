use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::parse::Parser;
use syn::punctuated::Punctuated;
use syn::{parse_macro_input, Attribute, Expr, ExprLit, ItemFn, Lit, Token};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Runs an async test on a dedicated Tokio runtime and fails it once the
/// deadline passes, even if the test body never yields.
///
/// Accepted forms:
/// `#[tokio_timeout_test]`, `#[tokio_timeout_test(20)]`,
/// `#[tokio_timeout_test(secs = 20, worker_threads = 2)]`.
/// Without `worker_threads` the runtime is current-thread.
#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = match TimeoutArgs::parse(attr.into()) {
        Ok(args) => args,
        Err(err) => return err.to_compile_error().into(),
    };

    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }

    sig.asyncness = None;

    let filtered_attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_tokio_test_attribute(attr))
        .collect();

    let timeout = args.secs;
    let runtime = match args.worker_threads {
        Some(threads) => quote! {
            tokio::runtime::Builder::new_multi_thread()
                .worker_threads(#threads)
                .enable_all()
                .build()
        },
        None => quote! {
            tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
        },
    };

    TokenStream::from(quote! {
        #[test]
        #(#filtered_attrs)*
        #vis #sig {
            let timeout_duration = std::time::Duration::from_secs(#timeout);
            let (sender, receiver) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    let runtime = #runtime.expect("failed to build Tokio runtime");
                    runtime.block_on(async {
                        tokio::time::timeout(timeout_duration, async move #block)
                            .await
                            .expect("test timed out");
                    });
                }));
                let _ = sender.send(result);
            });
            match receiver.recv_timeout(timeout_duration + std::time::Duration::from_secs(1)) {
                Ok(Ok(_)) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => panic!("test timed out"),
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread failed before reporting result")
                }
            }
        }
    })
}

struct TimeoutArgs {
    secs: u64,
    worker_threads: Option<usize>,
}

impl TimeoutArgs {
    fn parse(attr: TokenStream2) -> syn::Result<Self> {
        let mut args = TimeoutArgs {
            secs: DEFAULT_TIMEOUT_SECS,
            worker_threads: None,
        };
        if attr.is_empty() {
            return Ok(args);
        }

        let items = Punctuated::<Expr, Token![,]>::parse_terminated.parse2(attr)?;
        for item in items {
            match item {
                Expr::Lit(ExprLit {
                    lit: Lit::Int(lit), ..
                }) => args.secs = lit.base10_parse()?,
                Expr::Assign(assign) => {
                    let key = match &*assign.left {
                        Expr::Path(path) => path.path.get_ident().map(|ident| ident.to_string()),
                        _ => None,
                    };
                    let value = match &*assign.right {
                        Expr::Lit(ExprLit {
                            lit: Lit::Int(lit), ..
                        }) => lit,
                        other => {
                            return Err(syn::Error::new_spanned(other, "expected an integer"));
                        }
                    };
                    match key.as_deref() {
                        Some("secs") => args.secs = value.base10_parse()?,
                        Some("worker_threads") => {
                            args.worker_threads = Some(value.base10_parse()?)
                        }
                        _ => {
                            return Err(syn::Error::new_spanned(
                                &assign.left,
                                "expected `secs` or `worker_threads`",
                            ));
                        }
                    }
                }
                other => {
                    return Err(syn::Error::new_spanned(
                        other,
                        "expected a timeout in seconds or `key = value`",
                    ));
                }
            }
        }

        if args.secs == 0 {
            return Err(syn::Error::new(
                proc_macro2::Span::call_site(),
                "timeout must be greater than zero",
            ));
        }
        if args.worker_threads == Some(0) {
            return Err(syn::Error::new(
                proc_macro2::Span::call_site(),
                "worker_threads must be greater than zero",
            ));
        }
        Ok(args)
    }
}

fn is_tokio_test_attribute(attr: &Attribute) -> bool {
    let mut segments = attr.path().segments.iter();
    matches!(
        (segments.next(), segments.next(), segments.next()),
        (Some(first), Some(second), None)
            if first.ident == "tokio" && second.ident == "test"
    )
}
