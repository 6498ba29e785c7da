use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, Attribute, ItemFn, LitInt};

struct Options {
    secs: u64,
    paused: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            secs: 60,
            paused: false,
        }
    }
}

/// Runs an async test on a fresh current-thread Tokio runtime with a hard
/// wall-clock limit.
///
/// Accepts `secs = N` (or a bare `N`) for the limit and `paused` to start the
/// runtime with its clock paused, e.g. `#[tokio_timeout_test(paused, secs = 5)]`.
#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let mut options = Options::default();

    if !attr.is_empty() {
        if let Ok(lit) = syn::parse::<LitInt>(attr.clone()) {
            match lit.base10_parse() {
                Ok(secs) => options.secs = secs,
                Err(err) => return err.to_compile_error().into(),
            }
        } else {
            let parser = syn::meta::parser(|meta| {
                if meta.path.is_ident("paused") {
                    options.paused = true;
                    Ok(())
                } else if meta.path.is_ident("secs") {
                    let lit: LitInt = meta.value()?.parse()?;
                    options.secs = lit.base10_parse()?;
                    Ok(())
                } else {
                    Err(meta.error("expected `secs = N` or `paused`"))
                }
            });
            parse_macro_input!(attr with parser);
        }
    }

    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if options.secs == 0 {
        return syn::Error::new_spanned(&sig.ident, "timeout must be greater than zero")
            .to_compile_error()
            .into();
    }

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

    let timeout = options.secs;
    let paused = options.paused;

    TokenStream::from(quote! {
        #[test]
        #(#filtered_attrs)*
        #vis #sig {
            let timeout_duration = std::time::Duration::from_secs(#timeout);
            let (sender, receiver) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    let mut builder = tokio::runtime::Builder::new_current_thread();
                    builder.enable_all();
                    if #paused {
                        builder.start_paused(true);
                    }
                    let runtime = builder.build().expect("failed to build Tokio runtime");
                    runtime.block_on(async {
                        tokio::time::timeout(timeout_duration, async move #block)
                            .await
                            .expect("test timed out");
                    });
                }));
                let _ = sender.send(result);
            });
            match receiver.recv_timeout(timeout_duration) {
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

fn is_tokio_test_attribute(attr: &Attribute) -> bool {
    let mut segments = attr.path().segments.iter();
    matches!(
        (segments.next(), segments.next(), segments.next()),
        (Some(first), Some(second), None)
            if first.ident == "tokio" && second.ident == "test"
    )
}
