//! # Accessor Derive
//!
//! Derive macro generating builder-style setters for configuration structs,
//! such as the memory services policy.

use proc_macro::TokenStream;
use quote::{format_ident, quote};
use syn::{Data, DeriveInput, Fields, LitBool, parse_macro_input, spanned::Spanned};

/// Derive to generate `.set_<field>(&mut self, value: Ty) -> &mut Self` and
/// `.with_<field>(mut self, value: Ty) -> Self` for each **named** field.
///
/// `with_` is a `const fn` unless the field is marked `#[setters(runtime)]`;
/// use that for fields whose old value needs a destructor (`Vec`, `Box`).
///
/// - Skipping a field: `#[setters(skip)]`
/// - Non-const builder: `#[setters(runtime)]`
///
/// # Example
///
/// ```
/// use utils_accessors_derive::Setters;
///
/// #[derive(Default, Setters)]
/// struct Policy {
///     page_mask: u64,
///     #[setters(runtime)]
///     bins: Vec<(u32, u64)>,
///     #[setters(skip)]
///     generation: u32,
/// }
///
/// const STRICT: Policy = Policy { page_mask: 0, bins: Vec::new(), generation: 0 }.with_page_mask(!0);
/// let mut p = STRICT.with_bins(vec![(4, 16)]);
/// p.set_page_mask(1).set_page_mask(2);
/// assert_eq!(p.page_mask, 2);
/// assert_eq!(p.bins, [(4, 16)]);
/// assert_eq!(p.generation, 0);
/// ```
#[proc_macro_derive(Setters, attributes(setters))]
pub fn derive_generate_setters(input: TokenStream) -> TokenStream {
    let DeriveInput {
        ident,
        generics,
        data,
        ..
    } = parse_macro_input!(input as DeriveInput);

    let fields = match data {
        Data::Struct(s) => match s.fields {
            Fields::Named(n) => n.named,
            Fields::Unnamed(u) => {
                return syn::Error::new(u.span(), "Setters only supports named fields")
                    .to_compile_error()
                    .into();
            }
            Fields::Unit => {
                return syn::Error::new(ident.span(), "Setters does not apply to unit structs")
                    .to_compile_error()
                    .into();
            }
        },
        _ => {
            return syn::Error::new(ident.span(), "Setters can only be derived for structs")
                .to_compile_error()
                .into();
        }
    };

    let (impl_generics, ty_generics, where_clause) = generics.split_for_impl();

    let mut methods = Vec::new();

    for field in fields {
        let Some(fname) = &field.ident else { continue };
        let opts = match FieldOptions::parse(&field.attrs) {
            Ok(opts) => opts,
            Err(e) => return e.to_compile_error().into(),
        };
        if opts.skip {
            continue;
        }

        let ty = &field.ty;
        let set_name = format_ident!("set_{}", fname);
        let with_name = format_ident!("with_{}", fname);
        let constness = if opts.runtime {
            quote! {}
        } else {
            quote! { const }
        };

        methods.push(quote! {
            #[inline]
            pub fn #set_name(&mut self, value: #ty) -> &mut Self {
                self.#fname = value;
                self
            }

            #[inline]
            #[must_use]
            pub #constness fn #with_name(mut self, value: #ty) -> Self {
                self.#fname = value;
                self
            }
        });
    }

    let expanded = quote! {
        impl #impl_generics #ident #ty_generics #where_clause {
            #(#methods)*
        }
    };

    TokenStream::from(expanded)
}

#[derive(Default)]
struct FieldOptions {
    skip: bool,
    runtime: bool,
}

impl FieldOptions {
    /// Accepts `#[setters(skip)]`, `#[setters(skip = true)]` and
    /// `#[setters(runtime)]`, in any combination.
    fn parse(attrs: &[syn::Attribute]) -> syn::Result<Self> {
        let mut opts = Self::default();
        for attr in attrs {
            if !attr.path().is_ident("setters") {
                continue;
            }

            attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("skip") {
                    opts.skip = if meta.input.is_empty() {
                        true
                    } else {
                        meta.value()?.parse::<LitBool>()?.value
                    };
                    Ok(())
                } else if meta.path.is_ident("runtime") {
                    opts.runtime = true;
                    Ok(())
                } else {
                    Err(meta.error("expected `skip` or `runtime`"))
                }
            })?;
        }
        Ok(opts)
    }
}
