// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

use proc_macro::TokenStream;
use proc_macro2::Span;
use quote::format_ident;
use quote::quote;
use syn::DeriveInput;
use syn::Field;
use syn::FieldsNamed;
use syn::Ident;
use syn::parse_macro_input;

/// Generate a [`natsync::ddi::stat::StatProvider`] implementation
/// given a struct of named fields of type
/// [`natsync::ddi::stat::StatU64`].
///
/// ```Rust
/// #[derive(StatProvider)]
/// struct CacheStats {
///     added: StatU64,
///     dup: StatU64,
/// }
/// ```
///
/// This macro generates the following code based on the struct above.
///
/// ```Rust
/// #[derive(Clone, Debug, Default, Serialize, Deserialize)]
/// pub struct CacheStatsSnap {
///     pub added: u64,
///     pub dup: u64,
/// }
///
/// impl StatProvider for CacheStats {
///     const NUM_FIELDS: u32 = 2;
///     type Snap = CacheStatsSnap;
///
///     fn new() -> Self {
///         Self { added: StatU64::new(), dup: StatU64::new() }
///     }
///
///     fn snapshot(&self) -> Self::Snap {
///         CacheStatsSnap { added: self.added.val(), dup: self.dup.val() }
///     }
///
///     fn names() -> &'static [&'static str] {
///         &["added", "dup"]
///     }
/// }
/// ````
#[proc_macro_derive(StatProvider)]
pub fn derive_stat_provider(input: TokenStream) -> TokenStream {
    let DeriveInput { ident, data, vis, .. } = parse_macro_input!(input);
    let fields: Vec<Field> = match data {
        syn::Data::Struct(s) => match s.fields {
            syn::Fields::Named(FieldsNamed { named, .. }) => {
                named.into_iter().collect()
            }

            _ => {
                return syn::Error::new(
                    Span::call_site(),
                    "a StatProvider must have named fields",
                )
                .to_compile_error()
                .into();
            }
        },

        _ => {
            return syn::Error::new(
                Span::call_site(),
                "only a struct may be a StatProvider",
            )
            .to_compile_error()
            .into();
        }
    };

    let num_fields = fields.len() as u32;
    let fields_ident: Vec<Ident> =
        fields.iter().filter_map(|f| f.ident.clone()).collect();
    let fields_name: Vec<String> =
        fields_ident.iter().map(|i| i.to_string()).collect();
    let ident_snap = format_ident!("{}Snap", ident);

    let output = quote! {
        #[derive(
            Clone, Debug, Default, ::serde::Serialize, ::serde::Deserialize,
        )]
        #vis struct #ident_snap {
            #( pub #fields_ident: u64, )*
        }

        impl #ident_snap {
            /// Iterate the counters as `(name, value)` pairs, in
            /// declaration order.
            pub fn iter(&self) -> impl Iterator<Item = (&'static str, u64)> {
                [#( (#fields_name, self.#fields_ident), )*].into_iter()
            }
        }

        impl ::natsync::ddi::stat::StatProvider for #ident {
            const NUM_FIELDS: u32 = #num_fields;
            type Snap = #ident_snap;

            fn new() -> Self {
                use ::natsync::ddi::stat::StatU64;

                Self {
                    #( #fields_ident: StatU64::new(), )*
                }
            }

            fn snapshot(&self) -> Self::Snap {
                #ident_snap {
                    #( #fields_ident: self.#fields_ident.val(), )*
                }
            }

            fn names() -> &'static [&'static str] {
                &[#( #fields_name, )*]
            }
        }
    };

    output.into()
}
