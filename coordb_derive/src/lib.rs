use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{Attribute, Data, DeriveInput, Fields, Ident, LitStr, Type, parse_macro_input, spanned::Spanned};

/// Derives `coordb::Entity`.
///
/// ```ignore
/// #[derive(Clone, Serialize, Deserialize, Entity)]
/// #[entity(kind = "Agency")]
/// struct Agency {
///     #[entity(key)]
///     id: Uuid,
///     name: String,
/// }
/// ```
#[proc_macro_derive(Entity, attributes(entity))]
pub fn derive_entity(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    match expand_entity(input) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

struct EntityOptions {
    kind: Option<String>,
}

fn expand_entity(input: DeriveInput) -> syn::Result<TokenStream2> {
    let struct_name = input.ident;

    if !input.generics.params.is_empty() {
        return Err(syn::Error::new_spanned(
            input.generics,
            "Entity does not support generic structs",
        ));
    }

    let options = parse_entity_options(&input.attrs)?;

    let data_struct = match input.data {
        Data::Struct(data) => data,
        _ => {
            return Err(syn::Error::new(
                struct_name.span(),
                "Entity can only be derived for structs",
            ));
        }
    };

    let named_fields = match data_struct.fields {
        Fields::Named(fields) => fields,
        _ => {
            return Err(syn::Error::new(
                struct_name.span(),
                "Entity requires named fields",
            ));
        }
    };

    let mut key_field: Option<(Ident, Type)> = None;
    let mut other_fields = Vec::<Ident>::new();

    for field in named_fields.named {
        let span = field.span();
        let ident = field
            .ident
            .clone()
            .ok_or_else(|| syn::Error::new(span, "Entity requires named fields"))?;

        if is_key_field(&field.attrs)? {
            if key_field.is_some() {
                return Err(syn::Error::new(
                    span,
                    "Entity allows exactly one #[entity(key)] field",
                ));
            }
            key_field = Some((ident, field.ty));
        } else {
            other_fields.push(ident);
        }
    }

    let Some((key_ident, key_ty)) = key_field else {
        return Err(syn::Error::new(
            struct_name.span(),
            "Entity requires a field marked #[entity(key)]",
        ));
    };

    let kind = options.kind.unwrap_or_else(|| struct_name.to_string());

    Ok(quote! {
        impl ::coordb::Entity for #struct_name {
            type Key = #key_ty;

            const KIND: &'static str = #kind;

            fn key(&self) -> Self::Key {
                ::core::clone::Clone::clone(&self.#key_ident)
            }

            fn overwrite_non_key_fields(&mut self, intended: &Self) {
                let _ = intended;
                #( self.#other_fields = ::core::clone::Clone::clone(&intended.#other_fields); )*
            }
        }
    })
}

fn parse_entity_options(attrs: &[Attribute]) -> syn::Result<EntityOptions> {
    let mut options = EntityOptions { kind: None };
    for attr in attrs {
        if !attr.path().is_ident("entity") {
            continue;
        }
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("kind") {
                let value: LitStr = meta.value()?.parse()?;
                if value.value().trim().is_empty() {
                    return Err(meta.error("entity kind must not be empty"));
                }
                options.kind = Some(value.value());
                Ok(())
            } else {
                Err(meta.error("unsupported #[entity(...)] option, expected `kind = \"...\"`"))
            }
        })?;
    }
    Ok(options)
}

fn is_key_field(attrs: &[Attribute]) -> syn::Result<bool> {
    let mut is_key = false;
    for attr in attrs {
        if !attr.path().is_ident("entity") {
            continue;
        }
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("key") {
                is_key = true;
                Ok(())
            } else {
                Err(meta.error("unsupported field option, expected #[entity(key)]"))
            }
        })?;
    }
    Ok(is_key)
}
