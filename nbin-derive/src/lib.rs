//! # nbin Derive Macros
//!
//! This crate provides the procedural macros for `nbin`. It automates the
//! implementation of `NativeType`, plus `NativeObject` for objects and
//! `NativeValue` for inline structs and enums.
//!
//! Compatible with `syn 2.0`.

use proc_macro::TokenStream;
use quote::quote;
use syn::{
    Attribute, Data, DataEnum, DeriveInput, Expr, Fields, Ident, LitInt, LitStr, Type,
    parse_macro_input,
};

/// Derives `NativeType` and either `NativeObject` (default) or `NativeValue`
/// (`#[nbin(kind = "struct")]` and fieldless enums).
#[proc_macro_derive(NbinType, attributes(nbin))]
pub fn derive_nbin_type(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    match expand(&input) {
        Ok(tokens) => TokenStream::from(tokens),
        Err(e) => e.to_compile_error().into(),
    }
}

fn expand(input: &DeriveInput) -> syn::Result<proc_macro2::TokenStream> {
    let name = &input.ident;
    if !input.generics.params.is_empty() {
        return Err(syn::Error::new_spanned(
            &input.generics,
            "NbinType does not support generic types",
        ));
    }
    let container = parse_container(&input.attrs)?;
    let type_name = match &container.name {
        Some(explicit) => quote! { #explicit },
        None => quote! { concat!(module_path!(), "::", stringify!(#name)) },
    };

    match &input.data {
        Data::Struct(data) => {
            let Fields::Named(named) = &data.fields else {
                return Err(syn::Error::new(
                    name.span(),
                    "NbinType only supports structs with named fields",
                ));
            };
            let mut declared = Vec::new();
            let mut skipped = Vec::new();
            for field in &named.named {
                let attrs = parse_field(&field.attrs)?;
                let Some(ident) = field.ident.clone() else {
                    return Err(syn::Error::new(name.span(), "unnamed field"));
                };
                if attrs.skip {
                    skipped.push(ident);
                } else {
                    declared.push(DeclaredField {
                        ident,
                        ty: field.ty.clone(),
                        order: attrs.order,
                        transient: attrs.transient,
                    });
                }
            }
            let is_struct = match container.kind.as_deref() {
                None | Some("object") => false,
                Some("struct") => true,
                Some(_) => {
                    return Err(syn::Error::new(
                        name.span(),
                        "Unknown nbin kind. Supported: object, struct",
                    ));
                }
            };
            Ok(generate_struct(name, &type_name, is_struct, &declared, &skipped))
        }
        Data::Enum(data) => {
            if container.kind.is_some() {
                return Err(syn::Error::new(name.span(), "enums take no nbin kind"));
            }
            generate_enum(name, &type_name, data)
        }
        Data::Union(_) => Err(syn::Error::new(
            name.span(),
            "NbinType only supports structs and enums",
        )),
    }
}

// --- Internal Data Structures ---

#[derive(Default)]
struct ContainerAttrs {
    name: Option<LitStr>,
    kind: Option<String>,
}

#[derive(Default)]
struct FieldAttrs {
    order: Option<LitInt>,
    transient: bool,
    skip: bool,
}

struct DeclaredField {
    ident: Ident,
    ty: Type,
    order: Option<LitInt>,
    transient: bool,
}

fn parse_container(attrs: &[Attribute]) -> syn::Result<ContainerAttrs> {
    let mut parsed = ContainerAttrs::default();
    for attr in attrs {
        if attr.path().is_ident("nbin") {
            attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("name") {
                    parsed.name = Some(meta.value()?.parse()?);
                    return Ok(());
                }
                if meta.path.is_ident("kind") {
                    let kind: LitStr = meta.value()?.parse()?;
                    parsed.kind = Some(kind.value());
                    return Ok(());
                }
                Err(meta.error("Unknown nbin attribute key. Supported: name, kind"))
            })?;
        }
    }
    Ok(parsed)
}

fn parse_field(attrs: &[Attribute]) -> syn::Result<FieldAttrs> {
    let mut parsed = FieldAttrs::default();
    for attr in attrs {
        if attr.path().is_ident("nbin") {
            attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("order") {
                    parsed.order = Some(meta.value()?.parse()?);
                    return Ok(());
                }
                if meta.path.is_ident("transient") {
                    parsed.transient = true;
                    return Ok(());
                }
                if meta.path.is_ident("skip") {
                    parsed.skip = true;
                    return Ok(());
                }
                Err(meta.error("Unknown nbin field attribute. Supported: order, transient, skip"))
            })?;
        }
    }
    Ok(parsed)
}

/// Parses `#[nbin(value = N)]` on an enum variant.
fn parse_variant(attrs: &[Attribute]) -> syn::Result<Option<Expr>> {
    let mut value = None;
    for attr in attrs {
        if attr.path().is_ident("nbin") {
            attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("value") {
                    value = Some(meta.value()?.parse()?);
                    return Ok(());
                }
                Err(meta.error("Unknown nbin variant attribute. Supported: value"))
            })?;
        }
    }
    Ok(value)
}

// --- Generator: NativeType (shared) ---

fn generate_native_type(
    name: &Ident,
    type_name: &proc_macro2::TokenStream,
    builder: proc_macro2::TokenStream,
) -> proc_macro2::TokenStream {
    quote! {
        impl ::nbin::NativeType for #name {
            const TYPE_NAME: &'static str = #type_name;

            fn type_def() -> ::nbin::types::TypeRef {
                static DEF: ::nbin::rt::OnceLock<::nbin::types::TypeRef> =
                    ::nbin::rt::OnceLock::new();
                DEF.get_or_init(|| #builder).clone()
            }
        }
    }
}

// --- Generator: structs ---

fn generate_struct(
    name: &Ident,
    type_name: &proc_macro2::TokenStream,
    is_struct: bool,
    declared: &[DeclaredField],
    skipped: &[Ident],
) -> proc_macro2::TokenStream {
    let constructor = if is_struct {
        quote! { structure }
    } else {
        quote! { object }
    };
    let field_defs = declared.iter().map(|f| {
        let ident = &f.ident;
        let ty = &f.ty;
        let order = f.order.as_ref().map(|n| quote! { .order(#n) });
        let transient = f.transient.then(|| quote! { .transient() });
        quote! {
            .field(
                ::nbin::types::FieldDef::new(
                    stringify!(#ident),
                    <#ty as ::nbin::NativeValue>::value_type(),
                )
                #order
                #transient
            )
        }
    });
    let impl_native_type = generate_native_type(
        name,
        type_name,
        quote! {
            ::nbin::types::TypeDef::#constructor(<Self as ::nbin::NativeType>::TYPE_NAME)
                #(#field_defs)*
                .build()
        },
    );

    let count = declared.len();
    let to_values = declared.iter().map(|f| {
        let ident = &f.ident;
        quote! { ::nbin::NativeValue::to_value(&self.#ident) }
    });
    let read_fields = declared.iter().enumerate().map(|(slot, f)| {
        let ident = &f.ident;
        quote! {
            #ident: ::nbin::rt::slot(
                values,
                #slot,
                <Self as ::nbin::NativeType>::TYPE_NAME,
                stringify!(#ident),
            )?,
        }
    });
    let restore_skipped = skipped.iter().map(|ident| {
        quote! { #ident: ::core::default::Default::default(), }
    });
    let rebuild = quote! {
        ::nbin::rt::expect_slots(values, #count, <Self as ::nbin::NativeType>::TYPE_NAME)?;
        Ok(Self {
            #(#read_fields)*
            #(#restore_skipped)*
        })
    };

    let impl_conversion = if is_struct {
        quote! {
            impl ::nbin::NativeValue for #name {
                fn value_type() -> ::nbin::types::ValueType {
                    ::nbin::types::ValueType::Struct(<Self as ::nbin::NativeType>::type_def())
                }

                fn to_value(&self) -> ::nbin::Value {
                    ::nbin::rt::struct_value(
                        <Self as ::nbin::NativeType>::type_def(),
                        vec![#(#to_values),*],
                    )
                }

                fn from_value(value: &::nbin::Value) -> ::nbin::Result<Self> {
                    let values = ::nbin::rt::struct_slots(
                        value,
                        <Self as ::nbin::NativeType>::TYPE_NAME,
                    )?;
                    #rebuild
                }
            }
        }
    } else {
        quote! {
            impl ::nbin::NativeObject for #name {
                fn to_values(&self) -> ::std::vec::Vec<::nbin::Value> {
                    vec![#(#to_values),*]
                }

                fn from_values(values: &[::nbin::Value]) -> ::nbin::Result<Self> {
                    #rebuild
                }
            }
        }
    };

    quote! {
        #impl_native_type
        #impl_conversion
    }
}

// --- Generator: enums ---

fn generate_enum(
    name: &Ident,
    type_name: &proc_macro2::TokenStream,
    data: &DataEnum,
) -> syn::Result<proc_macro2::TokenStream> {
    if data.variants.is_empty() {
        return Err(syn::Error::new(name.span(), "NbinType enums need at least one variant"));
    }
    let mut constants = Vec::new();
    let mut to_ordinal = Vec::new();
    let mut from_ordinal = Vec::new();
    for (ordinal, variant) in data.variants.iter().enumerate() {
        if !matches!(variant.fields, Fields::Unit) {
            return Err(syn::Error::new(
                variant.ident.span(),
                "NbinType only supports fieldless enums",
            ));
        }
        let ident = &variant.ident;
        let ordinal = u32::try_from(ordinal)
            .map_err(|_| syn::Error::new(ident.span(), "too many variants"))?;
        constants.push(match parse_variant(&variant.attrs)? {
            Some(value) => quote! { .native_constant(stringify!(#ident), #value) },
            None => quote! { .constant(stringify!(#ident)) },
        });
        to_ordinal.push(quote! { Self::#ident => #ordinal, });
        from_ordinal.push(quote! { #ordinal => Ok(Self::#ident), });
    }

    let impl_native_type = generate_native_type(
        name,
        type_name,
        quote! {
            ::nbin::types::TypeDef::enumeration(<Self as ::nbin::NativeType>::TYPE_NAME)
                #(#constants)*
                .build()
        },
    );

    Ok(quote! {
        #impl_native_type

        impl ::nbin::NativeValue for #name {
            fn value_type() -> ::nbin::types::ValueType {
                ::nbin::types::ValueType::Enum(<Self as ::nbin::NativeType>::type_def())
            }

            fn to_value(&self) -> ::nbin::Value {
                ::nbin::Value::Enum(match self {
                    #(#to_ordinal)*
                })
            }

            fn from_value(value: &::nbin::Value) -> ::nbin::Result<Self> {
                let type_name = <Self as ::nbin::NativeType>::TYPE_NAME;
                match ::nbin::rt::enum_ordinal(value, type_name)? {
                    #(#from_ordinal)*
                    other => Err(::nbin::rt::unknown_ordinal(type_name, other)),
                }
            }
        }
    })
}
