/*!
# Derive Layer and Forward
Layer and Forward can be derived for structs composed of other layers and parameters.

Fields are child layers unless marked otherwise:
- `#[layer(layer)]`: a child layer (the default).
- `#[layer(parameter)]`: a [`Tensor`](tessera::Tensor) parameter.
- `#[layer(optional_parameter)]`: an `Option<Tensor>` parameter.
- `#[layer(skip)]`: ignored.

Derived [`Forward`](tessera::layer::Forward) applies the child layers in declaration order.

```
use tessera::{
    layer::{activation::Activation, linear::Linear, Forward, Layer},
    Result,
};
use rand::{rngs::StdRng, SeedableRng};
use serde::{Deserialize, Serialize};

#[derive(Layer, Forward, Clone, Debug, Serialize, Deserialize)]
struct Net {
    dense1: Linear,
    relu: Activation,
    dense2: Linear,
    #[layer(skip)]
    name: String,
}

# fn main() -> Result<()> {
let mut rng = StdRng::seed_from_u64(0);
let net = Net {
    dense1: Linear::new(4, 8, &mut rng)?,
    relu: Activation::Relu,
    dense2: Linear::new(8, 2, &mut rng)?,
    name: "net".into(),
};
assert_eq!(net.parameters().len(), 4);
let y = net.forward(&ndarray::ArrayD::ones(vec![3, 4]))?;
assert_eq!(y.shape(), &[3, 2]);
# Ok(())
# }
```
*/

use derive_syn_parse::Parse;
use proc_macro::TokenStream as BaseTokenStream;
use proc_macro2::{Span, TokenStream};
use quote::{quote, ToTokens};
use syn::{parse_macro_input, Attribute, Data, DeriveInput, Error, Fields, Ident, Index, Result};

#[derive(Parse)]
struct LayerArgs {
    kind: Ident,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum FieldKind {
    Layer,
    Parameter,
    OptionalParameter,
    Skip,
}

impl FieldKind {
    fn from_attributes(attributes: &[Attribute]) -> Result<Self> {
        let mut kind = Self::Layer;
        for attribute in attributes.iter().filter(|x| x.path.is_ident("layer")) {
            let args: LayerArgs = attribute.parse_args()?;
            kind = match args.kind.to_string().as_str() {
                "layer" => Self::Layer,
                "parameter" => Self::Parameter,
                "optional_parameter" => Self::OptionalParameter,
                "skip" => Self::Skip,
                _ => {
                    return Err(Error::new_spanned(
                        &args.kind,
                        "expected one of `layer`, `parameter`, `optional_parameter` or `skip`",
                    ))
                }
            };
        }
        Ok(kind)
    }
}

struct LayerFields {
    fields: Vec<(TokenStream, FieldKind)>,
}

impl LayerFields {
    fn parse(input: &DeriveInput) -> Result<Self> {
        let fields = match &input.data {
            Data::Struct(data_struct) => match &data_struct.fields {
                Fields::Named(fields) => fields.named.iter().collect(),
                Fields::Unnamed(fields) => fields.unnamed.iter().collect(),
                Fields::Unit => Vec::new(),
            },
            _ => {
                return Err(Error::new(
                    Span::call_site(),
                    "layers can only be derived for structs",
                ))
            }
        };
        let fields = fields
            .into_iter()
            .enumerate()
            .map(|(i, field)| {
                let member = if let Some(ident) = &field.ident {
                    ident.to_token_stream()
                } else {
                    Index::from(i).to_token_stream()
                };
                Ok((member, FieldKind::from_attributes(&field.attrs)?))
            })
            .collect::<Result<_>>()?;
        Ok(Self { fields })
    }
    fn of_kind(&self, kind: FieldKind) -> impl Iterator<Item = &TokenStream> {
        self.fields
            .iter()
            .filter(move |(_, x)| *x == kind)
            .map(|(member, _)| member)
    }
}

fn derive_layer_impl(input: &DeriveInput) -> Result<TokenStream> {
    let fields = LayerFields::parse(input)?;
    let ident = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();
    let layers: Vec<_> = fields.of_kind(FieldKind::Layer).collect();
    let parameters: Vec<_> = fields.of_kind(FieldKind::Parameter).collect();
    let optional_parameters: Vec<_> = fields.of_kind(FieldKind::OptionalParameter).collect();
    let mut collect_parameters = TokenStream::new();
    let mut collect_parameters_mut = TokenStream::new();
    for (member, kind) in fields.fields.iter() {
        match kind {
            FieldKind::Layer => {
                collect_parameters.extend(quote! {
                    ::tessera::layer::Layer::collect_parameters(&self.#member, parameters);
                });
                collect_parameters_mut.extend(quote! {
                    ::tessera::layer::Layer::collect_parameters_mut(&mut self.#member, parameters);
                });
            }
            FieldKind::Parameter => {
                collect_parameters.extend(quote! {
                    parameters.push(&self.#member);
                });
                collect_parameters_mut.extend(quote! {
                    parameters.push(&mut self.#member);
                });
            }
            FieldKind::OptionalParameter => {
                collect_parameters.extend(quote! {
                    if let Some(parameter) = self.#member.as_ref() {
                        parameters.push(parameter);
                    }
                });
                collect_parameters_mut.extend(quote! {
                    if let Some(parameter) = self.#member.as_mut() {
                        parameters.push(parameter);
                    }
                });
            }
            FieldKind::Skip => (),
        }
    }
    let parameters_len = parameters.len();
    let build = if layers.is_empty() {
        quote! {
            ::tessera::layer::Forward::forward(self, input)
        }
    } else {
        quote! {
            let x = input.clone();
            #(let x = ::tessera::layer::Layer::build(&mut self.#layers, &x)?;)*
            ::std::result::Result::Ok(x)
        }
    };
    Ok(quote! {
        impl #impl_generics ::tessera::layer::Layer for #ident #ty_generics #where_clause {
            fn parameters_len(&self) -> usize {
                #parameters_len
                    #(+ ::tessera::layer::Layer::parameters_len(&self.#layers))*
                    #(+ self.#optional_parameters.is_some() as usize)*
            }
            #[allow(unused_variables)]
            fn collect_parameters<'a>(&'a self, parameters: &mut ::std::vec::Vec<&'a ::tessera::Tensor>) {
                #collect_parameters
            }
            #[allow(unused_variables)]
            fn collect_parameters_mut<'a>(&'a mut self, parameters: &mut ::std::vec::Vec<&'a mut ::tessera::Tensor>) {
                #collect_parameters_mut
            }
            fn layers(&self) -> ::std::vec::Vec<&dyn ::tessera::layer::Layer> {
                ::std::vec![#(&self.#layers as &dyn ::tessera::layer::Layer),*]
            }
            fn layers_mut(&mut self) -> ::std::vec::Vec<&mut dyn ::tessera::layer::Layer> {
                ::std::vec![#(&mut self.#layers as &mut dyn ::tessera::layer::Layer),*]
            }
            #[allow(unused_variables)]
            fn set_training(&mut self, training: bool) {
                #(::tessera::layer::Layer::set_training(&mut self.#layers, training);)*
            }
            fn build(&mut self, input: &::tessera::Tensor) -> ::tessera::Result<::tessera::Tensor> {
                #build
            }
            fn is_lazy(&self) -> bool {
                false #(|| ::tessera::layer::Layer::is_lazy(&self.#layers))*
            }
        }
    })
}

fn derive_forward_impl(input: &DeriveInput) -> Result<TokenStream> {
    let fields = LayerFields::parse(input)?;
    let ident = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();
    let layers: Vec<_> = fields.of_kind(FieldKind::Layer).collect();
    Ok(quote! {
        impl #impl_generics ::tessera::layer::Forward for #ident #ty_generics #where_clause {
            fn forward(&self, input: &::tessera::Tensor) -> ::tessera::Result<::tessera::Tensor> {
                let x = input.clone();
                #(let x = ::tessera::layer::Forward::forward(&self.#layers, &x)?;)*
                ::std::result::Result::Ok(x)
            }
            #[allow(unused_variables)]
            fn forward_rng(
                &self,
                input: &::tessera::Tensor,
                rng: &mut dyn ::tessera::__private::rand::RngCore,
            ) -> ::tessera::Result<::tessera::Tensor> {
                let x = input.clone();
                #(let x = ::tessera::layer::Forward::forward_rng(&self.#layers, &x, rng)?;)*
                ::std::result::Result::Ok(x)
            }
        }
    })
}

/// Derives [`Layer`](tessera::layer::Layer).
///
/// Parameters are collected in declaration order, recursing into child layers.
/// `build` materializes child layers in order, feeding each the output of the
/// previous one.
#[proc_macro_derive(Layer, attributes(layer))]
pub fn derive_layer(input: BaseTokenStream) -> BaseTokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    match derive_layer_impl(&input) {
        Ok(output) => output.into(),
        Err(e) => e.to_compile_error().into(),
    }
}

/// Derives [`Forward`](tessera::layer::Forward) for sequential layers.
#[proc_macro_derive(Forward, attributes(layer))]
pub fn derive_forward(input: BaseTokenStream) -> BaseTokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    match derive_forward_impl(&input) {
        Ok(output) => output.into(),
        Err(e) => e.to_compile_error().into(),
    }
}
