use super::{lazy_rng, Forward, Layer};
use crate::{
    dims::{
        check_dims, check_features, check_spatial_ndim, conv_output_size, dims_from_slice,
        resolve_padding, IntoDims, Padding, Spatial,
    },
    error::{check_positive, check_shape, Error},
    init::{init_optional, Init, Initializer},
    ops::{
        conv_general, conv_local, conv_transpose, fft_conv_general, fft_conv_transpose,
        signed, spectral_conv, ConvOptions,
    },
    Result, Tensor,
};
use anyhow::bail;
use dry::macro_for;
use ndarray::{Dimension, Ix1, Ix2, Ix3};
use paste::paste;
use rand::RngCore;
use rand_distr::{Distribution, StandardNormal};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{
    borrow::Cow,
    fmt::{self, Debug},
    marker::PhantomData,
};

mod sealed {
    pub trait ConvKindBase {}
}
use sealed::ConvKindBase;

/// Convolution algorithm, see [`Direct`] and [`Fft`].
pub trait ConvKind:
    Default + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static + ConvKindBase
{
    #[doc(hidden)]
    const PREFIX: &'static str;
    #[doc(hidden)]
    fn conv(
        input: &Tensor,
        weight: &Tensor,
        strides: &[usize],
        padding: &[(usize, usize)],
        dilation: &[usize],
        groups: usize,
    ) -> Result<Tensor>;
    #[doc(hidden)]
    fn conv_transpose(
        input: &Tensor,
        weight: &Tensor,
        strides: &[usize],
        padding: &[(usize, usize)],
        dilation: &[usize],
        out_padding: &[usize],
    ) -> Result<Tensor>;
}

/// Marker for direct convolutions.
#[derive(Default, Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Direct {}

impl ConvKindBase for Direct {}

impl ConvKind for Direct {
    const PREFIX: &'static str = "";
    fn conv(
        input: &Tensor,
        weight: &Tensor,
        strides: &[usize],
        padding: &[(usize, usize)],
        dilation: &[usize],
        groups: usize,
    ) -> Result<Tensor> {
        let options = ConvOptions {
            strides: strides.to_vec(),
            padding: signed(padding),
            rhs_dilation: dilation.to_vec(),
            groups,
            ..ConvOptions::new(strides.len())
        };
        conv_general(input, weight, &options)
    }
    fn conv_transpose(
        input: &Tensor,
        weight: &Tensor,
        strides: &[usize],
        padding: &[(usize, usize)],
        dilation: &[usize],
        out_padding: &[usize],
    ) -> Result<Tensor> {
        conv_transpose(input, weight, strides, padding, dilation, out_padding, 1)
    }
}

/// Marker for convolutions computed with the fft.
#[derive(Default, Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Fft {}

impl ConvKindBase for Fft {}

impl ConvKind for Fft {
    const PREFIX: &'static str = "Fft";
    fn conv(
        input: &Tensor,
        weight: &Tensor,
        strides: &[usize],
        padding: &[(usize, usize)],
        dilation: &[usize],
        groups: usize,
    ) -> Result<Tensor> {
        fft_conv_general(input, weight, strides, &signed(padding), dilation, groups)
    }
    fn conv_transpose(
        input: &Tensor,
        weight: &Tensor,
        strides: &[usize],
        padding: &[(usize, usize)],
        dilation: &[usize],
        out_padding: &[usize],
    ) -> Result<Tensor> {
        fft_conv_transpose(input, weight, strides, padding, dilation, out_padding, 1)
    }
}

fn masked<'a>(weight: &'a Tensor, mask: Option<&Tensor>) -> Result<Cow<'a, Tensor>> {
    match mask {
        Some(mask) => {
            check_shape(weight.shape(), mask.shape())?;
            Ok(Cow::Owned(weight * mask))
        }
        None => Ok(Cow::Borrowed(weight)),
    }
}

fn add_bias(mut output: Tensor, bias: Option<&Tensor>) -> Tensor {
    if let Some(bias) = bias {
        output += bias;
    }
    output
}

/// `(features, 1, ..)` with a unit axis per spatial axis.
fn bias_shape(features: usize, spatial_ndim: usize) -> Vec<usize> {
    let mut shape = vec![1; spatial_ndim + 1];
    shape[0] = features;
    shape
}

fn kernel_shape(outputs: usize, inputs: usize, kernel: &[usize]) -> Vec<usize> {
    let mut shape = vec![outputs, inputs];
    shape.extend_from_slice(kernel);
    shape
}

/// Checks that `input` is `(in_features, *spatial)`, returning the channels.
fn check_input(layer: &'static str, input: &Tensor, spatial_ndim: usize) -> Result<usize> {
    check_spatial_ndim(layer, input.shape(), spatial_ndim)?;
    Ok(check_positive("in_features", input.shape()[0])?)
}

/// Layers created with a [`ConvBuilder`].
pub trait ConvLayer: Layer + Sized {
    /// The spatial dimensions.
    type Dim: Spatial;
    #[doc(hidden)]
    fn from_builder(builder: ConvBuilder<Self>, rng: &mut dyn RngCore) -> Result<Self>;
}

/// Builder for convolutional layers.
///
/// Omitting the inputs creates a lazy layer, initialized on [`.build()`](Layer::build()).
///
/// Defaults:
/// - strides: 1
/// - padding: [`Padding::Same`]
/// - dilation: 1
/// - weight_init: glorot_uniform
/// - bias_init: zeros
#[derive(Clone, Debug)]
pub struct ConvBuilder<L: ConvLayer> {
    inputs: Option<usize>,
    outputs: Option<usize>,
    kernel: Option<L::Dim>,
    strides: L::Dim,
    padding: Padding,
    dilation: L::Dim,
    groups: usize,
    out_padding: L::Dim,
    depth_multiplier: usize,
    in_size: Option<L::Dim>,
    weight_init: Init,
    bias_init: Option<Init>,
    pointwise_weight_init: Init,
    _layer: PhantomData<fn() -> L>,
}

impl<L: ConvLayer> Default for ConvBuilder<L> {
    fn default() -> Self {
        Self {
            inputs: None,
            outputs: None,
            kernel: None,
            strides: 1.into_dims(),
            padding: Padding::Same,
            dilation: 1.into_dims(),
            groups: 1,
            out_padding: 0.into_dims(),
            depth_multiplier: 1,
            in_size: None,
            weight_init: Init::GlorotUniform,
            bias_init: Some(Init::Zeros),
            pointwise_weight_init: Init::GlorotUniform,
            _layer: PhantomData,
        }
    }
}

impl<L: ConvLayer> ConvBuilder<L> {
    /// Input channels, inferred from the first input when omitted.
    pub fn inputs(mut self, inputs: usize) -> Self {
        self.inputs.replace(inputs);
        self
    }
    /// Output channels.
    pub fn outputs(mut self, outputs: usize) -> Self {
        self.outputs.replace(outputs);
        self
    }
    /// The kernel size.
    pub fn kernel(mut self, kernel: impl IntoDims<L::Dim>) -> Self {
        self.kernel.replace(kernel.into_dims());
        self
    }
    /// Window strides.
    pub fn strides(mut self, strides: impl IntoDims<L::Dim>) -> Self {
        self.strides = strides.into_dims();
        self
    }
    /// Input padding.
    pub fn padding(mut self, padding: impl Into<Padding>) -> Self {
        self.padding = padding.into();
        self
    }
    /// Initializer of the weight.
    pub fn weight_init(mut self, init: Init) -> Self {
        self.weight_init = init;
        self
    }
    /// Initializer of the bias, `None` disables the bias.
    pub fn bias_init(mut self, init: Option<Init>) -> Self {
        self.bias_init = init;
        self
    }
    /// Builds the layer.
    ///
    /// A lazy layer draws a seed from `rng` for its initialization.
    ///
    /// **Errors**
    ///
    /// Outputs or kernel were not set, sizes are zero, or the padding or groups
    /// do not match.
    pub fn build(self, rng: &mut dyn RngCore) -> Result<L> {
        L::from_builder(self, rng)
    }
    fn outputs_or_err(&self, layer: &str) -> Result<usize> {
        match self.outputs {
            Some(outputs) => Ok(check_positive("outputs", outputs)?),
            None => bail!("{layer} outputs must be set before build()!"),
        }
    }
    fn kernel_or_err(&self, layer: &str) -> Result<L::Dim> {
        match self.kernel.clone() {
            Some(kernel) => check_dims(kernel, "kernel"),
            None => bail!("{layer} kernel must be set before build()!"),
        }
    }
}

/// Geometry shared by the convolutions.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound = "")]
struct Window<D: Spatial> {
    kernel: D,
    strides: D,
    padding: Padding,
    dilation: D,
}

impl<D: Spatial> Window<D> {
    fn new(kernel: D, strides: D, padding: Padding, dilation: D) -> Result<Self> {
        padding.validate(D::SPATIAL_NDIM)?;
        Ok(Self {
            kernel,
            strides: check_dims(strides, "strides")?,
            padding,
            dilation: check_dims(dilation, "dilation")?,
        })
    }
    fn resolve(&self, in_size: &[usize]) -> Result<Vec<(usize, usize)>> {
        resolve_padding(in_size, &self.padding, self.kernel.slice(), self.strides.slice())
    }
    fn fmt_fields(&self, builder: &mut fmt::DebugStruct) {
        builder.field("kernel", &self.kernel.slice());
        if self.strides.slice().iter().any(|x| *x != 1) {
            builder.field("strides", &self.strides.slice());
        }
        if self.padding != Padding::Same {
            builder.field("padding", &self.padding);
        }
        if self.dilation.slice().iter().any(|x| *x != 1) {
            builder.field("dilation", &self.dilation.slice());
        }
    }
}

/// Parameters that may be created on the first call.
#[derive(Clone, Serialize, Deserialize)]
struct LazyParams {
    weight: Option<Tensor>,
    bias: Option<Tensor>,
    in_features: Option<usize>,
    weight_init: Init,
    bias_init: Option<Init>,
    seed: u64,
}

impl LazyParams {
    fn new<L: ConvLayer>(builder: &ConvBuilder<L>, rng: &mut dyn RngCore) -> Result<Self> {
        let in_features = builder
            .inputs
            .map(|inputs| check_positive("inputs", inputs))
            .transpose()?;
        let seed = if in_features.is_none() {
            rng.next_u64()
        } else {
            0
        };
        Ok(Self {
            weight: None,
            bias: None,
            in_features,
            weight_init: builder.weight_init,
            bias_init: builder.bias_init,
            seed,
        })
    }
    fn init(&mut self, rng: &mut dyn RngCore, weight_shape: &[usize], bias_shape: &[usize]) {
        self.weight = Some(self.weight_init.init(rng, weight_shape));
        self.bias = init_optional(self.bias_init, rng, bias_shape);
    }
    fn weight(&self, layer: &'static str) -> Result<&Tensor> {
        Ok(self.weight.as_ref().ok_or(Error::Unmaterialized(layer))?)
    }
    fn len(&self) -> usize {
        self.weight.is_some() as usize + self.bias.is_some() as usize
    }
    fn collect<'a>(&'a self, parameters: &mut Vec<&'a Tensor>) {
        parameters.extend(self.weight.iter().chain(self.bias.iter()));
    }
    fn collect_mut<'a>(&'a mut self, parameters: &mut Vec<&'a mut Tensor>) {
        parameters.extend(self.weight.iter_mut().chain(self.bias.iter_mut()));
    }
}

/// Layer impl for convolutions with [`LazyParams`] in `params` and a
/// `materialize(&mut self, rng, input)` method.
macro_rules! impl_lazy_conv_layer {
    ($layer:ident<$($generic:ident: $bound:ident),*>, $name:literal) => {
        impl<$($generic: $bound),*> Layer for $layer<$($generic),*> {
            fn parameters_len(&self) -> usize {
                self.params.len()
            }
            fn collect_parameters<'a>(&'a self, parameters: &mut Vec<&'a Tensor>) {
                self.params.collect(parameters);
            }
            fn collect_parameters_mut<'a>(&'a mut self, parameters: &mut Vec<&'a mut Tensor>) {
                self.params.collect_mut(parameters);
            }
            fn build(&mut self, input: &Tensor) -> Result<Tensor> {
                if self.is_lazy() {
                    let mut rng = lazy_rng($name, self.params.seed, input.shape());
                    self.materialize(&mut rng, input)?;
                }
                self.forward(input)
            }
            fn is_lazy(&self) -> bool {
                self.params.weight.is_none()
            }
        }
    };
}

/// Convolution.
///
/// The weight is `(outputs, inputs / groups, *kernel)` and the bias `(outputs, 1, ..)`.
#[derive(Clone, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct ConvBase<D: Spatial, K: ConvKind> {
    params: LazyParams,
    outputs: usize,
    window: Window<D>,
    groups: usize,
    kind: PhantomData<K>,
}

macro_for!($N in [1, 2, 3] {
    paste! {
        #[doc = "Convolution in " $N "d, see [`ConvBase`]."]
        pub type [<Conv $N>] = ConvBase<[<Ix $N>], Direct>;
        #[doc = "Fft convolution in " $N "d, see [`ConvBase`]."]
        pub type [<FftConv $N>] = ConvBase<[<Ix $N>], Fft>;
        #[doc = "Transposed convolution in " $N "d, see [`ConvTransposeBase`]."]
        pub type [<ConvTranspose $N>] = ConvTransposeBase<[<Ix $N>], Direct>;
        #[doc = "Fft transposed convolution in " $N "d, see [`ConvTransposeBase`]."]
        pub type [<FftConvTranspose $N>] = ConvTransposeBase<[<Ix $N>], Fft>;
        #[doc = "Depthwise convolution in " $N "d, see [`DepthwiseConvBase`]."]
        pub type [<DepthwiseConv $N>] = DepthwiseConvBase<[<Ix $N>], Direct>;
        #[doc = "Depthwise fft convolution in " $N "d, see [`DepthwiseConvBase`]."]
        pub type [<DepthwiseFftConv $N>] = DepthwiseConvBase<[<Ix $N>], Fft>;
        #[doc = "Separable convolution in " $N "d, see [`SeparableConvBase`]."]
        pub type [<SeparableConv $N>] = SeparableConvBase<[<Ix $N>], Direct>;
        #[doc = "Separable fft convolution in " $N "d, see [`SeparableConvBase`]."]
        pub type [<SeparableFftConv $N>] = SeparableConvBase<[<Ix $N>], Fft>;
        #[doc = "Spectral convolution in " $N "d, see [`SpectralConv`]."]
        pub type [<SpectralConv $N>] = SpectralConv<[<Ix $N>]>;
        #[doc = "Locally connected convolution in " $N "d, see [`ConvLocal`]."]
        pub type [<ConvLocal $N>] = ConvLocal<[<Ix $N>]>;
    }
});

impl<D: Spatial, K: ConvKind> ConvBase<D, K> {
    /// Returns a builder for creating a [`ConvBase`].
    ///
    /// # Example
    /// ```
    /// # use tessera::{layer::conv::Conv2, Result};
    /// # use rand::{rngs::StdRng, SeedableRng};
    /// # fn main() -> Result<()> {
    /// let conv = Conv2::builder()
    ///     .inputs(1)
    ///     .outputs(8)
    ///     .kernel(3)
    ///     .strides(2)
    ///     .build(&mut StdRng::seed_from_u64(0))?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn builder() -> ConvBuilder<Self> {
        ConvBuilder::default()
    }
    /// The weight, `None` until materialized.
    pub fn weight(&self) -> Option<&Tensor> {
        self.params.weight.as_ref()
    }
    /// The bias.
    pub fn bias(&self) -> Option<&Tensor> {
        self.params.bias.as_ref()
    }
    /// Replaces the weight, materializing a lazy layer without a bias init.
    ///
    /// **Errors**
    ///
    /// The shape does not match the layer.
    pub fn with_weight(mut self, weight: Tensor) -> Result<Self> {
        let inputs = weight.shape().get(1).copied().unwrap_or(0) * self.groups;
        let expected = self.weight_shape(self.params.in_features.unwrap_or(inputs));
        check_shape(&expected, weight.shape())?;
        if self.params.weight.is_none() {
            let mut rng = lazy_rng("Conv", self.params.seed, weight.shape());
            let bias_shape = bias_shape(self.outputs, D::SPATIAL_NDIM);
            self.params.bias = init_optional(self.params.bias_init, &mut rng, &bias_shape);
            self.params.in_features = Some(inputs);
        }
        self.params.weight = Some(weight);
        Ok(self)
    }
    /// Replaces the bias, `None` removes it.
    ///
    /// **Errors**
    ///
    /// The bias is not `(outputs, 1, ..)`.
    pub fn with_bias(mut self, bias: Option<Tensor>) -> Result<Self> {
        if let Some(bias) = bias.as_ref() {
            check_shape(&bias_shape(self.outputs, D::SPATIAL_NDIM), bias.shape())?;
        }
        self.params.bias = bias;
        Ok(self)
    }
    fn weight_shape(&self, inputs: usize) -> Vec<usize> {
        kernel_shape(self.outputs, inputs / self.groups, self.window.kernel.slice())
    }
    fn materialize(&mut self, rng: &mut dyn RngCore, input: &Tensor) -> Result<()> {
        let inputs = match self.params.in_features {
            Some(inputs) => inputs,
            None => check_input("Conv", input, D::SPATIAL_NDIM)?,
        };
        if inputs % self.groups != 0 {
            return Err(Error::invalid(
                "groups",
                format!("inputs {inputs} are not divisible by groups {}", self.groups),
            )
            .into());
        }
        let weight_shape = self.weight_shape(inputs);
        self.params.init(rng, &weight_shape, &bias_shape(self.outputs, D::SPATIAL_NDIM));
        self.params.in_features = Some(inputs);
        Ok(())
    }
    /// Applies the layer with the weight multiplied by `mask`.
    ///
    /// **Errors**
    ///
    /// The mask does not match the weight, or see [`Forward::forward()`].
    pub fn forward_masked(&self, input: &Tensor, mask: &Tensor) -> Result<Tensor> {
        self.apply(input, Some(mask))
    }
    fn apply(&self, input: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let weight = self.params.weight("Conv")?;
        check_spatial_ndim("Conv", input.shape(), D::SPATIAL_NDIM)?;
        let inputs = weight.shape()[1] * self.groups;
        check_features(input.shape(), 0, inputs)?;
        let weight = masked(weight, mask)?;
        let padding = self.window.resolve(&input.shape()[1..])?;
        let output = K::conv(
            input,
            &weight,
            self.window.strides.slice(),
            &padding,
            self.window.dilation.slice(),
            self.groups,
        )?;
        Ok(add_bias(output, self.params.bias.as_ref()))
    }
}

impl<D: Spatial, K: ConvKind> ConvBuilder<ConvBase<D, K>> {
    /// Kernel dilation.
    pub fn dilation(mut self, dilation: impl IntoDims<D>) -> Self {
        self.dilation = dilation.into_dims();
        self
    }
    /// Feature groups, dividing both inputs and outputs.
    pub fn groups(mut self, groups: usize) -> Self {
        self.groups = groups;
        self
    }
}

impl<D: Spatial, K: ConvKind> ConvLayer for ConvBase<D, K> {
    type Dim = D;
    fn from_builder(builder: ConvBuilder<Self>, rng: &mut dyn RngCore) -> Result<Self> {
        let outputs = builder.outputs_or_err("ConvBuilder")?;
        let kernel = builder.kernel_or_err("ConvBuilder")?;
        let groups = check_positive("groups", builder.groups)?;
        if outputs % groups != 0 {
            return Err(Error::invalid(
                "groups",
                format!("outputs {outputs} are not divisible by groups {groups}"),
            )
            .into());
        }
        let params = LazyParams::new(&builder, rng)?;
        let mut conv = Self {
            params,
            outputs,
            window: Window::new(kernel, builder.strides, builder.padding, builder.dilation)?,
            groups,
            kind: PhantomData,
        };
        if conv.params.in_features.is_some() {
            conv.materialize(rng, &Tensor::zeros(vec![0]))?;
        }
        Ok(conv)
    }
}

impl<D: Spatial, K: ConvKind> Debug for ConvBase<D, K> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = format!("{}Conv{}", K::PREFIX, D::SPATIAL_NDIM);
        let mut builder = f.debug_struct(&name);
        builder.field("inputs", &self.params.in_features);
        builder.field("outputs", &self.outputs);
        self.window.fmt_fields(&mut builder);
        if self.groups != 1 {
            builder.field("groups", &self.groups);
        }
        builder.field("bias", &self.params.bias.is_some());
        builder.finish()
    }
}

impl<D: Spatial, K: ConvKind> Forward for ConvBase<D, K> {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        self.apply(input, None)
    }
}

impl_lazy_conv_layer!(ConvBase<D: Spatial, K: ConvKind>, "Conv");

/// Transposed convolution.
///
/// The weight is `(outputs, inputs, *kernel)`, `padding` is the padding of the
/// corresponding forward convolution and `out_padding` extends the output.
#[derive(Clone, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct ConvTransposeBase<D: Spatial, K: ConvKind> {
    params: LazyParams,
    outputs: usize,
    window: Window<D>,
    out_padding: D,
    kind: PhantomData<K>,
}

impl<D: Spatial, K: ConvKind> ConvTransposeBase<D, K> {
    /// Returns a builder for creating a [`ConvTransposeBase`].
    pub fn builder() -> ConvBuilder<Self> {
        ConvBuilder::default()
    }
    /// The weight, `None` until materialized.
    pub fn weight(&self) -> Option<&Tensor> {
        self.params.weight.as_ref()
    }
    fn materialize(&mut self, rng: &mut dyn RngCore, input: &Tensor) -> Result<()> {
        let inputs = match self.params.in_features {
            Some(inputs) => inputs,
            None => check_input("ConvTranspose", input, D::SPATIAL_NDIM)?,
        };
        let weight_shape = kernel_shape(self.outputs, inputs, self.window.kernel.slice());
        self.params.init(rng, &weight_shape, &bias_shape(self.outputs, D::SPATIAL_NDIM));
        self.params.in_features = Some(inputs);
        Ok(())
    }
    /// Applies the layer with the weight multiplied by `mask`.
    pub fn forward_masked(&self, input: &Tensor, mask: &Tensor) -> Result<Tensor> {
        self.apply(input, Some(mask))
    }
    fn apply(&self, input: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let weight = self.params.weight("ConvTranspose")?;
        check_spatial_ndim("ConvTranspose", input.shape(), D::SPATIAL_NDIM)?;
        check_features(input.shape(), 0, weight.shape()[1])?;
        let weight = masked(weight, mask)?;
        let padding = self.window.resolve(&input.shape()[1..])?;
        let output = K::conv_transpose(
            input,
            &weight,
            self.window.strides.slice(),
            &padding,
            self.window.dilation.slice(),
            self.out_padding.slice(),
        )?;
        Ok(add_bias(output, self.params.bias.as_ref()))
    }
}

impl<D: Spatial, K: ConvKind> ConvBuilder<ConvTransposeBase<D, K>> {
    /// Kernel dilation.
    pub fn dilation(mut self, dilation: impl IntoDims<D>) -> Self {
        self.dilation = dilation.into_dims();
        self
    }
    /// Extra padding added after the output.
    pub fn out_padding(mut self, out_padding: impl IntoDims<D>) -> Self {
        self.out_padding = out_padding.into_dims();
        self
    }
}

impl<D: Spatial, K: ConvKind> ConvLayer for ConvTransposeBase<D, K> {
    type Dim = D;
    fn from_builder(builder: ConvBuilder<Self>, rng: &mut dyn RngCore) -> Result<Self> {
        let outputs = builder.outputs_or_err("ConvBuilder")?;
        let kernel = builder.kernel_or_err("ConvBuilder")?;
        let params = LazyParams::new(&builder, rng)?;
        let mut conv = Self {
            params,
            outputs,
            window: Window::new(kernel, builder.strides, builder.padding, builder.dilation)?,
            out_padding: builder.out_padding,
            kind: PhantomData,
        };
        if conv.params.in_features.is_some() {
            conv.materialize(rng, &Tensor::zeros(vec![0]))?;
        }
        Ok(conv)
    }
}

impl<D: Spatial, K: ConvKind> Debug for ConvTransposeBase<D, K> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = format!("{}ConvTranspose{}", K::PREFIX, D::SPATIAL_NDIM);
        let mut builder = f.debug_struct(&name);
        builder.field("inputs", &self.params.in_features);
        builder.field("outputs", &self.outputs);
        self.window.fmt_fields(&mut builder);
        if self.out_padding.slice().iter().any(|x| *x != 0) {
            builder.field("out_padding", &self.out_padding.slice());
        }
        builder.field("bias", &self.params.bias.is_some());
        builder.finish()
    }
}

impl<D: Spatial, K: ConvKind> Forward for ConvTransposeBase<D, K> {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        self.apply(input, None)
    }
}

impl_lazy_conv_layer!(ConvTransposeBase<D: Spatial, K: ConvKind>, "ConvTranspose");

/// Depthwise convolution, every input channel convolved with `depth_multiplier` kernels.
///
/// The weight is `(depth_multiplier * inputs, 1, *kernel)`.
#[derive(Clone, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct DepthwiseConvBase<D: Spatial, K: ConvKind> {
    params: LazyParams,
    depth_multiplier: usize,
    window: Window<D>,
    kind: PhantomData<K>,
}

impl<D: Spatial, K: ConvKind> DepthwiseConvBase<D, K> {
    /// Returns a builder for creating a [`DepthwiseConvBase`].
    ///
    /// The outputs are `depth_multiplier * inputs`, outputs set on the builder are ignored.
    pub fn builder() -> ConvBuilder<Self> {
        ConvBuilder::default()
    }
    /// The weight, `None` until materialized.
    pub fn weight(&self) -> Option<&Tensor> {
        self.params.weight.as_ref()
    }
    fn materialize(&mut self, rng: &mut dyn RngCore, input: &Tensor) -> Result<()> {
        let inputs = match self.params.in_features {
            Some(inputs) => inputs,
            None => check_input("DepthwiseConv", input, D::SPATIAL_NDIM)?,
        };
        let outputs = self.depth_multiplier * inputs;
        let weight_shape = kernel_shape(outputs, 1, self.window.kernel.slice());
        self.params.init(rng, &weight_shape, &bias_shape(outputs, D::SPATIAL_NDIM));
        self.params.in_features = Some(inputs);
        Ok(())
    }
    /// Applies the layer with the weight multiplied by `mask`.
    pub fn forward_masked(&self, input: &Tensor, mask: &Tensor) -> Result<Tensor> {
        self.apply(input, Some(mask))
    }
    fn apply(&self, input: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let weight = self.params.weight("DepthwiseConv")?;
        check_spatial_ndim("DepthwiseConv", input.shape(), D::SPATIAL_NDIM)?;
        let inputs = weight.shape()[0] / self.depth_multiplier;
        check_features(input.shape(), 0, inputs)?;
        let weight = masked(weight, mask)?;
        let padding = self.window.resolve(&input.shape()[1..])?;
        let output = K::conv(
            input,
            &weight,
            self.window.strides.slice(),
            &padding,
            self.window.dilation.slice(),
            inputs,
        )?;
        Ok(add_bias(output, self.params.bias.as_ref()))
    }
}

impl<D: Spatial, K: ConvKind> ConvBuilder<DepthwiseConvBase<D, K>> {
    /// Kernels per input channel.
    pub fn depth_multiplier(mut self, depth_multiplier: usize) -> Self {
        self.depth_multiplier = depth_multiplier;
        self
    }
}

impl<D: Spatial, K: ConvKind> ConvLayer for DepthwiseConvBase<D, K> {
    type Dim = D;
    fn from_builder(builder: ConvBuilder<Self>, rng: &mut dyn RngCore) -> Result<Self> {
        let kernel = builder.kernel_or_err("ConvBuilder")?;
        let params = LazyParams::new(&builder, rng)?;
        let mut conv = Self {
            params,
            depth_multiplier: check_positive("depth_multiplier", builder.depth_multiplier)?,
            window: Window::new(kernel, builder.strides, builder.padding, 1.into_dims())?,
            kind: PhantomData,
        };
        if conv.params.in_features.is_some() {
            conv.materialize(rng, &Tensor::zeros(vec![0]))?;
        }
        Ok(conv)
    }
}

impl<D: Spatial, K: ConvKind> Debug for DepthwiseConvBase<D, K> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = format!("Depthwise{}Conv{}", K::PREFIX, D::SPATIAL_NDIM);
        let mut builder = f.debug_struct(&name);
        builder.field("inputs", &self.params.in_features);
        builder.field("depth_multiplier", &self.depth_multiplier);
        self.window.fmt_fields(&mut builder);
        builder.field("bias", &self.params.bias.is_some());
        builder.finish()
    }
}

impl<D: Spatial, K: ConvKind> Forward for DepthwiseConvBase<D, K> {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        self.apply(input, None)
    }
}

impl_lazy_conv_layer!(DepthwiseConvBase<D: Spatial, K: ConvKind>, "DepthwiseConv");

/// Depthwise convolution followed by a pointwise (kernel 1) convolution.
///
/// Only the pointwise convolution has a bias.
#[derive(Layer, Forward, Clone, Debug, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct SeparableConvBase<D: Spatial, K: ConvKind> {
    depthwise: DepthwiseConvBase<D, K>,
    pointwise: ConvBase<D, K>,
}

impl<D: Spatial, K: ConvKind> SeparableConvBase<D, K> {
    /// Returns a builder for creating a [`SeparableConvBase`].
    ///
    /// `weight_init` initializes the depthwise kernel and `bias_init` the pointwise bias.
    pub fn builder() -> ConvBuilder<Self> {
        ConvBuilder::default()
    }
    /// The depthwise convolution.
    pub fn depthwise(&self) -> &DepthwiseConvBase<D, K> {
        &self.depthwise
    }
    /// The pointwise convolution.
    pub fn pointwise(&self) -> &ConvBase<D, K> {
        &self.pointwise
    }
    /// Applies the layer with optional masks for both weights.
    pub fn forward_masked(
        &self,
        input: &Tensor,
        depthwise_mask: Option<&Tensor>,
        pointwise_mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let x = self.depthwise.apply(input, depthwise_mask)?;
        self.pointwise.apply(&x, pointwise_mask)
    }
}

impl<D: Spatial, K: ConvKind> ConvBuilder<SeparableConvBase<D, K>> {
    /// Kernels per input channel of the depthwise convolution.
    pub fn depth_multiplier(mut self, depth_multiplier: usize) -> Self {
        self.depth_multiplier = depth_multiplier;
        self
    }
    /// Initializer of the pointwise weight.
    pub fn pointwise_weight_init(mut self, init: Init) -> Self {
        self.pointwise_weight_init = init;
        self
    }
}

impl<D: Spatial, K: ConvKind> ConvLayer for SeparableConvBase<D, K> {
    type Dim = D;
    fn from_builder(builder: ConvBuilder<Self>, rng: &mut dyn RngCore) -> Result<Self> {
        let outputs = builder.outputs_or_err("ConvBuilder")?;
        let kernel = builder.kernel_or_err("ConvBuilder")?;
        let depthwise = ConvBuilder::<DepthwiseConvBase<D, K>> {
            inputs: builder.inputs,
            kernel: Some(kernel),
            strides: builder.strides.clone(),
            padding: builder.padding.clone(),
            depth_multiplier: builder.depth_multiplier,
            weight_init: builder.weight_init,
            bias_init: None,
            ..ConvBuilder::default()
        };
        let pointwise = ConvBuilder::<ConvBase<D, K>> {
            inputs: builder.inputs.map(|inputs| builder.depth_multiplier * inputs),
            outputs: Some(outputs),
            kernel: Some(1.into_dims()),
            padding: Padding::Valid,
            weight_init: builder.pointwise_weight_init,
            bias_init: builder.bias_init,
            ..ConvBuilder::default()
        };
        Ok(Self {
            depthwise: depthwise.build(rng)?,
            pointwise: pointwise.build(rng)?,
        })
    }
}

/// Fourier neural operator layer.
///
/// Transforms the input with a real fft, mixes channels of the lowest `modes`
/// frequencies with complex weights `(2^(N-1), outputs, inputs, *modes)`, and
/// transforms back. Omitting the inputs creates a lazy layer.
#[derive(Clone, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct SpectralConv<D: Spatial> {
    weight_r: Option<Tensor>,
    weight_i: Option<Tensor>,
    inputs: Option<usize>,
    outputs: usize,
    modes: D,
    seed: u64,
}

impl<D: Spatial> SpectralConv<D> {
    /// Creates a new [`SpectralConv`] for `inputs`, `outputs` and `modes`.
    ///
    /// Weights are normal, scaled by `1 / (inputs * outputs)`. With `inputs`
    /// `None` a seed is drawn from `rng` and the weights are created on
    /// [`.build()`](Layer::build()).
    ///
    /// **Errors**
    ///
    /// Sizes are zero.
    pub fn new(
        inputs: impl Into<Option<usize>>,
        outputs: usize,
        modes: impl IntoDims<D>,
        rng: &mut dyn RngCore,
    ) -> Result<Self> {
        let inputs = inputs
            .into()
            .map(|inputs| check_positive("inputs", inputs))
            .transpose()?;
        let mut conv = Self {
            weight_r: None,
            weight_i: None,
            inputs,
            outputs: check_positive("outputs", outputs)?,
            modes: check_dims(modes.into_dims(), "modes")?,
            seed: 0,
        };
        match inputs {
            Some(inputs) => conv.materialize(rng, inputs),
            None => conv.seed = rng.next_u64(),
        }
        Ok(conv)
    }
    fn weight_shape(&self, inputs: usize) -> Vec<usize> {
        let mut shape = vec![1 << (D::SPATIAL_NDIM - 1), self.outputs, inputs];
        shape.extend_from_slice(self.modes.slice());
        shape
    }
    fn materialize(&mut self, rng: &mut dyn RngCore, inputs: usize) {
        let shape = self.weight_shape(inputs);
        let scale = 1. / (inputs * self.outputs) as f32;
        self.weight_r = Some(scaled_normal(rng, &shape, scale));
        self.weight_i = Some(scaled_normal(rng, &shape, scale));
        self.inputs = Some(inputs);
    }
    /// Replaces the weights, materializing a lazy layer.
    ///
    /// **Errors**
    ///
    /// The shapes are not `(2^(N-1), outputs, inputs, *modes)`.
    pub fn with_weights(mut self, weight_r: Tensor, weight_i: Tensor) -> Result<Self> {
        let inputs = weight_r.shape().get(2).copied().unwrap_or(0);
        let expected = self.weight_shape(self.inputs.unwrap_or(inputs));
        check_shape(&expected, weight_r.shape())?;
        check_shape(&expected, weight_i.shape())?;
        self.weight_r = Some(weight_r);
        self.weight_i = Some(weight_i);
        self.inputs = Some(inputs);
        Ok(self)
    }
}

fn scaled_normal(rng: &mut dyn RngCore, shape: &[usize], scale: f32) -> Tensor {
    let mut array = Tensor::zeros(shape);
    array.map_inplace(|x| {
        let z: f32 = StandardNormal.sample(rng);
        *x = scale * z;
    });
    array
}

impl<D: Spatial> Debug for SpectralConv<D> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct(&format!("SpectralConv{}", D::SPATIAL_NDIM))
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("modes", &self.modes.slice())
            .finish()
    }
}

impl<D: Spatial> Forward for SpectralConv<D> {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let (Some(weight_r), Some(weight_i)) = (self.weight_r.as_ref(), self.weight_i.as_ref())
        else {
            return Err(Error::Unmaterialized("SpectralConv").into());
        };
        check_spatial_ndim("SpectralConv", input.shape(), D::SPATIAL_NDIM)?;
        check_features(input.shape(), 0, weight_r.shape()[2])?;
        spectral_conv(input, weight_r, weight_i, self.modes.slice())
    }
}

impl<D: Spatial> Layer for SpectralConv<D> {
    fn parameters_len(&self) -> usize {
        self.weight_r.is_some() as usize + self.weight_i.is_some() as usize
    }
    fn collect_parameters<'a>(&'a self, parameters: &mut Vec<&'a Tensor>) {
        parameters.extend(self.weight_r.iter().chain(self.weight_i.iter()));
    }
    fn collect_parameters_mut<'a>(&'a mut self, parameters: &mut Vec<&'a mut Tensor>) {
        parameters.extend(self.weight_r.iter_mut().chain(self.weight_i.iter_mut()));
    }
    fn build(&mut self, input: &Tensor) -> Result<Tensor> {
        if self.is_lazy() {
            let inputs = check_input("SpectralConv", input, D::SPATIAL_NDIM)?;
            let mut rng = lazy_rng("SpectralConv", self.seed, input.shape());
            self.materialize(&mut rng, inputs);
        }
        self.forward(input)
    }
    fn is_lazy(&self) -> bool {
        self.weight_r.is_none()
    }
}

/// Locally connected convolution, with a separate kernel at every output position.
///
/// The weight is `(outputs, inputs * prod(kernel), *out_size)` and the bias
/// `(outputs, *out_size)`, so the input size is fixed. Omitting the inputs or
/// the input size creates a lazy layer.
#[derive(Clone, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct ConvLocal<D: Spatial> {
    params: LazyParams,
    outputs: usize,
    in_size: Option<D>,
    window: Window<D>,
}

impl<D: Spatial> ConvLocal<D> {
    /// Returns a builder for creating a [`ConvLocal`].
    pub fn builder() -> ConvBuilder<Self> {
        ConvBuilder::default()
    }
    /// The weight, `None` until materialized.
    pub fn weight(&self) -> Option<&Tensor> {
        self.params.weight.as_ref()
    }
    fn out_size(&self, in_size: &[usize]) -> Result<(Vec<(usize, usize)>, Vec<usize>)> {
        let padding = self.window.resolve(in_size)?;
        let out_size = conv_output_size(
            in_size,
            self.window.kernel.slice(),
            &padding,
            self.window.strides.slice(),
            self.window.dilation.slice(),
        );
        Ok((padding, out_size))
    }
    fn materialize(&mut self, rng: &mut dyn RngCore, input: &Tensor) -> Result<()> {
        let (inputs, in_size) = match (self.params.in_features, self.in_size.clone()) {
            (Some(inputs), Some(in_size)) => (inputs, in_size),
            (inputs, in_size) => {
                let channels = check_input("ConvLocal", input, D::SPATIAL_NDIM)?;
                let in_size = in_size.unwrap_or_else(|| dims_from_slice(&input.shape()[1..]));
                (inputs.unwrap_or(channels), check_dims(in_size, "in_size")?)
            }
        };
        let (_, out_size) = self.out_size(in_size.slice())?;
        let kernel_len = self.window.kernel.size();
        let mut weight_shape = vec![self.outputs, inputs * kernel_len];
        weight_shape.extend_from_slice(&out_size);
        let mut bias_shape = vec![self.outputs];
        bias_shape.extend_from_slice(&out_size);
        self.params.init(rng, &weight_shape, &bias_shape);
        self.params.in_features = Some(inputs);
        self.in_size = Some(in_size);
        Ok(())
    }
    /// Applies the layer with the weight multiplied by `mask`.
    pub fn forward_masked(&self, input: &Tensor, mask: &Tensor) -> Result<Tensor> {
        self.apply(input, Some(mask))
    }
    fn apply(&self, input: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let weight = self.params.weight("ConvLocal")?;
        check_spatial_ndim("ConvLocal", input.shape(), D::SPATIAL_NDIM)?;
        let in_features = self.params.in_features.unwrap_or(0);
        check_features(input.shape(), 0, in_features)?;
        if let Some(in_size) = self.in_size.as_ref() {
            check_shape(in_size.slice(), &input.shape()[1..])?;
        }
        let weight = masked(weight, mask)?;
        let (padding, _) = self.out_size(&input.shape()[1..])?;
        let output = conv_local(
            input,
            &weight,
            self.window.kernel.slice(),
            self.window.strides.slice(),
            &padding,
            self.window.dilation.slice(),
        )?;
        Ok(add_bias(output, self.params.bias.as_ref()))
    }
}

impl<D: Spatial> ConvBuilder<ConvLocal<D>> {
    /// Kernel dilation.
    pub fn dilation(mut self, dilation: impl IntoDims<D>) -> Self {
        self.dilation = dilation.into_dims();
        self
    }
    /// Spatial size of the input, inferred from the first input when omitted.
    pub fn in_size(mut self, in_size: impl IntoDims<D>) -> Self {
        self.in_size.replace(in_size.into_dims());
        self
    }
}

impl<D: Spatial> ConvLayer for ConvLocal<D> {
    type Dim = D;
    fn from_builder(builder: ConvBuilder<Self>, rng: &mut dyn RngCore) -> Result<Self> {
        let outputs = builder.outputs_or_err("ConvBuilder")?;
        let kernel = builder.kernel_or_err("ConvBuilder")?;
        let in_size = builder
            .in_size
            .clone()
            .map(|in_size| check_dims(in_size, "in_size"))
            .transpose()?;
        let mut params = LazyParams::new(&builder, rng)?;
        let eager = params.in_features.is_some() && in_size.is_some();
        if !eager && params.in_features.is_some() {
            params.seed = rng.next_u64();
        }
        let mut conv = Self {
            params,
            outputs,
            in_size,
            window: Window::new(kernel, builder.strides, builder.padding, builder.dilation)?,
        };
        if eager {
            conv.materialize(rng, &Tensor::zeros(vec![0]))?;
        }
        Ok(conv)
    }
}

impl<D: Spatial> Debug for ConvLocal<D> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut builder = f.debug_struct(&format!("ConvLocal{}", D::SPATIAL_NDIM));
        builder.field("inputs", &self.params.in_features);
        builder.field("outputs", &self.outputs);
        builder.field("in_size", &self.in_size.as_ref().map(|x| x.slice().to_vec()));
        self.window.fmt_fields(&mut builder);
        builder.field("bias", &self.params.bias.is_some());
        builder.finish()
    }
}

impl<D: Spatial> Forward for ConvLocal<D> {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        self.apply(input, None)
    }
}

impl_lazy_conv_layer!(ConvLocal<D: Spatial>, "ConvLocal");
