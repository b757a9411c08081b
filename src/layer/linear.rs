use super::{activation::Activation, lazy_rng, Forward, Layer};
use crate::{
    dims::{check_features, normalize_axis},
    error::{check_positive, check_shape, Error},
    init::{init_optional, Init, Initializer},
    Result, Tensor,
};
use anyhow::bail;
use ndarray::{ArrayD, Axis, Ix1, Ix2};
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug};

/// Initializes an `(outputs, inputs)` weight, with fans computed as `(inputs, outputs)`.
fn init_transposed(init: Init, rng: &mut dyn RngCore, inputs: usize, outputs: usize) -> Tensor {
    init.init(rng, &[inputs, outputs])
        .reversed_axes()
        .as_standard_layout()
        .into_owned()
}

/// Multiplies the last axis of `x` by `weight` (I, O) and adds `bias` (O).
fn matmul_last(x: &Tensor, weight: &Tensor, bias: Option<&Tensor>) -> Result<Tensor> {
    let weight = weight.view().into_dimensionality::<Ix2>()?;
    let (inputs, outputs) = weight.dim();
    if x.ndim() == 0 {
        bail!("Expected at least 1 axis with {inputs} features, found a scalar!");
    }
    let last = x.ndim() - 1;
    check_features(x.shape(), last, inputs)?;
    let mut out_shape = x.shape()[..last].to_vec();
    let rows = out_shape.iter().product::<usize>();
    out_shape.push(outputs);
    let x = x.as_standard_layout();
    let mut y = x.view().into_shape((rows, inputs))?.dot(&weight);
    if let Some(bias) = bias {
        y += &bias.view().into_dimensionality::<Ix1>()?;
    }
    Ok(y.into_shape(out_shape)?)
}

/// Builder for [`Linear`].
#[derive(Clone, Debug)]
pub struct LinearBuilder {
    inputs: Option<usize>,
    outputs: Option<usize>,
    weight_init: Init,
    bias_init: Option<Init>,
}

impl Default for LinearBuilder {
    fn default() -> Self {
        Self {
            inputs: None,
            outputs: None,
            weight_init: Init::GlorotUniform,
            bias_init: Some(Init::Zeros),
        }
    }
}

impl LinearBuilder {
    /// Input features, inferred from the first input when omitted.
    pub fn inputs(mut self, inputs: usize) -> Self {
        self.inputs.replace(inputs);
        self
    }
    /// Output features.
    pub fn outputs(mut self, outputs: usize) -> Self {
        self.outputs.replace(outputs);
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
    /// A lazy layer draws a seed from `rng` and initializes on [`.build()`](Layer::build()).
    ///
    /// **Errors**
    ///
    /// Outputs were not set, or features are zero.
    pub fn build(self, rng: &mut dyn RngCore) -> Result<Linear> {
        let outputs = match self.outputs {
            Some(outputs) => check_positive("outputs", outputs)?,
            None => bail!("LinearBuilder outputs must be set before build()!"),
        };
        let mut linear = Linear {
            weight: None,
            bias: None,
            outputs,
            weight_init: self.weight_init,
            bias_init: self.bias_init,
            seed: 0,
        };
        match self.inputs {
            Some(inputs) => {
                linear.materialize(rng, check_positive("inputs", inputs)?);
            }
            None => linear.seed = rng.next_u64(),
        }
        Ok(linear)
    }
}

/// Dense / fully connected layer.
///
/// The weight is `(outputs, inputs)` and the bias `(outputs)`, applied to the
/// last axis of the input.
#[derive(Clone, Serialize, Deserialize)]
pub struct Linear {
    weight: Option<Tensor>,
    bias: Option<Tensor>,
    outputs: usize,
    weight_init: Init,
    bias_init: Option<Init>,
    seed: u64,
}

impl Linear {
    /// Creates a new [`Linear`] for `inputs` and `outputs`.
    ///
    /// Defaults:
    /// - weight_init: glorot_uniform
    /// - bias_init: zeros
    ///
    /// **Errors**
    ///
    /// `inputs` or `outputs` is zero.
    pub fn new(inputs: usize, outputs: usize, rng: &mut dyn RngCore) -> Result<Self> {
        Self::builder().inputs(inputs).outputs(outputs).build(rng)
    }
    /// Returns a builder for creating a [`Linear`].
    pub fn builder() -> LinearBuilder {
        LinearBuilder::default()
    }
    fn materialize(&mut self, rng: &mut dyn RngCore, inputs: usize) {
        self.weight = Some(init_transposed(self.weight_init, rng, inputs, self.outputs));
        self.bias = init_optional(self.bias_init, rng, &[self.outputs]);
    }
    /// The weight, `None` until materialized.
    pub fn weight(&self) -> Option<&Tensor> {
        self.weight.as_ref()
    }
    /// The bias.
    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }
    /// Replaces the weight, materializing a lazy layer.
    ///
    /// **Errors**
    ///
    /// The weight is not `(outputs, inputs)`, matching the current inputs if any.
    pub fn with_weight(mut self, weight: Tensor) -> Result<Self> {
        let inputs = match &self.weight {
            Some(current) => current.shape()[1],
            None => weight.shape().get(1).copied().unwrap_or(0),
        };
        check_shape(&[self.outputs, inputs], weight.shape())?;
        if self.weight.is_none() && self.bias_init.is_some() {
            let mut rng = lazy_rng("Linear", self.seed, weight.shape());
            self.bias = init_optional(self.bias_init, &mut rng, &[self.outputs]);
        }
        self.weight.replace(weight);
        Ok(self)
    }
    /// Replaces the bias, `None` removes it.
    ///
    /// **Errors**
    ///
    /// The bias is not `(outputs)`.
    pub fn with_bias(mut self, bias: Option<Tensor>) -> Result<Self> {
        if let Some(bias) = bias.as_ref() {
            check_shape(&[self.outputs], bias.shape())?;
        }
        self.bias = bias;
        Ok(self)
    }
}

impl Debug for Linear {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut builder = f.debug_struct("Linear");
        match self.weight.as_ref() {
            Some(weight) => builder.field("inputs", &weight.shape()[1]),
            None => builder.field("inputs", &"lazy"),
        };
        builder.field("outputs", &self.outputs);
        builder.field("bias", &self.bias.is_some());
        builder.finish()
    }
}

impl Forward for Linear {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let weight = self.weight.as_ref().ok_or(Error::Unmaterialized("Linear"))?;
        matmul_last(input, &weight.t().to_owned(), self.bias.as_ref())
    }
}

impl Layer for Linear {
    fn parameters_len(&self) -> usize {
        self.weight.is_some() as usize + self.bias.is_some() as usize
    }
    fn collect_parameters<'a>(&'a self, parameters: &mut Vec<&'a Tensor>) {
        parameters.extend(self.weight.iter().chain(self.bias.iter()));
    }
    fn collect_parameters_mut<'a>(&'a mut self, parameters: &mut Vec<&'a mut Tensor>) {
        parameters.extend(self.weight.iter_mut().chain(self.bias.iter_mut()));
    }
    fn build(&mut self, input: &Tensor) -> Result<Tensor> {
        if self.weight.is_none() {
            let inputs = match input.shape().last() {
                Some(inputs) => check_positive("inputs", *inputs)?,
                None => bail!("Cannot infer Linear inputs from a scalar!"),
            };
            let mut rng = lazy_rng("Linear", self.seed, input.shape());
            self.materialize(&mut rng, inputs);
        }
        self.forward(input)
    }
    fn is_lazy(&self) -> bool {
        self.weight.is_none()
    }
}

/// Lookup table of `count` vectors of `size`.
#[derive(Layer, Clone, Debug, Serialize, Deserialize)]
pub struct Embedding {
    #[layer(parameter)]
    weight: Tensor,
}

impl Embedding {
    /// Creates a new [`Embedding`] with a table drawn uniformly from [0, 1).
    ///
    /// **Errors**
    ///
    /// `count` or `size` is zero.
    pub fn new(count: usize, size: usize, rng: &mut dyn RngCore) -> Result<Self> {
        let count = check_positive("count", count)?;
        let size = check_positive("size", size)?;
        let weight = Tensor::from_shape_simple_fn(vec![count, size], || rng.gen::<f32>());
        Ok(Self { weight })
    }
    /// Creates a new [`Embedding`] from a `(count, size)` table.
    pub fn from_weight(weight: Tensor) -> Result<Self> {
        if weight.ndim() != 2 || weight.is_empty() {
            bail!("Embedding table must be a non empty matrix, found {:?}!", weight.shape());
        }
        Ok(Self { weight })
    }
    /// The table.
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }
    /// Looks up every index, appending an axis of `size`.
    ///
    /// **Errors**
    ///
    /// [`Error::IndexOutOfBounds`] if an index exceeds the table.
    pub fn forward_indices(&self, indices: &ArrayD<usize>) -> Result<Tensor> {
        let (count, size) = (self.weight.shape()[0], self.weight.shape()[1]);
        let mut out_shape = indices.shape().to_vec();
        out_shape.push(size);
        let mut data = Vec::with_capacity(indices.len() * size);
        for &index in indices.iter() {
            if index >= count {
                return Err(Error::IndexOutOfBounds { index, len: count }.into());
            }
            data.extend(self.weight.index_axis(Axis(0), index).iter().copied());
        }
        Ok(Tensor::from_shape_vec(out_shape, data)?)
    }
}

impl Forward for Embedding {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        Err(Error::invalid(
            "input",
            format!(
                "Embedding expects integer indices, found floats {:?}, use `forward_indices`",
                input.shape()
            ),
        )
        .into())
    }
}

/// Linear map of the outer product of several inputs.
///
/// With inputs `x1 (.., I1)`, `x2 (.., I2)`, the weight is `(I1, I2, O)` and
/// `y_k = sum_ij x1_i x2_j W_ijk + b_k`.
#[derive(Layer, Clone, Debug, Serialize, Deserialize)]
pub struct Multilinear {
    #[layer(parameter)]
    weight: Tensor,
    #[layer(optional_parameter)]
    bias: Option<Tensor>,
}

/// [`Multilinear`] with 2 inputs.
pub type Bilinear = Multilinear;

impl Multilinear {
    /// Creates a new [`Multilinear`] for `in_features` and `outputs`.
    ///
    /// Defaults:
    /// - weight_init: glorot_uniform
    /// - bias_init: zeros
    ///
    /// **Errors**
    ///
    /// `in_features` is empty or a feature count is zero.
    pub fn new(
        in_features: &[usize],
        outputs: usize,
        weight_init: Init,
        bias_init: Option<Init>,
        rng: &mut dyn RngCore,
    ) -> Result<Self> {
        if in_features.is_empty() {
            return Err(Error::invalid("in_features", "expected at least one input").into());
        }
        for features in in_features.iter().copied().chain([outputs]) {
            check_positive("in_features", features)?;
        }
        let mut shape = in_features.to_vec();
        shape.push(outputs);
        Ok(Self {
            weight: weight_init.init(rng, &shape),
            bias: init_optional(bias_init, rng, &[outputs]),
        })
    }
    /// Replaces the weight.
    ///
    /// **Errors**
    ///
    /// The shape differs from the current weight.
    pub fn with_weight(mut self, weight: Tensor) -> Result<Self> {
        check_shape(self.weight.shape(), weight.shape())?;
        self.weight = weight;
        Ok(self)
    }
    /// Replaces the bias, `None` removes it.
    pub fn with_bias(mut self, bias: Option<Tensor>) -> Result<Self> {
        if let Some(bias) = bias.as_ref() {
            check_shape(&self.weight.shape()[self.weight.ndim() - 1..], bias.shape())?;
        }
        self.bias = bias;
        Ok(self)
    }
    /// The weight, `(*in_features, outputs)`.
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }
    /// Applies the layer to one input per in feature.
    ///
    /// Inputs share their leading axes.
    ///
    /// **Errors**
    ///
    /// The number of inputs or their shapes do not match.
    pub fn forward_many(&self, inputs: &[&Tensor]) -> Result<Tensor> {
        let in_features = &self.weight.shape()[..self.weight.ndim() - 1];
        if inputs.len() != in_features.len() {
            bail!(
                "Expected {} inputs for in_features {in_features:?}, found {}!",
                in_features.len(),
                inputs.len()
            );
        }
        let lead = match inputs[0].ndim() {
            0 => bail!("Multilinear inputs must have a feature axis!"),
            ndim => inputs[0].shape()[..ndim - 1].to_vec(),
        };
        let rows = lead.iter().product::<usize>();
        let mut outer = ndarray::Array2::<f32>::ones((rows, 1));
        for (x, &features) in inputs.iter().zip(in_features) {
            let last = x.ndim().saturating_sub(1);
            if x.shape()[..last] != lead[..] {
                bail!(
                    "Multilinear inputs {:?} and {:?} do not share leading axes!",
                    inputs[0].shape(),
                    x.shape()
                );
            }
            check_features(x.shape(), last, features)?;
            let x = x.as_standard_layout();
            let x = x.view().into_shape((rows, features))?;
            let width = outer.ncols();
            let mut next = ndarray::Array2::<f32>::zeros((rows, width * features));
            for ((mut next, outer), x) in next
                .outer_iter_mut()
                .zip(outer.outer_iter())
                .zip(x.outer_iter())
            {
                for (i, a) in outer.iter().enumerate() {
                    for (j, b) in x.iter().enumerate() {
                        next[i * features + j] = a * b;
                    }
                }
            }
            outer = next;
        }
        let width = outer.ncols();
        let outputs = self.weight.shape()[self.weight.ndim() - 1];
        let weight = self.weight.view().into_shape((width, outputs))?;
        let mut y = outer.dot(&weight);
        if let Some(bias) = self.bias.as_ref() {
            y += &bias.view().into_dimensionality::<Ix1>()?;
        }
        let mut out_shape = lead;
        out_shape.push(outputs);
        Ok(y.into_shape(out_shape)?)
    }
}

impl Forward for Multilinear {
    /// Applies a single input multilinear (ie linear) layer.
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        self.forward_many(&[input])
    }
}

/// Linear map contracting several axes of the input.
///
/// The contracted axes are removed and `outputs` is appended as the last axis.
#[derive(Layer, Clone, Debug, Serialize, Deserialize)]
pub struct GeneralLinear {
    #[layer(parameter)]
    weight: Tensor,
    #[layer(optional_parameter)]
    bias: Option<Tensor>,
    #[layer(skip)]
    in_axes: Vec<isize>,
}

impl GeneralLinear {
    /// Creates a new [`GeneralLinear`] contracting `in_axes` of sizes `in_features`.
    ///
    /// Negative axes count from the end.
    ///
    /// **Errors**
    ///
    /// `in_features` and `in_axes` differ in length or are empty, or a feature count is zero.
    pub fn new(
        in_features: &[usize],
        in_axes: &[isize],
        outputs: usize,
        weight_init: Init,
        bias_init: Option<Init>,
        rng: &mut dyn RngCore,
    ) -> Result<Self> {
        if in_features.len() != in_axes.len() {
            return Err(Error::invalid(
                "in_axes",
                format!("{in_axes:?} does not match in_features {in_features:?}"),
            )
            .into());
        }
        let Multilinear { weight, bias } =
            Multilinear::new(in_features, outputs, weight_init, bias_init, rng)?;
        Ok(Self {
            weight,
            bias,
            in_axes: in_axes.to_vec(),
        })
    }
}

impl Forward for GeneralLinear {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let ndim = input.ndim();
        let axes = self
            .in_axes
            .iter()
            .map(|axis| normalize_axis(*axis, ndim))
            .collect::<Result<Vec<_>, _>>()?;
        for (i, axis) in axes.iter().enumerate() {
            if axes[..i].contains(axis) {
                bail!("Axis {axis} is contracted twice in {:?}!", self.in_axes);
            }
            check_features(input.shape(), *axis, self.weight.shape()[i])?;
        }
        let mut order: Vec<usize> = (0..ndim).filter(|x| !axes.contains(x)).collect();
        let lead: Vec<usize> = order.iter().map(|x| input.shape()[*x]).collect();
        order.extend_from_slice(&axes);
        let x = input.view().permuted_axes(order);
        let rows = lead.iter().product::<usize>();
        let width = self.weight.len() / self.weight.shape()[self.weight.ndim() - 1];
        let x = x.as_standard_layout();
        let x = x.into_shape(vec![rows, width])?.into_dyn();
        let outputs = self.weight.shape()[self.weight.ndim() - 1];
        let weight = self.weight.view().into_shape(vec![width, outputs])?;
        let y = matmul_last(&x.to_owned(), &weight.to_owned(), self.bias.as_ref())?;
        let mut out_shape = lead;
        out_shape.push(outputs);
        Ok(y.into_shape(out_shape)?)
    }
}

/// Stack of [`Linear`] layers with an activation between them.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Fnn {
    layers: Vec<Linear>,
    act: Activation,
}

impl Fnn {
    /// Creates a new [`Fnn`] mapping `layers[0]` to `layers[n]` features.
    ///
    /// **Errors**
    ///
    /// Fewer than 2 feature counts or a zero count.
    pub fn new(
        layers: &[usize],
        act: Activation,
        weight_init: Init,
        bias_init: Option<Init>,
        rng: &mut dyn RngCore,
    ) -> Result<Self> {
        if layers.len() < 2 {
            return Err(Error::invalid("layers", format!("{layers:?} needs inputs and outputs")).into());
        }
        let layers = layers
            .windows(2)
            .map(|pair| {
                Linear::builder()
                    .inputs(pair[0])
                    .outputs(pair[1])
                    .weight_init(weight_init)
                    .bias_init(bias_init)
                    .build(rng)
            })
            .collect::<Result<_>>()?;
        Ok(Self { layers, act })
    }
    /// The linear layers.
    pub fn layers(&self) -> &[Linear] {
        &self.layers
    }
}

impl Forward for Fnn {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let mut x = input.clone();
        for (i, layer) in self.layers.iter().enumerate() {
            if i > 0 {
                x = self.act.forward(&x)?;
            }
            x = layer.forward(&x)?;
        }
        Ok(x)
    }
}

impl Layer for Fnn {
    fn parameters_len(&self) -> usize {
        self.layers.iter().map(Layer::parameters_len).sum()
    }
    fn collect_parameters<'a>(&'a self, parameters: &mut Vec<&'a Tensor>) {
        for layer in self.layers.iter() {
            layer.collect_parameters(parameters);
        }
    }
    fn collect_parameters_mut<'a>(&'a mut self, parameters: &mut Vec<&'a mut Tensor>) {
        for layer in self.layers.iter_mut() {
            layer.collect_parameters_mut(parameters);
        }
    }
    fn layers(&self) -> Vec<&dyn Layer> {
        self.layers.iter().map(|x| x as &dyn Layer).collect()
    }
    fn layers_mut(&mut self) -> Vec<&mut dyn Layer> {
        self.layers.iter_mut().map(|x| x as &mut dyn Layer).collect()
    }
}

/// Multi layer perceptron with `num_hidden_layers` hidden layers of equal width.
#[derive(Layer, Forward, Clone, Debug, Serialize, Deserialize)]
pub struct Mlp {
    fnn: Fnn,
}

impl Mlp {
    /// Creates a new [`Mlp`] from `inputs` to `outputs` through `hidden` features.
    ///
    /// **Errors**
    ///
    /// `num_hidden_layers` or a feature count is zero.
    pub fn new(
        inputs: usize,
        outputs: usize,
        hidden: usize,
        num_hidden_layers: usize,
        act: Activation,
        rng: &mut dyn RngCore,
    ) -> Result<Self> {
        let num_hidden_layers = check_positive("num_hidden_layers", num_hidden_layers)?;
        let mut layers = vec![inputs];
        layers.extend(std::iter::repeat(hidden).take(num_hidden_layers));
        layers.push(outputs);
        Ok(Self {
            fnn: Fnn::new(&layers, act, Init::GlorotUniform, Some(Init::Zeros), rng)?,
        })
    }
}

/// Sum of [`Linear`] maps of the elementwise powers of the input.
///
/// `y = L_1(x) + L_2(x^2) + .. + L_n(x^n)`, only `L_1` carries a bias.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Polynomial {
    linears: Vec<Linear>,
}

impl Polynomial {
    /// Creates a new [`Polynomial`] of `degree` from `inputs` to `outputs`.
    ///
    /// Inputs are inferred on [`.build()`](Layer::build()) when `None`.
    ///
    /// **Errors**
    ///
    /// `degree` or a feature count is zero.
    pub fn new(
        inputs: impl Into<Option<usize>>,
        outputs: usize,
        degree: usize,
        rng: &mut dyn RngCore,
    ) -> Result<Self> {
        let degree = check_positive("degree", degree)?;
        let inputs = inputs.into();
        let linears = (0..degree)
            .map(|i| {
                let builder = Linear::builder()
                    .outputs(outputs)
                    .bias_init(if i == 0 { Some(Init::Zeros) } else { None });
                match inputs {
                    Some(inputs) => builder.inputs(inputs).build(rng),
                    None => builder.build(rng),
                }
            })
            .collect::<Result<_>>()?;
        Ok(Self { linears })
    }
    /// The highest power.
    pub fn degree(&self) -> usize {
        self.linears.len()
    }
    /// The linear layer of each power, starting at 1.
    pub fn linears(&self) -> &[Linear] {
        &self.linears
    }
}

/// Sums `f(linear_i, x^i)` over the linear layer of each power.
fn sum_powers<L>(
    linears: impl IntoIterator<Item = L>,
    input: &Tensor,
    mut f: impl FnMut(L, &Tensor) -> Result<Tensor>,
) -> Result<Tensor> {
    let mut power = input.clone();
    let mut output: Option<Tensor> = None;
    for (i, linear) in linears.into_iter().enumerate() {
        if i > 0 {
            power *= input;
        }
        let y = f(linear, &power)?;
        output = Some(match output {
            Some(acc) => acc + y,
            None => y,
        });
    }
    output.ok_or_else(|| Error::invalid("degree", "expected at least 1 power").into())
}

impl Forward for Polynomial {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        sum_powers(self.linears.iter(), input, |linear, x| linear.forward(x))
    }
}

impl Layer for Polynomial {
    fn parameters_len(&self) -> usize {
        self.linears.iter().map(Layer::parameters_len).sum()
    }
    fn collect_parameters<'a>(&'a self, parameters: &mut Vec<&'a Tensor>) {
        for linear in self.linears.iter() {
            linear.collect_parameters(parameters);
        }
    }
    fn collect_parameters_mut<'a>(&'a mut self, parameters: &mut Vec<&'a mut Tensor>) {
        for linear in self.linears.iter_mut() {
            linear.collect_parameters_mut(parameters);
        }
    }
    fn layers(&self) -> Vec<&dyn Layer> {
        self.linears.iter().map(|x| x as &dyn Layer).collect()
    }
    fn layers_mut(&mut self) -> Vec<&mut dyn Layer> {
        self.linears.iter_mut().map(|x| x as &mut dyn Layer).collect()
    }
    fn build(&mut self, input: &Tensor) -> Result<Tensor> {
        sum_powers(self.linears.iter_mut(), input, |linear, x| linear.build(x))
    }
    fn is_lazy(&self) -> bool {
        self.linears.iter().any(Layer::is_lazy)
    }
}

/// Divides `weight` by its L2 norm over every axis but `axis`.
///
/// Norms are clamped to at least `eps`.
pub fn weight_norm(weight: &Tensor, axis: isize, eps: f32) -> Result<Tensor> {
    let axis = Axis(normalize_axis(axis, weight.ndim())?);
    let mut output = weight.clone();
    for mut lane in output.axis_iter_mut(axis) {
        let norm = lane.iter().map(|x| x * x).sum::<f32>().sqrt().max(eps);
        lane.mapv_inplace(|x| x / norm);
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array, IxDyn};
    use rand::{rngs::StdRng, SeedableRng};

    fn rng() -> StdRng {
        StdRng::seed_from_u64(0)
    }

    #[test]
    fn linear_with_weight() {
        let linear = Linear::builder()
            .inputs(1)
            .outputs(1)
            .bias_init(None)
            .build(&mut rng())
            .unwrap()
            .with_weight(array![[-0.31568417f32]].into_dyn())
            .unwrap();
        let y = linear.forward(&array![[1f32]].into_dyn()).unwrap();
        assert_abs_diff_eq!(y, array![[-0.31568417f32]].into_dyn());
        assert_eq!(linear.parameters_len(), 1);
    }

    #[test]
    fn linear_lazy() {
        let mut linear = Linear::builder().outputs(3).build(&mut rng()).unwrap();
        assert!(linear.is_lazy());
        let x = Tensor::ones(vec![2, 5, 4]);
        let err = linear.forward(&x).unwrap_err();
        assert_eq!(
            err.downcast_ref::<Error>(),
            Some(&Error::Unmaterialized("Linear"))
        );
        let y = linear.build(&x).unwrap();
        assert_eq!(y.shape(), &[2, 5, 3]);
        assert_eq!(linear.weight().unwrap().shape(), &[3, 4]);
        assert!(!linear.is_lazy());
        let err = linear.forward(&Tensor::ones(vec![2, 3])).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::FeatureMismatch { expected: 4, found: 3, .. })
        ));
    }

    #[test]
    fn lazy_is_deterministic() {
        let x = Tensor::ones(vec![4]);
        let mut a = Linear::builder().outputs(2).build(&mut rng()).unwrap();
        let mut b = Linear::builder().outputs(2).build(&mut rng()).unwrap();
        assert_eq!(a.build(&x).unwrap(), b.build(&x).unwrap());
    }

    #[test]
    fn embedding_lookup() {
        let table = Embedding::from_weight(array![[0f32, 1.], [2., 3.], [4., 5.]].into_dyn()).unwrap();
        let y = table
            .forward_indices(&array![[2usize], [0]].into_dyn())
            .unwrap();
        assert_eq!(y, array![[[4f32, 5.]], [[0., 1.]]].into_dyn());
        let err = table.forward_indices(&array![3usize].into_dyn()).unwrap_err();
        assert_eq!(
            err.downcast_ref::<Error>(),
            Some(&Error::IndexOutOfBounds { index: 3, len: 3 })
        );
        assert!(table.forward(&array![1f32].into_dyn()).is_err());
    }

    #[test]
    fn bilinear() {
        let weight = array![
            [[-0.246f32, -0.3016], [-0.5532, 0.4251], [0.0983, 0.4425], [-0.1003, 0.1923]],
            [[0.4584, -0.5352], [-0.449, 0.1154], [-0.3347, 0.3776], [0.2751, -0.0284]],
            [[-0.4469, 0.3681], [-0.2142, -0.0545], [-0.5095, -0.2242], [-0.4428, 0.2033]],
        ]
        .into_dyn();
        let x1 = array![[-0.7676f32, -0.7205, -0.0586]].into_dyn();
        let x2 = array![[0.46f32, -0.2508, 0.0115, 0.6155]].into_dyn();
        let expected = array![[-0.3001916f32, 0.28336674]].into_dyn();
        for bias_init in [None, Some(Init::Zeros)] {
            let layer = Bilinear::new(&[3, 4], 2, Init::GlorotUniform, bias_init, &mut rng())
                .unwrap()
                .with_weight(weight.clone())
                .unwrap();
            let y = layer.forward_many(&[&x1, &x2]).unwrap();
            assert_abs_diff_eq!(y, expected, epsilon = 1e-4);
        }
    }

    #[test]
    fn multilinear_single_input_is_linear() {
        let linear = Linear::new(1, 10, &mut rng()).unwrap();
        let weight = linear.weight().unwrap().t().to_owned();
        let multi = Multilinear::new(&[1], 10, Init::GlorotUniform, Some(Init::Zeros), &mut rng())
            .unwrap()
            .with_weight(weight)
            .unwrap();
        let x = Array::linspace(0f32, 1., 100).into_shape((100, 1)).unwrap().into_dyn();
        assert_abs_diff_eq!(linear.forward(&x).unwrap(), multi.forward(&x).unwrap(), epsilon = 1e-5);
        assert!(Multilinear::new(&[], 10, Init::GlorotUniform, None, &mut rng()).is_err());
    }

    #[test]
    fn general_linear_shapes() {
        let x = Tensor::ones(IxDyn(&[1, 2, 3, 4]));
        let cases: [(&[usize], &[isize], &[usize]); 3] = [
            (&[1, 2], &[0, 1], &[3, 4, 5]),
            (&[1, 2], &[0, -3], &[3, 4, 5]),
            (&[2, 3], &[1, -2], &[1, 4, 5]),
        ];
        for (in_features, in_axes, shape) in cases {
            let layer =
                GeneralLinear::new(in_features, in_axes, 5, Init::GlorotUniform, Some(Init::Zeros), &mut rng())
                    .unwrap();
            assert_eq!(layer.forward(&x).unwrap().shape(), shape);
        }
        assert!(GeneralLinear::new(&[1], &[0, -3], 5, Init::GlorotUniform, None, &mut rng()).is_err());
    }

    #[test]
    fn fnn_and_mlp() {
        let fnn = Fnn::new(&[1, 8, 8, 1], Activation::Relu, Init::HeNormal, Some(Init::Ones), &mut rng())
            .unwrap();
        assert_eq!(fnn.parameters_len(), 6);
        assert_eq!(fnn.forward(&Tensor::ones(vec![7, 1])).unwrap().shape(), &[7, 1]);
        let mlp = Mlp::new(3, 2, 4, 2, Activation::Tanh, &mut rng()).unwrap();
        assert_eq!(mlp.parameters_len(), 6);
        assert_eq!(mlp.forward(&Tensor::ones(vec![3])).unwrap().shape(), &[2]);
        assert!(Mlp::new(3, 2, 4, 0, Activation::Tanh, &mut rng()).is_err());
    }

    #[test]
    fn polynomial_sums_powers() {
        let mut poly = Polynomial::new(1, 1, 2, &mut rng()).unwrap();
        assert_eq!(poly.degree(), 2);
        assert_eq!(poly.parameters_len(), 3);
        let mut parameters = poly.parameters_mut();
        parameters[0].fill(2.);
        parameters[1].fill(1.);
        parameters[2].fill(3.);
        let y = poly.forward(&array![[2f32], [-1.]].into_dyn()).unwrap();
        assert_abs_diff_eq!(y, array![[17f32], [2.]].into_dyn());
        assert!(Polynomial::new(1, 1, 0, &mut rng()).is_err());
    }

    #[test]
    fn polynomial_lazy() {
        let mut poly = Polynomial::new(None, 3, 3, &mut rng()).unwrap();
        assert!(poly.is_lazy());
        let y = poly.build(&Tensor::ones(vec![4, 5])).unwrap();
        assert_eq!(y.shape(), &[4, 3]);
        assert!(!poly.is_lazy());
        assert_eq!(poly.parameters_len(), 4);
        for linear in poly.linears() {
            assert_eq!(linear.weight().unwrap().shape(), &[3, 5]);
        }
    }

    #[test]
    fn weight_norm_unit_rows() {
        let w = array![[3f32, 4.], [0., 2.]].into_dyn();
        let y = weight_norm(&w, 0, 1e-12).unwrap();
        assert_abs_diff_eq!(y, array![[0.6f32, 0.8], [0., 1.]].into_dyn(), epsilon = 1e-6);
        let y = weight_norm(&w, -1, 1e-12).unwrap();
        assert_abs_diff_eq!(y, array![[1f32, 0.894_427_2], [0., 0.447_213_6]].into_dyn(), epsilon = 1e-6);
    }
}
