use super::{Forward, Layer};
use crate::{
    dims::{check_features, normalize_axis},
    error::{check_positive, check_shape, Error},
    Result, Tensor,
};
use ndarray::{Axis, Ix2};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug};

/// Standardizes `groups` equal contiguous chunks of `x` to zero mean and unit variance.
fn standardize(x: &Tensor, groups: usize, eps: f32) -> Result<Tensor> {
    let shape = x.shape().to_vec();
    let len = x.len() / groups;
    let x = x
        .as_standard_layout()
        .into_owned()
        .into_shape((groups, len))?;
    let mean = x
        .mean_axis(Axis(1))
        .ok_or_else(|| Error::invalid("input", "cannot normalize an empty array"))?
        .insert_axis(Axis(1));
    let centered = x - &mean;
    let std = centered
        .mapv(|x| x * x)
        .mean_axis(Axis(1))
        .ok_or_else(|| Error::invalid("input", "cannot normalize an empty array"))?
        .mapv(|var| (var + eps).sqrt())
        .insert_axis(Axis(1));
    Ok((centered / &std).into_shape(shape)?)
}

/// `x * weight + bias` with parameters of `shape`, broadcast from the right.
fn affine(
    mut x: Tensor,
    weight: Option<&Tensor>,
    bias: Option<&Tensor>,
    shape: &[usize],
) -> Result<Tensor> {
    if let Some(weight) = weight {
        x *= &weight.view().into_shape(shape)?;
    }
    if let Some(bias) = bias {
        x += &bias.view().into_shape(shape)?;
    }
    Ok(x)
}

/// `(features, 1, ..)` for a `(features, *spatial)` input.
fn channel_shape(features: usize, ndim: usize) -> Vec<usize> {
    let mut shape = vec![1; ndim];
    shape[0] = features;
    shape
}

fn check_eps(eps: f32) -> Result<f32, Error> {
    if !(eps > 0.) {
        return Err(Error::invalid("eps", format!("{eps} is not positive")));
    }
    Ok(eps)
}

fn check_param(expected: &[usize], param: Option<&Tensor>) -> Result<(), Error> {
    if let Some(param) = param {
        check_shape(expected, param.shape())?;
    }
    Ok(())
}

/// Layer normalization.
///
/// Normalizes over the trailing axes matching `normalized_shape`, then
/// applies the optional elementwise weight (ones) and bias (zeros).
#[derive(Layer, Clone, Serialize, Deserialize)]
pub struct LayerNorm {
    #[layer(optional_parameter)]
    weight: Option<Tensor>,
    #[layer(optional_parameter)]
    bias: Option<Tensor>,
    #[layer(skip)]
    normalized_shape: Vec<usize>,
    #[layer(skip)]
    eps: f32,
}

impl LayerNorm {
    /// Creates a new [`LayerNorm`] for `normalized_shape`.
    ///
    /// Defaults:
    /// - eps: 1e-5
    ///
    /// **Errors**
    ///
    /// The shape is empty or has a zero axis.
    pub fn new(normalized_shape: &[usize]) -> Result<Self> {
        if normalized_shape.is_empty() {
            return Err(Error::invalid("normalized_shape", "must not be empty").into());
        }
        for x in normalized_shape {
            check_positive("normalized_shape", *x)?;
        }
        Ok(Self {
            weight: Some(Tensor::ones(normalized_shape)),
            bias: Some(Tensor::zeros(normalized_shape)),
            normalized_shape: normalized_shape.to_vec(),
            eps: 1e-5,
        })
    }
    /// Sets `eps`, added to the variance.
    ///
    /// **Errors**
    ///
    /// `eps` is not positive.
    pub fn with_eps(mut self, eps: f32) -> Result<Self> {
        self.eps = check_eps(eps)?;
        Ok(self)
    }
    /// Replaces the weight, `None` removes it.
    ///
    /// **Errors**
    ///
    /// The weight is not `normalized_shape`.
    pub fn with_weight(mut self, weight: Option<Tensor>) -> Result<Self> {
        check_param(&self.normalized_shape, weight.as_ref())?;
        self.weight = weight;
        Ok(self)
    }
    /// Replaces the bias, `None` removes it.
    ///
    /// **Errors**
    ///
    /// The bias is not `normalized_shape`.
    pub fn with_bias(mut self, bias: Option<Tensor>) -> Result<Self> {
        check_param(&self.normalized_shape, bias.as_ref())?;
        self.bias = bias;
        Ok(self)
    }
}

impl Debug for LayerNorm {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut builder = f.debug_struct("LayerNorm");
        builder.field("normalized_shape", &self.normalized_shape);
        builder.field("eps", &self.eps);
        if self.weight.is_none() {
            builder.field("weight", &false);
        }
        if self.bias.is_none() {
            builder.field("bias", &false);
        }
        builder.finish()
    }
}

impl Forward for LayerNorm {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let n = self.normalized_shape.len();
        if input.ndim() < n {
            return Err(Error::ShapeMismatch {
                expected: self.normalized_shape.clone(),
                found: input.shape().to_vec(),
            }
            .into());
        }
        let lead = input.ndim() - n;
        check_shape(&self.normalized_shape, &input.shape()[lead..])?;
        let groups = input.shape()[..lead].iter().product();
        let y = standardize(input, groups, self.eps)?;
        affine(y, self.weight.as_ref(), self.bias.as_ref(), &self.normalized_shape)
    }
}

/// Group normalization.
///
/// The channels of a `(channels, *spatial)` input are split into `groups`,
/// each normalized over its channels and spatial axes. The optional weight
/// (ones) and bias (zeros) are per channel.
#[derive(Layer, Clone, Serialize, Deserialize)]
pub struct GroupNorm {
    #[layer(optional_parameter)]
    weight: Option<Tensor>,
    #[layer(optional_parameter)]
    bias: Option<Tensor>,
    #[layer(skip)]
    in_features: usize,
    #[layer(skip)]
    groups: usize,
    #[layer(skip)]
    eps: f32,
}

impl GroupNorm {
    /// Creates a new [`GroupNorm`] for `in_features` split into `groups`.
    ///
    /// Defaults:
    /// - eps: 1e-5
    ///
    /// **Errors**
    ///
    /// `in_features` or `groups` is zero, or `groups` does not divide `in_features`.
    pub fn new(in_features: usize, groups: usize) -> Result<Self> {
        let in_features = check_positive("in_features", in_features)?;
        let groups = check_positive("groups", groups)?;
        if in_features % groups != 0 {
            return Err(Error::invalid(
                "groups",
                format!("{groups} does not divide in_features {in_features}"),
            )
            .into());
        }
        Ok(Self {
            weight: Some(Tensor::ones(vec![in_features])),
            bias: Some(Tensor::zeros(vec![in_features])),
            in_features,
            groups,
            eps: 1e-5,
        })
    }
    /// Sets `eps`, added to the variance.
    ///
    /// **Errors**
    ///
    /// `eps` is not positive.
    pub fn with_eps(mut self, eps: f32) -> Result<Self> {
        self.eps = check_eps(eps)?;
        Ok(self)
    }
    /// Replaces the weight, `None` removes it.
    ///
    /// **Errors**
    ///
    /// The weight is not `(in_features)`.
    pub fn with_weight(mut self, weight: Option<Tensor>) -> Result<Self> {
        check_param(&[self.in_features], weight.as_ref())?;
        self.weight = weight;
        Ok(self)
    }
    /// Replaces the bias, `None` removes it.
    ///
    /// **Errors**
    ///
    /// The bias is not `(in_features)`.
    pub fn with_bias(mut self, bias: Option<Tensor>) -> Result<Self> {
        check_param(&[self.in_features], bias.as_ref())?;
        self.bias = bias;
        Ok(self)
    }
}

impl Debug for GroupNorm {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = if self.groups == self.in_features {
            "InstanceNorm"
        } else {
            "GroupNorm"
        };
        let mut builder = f.debug_struct(name);
        builder.field("in_features", &self.in_features);
        if self.groups != self.in_features {
            builder.field("groups", &self.groups);
        }
        builder.field("eps", &self.eps);
        builder.field("affine", &(self.weight.is_some() || self.bias.is_some()));
        builder.finish()
    }
}

impl Forward for GroupNorm {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        if input.ndim() < 2 {
            return Err(Error::invalid(
                "input",
                format!("expected (channels, *spatial), found {:?}", input.shape()),
            )
            .into());
        }
        check_features(input.shape(), 0, self.in_features)?;
        let y = standardize(input, self.groups, self.eps)?;
        let shape = channel_shape(self.in_features, input.ndim());
        affine(y, self.weight.as_ref(), self.bias.as_ref(), &shape)
    }
}

/// Instance normalization, every channel normalized over the spatial axes.
///
/// This is a [`GroupNorm`] with one group per channel.
pub type InstanceNorm = GroupNorm;

impl GroupNorm {
    /// Creates a new [`InstanceNorm`] for `in_features`.
    ///
    /// **Errors**
    ///
    /// `in_features` is zero.
    pub fn instance(in_features: usize) -> Result<Self> {
        Self::new(in_features, in_features)
    }
}

/// Running statistics of a [`BatchNorm`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BatchNormState {
    /// Running mean, `(in_features)`.
    pub running_mean: Tensor,
    /// Running (biased) variance, `(in_features)`.
    pub running_var: Tensor,
}

/// Batch normalization of a batched array.
///
/// Normalizes every feature along `axis` over all other axes. In training
/// mode the batch statistics are used and folded into the running state,
/// `running = momentum * running + (1 - momentum) * batch`. In evaluation mode
/// the running statistics are used.
#[derive(Clone, Serialize, Deserialize)]
pub struct BatchNorm {
    weight: Option<Tensor>,
    bias: Option<Tensor>,
    in_features: usize,
    momentum: f32,
    eps: f32,
    axis: isize,
    training: bool,
}

impl BatchNorm {
    /// Creates a new [`BatchNorm`] for `in_features`.
    ///
    /// Defaults:
    /// - momentum: 0.99
    /// - eps: 1e-5
    /// - axis: 1
    ///
    /// **Errors**
    ///
    /// `in_features` is zero.
    pub fn new(in_features: usize) -> Result<Self> {
        let in_features = check_positive("in_features", in_features)?;
        Ok(Self {
            weight: Some(Tensor::ones(vec![in_features])),
            bias: Some(Tensor::zeros(vec![in_features])),
            in_features,
            momentum: 0.99,
            eps: 1e-5,
            axis: 1,
            training: true,
        })
    }
    /// Sets the momentum of the running statistics.
    ///
    /// **Errors**
    ///
    /// `momentum` is not in [0, 1].
    pub fn with_momentum(mut self, momentum: f32) -> Result<Self> {
        self.momentum = crate::error::check_rate("momentum", momentum)?;
        Ok(self)
    }
    /// Sets `eps`, added to the variance.
    ///
    /// **Errors**
    ///
    /// `eps` is not positive.
    pub fn with_eps(mut self, eps: f32) -> Result<Self> {
        self.eps = check_eps(eps)?;
        Ok(self)
    }
    /// Sets the feature axis, negative axes count from the end.
    pub fn with_axis(mut self, axis: isize) -> Self {
        self.axis = axis;
        self
    }
    /// Replaces the weight, `None` removes it.
    ///
    /// **Errors**
    ///
    /// The weight is not `(in_features)`.
    pub fn with_weight(mut self, weight: Option<Tensor>) -> Result<Self> {
        check_param(&[self.in_features], weight.as_ref())?;
        self.weight = weight;
        Ok(self)
    }
    /// Replaces the bias, `None` removes it.
    ///
    /// **Errors**
    ///
    /// The bias is not `(in_features)`.
    pub fn with_bias(mut self, bias: Option<Tensor>) -> Result<Self> {
        check_param(&[self.in_features], bias.as_ref())?;
        self.bias = bias;
        Ok(self)
    }
    /// Whether the layer is in training mode.
    pub fn training(&self) -> bool {
        self.training
    }
    /// The initial state, zero mean and unit variance.
    pub fn init_state(&self) -> BatchNormState {
        BatchNormState {
            running_mean: Tensor::zeros(vec![self.in_features]),
            running_var: Tensor::ones(vec![self.in_features]),
        }
    }
    /// Normalizes `input`, returning the output and the next state.
    ///
    /// In evaluation mode the state is returned unchanged.
    ///
    /// **Errors**
    ///
    /// `input` does not have `in_features` on `axis`, or the state does not match.
    pub fn forward_state(
        &self,
        input: &Tensor,
        state: &BatchNormState,
    ) -> Result<(Tensor, BatchNormState)> {
        let feature_axis = normalize_axis(self.axis, input.ndim())?;
        check_features(input.shape(), feature_axis, self.in_features)?;
        check_shape(&[self.in_features], state.running_mean.shape())?;
        check_shape(&[self.in_features], state.running_var.shape())?;
        let axis = Axis(feature_axis);
        let (mean, var) = if self.training {
            let lanes = input
                .view()
                .permuted_axes(moved_to_front(input.ndim(), feature_axis))
                .as_standard_layout()
                .into_owned()
                .into_shape((self.in_features, input.len() / self.in_features))?
                .into_dimensionality::<Ix2>()?;
            let mean = lanes
                .mean_axis(Axis(1))
                .ok_or_else(|| Error::invalid("input", "cannot normalize an empty batch"))?;
            let var = (&lanes - &mean.view().insert_axis(Axis(1)))
                .mapv(|x| x * x)
                .mean_axis(Axis(1))
                .ok_or_else(|| Error::invalid("input", "cannot normalize an empty batch"))?;
            (mean.into_dyn(), var.into_dyn())
        } else {
            (state.running_mean.clone(), state.running_var.clone())
        };
        let mut output = input.clone();
        for (i, mut lane) in output.axis_iter_mut(axis).enumerate() {
            let scale = self.weight.as_ref().map_or(1., |w| w[[i]]) / (var[[i]] + self.eps).sqrt();
            let shift = self.bias.as_ref().map_or(0., |b| b[[i]]);
            let m = mean[[i]];
            lane.mapv_inplace(|x| (x - m) * scale + shift);
        }
        let state = if self.training {
            let momentum = self.momentum;
            BatchNormState {
                running_mean: &state.running_mean * momentum + &mean * (1. - momentum),
                running_var: &state.running_var * momentum + &var * (1. - momentum),
            }
        } else {
            state.clone()
        };
        Ok((output, state))
    }
}

fn moved_to_front(ndim: usize, axis: usize) -> Vec<usize> {
    std::iter::once(axis)
        .chain((0..ndim).filter(|x| *x != axis))
        .collect()
}

impl Debug for BatchNorm {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut builder = f.debug_struct("BatchNorm");
        builder.field("in_features", &self.in_features);
        builder.field("momentum", &self.momentum);
        builder.field("eps", &self.eps);
        if self.axis != 1 {
            builder.field("axis", &self.axis);
        }
        if !self.training {
            builder.field("training", &false);
        }
        builder.finish()
    }
}

impl Forward for BatchNorm {
    /// Normalizes with [`.init_state()`](BatchNorm::init_state()), discarding the next state.
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        Ok(self.forward_state(input, &self.init_state())?.0)
    }
}

impl Layer for BatchNorm {
    fn parameters_len(&self) -> usize {
        self.weight.is_some() as usize + self.bias.is_some() as usize
    }
    fn collect_parameters<'a>(&'a self, parameters: &mut Vec<&'a Tensor>) {
        parameters.extend(self.weight.iter().chain(self.bias.iter()));
    }
    fn collect_parameters_mut<'a>(&'a mut self, parameters: &mut Vec<&'a mut Tensor>) {
        parameters.extend(self.weight.iter_mut().chain(self.bias.iter_mut()));
    }
    fn set_training(&mut self, training: bool) {
        self.training = training;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array, IxDyn};

    fn arange(shape: &[usize]) -> Tensor {
        let len = shape.iter().product::<usize>();
        Array::range(1., len as f32 + 1., 1.)
            .into_shape(IxDyn(shape))
            .unwrap()
    }

    #[test]
    fn layer_norm_trailing_axes() {
        let norm = LayerNorm::new(&[3]).unwrap();
        let y = norm.forward(&array![[1f32, 2., 3.], [2., 4., 6.]].into_dyn()).unwrap();
        let s = (2f32 / 3.).sqrt();
        assert_abs_diff_eq!(
            y,
            array![[-1. / s, 0., 1. / s], [-1. / s, 0., 1. / s]].into_dyn(),
            epsilon = 1e-4
        );
        let err = norm.forward(&Tensor::ones(vec![2, 4])).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::ShapeMismatch { .. })
        ));
        assert!(LayerNorm::new(&[]).is_err());
        assert!(norm.clone().with_weight(Some(Tensor::ones(vec![2]))).is_err());
    }

    #[test]
    fn layer_norm_affine() {
        let norm = LayerNorm::new(&[2])
            .unwrap()
            .with_weight(Some(array![2f32, 3.].into_dyn()))
            .unwrap()
            .with_bias(Some(array![1f32, -1.].into_dyn()))
            .unwrap();
        assert_eq!(norm.parameters_len(), 2);
        let y = norm.forward(&array![0f32, 2.].into_dyn()).unwrap();
        assert_abs_diff_eq!(y, array![-1f32, 2.].into_dyn(), epsilon = 1e-4);
        let norm = norm.with_weight(None).unwrap().with_bias(None).unwrap();
        assert_eq!(norm.parameters_len(), 0);
    }

    #[test]
    fn group_norm_validates() {
        assert!(GroupNorm::new(6, 4).is_err());
        assert!(GroupNorm::new(0, 1).is_err());
        assert!(GroupNorm::new(6, 0).is_err());
        let norm = GroupNorm::new(4, 2).unwrap();
        assert!(norm.forward(&Tensor::ones(vec![4])).is_err());
        let err = norm.forward(&Tensor::ones(vec![3, 2])).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::FeatureMismatch { expected: 4, found: 3, .. })
        ));
    }

    #[test]
    fn group_norm_groups_channels() {
        let x = arange(&[4, 2]);
        let y = GroupNorm::new(4, 2).unwrap().forward(&x).unwrap();
        let s = 1.25f32.sqrt();
        let group = [-1.5 / s, -0.5 / s, 0.5 / s, 1.5 / s];
        let expected = Array::from_iter(group.iter().chain(&group).copied());
        assert_abs_diff_eq!(y.into_shape(8).unwrap(), expected, epsilon = 1e-4);
        let y = InstanceNorm::instance(4).unwrap().forward(&x).unwrap();
        assert_abs_diff_eq!(
            y,
            array![[-1f32, 1.], [-1., 1.], [-1., 1.], [-1., 1.]].into_dyn(),
            epsilon = 1e-4
        );
    }

    #[test]
    fn batch_norm_training_and_eval() {
        let x = arange(&[2, 3, 2]);
        let mut bn = BatchNorm::new(3).unwrap().with_momentum(0.5).unwrap();
        let (y, state) = bn.forward_state(&x, &bn.init_state()).unwrap();
        // channel 0 holds 1, 2, 7, 8
        assert_abs_diff_eq!(
            state.running_mean,
            array![2.25f32, 3.25, 4.25].into_dyn(),
            epsilon = 1e-5
        );
        assert_abs_diff_eq!(
            state.running_var,
            array![5.125f32, 5.125, 5.125].into_dyn(),
            epsilon = 1e-5
        );
        let std = (9.25f32 + 1e-5).sqrt();
        assert_abs_diff_eq!(y[[0, 0, 0]], -3.5 / std, epsilon = 1e-5);
        assert_abs_diff_eq!(y[[1, 2, 1]], 3.5 / std, epsilon = 1e-5);
        bn.set_training(false);
        let (y, next) = bn.forward_state(&x, &state).unwrap();
        assert_eq!(next, state);
        let expected = (1. - 2.25) / (5.125f32 + 1e-5).sqrt();
        assert_abs_diff_eq!(y[[0, 0, 0]], expected, epsilon = 1e-5);
    }

    #[test]
    fn batch_norm_axis() {
        let x = arange(&[4, 2]);
        let bn = BatchNorm::new(4).unwrap().with_axis(0);
        let y = bn.forward(&x).unwrap();
        let last = BatchNorm::new(2).unwrap().with_axis(-1);
        let t = BatchNorm::new(2).unwrap().with_axis(1);
        assert_eq!(last.forward(&x).unwrap(), t.forward(&x).unwrap());
        let s = (0.25f32 + 1e-5).sqrt();
        assert_abs_diff_eq!(
            y.index_axis(Axis(1), 0).to_owned(),
            Array::from_elem(4, -0.5 / s).into_dyn(),
            epsilon = 1e-4
        );
        assert!(bn.clone().with_axis(2).forward(&x).is_err());
        assert!(BatchNorm::new(3).unwrap().forward(&x).is_err());
    }
}
