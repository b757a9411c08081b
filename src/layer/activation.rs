use super::{Forward, Layer};
use crate::{
    error::{check_positive, Error},
    Result, Tensor,
};
use anyhow::bail;
use ndarray::{Axis, IxDyn, Slice, Zip};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

const SELU_ALPHA: f32 = 1.673_263_2;
const SELU_SCALE: f32 = 1.050_701;

/// Parameter free activations.
///
/// Parsed from the snake case name, with default arguments.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    /// `max(0, x) + min(0, alpha * (exp(x / alpha) - 1))`, alpha = 1.
    Celu(f32),
    /// `x` if positive else `alpha * (exp(x) - 1)`, alpha = 1.
    Elu(f32),
    /// Gaussian error linear unit, the tanh approximation by default.
    Gelu { approximate: bool },
    /// Gated linear unit, `a * sigmoid(b)` of the halves of the last axis.
    Glu,
    /// Zero within `lambda` of 0, lambda = 0.5.
    HardShrink(f32),
    HardSigmoid,
    HardSwish,
    HardTanh,
    /// negative slope = 0.01
    LeakyRelu(f32),
    LogSigmoid,
    /// Along the last axis.
    LogSoftmax,
    Mish,
    Relu,
    Relu6,
    Selu,
    Sigmoid,
    /// `x + sin(frequency * x)^2 / frequency`, frequency = 1.
    Snake(f32),
    Softplus,
    /// lambda = 0.5
    Softshrink(f32),
    Softsign,
    Squareplus,
    Swish,
    Tanh,
    TanhShrink,
    /// `x` if greater than theta else 0, theta = 1.
    ThresholdedRelu(f32),
}

const NAMES: [(&str, Activation); 25] = [
    ("celu", Activation::Celu(1.)),
    ("elu", Activation::Elu(1.)),
    ("gelu", Activation::Gelu { approximate: true }),
    ("glu", Activation::Glu),
    ("hard_shrink", Activation::HardShrink(0.5)),
    ("hard_sigmoid", Activation::HardSigmoid),
    ("hard_swish", Activation::HardSwish),
    ("hard_tanh", Activation::HardTanh),
    ("leaky_relu", Activation::LeakyRelu(0.01)),
    ("log_sigmoid", Activation::LogSigmoid),
    ("log_softmax", Activation::LogSoftmax),
    ("mish", Activation::Mish),
    ("relu", Activation::Relu),
    ("relu6", Activation::Relu6),
    ("selu", Activation::Selu),
    ("sigmoid", Activation::Sigmoid),
    ("snake", Activation::Snake(1.)),
    ("softplus", Activation::Softplus),
    ("softshrink", Activation::Softshrink(0.5)),
    ("softsign", Activation::Softsign),
    ("squareplus", Activation::Squareplus),
    ("swish", Activation::Swish),
    ("tanh", Activation::Tanh),
    ("tanh_shrink", Activation::TanhShrink),
    ("thresholded_relu", Activation::ThresholdedRelu(1.)),
];

impl FromStr for Activation {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Error> {
        NAMES
            .iter()
            .find(|(name, _)| *name == s)
            .map(|(_, act)| *act)
            .ok_or_else(|| Error::UnknownName {
                kind: "activation",
                name: s.to_string(),
                available: NAMES.map(|(name, _)| name).join(", "),
            })
    }
}

impl Default for Activation {
    fn default() -> Self {
        Self::Relu
    }
}

pub(crate) fn sigmoid(x: f32) -> f32 {
    1. / (1. + (-x).exp())
}

pub(crate) fn softplus(x: f32) -> f32 {
    x.max(0.) + (-x.abs()).exp().ln_1p()
}

// Abramowitz and Stegun 7.1.26, max error 1.5e-7
fn erf(x: f32) -> f32 {
    let t = 1. / (1. + 0.327_591_1 * x.abs());
    let poly = t
        * (0.254_829_6
            + t * (-0.284_496_74 + t * (1.421_413_7 + t * (-1.453_152_1 + t * 1.061_405_4))));
    let y = 1. - poly * (-x * x).exp();
    y.copysign(x)
}

fn relu6(x: f32) -> f32 {
    x.clamp(0., 6.)
}

impl Activation {
    /// Applies an elementwise activation to `x`, `None` for activations over an axis.
    fn map(&self, x: f32) -> Option<f32> {
        let y = match *self {
            Self::Celu(alpha) => x.max(0.) + (alpha * ((x / alpha).exp() - 1.)).min(0.),
            Self::Elu(alpha) => {
                if x > 0. {
                    x
                } else {
                    alpha * x.exp_m1()
                }
            }
            Self::Gelu { approximate: true } => {
                let c = (2. / std::f32::consts::PI).sqrt();
                0.5 * x * (1. + (c * (x + 0.044_715 * x.powi(3))).tanh())
            }
            Self::Gelu { approximate: false } => {
                0.5 * x * (1. + erf(x / std::f32::consts::SQRT_2))
            }
            Self::HardShrink(lambda) => {
                if x.abs() > lambda {
                    x
                } else {
                    0.
                }
            }
            Self::HardSigmoid => relu6(x + 3.) / 6.,
            Self::HardSwish => x * relu6(x + 3.) / 6.,
            Self::HardTanh => x.clamp(-1., 1.),
            Self::LeakyRelu(slope) => {
                if x >= 0. {
                    x
                } else {
                    slope * x
                }
            }
            Self::LogSigmoid => -softplus(-x),
            Self::Mish => x * softplus(x).tanh(),
            Self::Relu => x.max(0.),
            Self::Relu6 => relu6(x),
            Self::Selu => {
                SELU_SCALE
                    * if x > 0. {
                        x
                    } else {
                        SELU_ALPHA * x.exp_m1()
                    }
            }
            Self::Sigmoid => sigmoid(x),
            Self::Snake(frequency) => x + (frequency * x).sin().powi(2) / frequency,
            Self::Softplus => softplus(x),
            Self::Softshrink(lambda) => {
                if x > lambda {
                    x - lambda
                } else if x < -lambda {
                    x + lambda
                } else {
                    0.
                }
            }
            Self::Softsign => x / (1. + x.abs()),
            Self::Squareplus => (x + (x * x + 4.).sqrt()) / 2.,
            Self::Swish => x * sigmoid(x),
            Self::Tanh => x.tanh(),
            Self::TanhShrink => x - x.tanh(),
            Self::ThresholdedRelu(theta) => {
                if x > theta {
                    x
                } else {
                    0.
                }
            }
            Self::Glu | Self::LogSoftmax => return None,
        };
        Some(y)
    }
}

fn glu(input: &Tensor) -> Result<Tensor> {
    let Some(last) = input.ndim().checked_sub(1) else {
        bail!("Glu expects at least 1 axis!");
    };
    let len = input.len_of(Axis(last));
    if len % 2 != 0 {
        bail!("Glu expects an even last axis, found {:?}!", input.shape());
    }
    let a = input.slice_axis(Axis(last), Slice::from(..len / 2));
    let b = input.slice_axis(Axis(last), Slice::from(len / 2..));
    Ok(Zip::from(&a).and(&b).map_collect(|a, b| a * sigmoid(*b)))
}

fn log_softmax(input: &Tensor) -> Result<Tensor> {
    let Some(last) = input.ndim().checked_sub(1) else {
        bail!("LogSoftmax expects at least 1 axis!");
    };
    let mut output = input.clone();
    for mut lane in output.lanes_mut(Axis(last)) {
        let max = lane.fold(f32::NEG_INFINITY, |m, x| m.max(*x));
        let log_sum = lane.fold(0., |s, x| s + (x - max).exp()).ln() + max;
        lane.mapv_inplace(|x| x - log_sum);
    }
    Ok(output)
}

impl Forward for Activation {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        match self {
            Self::Glu => glu(input),
            Self::LogSoftmax => log_softmax(input),
            _ => {
                let mut output = input.clone();
                for x in output.iter_mut() {
                    *x = self.map(*x).ok_or_else(|| {
                        Error::invalid("activation", format!("{self:?} is not elementwise"))
                    })?;
                }
                Ok(output)
            }
        }
    }
}

impl Layer for Activation {}

/// Leaky relu with a learned slope per channel (axis 0).
#[derive(Layer, Clone, Debug, Serialize, Deserialize)]
pub struct PRelu {
    #[layer(parameter)]
    weight: Tensor,
}

impl PRelu {
    /// Creates a new [`PRelu`] for `in_features` with every slope set to `weight_init`.
    ///
    /// The default slope is 0.25.
    pub fn new(in_features: usize, weight_init: f32) -> Result<Self> {
        let in_features = check_positive("in_features", in_features)?;
        Ok(Self {
            weight: Tensor::from_elem(vec![in_features], weight_init),
        })
    }
    /// The slopes.
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }
}

impl Forward for PRelu {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        crate::dims::check_features(input.shape(), 0, self.weight.len())?;
        let mut shape = vec![1; input.ndim()];
        shape[0] = self.weight.len();
        let weight = self.weight.view().into_shape(shape)?;
        Ok(Zip::from(input)
            .and_broadcast(&weight)
            .map_collect(|x, a| if *x >= 0. { *x } else { a * x }))
    }
}

/// Activations with a learned scale `a`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Adaptive {
    /// `max(0, a * x)`
    Relu,
    /// `max(0, a * x) - v * max(0, -a * x)`
    LeakyRelu,
    /// `1 / (1 + exp(-a * x))`
    Sigmoid,
    /// `tanh(a * x)`
    Tanh,
}

/// Adaptive activation, see [`Adaptive`].
///
/// `a` starts at 1, and so does `v` for [`Adaptive::LeakyRelu`].
#[derive(Layer, Clone, Debug, Serialize, Deserialize)]
pub struct AdaptiveActivation {
    #[layer(skip)]
    kind: Adaptive,
    #[layer(parameter)]
    a: Tensor,
    #[layer(optional_parameter)]
    v: Option<Tensor>,
}

impl AdaptiveActivation {
    /// Creates a new [`AdaptiveActivation`] of `kind`.
    pub fn new(kind: Adaptive) -> Self {
        Self::with_init(kind, 1., 1.)
    }
    /// Creates a new [`AdaptiveActivation`] with initial `a` and `v`.
    ///
    /// `v` is ignored unless `kind` is [`Adaptive::LeakyRelu`].
    pub fn with_init(kind: Adaptive, a: f32, v: f32) -> Self {
        let v = (kind == Adaptive::LeakyRelu).then(|| Tensor::from_elem(IxDyn(&[]), v));
        Self {
            kind,
            a: Tensor::from_elem(IxDyn(&[]), a),
            v,
        }
    }
}

impl Forward for AdaptiveActivation {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let a = self.a.iter().next().copied().unwrap_or(1.);
        let v = self
            .v
            .as_ref()
            .and_then(|v| v.iter().next().copied())
            .unwrap_or(1.);
        let output = match self.kind {
            Adaptive::Relu => input.mapv(|x| (a * x).max(0.)),
            Adaptive::LeakyRelu => input.mapv(|x| (a * x).max(0.) - v * (-a * x).max(0.)),
            Adaptive::Sigmoid => input.mapv(|x| sigmoid(a * x)),
            Adaptive::Tanh => input.mapv(|x| (a * x).tanh()),
        };
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn activation_values() {
        let x = array![-2f32, -0.25, 0., 0.25, 2.].into_dyn();
        let relu = Activation::Relu.forward(&x).unwrap();
        assert_eq!(relu, array![0f32, 0., 0., 0.25, 2.].into_dyn());
        let hard_shrink = Activation::HardShrink(0.5).forward(&x).unwrap();
        assert_eq!(hard_shrink, array![-2f32, 0., 0., 0., 2.].into_dyn());
        let softshrink = Activation::Softshrink(0.5).forward(&x).unwrap();
        assert_eq!(softshrink, array![-1.5f32, 0., 0., 0., 1.5].into_dyn());
        let hard_tanh = Activation::HardTanh.forward(&x).unwrap();
        assert_eq!(hard_tanh, array![-1f32, -0.25, 0., 0.25, 1.].into_dyn());
        let sigmoid = Activation::Sigmoid.forward(&array![0f32].into_dyn()).unwrap();
        assert_eq!(sigmoid[[0]], 0.5);
    }

    #[test]
    fn gelu_approximations_agree() {
        let x = array![-1.5f32, -0.5, 0.5, 1.5].into_dyn();
        let exact = Activation::Gelu { approximate: false }.forward(&x).unwrap();
        let approx = Activation::Gelu { approximate: true }.forward(&x).unwrap();
        assert_abs_diff_eq!(exact, approx, epsilon = 1e-3);
        assert!((exact[[3]] - 1.399_789).abs() < 1e-5);
    }

    #[test]
    fn glu_and_log_softmax() {
        let x = array![[1f32, 2., 0., 0.]].into_dyn();
        let y = Activation::Glu.forward(&x).unwrap();
        assert_eq!(y, array![[0.5f32, 1.]].into_dyn());
        assert!(Activation::Glu.forward(&array![1f32, 2., 3.].into_dyn()).is_err());
        let y = Activation::LogSoftmax.forward(&array![[0f32, 0.]].into_dyn()).unwrap();
        assert_abs_diff_eq!(y, array![[-2f32.ln(), -2f32.ln()]].into_dyn(), epsilon = 1e-6);        assert_eq!(Activation::Glu.map(1.), None);
        assert_eq!(Activation::LogSoftmax.map(1.), None);
        assert_eq!(Activation::Relu.map(-1.), Some(0.));
    }

    #[test]
    fn activation_from_str() {
        assert_eq!(
            "leaky_relu".parse::<Activation>().unwrap(),
            Activation::LeakyRelu(0.01)
        );
        assert!("relu7".parse::<Activation>().is_err());
    }

    #[test]
    fn prelu_per_channel() {
        let prelu = PRelu::new(2, 0.25).unwrap();
        let x = array![[-4f32, 4.], [-8., 8.]].into_dyn();
        let y = prelu.forward(&x).unwrap();
        assert_eq!(y, array![[-1f32, 4.], [-2., 8.]].into_dyn());
        assert_eq!(prelu.parameters().len(), 1);
        assert!(prelu.forward(&array![[1f32]].into_dyn()).is_err());
    }

    #[test]
    fn adaptive_leaky_relu() {
        let act = AdaptiveActivation::with_init(Adaptive::LeakyRelu, 2., 0.5);
        let y = act.forward(&array![-1f32, 1.].into_dyn()).unwrap();
        assert_eq!(y, array![-1f32, 2.].into_dyn());
        assert_eq!(act.parameters_len(), 2);
        assert_eq!(AdaptiveActivation::new(Adaptive::Tanh).parameters_len(), 1);
    }
}
