use crate::{error::Error, Tensor};
use ndarray::{Array2, ArrayViewMutD, IxDyn};
use rand::RngCore;
use rand_distr::{Distribution, StandardNormal, Uniform};
use serde::{Deserialize, Serialize};
use std::{fmt::Debug, str::FromStr};

/// Fills parameters.
pub trait Initializer: Debug {
    /// Fills `array` inplace, interpreting its shape for fan computations.
    fn fill(&self, rng: &mut dyn RngCore, array: &mut ArrayViewMutD<f32>);
    /// Creates a new array of `shape`.
    fn init(&self, rng: &mut dyn RngCore, shape: &[usize]) -> Tensor {
        let mut array = Tensor::zeros(IxDyn(shape));
        self.fill(rng, &mut array.view_mut());
        array
    }
}

/// Named initializers.
///
/// The variance scaling variants compute fans from the last two axes, with
/// every other axis treated as the receptive field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Init {
    HeNormal,
    HeUniform,
    GlorotNormal,
    GlorotUniform,
    LecunNormal,
    LecunUniform,
    /// Normal with std 1e-2.
    Normal,
    /// Uniform in [0, 1e-2).
    Uniform,
    Ones,
    Zeros,
    XavierNormal,
    XavierUniform,
    Orthogonal,
}

const NAMES: [(&str, Init); 13] = [
    ("he_normal", Init::HeNormal),
    ("he_uniform", Init::HeUniform),
    ("glorot_normal", Init::GlorotNormal),
    ("glorot_uniform", Init::GlorotUniform),
    ("lecun_normal", Init::LecunNormal),
    ("lecun_uniform", Init::LecunUniform),
    ("normal", Init::Normal),
    ("uniform", Init::Uniform),
    ("ones", Init::Ones),
    ("zeros", Init::Zeros),
    ("xavier_normal", Init::XavierNormal),
    ("xavier_uniform", Init::XavierUniform),
    ("orthogonal", Init::Orthogonal),
];

impl FromStr for Init {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Error> {
        NAMES
            .iter()
            .find(|(name, _)| *name == s)
            .map(|(_, init)| *init)
            .ok_or_else(|| Error::UnknownName {
                kind: "init",
                name: s.to_string(),
                available: NAMES.map(|(name, _)| name).join(", "),
            })
    }
}

#[derive(Clone, Copy)]
enum FanMode {
    In,
    Avg,
}

#[derive(Clone, Copy)]
enum Distr {
    TruncatedNormal,
    Uniform,
}

/// stddev of a unit normal truncated to (-2, 2)
const TRUNCATED_STD: f32 = 0.879_625_661_034_239_8;

fn fans(shape: &[usize]) -> (f32, f32) {
    let (fan_in, fan_out) = match shape {
        [] => (1, 1),
        [n] => (*n, *n),
        [fan_in, fan_out] => (*fan_in, *fan_out),
        [.., fan_in, fan_out] => {
            let receptive: usize = shape[..shape.len() - 2].iter().product();
            (fan_in * receptive, fan_out * receptive)
        }
    };
    (fan_in.max(1) as f32, fan_out.max(1) as f32)
}

fn variance_scaling(
    rng: &mut dyn RngCore,
    array: &mut ArrayViewMutD<f32>,
    scale: f32,
    mode: FanMode,
    distr: Distr,
) {
    let (fan_in, fan_out) = fans(array.shape());
    let n = match mode {
        FanMode::In => fan_in,
        FanMode::Avg => (fan_in + fan_out) / 2.,
    };
    let variance = scale / n;
    match distr {
        Distr::TruncatedNormal => {
            let std = variance.sqrt() / TRUNCATED_STD;
            array.map_inplace(|x| *x = truncated_normal(rng) * std);
        }
        Distr::Uniform => {
            let limit = (3. * variance).sqrt();
            let uniform = Uniform::new(-limit, limit);
            array.map_inplace(|x| *x = uniform.sample(rng));
        }
    }
}

fn truncated_normal(rng: &mut dyn RngCore) -> f32 {
    loop {
        let x: f32 = StandardNormal.sample(rng);
        if x.abs() < 2. {
            return x;
        }
    }
}

fn orthogonal(rng: &mut dyn RngCore, array: &mut ArrayViewMutD<f32>) {
    let shape = array.shape().to_vec();
    let Some(&cols) = shape.last() else {
        array.fill(1.);
        return;
    };
    let rows = shape.iter().product::<usize>() / cols.max(1);
    let transpose = rows < cols;
    let (m, n) = if transpose { (cols, rows) } else { (rows, cols) };
    let mut q = Array2::<f32>::zeros((m, n));
    q.map_inplace(|x| *x = StandardNormal.sample(rng));
    // modified Gram-Schmidt on the columns
    for j in 0..n {
        for k in 0..j {
            let dot = q.column(j).dot(&q.column(k));
            let basis = q.column(k).to_owned();
            q.column_mut(j).scaled_add(-dot, &basis);
        }
        let norm = q.column(j).dot(&q.column(j)).sqrt();
        if norm > f32::EPSILON {
            q.column_mut(j).mapv_inplace(|x| x / norm);
        }
    }
    let q = if transpose { q.reversed_axes() } else { q };
    for (dst, src) in array.iter_mut().zip(q.as_standard_layout().iter()) {
        *dst = *src;
    }
}

impl Initializer for Init {
    fn fill(&self, rng: &mut dyn RngCore, array: &mut ArrayViewMutD<f32>) {
        use Distr::{TruncatedNormal, Uniform as Uni};
        use FanMode::{Avg, In};
        match self {
            Self::HeNormal => variance_scaling(rng, array, 2., In, TruncatedNormal),
            Self::HeUniform => variance_scaling(rng, array, 2., In, Uni),
            Self::GlorotNormal | Self::XavierNormal => {
                variance_scaling(rng, array, 1., Avg, TruncatedNormal)
            }
            Self::GlorotUniform | Self::XavierUniform => {
                variance_scaling(rng, array, 1., Avg, Uni)
            }
            Self::LecunNormal => variance_scaling(rng, array, 1., In, TruncatedNormal),
            Self::LecunUniform => variance_scaling(rng, array, 1., In, Uni),
            Self::Normal => array.map_inplace(|x| {
                let z: f32 = StandardNormal.sample(rng);
                *x = z * 1e-2;
            }),
            Self::Uniform => {
                let uniform = Uniform::new(0., 1e-2);
                array.map_inplace(|x| *x = uniform.sample(rng));
            }
            Self::Ones => array.fill(1.),
            Self::Zeros => array.fill(0.),
            Self::Orthogonal => orthogonal(rng, array),
        }
    }
}

/// Initializes an optional parameter, `None` disables it.
pub(crate) fn init_optional(
    init: Option<Init>,
    rng: &mut dyn RngCore,
    shape: &[usize],
) -> Option<Tensor> {
    init.map(|init| init.init(rng, shape))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn moments(array: &Tensor) -> (f32, f32) {
        let n = array.len() as f32;
        let mean = array.sum() / n;
        let var = array.mapv(|x| (x - mean).powi(2)).sum() / n;
        (mean, var)
    }

    #[test]
    fn init_from_str() {
        assert_eq!("he_normal".parse::<Init>().unwrap(), Init::HeNormal);
        assert_eq!("orthogonal".parse::<Init>().unwrap(), Init::Orthogonal);
        let err = "kaiming".parse::<Init>().unwrap_err();
        assert!(err.to_string().contains("glorot_uniform"));
    }

    #[test]
    fn constant_inits() {
        let mut rng = StdRng::seed_from_u64(0);
        assert!(Init::Ones.init(&mut rng, &[2, 3]).iter().all(|x| *x == 1.));
        assert!(Init::Zeros.init(&mut rng, &[4]).iter().all(|x| *x == 0.));
    }

    #[test]
    fn glorot_uniform_bounds() {
        let mut rng = StdRng::seed_from_u64(1);
        let w = Init::GlorotUniform.init(&mut rng, &[30, 20]);
        let limit = (6f32 / 50.).sqrt();
        assert!(w.iter().all(|x| x.abs() <= limit));
    }

    #[test]
    fn he_normal_variance() {
        let mut rng = StdRng::seed_from_u64(2);
        let w = Init::HeNormal.init(&mut rng, &[200, 100]);
        let (mean, var) = moments(&w);
        assert!(mean.abs() < 0.01);
        assert!((var - 2. / 200.).abs() < 1e-3, "{var}");
        let bound = (2f32 / 200.).sqrt() / TRUNCATED_STD * 2.;
        assert!(w.iter().all(|x| x.abs() <= bound));
    }

    #[test]
    fn orthogonal_columns() {
        let mut rng = StdRng::seed_from_u64(3);
        for shape in [[6, 4], [4, 6]] {
            let w = Init::Orthogonal.init(&mut rng, &shape);
            let w = w.into_dimensionality::<ndarray::Ix2>().unwrap();
            let gram = if shape[0] >= shape[1] {
                w.t().dot(&w)
            } else {
                w.dot(&w.t())
            };
            let eye = Array2::<f32>::eye(gram.nrows());
            for (a, b) in gram.iter().zip(eye.iter()) {
                assert!((a - b).abs() < 1e-4);
            }
        }
    }
}
