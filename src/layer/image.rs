use super::{
    conv::{ConvKind, Direct, Fft},
    build_stochastic, Forward, Layer,
};
use crate::{
    dims::{check_spatial_ndim, resolve_padding, Padding},
    error::{check_positive, Error},
    Result, Tensor,
};
use ndarray::{array, Array1, Axis, Ix2};
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use std::{
    fmt::{self, Debug},
    marker::PhantomData,
};

/// Scales the distance of every pixel from its channel mean.
fn adjust_contrast(input: &Tensor, factor: f32) -> Tensor {
    let mut output = input.clone();
    for mut channel in output.outer_iter_mut() {
        let mean = channel.mean().unwrap_or_default();
        channel.mapv_inplace(|x| (x - mean) * factor + mean);
    }
    output
}

/// Contrast adjustment of `(channels, rows, cols)` images.
///
/// Computes `(x - mean) * factor + mean` with the mean of each channel.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AdjustContrast2 {
    factor: f32,
}

impl AdjustContrast2 {
    /// Creates a new [`AdjustContrast2`] with `factor`.
    pub fn new(factor: f32) -> Self {
        Self { factor }
    }
}

impl Default for AdjustContrast2 {
    fn default() -> Self {
        Self::new(1.)
    }
}

impl Forward for AdjustContrast2 {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        check_spatial_ndim("AdjustContrast2", input.shape(), 2)?;
        Ok(adjust_contrast(input, self.factor))
    }
}

impl Layer for AdjustContrast2 {}

/// Contrast adjustment by a factor drawn uniformly from `range`.
///
/// Requires an rng in training mode, the identity in evaluation mode.
#[derive(Clone, Serialize, Deserialize)]
pub struct RandomContrast2 {
    range: (f32, f32),
    training: bool,
}

impl RandomContrast2 {
    /// Creates a new [`RandomContrast2`] drawing factors from `range`, inclusive.
    ///
    /// **Errors**
    ///
    /// The range is reversed or not finite.
    pub fn new(range: (f32, f32)) -> Result<Self> {
        let (lo, hi) = range;
        if !(lo.is_finite() && hi.is_finite() && lo <= hi) {
            return Err(Error::invalid("range", format!("{range:?} is not a finite range")).into());
        }
        Ok(Self {
            range,
            training: true,
        })
    }
}

impl Default for RandomContrast2 {
    fn default() -> Self {
        Self {
            range: (0.5, 1.),
            training: true,
        }
    }
}

impl Debug for RandomContrast2 {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut builder = f.debug_struct("RandomContrast2");
        builder.field("range", &self.range);
        if !self.training {
            builder.field("training", &false);
        }
        builder.finish()
    }
}

impl Forward for RandomContrast2 {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        if !self.training {
            return Ok(input.clone());
        }
        Err(Error::MissingRng("RandomContrast2").into())
    }
    fn forward_rng(&self, input: &Tensor, rng: &mut dyn RngCore) -> Result<Tensor> {
        if !self.training {
            return Ok(input.clone());
        }
        check_spatial_ndim("RandomContrast2", input.shape(), 2)?;
        let (lo, hi) = self.range;
        Ok(adjust_contrast(input, rng.gen_range(lo..=hi)))
    }
}

impl Layer for RandomContrast2 {
    fn set_training(&mut self, training: bool) {
        self.training = training;
    }
    fn build(&mut self, input: &Tensor) -> Result<Tensor> {
        build_stochastic(&*self, input)
    }
}

/// Correlates every channel with a fixed 2d kernel, with `same` padding.
///
/// The kernel is not a parameter.
#[derive(Clone, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct FilterBase<K: ConvKind> {
    kernel: Tensor,
    #[serde(skip)]
    kind: PhantomData<K>,
}

/// Filter computed directly, see [`FilterBase`].
pub type Filter2 = FilterBase<Direct>;
/// Filter computed with the fft, see [`FilterBase`].
pub type FftFilter2 = FilterBase<Fft>;

impl<K: ConvKind> FilterBase<K> {
    /// Creates a new filter from a 2d `kernel`.
    ///
    /// **Errors**
    ///
    /// The kernel is not 2d or is empty.
    pub fn new(kernel: Tensor) -> Result<Self> {
        let kernel2 = kernel.view().into_dimensionality::<Ix2>()?;
        if kernel2.is_empty() {
            return Err(Error::invalid("kernel", "kernel is empty").into());
        }
        Ok(Self {
            kernel,
            kind: PhantomData,
        })
    }
    /// The kernel.
    pub fn kernel(&self) -> &Tensor {
        &self.kernel
    }
}

impl<K: ConvKind> Debug for FilterBase<K> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct(&format!("{}Filter2", K::PREFIX))
            .field("kernel", &self.kernel.shape())
            .finish()
    }
}

impl<K: ConvKind> Forward for FilterBase<K> {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        check_spatial_ndim("Filter2", input.shape(), 2)?;
        let channels = input.shape()[0];
        let kernel = &self.kernel.shape()[..2];
        let mut weight_shape = vec![channels, 1];
        weight_shape.extend_from_slice(kernel);
        let weight = self.kernel.broadcast(weight_shape.as_slice()).map(|x| x.to_owned());
        let Some(weight) = weight else {
            return Err(Error::invalid("kernel", "kernel does not broadcast").into());
        };
        let padding = resolve_padding(&input.shape()[1..], &Padding::Same, kernel, &[1, 1])?;
        K::conv(input, &weight, &[1, 1], &padding, &[1, 1], channels)
    }
}

impl<K: ConvKind> Layer for FilterBase<K> {}

fn outer(a: &Array1<f32>, b: &Array1<f32>) -> Tensor {
    let rows = a.view().insert_axis(Axis(1));
    let cols = b.view().insert_axis(Axis(0));
    (&rows * &cols).into_dyn()
}

/// Box blur with a `size x size` mean kernel.
#[derive(Layer, Forward, Clone, Debug, Serialize, Deserialize)]
pub struct AvgBlur2 {
    filter: Filter2,
}

impl AvgBlur2 {
    /// Creates a new [`AvgBlur2`] of `size`.
    ///
    /// **Errors**
    ///
    /// `size` is zero.
    pub fn new(size: usize) -> Result<Self> {
        let size = check_positive("size", size)?;
        let row = Array1::from_elem(size, (size as f32).recip());
        Ok(Self {
            filter: Filter2::new(outer(&row, &row))?,
        })
    }
}

/// Gaussian blur with a normalized `size x size` kernel of std `sigma`.
#[derive(Layer, Forward, Clone, Debug, Serialize, Deserialize)]
pub struct GaussianBlur2 {
    filter: Filter2,
}

impl GaussianBlur2 {
    /// Creates a new [`GaussianBlur2`] of `size` with `sigma`.
    ///
    /// **Errors**
    ///
    /// `size` is zero or `sigma` is not positive.
    pub fn new(size: usize, sigma: f32) -> Result<Self> {
        let size = check_positive("size", size)?;
        if !(sigma > 0.) {
            return Err(Error::invalid("sigma", format!("{sigma} is not positive")).into());
        }
        let center = (size - 1) as f32 / 2.;
        let mut row =
            Array1::from_shape_fn(size, |i| (-(i as f32 - center).powi(2) / (2. * sigma * sigma)).exp());
        row /= row.sum();
        Ok(Self {
            filter: Filter2::new(outer(&row, &row))?,
        })
    }
}

/// Discrete laplacian, the 5 point stencil.
#[derive(Layer, Forward, Clone, Debug, Serialize, Deserialize)]
pub struct Laplace2 {
    filter: Filter2,
}

impl Default for Laplace2 {
    fn default() -> Self {
        Self {
            filter: FilterBase {
                kernel: array![[0f32, 1., 0.], [1., -4., 1.], [0., 1., 0.]].into_dyn(),
                kind: PhantomData,
            },
        }
    }
}

/// Rearranges `(channels * r * r, rows, cols)` into `(channels, rows * r, cols * r)`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PixelShuffle2 {
    upscale: usize,
}

impl PixelShuffle2 {
    /// Creates a new [`PixelShuffle2`] with upscale factor `r`.
    ///
    /// **Errors**
    ///
    /// `r` is zero.
    pub fn new(r: usize) -> Result<Self> {
        Ok(Self {
            upscale: check_positive("upscale", r)?,
        })
    }
}

impl Forward for PixelShuffle2 {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        check_spatial_ndim("PixelShuffle2", input.shape(), 2)?;
        let r = self.upscale;
        let (c, h, w) = (input.shape()[0], input.shape()[1], input.shape()[2]);
        if c % (r * r) != 0 {
            return Err(Error::invalid(
                "input",
                format!("{c} channels are not divisible by {}", r * r),
            )
            .into());
        }
        let c = c / (r * r);
        let x = input.as_standard_layout();
        let x = x.view().into_shape((c, r, r, h, w))?;
        let x = x.permuted_axes([0, 3, 1, 4, 2]);
        Ok(x.as_standard_layout()
            .into_owned()
            .into_shape(vec![c, h * r, w * r])?)
    }
}

impl Layer for PixelShuffle2 {}

/// Equalizes `values` in place with a histogram of `bins` over `[min, max]`.
///
/// The normalized cdf is interpolated at the left bin edges.
fn equalize(values: &mut [f32], bins: usize) {
    let (lo, hi) = values
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), x| (lo.min(*x), hi.max(*x)));
    if lo > hi {
        return;
    }
    let (lo, hi) = if lo == hi { (lo - 0.5, hi + 0.5) } else { (lo, hi) };
    let edges: Vec<f32> = (0..=bins)
        .map(|i| lo + (hi - lo) * i as f32 / bins as f32)
        .collect();
    let mut cdf = vec![0f32; bins];
    for x in values.iter() {
        let bin = if *x >= edges[bins] {
            bins - 1
        } else {
            edges.partition_point(|e| e <= x).saturating_sub(1)
        };
        cdf[bin] += 1.;
    }
    let mut total = 0.;
    for count in cdf.iter_mut() {
        total += *count;
        *count = total;
    }
    let scale = (bins - 1) as f32 / total;
    cdf.iter_mut().for_each(|x| *x *= scale);
    let left = &edges[..bins];
    for x in values.iter_mut() {
        *x = if *x <= left[0] {
            cdf[0]
        } else if *x >= left[bins - 1] {
            cdf[bins - 1]
        } else {
            let i = left.partition_point(|e| e <= x) - 1;
            let t = (*x - left[i]) / (left[i + 1] - left[i]);
            cdf[i] + t * (cdf[i + 1] - cdf[i])
        };
    }
}

/// Histogram equalization of each channel of `(channels, rows, cols)` images.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HistogramEqualization2 {
    bins: usize,
}

impl HistogramEqualization2 {
    /// Creates a new [`HistogramEqualization2`] with `bins`.
    ///
    /// **Errors**
    ///
    /// `bins` is zero.
    pub fn new(bins: usize) -> Result<Self> {
        Ok(Self {
            bins: check_positive("bins", bins)?,
        })
    }
}

impl Default for HistogramEqualization2 {
    fn default() -> Self {
        Self { bins: 256 }
    }
}

impl Forward for HistogramEqualization2 {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        check_spatial_ndim("HistogramEqualization2", input.shape(), 2)?;
        let mut output = input.as_standard_layout().into_owned();
        for mut channel in output.outer_iter_mut() {
            if let Some(values) = channel.as_slice_mut() {
                equalize(values, self.bins);
            }
        }
        Ok(output)
    }
}

impl Layer for HistogramEqualization2 {}
