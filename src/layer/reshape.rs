use super::{build_stochastic, Forward, Layer};
use crate::{
    dims::{check_dims, check_spatial_ndim, normalize_axis, resolve_padding, IntoDims, Padding, Spatial},
    error::Error,
    ops::pad_constant,
    Result, Tensor,
};
use dry::macro_for;
use ndarray::{Axis, Dimension, Ix1, Ix2, Ix3, Slice};
use paste::paste;
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use std::{
    fmt::{self, Debug},
    str::FromStr,
};

/// Merges the axes `start..=end` into one.
///
/// Negative axes count from the end.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Flatten {
    start: isize,
    end: isize,
}

impl Default for Flatten {
    fn default() -> Self {
        Self { start: 0, end: -1 }
    }
}

impl Flatten {
    /// Creates a new [`Flatten`] over `start..=end`.
    pub fn new(start: isize, end: isize) -> Self {
        Self { start, end }
    }
}

impl Forward for Flatten {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let start = normalize_axis(self.start, input.ndim())?;
        let end = normalize_axis(self.end, input.ndim())?;
        if start > end {
            return Err(Error::invalid(
                "end",
                format!("axis {end} is before start axis {start}"),
            )
            .into());
        }
        let shape = input.shape();
        let mut flat = shape[..start].to_vec();
        flat.push(shape[start..=end].iter().product());
        flat.extend_from_slice(&shape[end + 1..]);
        Ok(input.as_standard_layout().into_owned().into_shape(flat)?)
    }
}

impl Layer for Flatten {}

/// Splits `axis` into `shape`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Unflatten {
    axis: isize,
    shape: Vec<usize>,
}

impl Unflatten {
    /// Creates a new [`Unflatten`] of `axis` into `shape`.
    pub fn new(axis: isize, shape: Vec<usize>) -> Self {
        Self { axis, shape }
    }
}

impl Forward for Unflatten {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let axis = normalize_axis(self.axis, input.ndim())?;
        let shape = input.shape();
        let len = self.shape.iter().product::<usize>();
        if len != shape[axis] {
            return Err(Error::FeatureMismatch {
                axis,
                expected: len,
                found: shape[axis],
            }
            .into());
        }
        let mut unflat = shape[..axis].to_vec();
        unflat.extend_from_slice(&self.shape);
        unflat.extend_from_slice(&shape[axis + 1..]);
        Ok(input.as_standard_layout().into_owned().into_shape(unflat)?)
    }
}

impl Layer for Unflatten {}

/// Pads the spatial axes with a constant.
#[derive(Clone, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct Pad<D: Spatial> {
    padding: Padding,
    value: f32,
    #[serde(skip)]
    _m: std::marker::PhantomData<D>,
}

/// Crop of `size` from `start`, clamped to the input like `dynamic_slice`.
#[derive(Clone, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct Crop<D: Spatial> {
    size: D,
    start: D,
}

/// Crop of `size` at the center of the input.
#[derive(Clone, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct CenterCrop<D: Spatial> {
    size: D,
}

/// Crop of `size` at a random start.
#[derive(Clone, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct RandomCrop<D: Spatial> {
    size: D,
}

/// Nearest neighbor upsampling by an integer `scale` per axis.
#[derive(Clone, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct Upsample<D: Spatial> {
    scale: D,
}

/// Resizes the spatial axes to `size`.
#[derive(Clone, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct Resize<D: Spatial> {
    size: D,
    method: ResizeMethod,
}

macro_for!($N in [1, 2, 3] {
    paste! {
        #[doc = "Padding of " $N "d inputs, see [`Pad`]."]
        pub type [<Pad $N>] = Pad<[<Ix $N>]>;
        #[doc = "Crop of " $N "d inputs, see [`Crop`]."]
        pub type [<Crop $N>] = Crop<[<Ix $N>]>;
        #[doc = "Center crop of " $N "d inputs, see [`CenterCrop`]."]
        pub type [<CenterCrop $N>] = CenterCrop<[<Ix $N>]>;
        #[doc = "Random crop of " $N "d inputs, see [`RandomCrop`]."]
        pub type [<RandomCrop $N>] = RandomCrop<[<Ix $N>]>;
        #[doc = "Upsampling of " $N "d inputs, see [`Upsample`]."]
        pub type [<Upsample $N>] = Upsample<[<Ix $N>]>;
        #[doc = "Resizing of " $N "d inputs, see [`Resize`]."]
        pub type [<Resize $N>] = Resize<[<Ix $N>]>;
    }
});

impl<D: Spatial> Pad<D> {
    /// Creates a new [`Pad`] filling `padding` with `value`.
    ///
    /// **Errors**
    ///
    /// The padding is `same` or `full`, or does not have one entry per spatial axis.
    pub fn new(padding: impl Into<Padding>, value: f32) -> Result<Self> {
        let padding = padding.into();
        if matches!(padding, Padding::Same | Padding::Full) {
            return Err(Error::invalid("padding", format!("{padding:?} requires a kernel")).into());
        }
        padding.validate(D::SPATIAL_NDIM)?;
        Ok(Self {
            padding,
            value,
            _m: std::marker::PhantomData,
        })
    }
}

impl<D: Spatial> Debug for Pad<D> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut builder = f.debug_struct(&format!("Pad{}", D::SPATIAL_NDIM));
        builder.field("padding", &self.padding);
        if self.value != 0. {
            builder.field("value", &self.value);
        }
        builder.finish()
    }
}

impl<D: Spatial> Forward for Pad<D> {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        check_spatial_ndim("Pad", input.shape(), D::SPATIAL_NDIM)?;
        let ones = vec![1; D::SPATIAL_NDIM];
        let padding = resolve_padding(&input.shape()[1..], &self.padding, &ones, &ones)?;
        Ok(pad_constant(input, &padding, self.value))
    }
}

impl<D: Spatial> Layer for Pad<D> {}

/// Slices `size` from `start` on every spatial axis, keeping the channels.
fn crop(layer: &'static str, input: &Tensor, size: &[usize], start: &[usize]) -> Result<Tensor> {
    check_spatial_ndim(layer, input.shape(), size.len())?;
    let spatial = &input.shape()[1..];
    if let Some(axis) = (0..size.len()).find(|i| size[*i] > spatial[*i]) {
        return Err(Error::invalid(
            "size",
            format!(
                "{layer} size {:?} exceeds the input {spatial:?} on axis {axis}",
                size
            ),
        )
        .into());
    }
    Ok(input
        .slice_each_axis(|ax| {
            let axis = ax.axis.index();
            if axis == 0 {
                return Slice::from(..);
            }
            let size = size[axis - 1];
            // clamped so the window stays inside the input
            let start = start[axis - 1].min(ax.len - size);
            Slice::from(start..start + size)
        })
        .to_owned())
}

impl<D: Spatial> Crop<D> {
    /// Creates a new [`Crop`] of `size` from `start`.
    ///
    /// A start past `len - size` is clamped to it.
    pub fn new(size: impl IntoDims<D>, start: impl IntoDims<D>) -> Self {
        Self {
            size: size.into_dims(),
            start: start.into_dims(),
        }
    }
}

impl<D: Spatial> Debug for Crop<D> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct(&format!("Crop{}", D::SPATIAL_NDIM))
            .field("size", &self.size.slice())
            .field("start", &self.start.slice())
            .finish()
    }
}

impl<D: Spatial> Forward for Crop<D> {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        crop("Crop", input, self.size.slice(), self.start.slice())
    }
}

impl<D: Spatial> Layer for Crop<D> {}

impl<D: Spatial> CenterCrop<D> {
    /// Creates a new [`CenterCrop`] of `size`.
    pub fn new(size: impl IntoDims<D>) -> Self {
        Self {
            size: size.into_dims(),
        }
    }
}

impl<D: Spatial> Debug for CenterCrop<D> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct(&format!("CenterCrop{}", D::SPATIAL_NDIM))
            .field("size", &self.size.slice())
            .finish()
    }
}

impl<D: Spatial> Forward for CenterCrop<D> {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        check_spatial_ndim("CenterCrop", input.shape(), D::SPATIAL_NDIM)?;
        let start: Vec<usize> = input.shape()[1..]
            .iter()
            .zip(self.size.slice())
            .map(|(len, size)| len.saturating_sub(*size) / 2)
            .collect();
        crop("CenterCrop", input, self.size.slice(), &start)
    }
}

impl<D: Spatial> Layer for CenterCrop<D> {}

impl<D: Spatial> RandomCrop<D> {
    /// Creates a new [`RandomCrop`] of `size`.
    ///
    /// **Errors**
    ///
    /// `size` has a zero axis.
    pub fn new(size: impl IntoDims<D>) -> Result<Self> {
        Ok(Self {
            size: check_dims(size.into_dims(), "size")?,
        })
    }
}

impl<D: Spatial> Debug for RandomCrop<D> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct(&format!("RandomCrop{}", D::SPATIAL_NDIM))
            .field("size", &self.size.slice())
            .finish()
    }
}

impl<D: Spatial> Forward for RandomCrop<D> {
    fn forward(&self, _input: &Tensor) -> Result<Tensor> {
        Err(Error::MissingRng("RandomCrop").into())
    }
    fn forward_rng(&self, input: &Tensor, rng: &mut dyn RngCore) -> Result<Tensor> {
        check_spatial_ndim("RandomCrop", input.shape(), D::SPATIAL_NDIM)?;
        let start: Vec<usize> = input.shape()[1..]
            .iter()
            .zip(self.size.slice())
            .map(|(len, size)| rng.gen_range(0..=len.saturating_sub(*size)))
            .collect();
        crop("RandomCrop", input, self.size.slice(), &start)
    }
}

impl<D: Spatial> Layer for RandomCrop<D> {
    fn build(&mut self, input: &Tensor) -> Result<Tensor> {
        build_stochastic(&*self, input)
    }
}

/// Interpolation of [`Resize`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResizeMethod {
    #[default]
    Nearest,
    /// Linear (bilinear, trilinear) with half pixel centers.
    Linear,
}

impl FromStr for ResizeMethod {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Error> {
        match s.to_ascii_lowercase().as_str() {
            "nearest" => Ok(Self::Nearest),
            "linear" | "bilinear" | "trilinear" => Ok(Self::Linear),
            _ => Err(Error::UnknownName {
                kind: "resize method",
                name: s.to_string(),
                available: "nearest, linear".to_string(),
            }),
        }
    }
}

/// Resamples `axis` to `out` elements.
fn resample_axis(x: &Tensor, axis: usize, out: usize, method: ResizeMethod) -> Tensor {
    let len = x.len_of(Axis(axis));
    if len == out {
        return x.clone();
    }
    let scale = len as f32 / out as f32;
    match method {
        ResizeMethod::Nearest => {
            let indices: Vec<usize> = (0..out)
                .map(|i| (((i as f32 + 0.5) * scale) as usize).min(len - 1))
                .collect();
            x.select(Axis(axis), &indices)
        }
        ResizeMethod::Linear => {
            let mut shape = x.shape().to_vec();
            shape[axis] = out;
            let mut y = Tensor::zeros(shape);
            for (i, mut lane) in y.axis_iter_mut(Axis(axis)).enumerate() {
                let center = ((i as f32 + 0.5) * scale - 0.5).clamp(0., (len - 1) as f32);
                let lo = center.floor() as usize;
                let hi = (lo + 1).min(len - 1);
                let w = center - lo as f32;
                lane.assign(&x.index_axis(Axis(axis), lo));
                lane *= 1. - w;
                lane.scaled_add(w, &x.index_axis(Axis(axis), hi));
            }
            y
        }
    }
}

impl<D: Spatial> Upsample<D> {
    /// Creates a new [`Upsample`] by `scale`.
    ///
    /// **Errors**
    ///
    /// `scale` has a zero axis.
    pub fn new(scale: impl IntoDims<D>) -> Result<Self> {
        Ok(Self {
            scale: check_dims(scale.into_dims(), "scale")?,
        })
    }
}

impl<D: Spatial> Debug for Upsample<D> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct(&format!("Upsample{}", D::SPATIAL_NDIM))
            .field("scale", &self.scale.slice())
            .finish()
    }
}

impl<D: Spatial> Forward for Upsample<D> {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        check_spatial_ndim("Upsample", input.shape(), D::SPATIAL_NDIM)?;
        let mut output = input.clone();
        for (i, scale) in self.scale.slice().iter().enumerate() {
            let axis = i + 1;
            let indices: Vec<usize> = (0..output.len_of(Axis(axis)) * scale)
                .map(|j| j / scale)
                .collect();
            output = output.select(Axis(axis), &indices);
        }
        Ok(output)
    }
}

impl<D: Spatial> Layer for Upsample<D> {}

impl<D: Spatial> Resize<D> {
    /// Creates a new [`Resize`] to `size` with nearest interpolation.
    ///
    /// **Errors**
    ///
    /// `size` has a zero axis.
    pub fn new(size: impl IntoDims<D>) -> Result<Self> {
        Ok(Self {
            size: check_dims(size.into_dims(), "size")?,
            method: ResizeMethod::default(),
        })
    }
    /// Sets the interpolation.
    pub fn with_method(mut self, method: ResizeMethod) -> Self {
        self.method = method;
        self
    }
}

impl<D: Spatial> Debug for Resize<D> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut builder = f.debug_struct(&format!("Resize{}", D::SPATIAL_NDIM));
        builder.field("size", &self.size.slice());
        if self.method != ResizeMethod::Nearest {
            builder.field("method", &self.method);
        }
        builder.finish()
    }
}

impl<D: Spatial> Forward for Resize<D> {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        check_spatial_ndim("Resize", input.shape(), D::SPATIAL_NDIM)?;
        if input.is_empty() {
            return Err(Error::invalid("input", "cannot resize an empty input").into());
        }
        let mut output = input.clone();
        for (i, size) in self.size.slice().iter().enumerate() {
            output = resample_axis(&output, i + 1, *size, self.method);
        }
        Ok(output)
    }
}

impl<D: Spatial> Layer for Resize<D> {}

fn flip(layer: &'static str, input: &Tensor, axis: usize) -> Result<Tensor> {
    check_spatial_ndim(layer, input.shape(), 2)?;
    let mut output = input.view();
    output.invert_axis(Axis(axis));
    Ok(output.to_owned())
}

/// Mirrors `(channels, rows, cols)` images horizontally.
#[derive(Default, Clone, Debug, Serialize, Deserialize)]
pub struct FlipLeftRight2;

impl Forward for FlipLeftRight2 {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        flip("FlipLeftRight2", input, 2)
    }
}

impl Layer for FlipLeftRight2 {}

/// Mirrors `(channels, rows, cols)` images vertically.
#[derive(Default, Clone, Debug, Serialize, Deserialize)]
pub struct FlipUpDown2;

impl Forward for FlipUpDown2 {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        flip("FlipUpDown2", input, 1)
    }
}

impl Layer for FlipUpDown2 {}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array, IxDyn};
    use rand::{rngs::StdRng, SeedableRng};

    fn arange(shape: &[usize]) -> Tensor {
        let len = shape.iter().product::<usize>();
        Array::range(0., len as f32, 1.).into_shape(IxDyn(shape)).unwrap()
    }

    #[test]
    fn flatten_unflatten() {
        let x = arange(&[2, 3, 4]);
        assert_eq!(Flatten::default().forward(&x).unwrap().shape(), &[24]);
        let y = Flatten::new(1, 2).forward(&x).unwrap();
        assert_eq!(y.shape(), &[2, 12]);
        assert_eq!(Unflatten::new(-1, vec![3, 4]).forward(&y).unwrap(), x);
        assert!(Unflatten::new(1, vec![5, 2]).forward(&y).is_err());
        assert!(Flatten::new(2, 0).forward(&x).is_err());
        assert!(Flatten::new(0, 3).forward(&x).is_err());
    }

    #[test]
    fn pad() {
        let x = Tensor::ones(vec![1, 2]);
        let y = Pad1::new([(1, 2)], -1.).unwrap().forward(&x).unwrap();
        assert_eq!(y, array![[-1f32, 1., 1., -1., -1.]].into_dyn());
        let y = Pad2::new(1, 0.).unwrap().forward(&Tensor::ones(vec![2, 2, 3])).unwrap();
        assert_eq!(y.shape(), &[2, 4, 5]);
        assert!(Pad2::new(Padding::Same, 0.).is_err());
        assert!(Pad2::new([1, 2, 3], 0.).is_err());
    }

    #[test]
    fn crop_clamps_start() {
        let x = arange(&[1, 10]);
        let crop = |start: usize| Crop1::new(5, start).forward(&x).unwrap();
        assert_eq!(crop(0), arange(&[1, 5]));
        assert_eq!(crop(2), array![[2f32, 3., 4., 5., 6.]].into_dyn());
        assert_eq!(crop(7), array![[5f32, 6., 7., 8., 9.]].into_dyn());
        let x = arange(&[1, 5, 5]);
        let y = Crop2::new(3, [2, 0]).forward(&x).unwrap();
        assert_eq!(
            y,
            array![[[10f32, 11., 12.], [15., 16., 17.], [20., 21., 22.]]].into_dyn()
        );
        assert!(Crop2::new(6, 0).forward(&x).is_err());
    }

    #[test]
    fn center_and_random_crop() {
        let x = arange(&[2, 5, 5, 5]);
        let y = CenterCrop3::new(3).forward(&x).unwrap();
        assert_eq!(y, x.slice(ndarray::s![.., 1..4, 1..4, 1..4]).into_dyn());
        assert_eq!(CenterCrop3::new(0).forward(&x).unwrap().shape(), &[2, 0, 0, 0]);
        let crop = RandomCrop2::new([3, 2]).unwrap();
        assert!(crop.forward(&arange(&[1, 5, 5])).is_err());
        let y = crop
            .forward_rng(&arange(&[1, 5, 5]), &mut StdRng::seed_from_u64(0))
            .unwrap();
        assert_eq!(y.shape(), &[1, 3, 2]);
        assert_eq!(y[[0, 0, 1]] - y[[0, 0, 0]], 1.);
    }

    #[test]
    fn upsample_repeats() {
        let y = Upsample2::new([2, 3]).unwrap().forward(&Tensor::ones(vec![1, 2, 2])).unwrap();
        assert_eq!(y.shape(), &[1, 4, 6]);
        let y = Upsample1::new(2).unwrap().forward(&array![[1f32, 2.]].into_dyn()).unwrap();
        assert_eq!(y, array![[1f32, 1., 2., 2.]].into_dyn());
    }

    #[test]
    fn resize() {
        let x = array![[0f32, 1., 2., 3.]].into_dyn();
        let y = Resize1::new(2).unwrap().forward(&x).unwrap();
        assert_eq!(y, array![[1f32, 3.]].into_dyn());
        let y = Resize1::new(8)
            .unwrap()
            .with_method("linear".parse().unwrap())
            .forward(&x)
            .unwrap();
        assert_abs_diff_eq!(
            y,
            array![[0f32, 0.25, 0.75, 1.25, 1.75, 2.25, 2.75, 3.]].into_dyn(),
            epsilon = 1e-6
        );
        let y = Resize2::new([3, 1]).unwrap().forward(&arange(&[2, 6, 2])).unwrap();
        assert_eq!(y.shape(), &[2, 3, 1]);
        assert!("cubic".parse::<ResizeMethod>().is_err());
    }

    #[test]
    fn flips() {
        let x = arange(&[1, 2, 2]);
        assert_eq!(
            FlipLeftRight2.forward(&x).unwrap(),
            array![[[1f32, 0.], [3., 2.]]].into_dyn()
        );
        assert_eq!(
            FlipUpDown2.forward(&x).unwrap(),
            array![[[2f32, 3.], [0., 1.]]].into_dyn()
        );
        assert!(FlipUpDown2.forward(&arange(&[2, 2])).is_err());
    }
}
