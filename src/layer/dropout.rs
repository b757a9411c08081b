use super::{build_stochastic, Forward, Layer};
use crate::{
    dims::{check_dims, check_spatial_ndim, normalize_axis, IntoDims, Spatial},
    error::{check_positive, check_rate, Error},
    Result, Tensor,
};
use dry::macro_for;
use ndarray::{Dimension, Ix1, Ix2, Ix3, Slice};
use paste::paste;
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use std::{
    fmt::{self, Debug},
    marker::PhantomData,
};

/// Zeroes elements with probability `drop_rate`, scaling survivors by `1 / (1 - drop_rate)`.
///
/// The mask is drawn over `mask_shape`, which broadcasts to the input.
fn dropout(
    input: &Tensor,
    drop_rate: f32,
    mask_shape: &[usize],
    rng: &mut dyn RngCore,
) -> Result<Tensor> {
    let keep = 1. - drop_rate;
    if keep == 0. {
        return Ok(Tensor::zeros(input.raw_dim()));
    }
    let mut mask = Tensor::zeros(mask_shape);
    mask.map_inplace(|x| {
        if rng.gen_bool(keep as f64) {
            *x = keep.recip();
        }
    });
    Ok(input * &mask)
}

/// Dropout.
///
/// Requires an rng in training mode, the identity in evaluation mode.
///
/// # Example
/// ```
/// # use tessera::{layer::{dropout::Dropout, Forward}, Result};
/// # use ndarray::ArrayD;
/// # use rand::{rngs::StdRng, SeedableRng};
/// # fn main() -> Result<()> {
/// let dropout = Dropout::new(0.5)?.with_drop_axes(vec![0]);
/// let y = dropout.forward_rng(&ArrayD::ones(vec![4, 3]), &mut StdRng::seed_from_u64(0))?;
/// // whole rows are kept or dropped
/// for row in y.outer_iter() {
///     assert!(row.iter().all(|x| *x == row[0]));
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Serialize, Deserialize)]
pub struct Dropout {
    drop_rate: f32,
    drop_axes: Option<Vec<isize>>,
    training: bool,
}

impl Dropout {
    /// Creates a new [`Dropout`] with `drop_rate`.
    ///
    /// **Errors**
    ///
    /// `drop_rate` is not in [0, 1].
    pub fn new(drop_rate: f32) -> Result<Self> {
        Ok(Self {
            drop_rate: check_rate("drop_rate", drop_rate)?,
            drop_axes: None,
            training: true,
        })
    }
    /// Restricts the mask to `drop_axes`, broadcast along the other axes.
    ///
    /// Negative axes count from the end.
    pub fn with_drop_axes(mut self, drop_axes: Vec<isize>) -> Self {
        self.drop_axes.replace(drop_axes);
        self
    }
    /// The probability of zeroing an element.
    pub fn drop_rate(&self) -> f32 {
        self.drop_rate
    }
}

impl Default for Dropout {
    fn default() -> Self {
        Self {
            drop_rate: 0.5,
            drop_axes: None,
            training: true,
        }
    }
}

impl Debug for Dropout {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut builder = f.debug_struct("Dropout");
        builder.field("drop_rate", &self.drop_rate);
        if let Some(drop_axes) = self.drop_axes.as_ref() {
            builder.field("drop_axes", drop_axes);
        }
        if !self.training {
            builder.field("training", &false);
        }
        builder.finish()
    }
}

impl Forward for Dropout {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        if !self.training {
            return Ok(input.clone());
        }
        Err(Error::MissingRng("Dropout").into())
    }
    fn forward_rng(&self, input: &Tensor, rng: &mut dyn RngCore) -> Result<Tensor> {
        if !self.training {
            return Ok(input.clone());
        }
        let mask_shape = match self.drop_axes.as_ref() {
            Some(drop_axes) => {
                let mut shape = vec![1; input.ndim()];
                for axis in drop_axes {
                    let axis = normalize_axis(*axis, input.ndim())?;
                    shape[axis] = input.shape()[axis];
                }
                shape
            }
            None => input.shape().to_vec(),
        };
        dropout(input, self.drop_rate, &mask_shape, rng)
    }
}

impl Layer for Dropout {
    fn set_training(&mut self, training: bool) {
        self.training = training;
    }
    fn build(&mut self, input: &Tensor) -> Result<Tensor> {
        build_stochastic(&*self, input)
    }
}

/// Drops whole channels of a `(channels, *spatial)` input.
///
/// Requires an rng in training mode, the identity in evaluation mode.
#[derive(Clone, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct ChannelDropout<D: Spatial> {
    drop_rate: f32,
    training: bool,
    #[serde(skip)]
    _m: PhantomData<D>,
}

macro_for!($N in [1, 2, 3] {
    paste! {
        #[doc = "Channel dropout for " $N "d inputs, see [`ChannelDropout`]."]
        pub type [<Dropout $N>] = ChannelDropout<[<Ix $N>]>;
    }
});

impl<D: Spatial> ChannelDropout<D> {
    /// Creates a new [`ChannelDropout`] with `drop_rate`.
    ///
    /// **Errors**
    ///
    /// `drop_rate` is not in [0, 1].
    pub fn new(drop_rate: f32) -> Result<Self> {
        Ok(Self {
            drop_rate: check_rate("drop_rate", drop_rate)?,
            training: true,
            _m: PhantomData,
        })
    }
}

impl<D: Spatial> Debug for ChannelDropout<D> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut builder = f.debug_struct(&format!("Dropout{}", D::SPATIAL_NDIM));
        builder.field("drop_rate", &self.drop_rate);
        if !self.training {
            builder.field("training", &false);
        }
        builder.finish()
    }
}

impl<D: Spatial> Forward for ChannelDropout<D> {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        if !self.training {
            return Ok(input.clone());
        }
        Err(Error::MissingRng("ChannelDropout").into())
    }
    fn forward_rng(&self, input: &Tensor, rng: &mut dyn RngCore) -> Result<Tensor> {
        if !self.training {
            return Ok(input.clone());
        }
        check_spatial_ndim("ChannelDropout", input.shape(), D::SPATIAL_NDIM)?;
        let mut mask_shape = vec![1; input.ndim()];
        mask_shape[0] = input.shape()[0];
        dropout(input, self.drop_rate, &mask_shape, rng)
    }
}

impl<D: Spatial> Layer for ChannelDropout<D> {
    fn set_training(&mut self, training: bool) {
        self.training = training;
    }
    fn build(&mut self, input: &Tensor) -> Result<Tensor> {
        build_stochastic(&*self, input)
    }
}

/// Fills `cutout_count` randomly placed boxes of `shape` across all channels.
///
/// Box starts are drawn from `[0, len - size)`, or 0 when the box covers the axis.
/// Requires an rng in training mode, the identity in evaluation mode.
#[derive(Clone, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct RandomCutout<D: Spatial> {
    shape: D,
    cutout_count: usize,
    fill_value: f32,
    training: bool,
}

/// Cutout of 1d inputs, see [`RandomCutout`].
pub type RandomCutout1 = RandomCutout<Ix1>;
/// Cutout of 2d inputs, see [`RandomCutout`].
pub type RandomCutout2 = RandomCutout<Ix2>;
/// Cutout of 3d inputs, see [`RandomCutout`].
pub type RandomCutout3 = RandomCutout<Ix3>;

impl<D: Spatial> RandomCutout<D> {
    /// Creates a new [`RandomCutout`] with boxes of `shape`.
    ///
    /// Defaults:
    /// - cutout_count: 1
    /// - fill_value: 0
    ///
    /// **Errors**
    ///
    /// `shape` has a zero axis.
    pub fn new(shape: impl IntoDims<D>) -> Result<Self> {
        Ok(Self {
            shape: check_dims(shape.into_dims(), "shape")?,
            cutout_count: 1,
            fill_value: 0.,
            training: true,
        })
    }
    /// Sets the number of boxes.
    ///
    /// **Errors**
    ///
    /// `cutout_count` is zero.
    pub fn with_cutout_count(mut self, cutout_count: usize) -> Result<Self> {
        self.cutout_count = check_positive("cutout_count", cutout_count)?;
        Ok(self)
    }
    /// Sets the value written into the boxes.
    pub fn with_fill_value(mut self, fill_value: f32) -> Self {
        self.fill_value = fill_value;
        self
    }
}

impl<D: Spatial> Debug for RandomCutout<D> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut builder = f.debug_struct(&format!("RandomCutout{}", D::SPATIAL_NDIM));
        builder.field("shape", &self.shape.slice());
        if self.cutout_count != 1 {
            builder.field("cutout_count", &self.cutout_count);
        }
        if self.fill_value != 0. {
            builder.field("fill_value", &self.fill_value);
        }
        builder.finish()
    }
}

impl<D: Spatial> Forward for RandomCutout<D> {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        if !self.training {
            return Ok(input.clone());
        }
        Err(Error::MissingRng("RandomCutout").into())
    }
    fn forward_rng(&self, input: &Tensor, rng: &mut dyn RngCore) -> Result<Tensor> {
        if !self.training {
            return Ok(input.clone());
        }
        check_spatial_ndim("RandomCutout", input.shape(), D::SPATIAL_NDIM)?;
        let mut output = input.clone();
        for _ in 0..self.cutout_count {
            let starts: Vec<usize> = input.shape()[1..]
                .iter()
                .zip(self.shape.slice())
                .map(|(len, size)| if len > size { rng.gen_range(0..len - size) } else { 0 })
                .collect();
            output
                .slice_each_axis_mut(|ax| {
                    let axis = ax.axis.index();
                    if axis == 0 {
                        return Slice::from(..);
                    }
                    let start = starts[axis - 1];
                    let end = (start + self.shape[axis - 1]).min(ax.len);
                    Slice::from(start..end)
                })
                .fill(self.fill_value);
        }
        Ok(output)
    }
}

impl<D: Spatial> Layer for RandomCutout<D> {
    fn set_training(&mut self, training: bool) {
        self.training = training;
    }
    fn build(&mut self, input: &Tensor) -> Result<Tensor> {
        build_stochastic(&*self, input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Axis};
    use rand::{rngs::StdRng, SeedableRng};

    fn rng() -> StdRng {
        StdRng::seed_from_u64(0)
    }

    #[test]
    fn dropout_scales_survivors() {
        let dropout = Dropout::new(0.25).unwrap();
        let y = dropout
            .forward_rng(&Tensor::ones(vec![1000]), &mut rng())
            .unwrap();
        assert!(y.iter().all(|x| *x == 0. || (*x - 1. / 0.75).abs() < 1e-6));
        let kept = y.iter().filter(|x| **x != 0.).count();
        assert!((650..850).contains(&kept), "kept {kept}");
    }

    #[test]
    fn dropout_edge_rates() {
        let x = Tensor::ones(vec![3, 4]);
        let y = Dropout::new(1.).unwrap().forward_rng(&x, &mut rng()).unwrap();
        assert_eq!(y, Tensor::zeros(vec![3, 4]));
        let y = Dropout::new(0.).unwrap().forward_rng(&x, &mut rng()).unwrap();
        assert_eq!(y, x);
        assert!(Dropout::new(1.5).is_err());
        assert!(Dropout::new(-0.1).is_err());
    }

    #[test]
    fn dropout_needs_rng_in_training() {
        let x = Tensor::ones(vec![3]);
        let err = Dropout::default().forward(&x).unwrap_err();
        assert_eq!(
            err.downcast_ref::<Error>(),
            Some(&Error::MissingRng("Dropout"))
        );
        let dropout = Dropout::default().eval();
        assert_eq!(dropout.forward(&x).unwrap(), x);
        assert_eq!(dropout.forward_rng(&x, &mut rng()).unwrap(), x);
    }

    #[test]
    fn dropout_axes_broadcast() {
        let dropout = Dropout::new(0.5).unwrap().with_drop_axes(vec![-1]);
        let y = dropout
            .forward_rng(&Tensor::ones(vec![5, 64]), &mut rng())
            .unwrap();
        for column in y.axis_iter(Axis(1)) {
            assert!(column.iter().all(|x| *x == column[0]));
        }
        let dropout = Dropout::new(0.5).unwrap().with_drop_axes(vec![2]);
        assert!(dropout.forward_rng(&Tensor::ones(vec![5, 4]), &mut rng()).is_err());
    }

    #[test]
    fn channel_dropout() {
        let dropout = Dropout2::new(0.5).unwrap();
        let y = dropout
            .forward_rng(&Tensor::ones(vec![16, 3, 3]), &mut rng())
            .unwrap();
        for channel in y.outer_iter() {
            assert!(channel.iter().all(|x| *x == 0.) || channel.iter().all(|x| *x == 2.));
        }
        assert!(dropout.forward_rng(&Tensor::ones(vec![16, 3]), &mut rng()).is_err());
    }

    #[test]
    fn cutout() {
        let cutout = RandomCutout1::new(3).unwrap().with_fill_value(-1.);
        let y = cutout
            .forward_rng(&Tensor::ones(vec![2, 10]), &mut rng())
            .unwrap();
        for channel in y.outer_iter() {
            assert_eq!(channel.iter().filter(|x| **x == -1.).count(), 3);
        }
        assert_eq!(y.index_axis(Axis(0), 0), y.index_axis(Axis(0), 1));
        let cutout = RandomCutout2::new([2, 2]).unwrap();
        let y = cutout
            .forward_rng(&Tensor::ones(vec![1, 2, 2]), &mut rng())
            .unwrap();
        assert_eq!(y, array![[[0f32, 0.], [0., 0.]]].into_dyn());
        assert!(RandomCutout2::new([0, 2]).is_err());
        assert!(RandomCutout1::new(2).unwrap().with_cutout_count(0).is_err());
    }
}
