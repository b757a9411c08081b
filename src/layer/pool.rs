use super::{Forward, Layer};
use crate::{
    dims::{check_dims, check_spatial_ndim, resolve_padding, IntoDims, Padding, Spatial},
    error::Error,
    ops::{adaptive_pool, avg_pool, lp_pool, max_pool, Reduction},
    Result, Tensor,
};
use dry::macro_for;
use ndarray::{Axis, Dimension, Ix1, Ix2, Ix3};
use paste::paste;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{
    fmt::{self, Debug},
    marker::PhantomData,
};

mod sealed {
    pub trait PoolKindBase {}
}
use sealed::PoolKindBase;

/// Marker trait for [`PoolBase`].
pub trait PoolKind:
    Default + Clone + Serialize + DeserializeOwned + Send + Sync + 'static + PoolKindBase
{
    #[doc(hidden)]
    const NAME: &'static str;
    #[doc(hidden)]
    fn pool(
        &self,
        input: &Tensor,
        kernel: &[usize],
        strides: &[usize],
        padding: &[(usize, usize)],
    ) -> Result<Tensor>;
}

/// Pooling kinds that reduce a whole axis, for global and adaptive pooling.
pub trait ReduceKind: PoolKind {
    #[doc(hidden)]
    const REDUCTION: Reduction;
}

/// Marker for [`MaxPool`](PoolBase).
#[derive(Default, Clone, Serialize, Deserialize)]
pub struct PoolMax {}

impl PoolKindBase for PoolMax {}

impl PoolKind for PoolMax {
    const NAME: &'static str = "Max";
    fn pool(
        &self,
        input: &Tensor,
        kernel: &[usize],
        strides: &[usize],
        padding: &[(usize, usize)],
    ) -> Result<Tensor> {
        max_pool(input, kernel, strides, padding)
    }
}

impl ReduceKind for PoolMax {
    const REDUCTION: Reduction = Reduction::Max;
}

/// Marker for [`AvgPool`](PoolBase).
#[derive(Default, Clone, Serialize, Deserialize)]
pub struct PoolAvg {}

impl PoolKindBase for PoolAvg {}

impl PoolKind for PoolAvg {
    const NAME: &'static str = "Avg";
    fn pool(
        &self,
        input: &Tensor,
        kernel: &[usize],
        strides: &[usize],
        padding: &[(usize, usize)],
    ) -> Result<Tensor> {
        avg_pool(input, kernel, strides, padding)
    }
}

impl ReduceKind for PoolAvg {
    const REDUCTION: Reduction = Reduction::Avg;
}

/// Marker for [`LpPool`](PoolBase), holding the norm.
#[derive(Clone, Serialize, Deserialize)]
pub struct PoolLp {
    norm_type: f32,
}

impl Default for PoolLp {
    fn default() -> Self {
        Self { norm_type: 2. }
    }
}

impl PoolKindBase for PoolLp {}

impl PoolKind for PoolLp {
    const NAME: &'static str = "Lp";
    fn pool(
        &self,
        input: &Tensor,
        kernel: &[usize],
        strides: &[usize],
        padding: &[(usize, usize)],
    ) -> Result<Tensor> {
        lp_pool(input, self.norm_type, kernel, strides, padding)
    }
}

/// Pooling layer.
///
/// Windows are reduced over the spatial axes of a `(channels, *spatial)` input.
#[derive(Clone, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct PoolBase<D: Spatial, K: PoolKind> {
    kernel: D,
    strides: D,
    padding: Padding,
    kind: K,
}

macro_for!($N in [1, 2, 3] {
    paste! {
        #[doc = "MaxPool " $N "d\n\nSee [`PoolBase`]."]
        pub type [<MaxPool $N>] = PoolBase<[<Ix $N>], PoolMax>;
        #[doc = "AvgPool " $N "d\n\nSee [`PoolBase`]."]
        pub type [<AvgPool $N>] = PoolBase<[<Ix $N>], PoolAvg>;
        #[doc = "LpPool " $N "d\n\nSee [`PoolBase`]."]
        pub type [<LpPool $N>] = PoolBase<[<Ix $N>], PoolLp>;
        #[doc = "GlobalMaxPool " $N "d\n\nSee [`GlobalPoolBase`]."]
        pub type [<GlobalMaxPool $N>] = GlobalPoolBase<[<Ix $N>], PoolMax>;
        #[doc = "GlobalAvgPool " $N "d\n\nSee [`GlobalPoolBase`]."]
        pub type [<GlobalAvgPool $N>] = GlobalPoolBase<[<Ix $N>], PoolAvg>;
        #[doc = "AdaptiveMaxPool " $N "d\n\nSee [`AdaptivePoolBase`]."]
        pub type [<AdaptiveMaxPool $N>] = AdaptivePoolBase<[<Ix $N>], PoolMax>;
        #[doc = "AdaptiveAvgPool " $N "d\n\nSee [`AdaptivePoolBase`]."]
        pub type [<AdaptiveAvgPool $N>] = AdaptivePoolBase<[<Ix $N>], PoolAvg>;
    }
});

impl<D: Spatial, K: PoolKind> PoolBase<D, K> {
    /// Creates a new pool with `kernel`.
    ///
    /// Defaults:
    /// - strides: 1
    /// - padding: [`Padding::Valid`]
    ///
    /// **Errors**
    ///
    /// The kernel has a zero axis.
    pub fn from_kernel(kernel: impl IntoDims<D>) -> Result<Self> {
        Ok(Self {
            kernel: check_dims(kernel.into_dims(), "kernel")?,
            strides: 1.into_dims(),
            padding: Padding::Valid,
            kind: K::default(),
        })
    }
    /// Adds `strides`.
    ///
    /// **Errors**
    ///
    /// The strides have a zero axis.
    pub fn with_strides(mut self, strides: impl IntoDims<D>) -> Result<Self> {
        self.strides = check_dims(strides.into_dims(), "strides")?;
        Ok(self)
    }
    /// Adds `padding`.
    ///
    /// **Errors**
    ///
    /// Per axis padding does not match the spatial ndim.
    pub fn with_padding(mut self, padding: impl Into<Padding>) -> Result<Self> {
        let padding = padding.into();
        padding.validate(D::SPATIAL_NDIM)?;
        self.padding = padding;
        Ok(self)
    }
}

impl<D: Spatial> PoolBase<D, PoolLp> {
    /// Sets the norm `p` of `(sum x^p)^(1/p)`, 2 by default.
    ///
    /// **Errors**
    ///
    /// `norm_type` is not positive.
    pub fn with_norm_type(mut self, norm_type: f32) -> Result<Self> {
        if !(norm_type > 0.) {
            return Err(Error::invalid("norm_type", format!("{norm_type} is not positive")).into());
        }
        self.kind.norm_type = norm_type;
        Ok(self)
    }
}

impl<D: Spatial, K: PoolKind> Debug for PoolBase<D, K> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let ty = format!("{}Pool{}", K::NAME, D::SPATIAL_NDIM);
        let mut builder = f.debug_struct(&ty);
        builder.field("kernel", &self.kernel.slice());
        if self.strides.slice().iter().any(|x| *x != 1) {
            builder.field("strides", &self.strides.slice());
        }
        if self.padding != Padding::Valid {
            builder.field("padding", &self.padding);
        }
        builder.finish()
    }
}

impl<D: Spatial, K: PoolKind> Layer for PoolBase<D, K> {}

impl<D: Spatial, K: PoolKind> Forward for PoolBase<D, K> {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        check_spatial_ndim("Pool", input.shape(), D::SPATIAL_NDIM)?;
        let padding = resolve_padding(
            &input.shape()[1..],
            &self.padding,
            self.kernel.slice(),
            self.strides.slice(),
        )?;
        self.kind
            .pool(input, self.kernel.slice(), self.strides.slice(), &padding)
    }
}

/// Reduces every spatial axis, keeping them with length 1.
#[derive(Clone, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct GlobalPoolBase<D: Spatial, K: ReduceKind> {
    #[serde(skip)]
    _m: PhantomData<(D, K)>,
}

impl<D: Spatial, K: ReduceKind> GlobalPoolBase<D, K> {
    /// Creates a new global pool.
    pub fn new() -> Self {
        Self {
            _m: PhantomData,
        }
    }
}

impl<D: Spatial, K: ReduceKind> Default for GlobalPoolBase<D, K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: Spatial, K: ReduceKind> Debug for GlobalPoolBase<D, K> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Global{}Pool{}", K::NAME, D::SPATIAL_NDIM)
    }
}

impl<D: Spatial, K: ReduceKind> Layer for GlobalPoolBase<D, K> {}

impl<D: Spatial, K: ReduceKind> Forward for GlobalPoolBase<D, K> {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        check_spatial_ndim("GlobalPool", input.shape(), D::SPATIAL_NDIM)?;
        let mut output = input.clone();
        for axis in 1..input.ndim() {
            let reduced = match K::REDUCTION {
                Reduction::Max => output.fold_axis(Axis(axis), f32::NEG_INFINITY, |a, b| a.max(*b)),
                Reduction::Avg => output
                    .mean_axis(Axis(axis))
                    .ok_or_else(|| Error::invalid("input", "spatial axes must not be empty"))?,
            };
            output = reduced.insert_axis(Axis(axis));
        }
        Ok(output)
    }
}

/// Pools the spatial axes to a fixed `output_size`, whatever the input size.
#[derive(Clone, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct AdaptivePoolBase<D: Spatial, K: ReduceKind> {
    output_size: D,
    #[serde(skip)]
    kind: PhantomData<K>,
}

impl<D: Spatial, K: ReduceKind> AdaptivePoolBase<D, K> {
    /// Creates a new [`AdaptivePoolBase`] for `output_size`.
    ///
    /// **Errors**
    ///
    /// The output size has a zero axis.
    pub fn new(output_size: impl IntoDims<D>) -> Result<Self> {
        Ok(Self {
            output_size: check_dims(output_size.into_dims(), "output_size")?,
            kind: PhantomData,
        })
    }
}

impl<D: Spatial, K: ReduceKind> Debug for AdaptivePoolBase<D, K> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct(&format!("Adaptive{}Pool{}", K::NAME, D::SPATIAL_NDIM))
            .field("output_size", &self.output_size.slice())
            .finish()
    }
}

impl<D: Spatial, K: ReduceKind> Layer for AdaptivePoolBase<D, K> {}

impl<D: Spatial, K: ReduceKind> Forward for AdaptivePoolBase<D, K> {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        check_spatial_ndim("AdaptivePool", input.shape(), D::SPATIAL_NDIM)?;
        adaptive_pool(input, self.output_size.slice(), K::REDUCTION)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array, IxDyn};

    fn ramp(shape: &[usize]) -> Tensor {
        let len = shape.iter().product::<usize>();
        Array::range(0., len as f32, 1.)
            .into_shape(IxDyn(shape))
            .unwrap()
    }

    #[test]
    fn max_pool_valid_and_same() {
        let pool = MaxPool2::from_kernel(2).unwrap().with_strides(2).unwrap();
        let y = pool.forward(&ramp(&[1, 4, 4])).unwrap();
        assert_eq!(y, array![[[5f32, 7.], [13., 15.]]].into_dyn());
        let pool = MaxPool1::from_kernel(3)
            .unwrap()
            .with_padding(Padding::Same)
            .unwrap();
        let x = array![[-1f32, -2., -3., -4.]].into_dyn();
        // padding with -inf leaves the edges unaffected
        assert_eq!(pool.forward(&x).unwrap(), array![[-1f32, -1., -2., -3.]].into_dyn());
    }

    #[test]
    fn avg_pool_counts_padding() {
        let pool = AvgPool1::from_kernel(2).unwrap().with_padding(1).unwrap();
        let y = pool.forward(&array![[2f32, 4.]].into_dyn()).unwrap();
        assert_eq!(y, array![[1f32, 3., 2.]].into_dyn());
    }

    #[test]
    fn lp_pool() {
        let pool = LpPool1::from_kernel(2).unwrap().with_strides(2).unwrap();
        let y = pool.forward(&array![[3f32, 4., 6., 8.]].into_dyn()).unwrap();
        assert_abs_diff_eq!(y, array![[5f32, 10.]].into_dyn(), epsilon = 1e-5);
        let pool = pool.with_norm_type(1.).unwrap();
        let y = pool.forward(&array![[3f32, 4., 6., 8.]].into_dyn()).unwrap();
        assert_abs_diff_eq!(y, array![[7f32, 14.]].into_dyn(), epsilon = 1e-5);
        assert!(LpPool1::from_kernel(2).unwrap().with_norm_type(0.).is_err());
    }

    #[test]
    fn pool_errors() {
        assert!(MaxPool2::from_kernel([2, 0]).is_err());
        assert!(MaxPool2::from_kernel(2).unwrap().with_strides(0).is_err());
        assert!(MaxPool2::from_kernel(2).unwrap().with_padding([1, 1, 1]).is_err());
        let err = MaxPool2::from_kernel(2)
            .unwrap()
            .forward(&ramp(&[1, 4]))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::SpatialNdim { .. })
        ));
    }

    #[test]
    fn global_pool_keeps_dims() {
        let x = ramp(&[2, 2, 3]);
        let y = GlobalAvgPool2::new().forward(&x).unwrap();
        assert_eq!(y, array![[[2.5f32]], [[8.5]]].into_dyn());
        let y = GlobalMaxPool2::new().forward(&x).unwrap();
        assert_eq!(y, array![[[5f32]], [[11.]]].into_dyn());
    }

    #[test]
    fn adaptive_pool() {
        let x = ramp(&[1, 5]);
        let y = AdaptiveAvgPool1::new(2).unwrap().forward(&x).unwrap();
        // windows [0, 3) and [2, 5)
        assert_abs_diff_eq!(y, array![[1f32, 3.]].into_dyn(), epsilon = 1e-6);
        let y = AdaptiveMaxPool1::new(3).unwrap().forward(&x).unwrap();
        assert_eq!(y, array![[1f32, 3., 4.]].into_dyn());
        assert!(AdaptiveMaxPool1::new(0).is_err());
    }
}
