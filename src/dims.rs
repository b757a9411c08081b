use crate::error::Error;
use anyhow::Result;
use ndarray::{Dim, Dimension, Ix1, Ix2, Ix3};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{fmt::Debug, str::FromStr};

mod sealed {
    pub trait SpatialBase {}
}
use sealed::SpatialBase;

/// Number of spatial dimensions of a layer.
///
/// Implemented for [`Ix1`], [`Ix2`] and [`Ix3`].
pub trait Spatial:
    Dimension + Debug + Serialize + DeserializeOwned + Send + Sync + 'static + SpatialBase
{
    /// The number of spatial axes.
    const SPATIAL_NDIM: usize;
}

impl SpatialBase for Ix1 {}
impl SpatialBase for Ix2 {}
impl SpatialBase for Ix3 {}

impl Spatial for Ix1 {
    const SPATIAL_NDIM: usize = 1;
}

impl Spatial for Ix2 {
    const SPATIAL_NDIM: usize = 2;
}

impl Spatial for Ix3 {
    const SPATIAL_NDIM: usize = 3;
}

/// Conversion into per-axis sizes.
///
/// A single `usize` is broadcast to every spatial axis.
pub trait IntoDims<D> {
    fn into_dims(self) -> D;
}

impl<D: Spatial> IntoDims<D> for usize {
    fn into_dims(self) -> D {
        let mut dims = D::zeros(D::SPATIAL_NDIM);
        dims.slice_mut().fill(self);
        dims
    }
}

impl<const N: usize> IntoDims<Dim<[usize; N]>> for [usize; N]
where
    Dim<[usize; N]>: Spatial,
{
    fn into_dims(self) -> Dim<[usize; N]> {
        dims_from_slice(&self)
    }
}

pub(crate) fn dims_from_slice<D: Spatial>(values: &[usize]) -> D {
    let mut dims = D::zeros(D::SPATIAL_NDIM);
    dims.slice_mut().copy_from_slice(values);
    dims
}

/// Checks that every axis is positive.
pub fn canonicalize<D: Spatial>(dims: impl IntoDims<D>, name: &'static str) -> Result<D> {
    check_dims(dims.into_dims(), name)
}

pub(crate) fn check_dims<D: Spatial>(dims: D, name: &'static str) -> Result<D> {
    if let Some(zero) = dims.slice().iter().position(|x| *x == 0) {
        return Err(Error::invalid(name, format!("axis {zero} of {:?} is zero", dims.slice())).into());
    }
    Ok(dims)
}

/// Padding applied before a convolution or pooling window.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Padding {
    /// Output has `ceil(in / strides)` elements per axis.
    Same,
    /// No padding.
    Valid,
    /// Every window that overlaps the input: `(k - 1, k - 1)`.
    Full,
    /// The same amount on both sides of every axis.
    Uniform(usize),
    /// The same amount on both sides, per axis.
    PerAxis(Vec<usize>),
    /// `(before, after)` per axis.
    Explicit(Vec<(usize, usize)>),
}

impl Default for Padding {
    fn default() -> Self {
        Self::Same
    }
}

impl From<usize> for Padding {
    fn from(padding: usize) -> Self {
        Self::Uniform(padding)
    }
}

impl<const N: usize> From<[usize; N]> for Padding {
    fn from(padding: [usize; N]) -> Self {
        Self::PerAxis(padding.to_vec())
    }
}

impl<const N: usize> From<[(usize, usize); N]> for Padding {
    fn from(padding: [(usize, usize); N]) -> Self {
        Self::Explicit(padding.to_vec())
    }
}

impl FromStr for Padding {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Error> {
        match s.to_ascii_lowercase().as_str() {
            "same" => Ok(Self::Same),
            "valid" => Ok(Self::Valid),
            "full" => Ok(Self::Full),
            _ => Err(Error::UnknownName {
                kind: "padding",
                name: s.to_string(),
                available: "same, valid, full".to_string(),
            }),
        }
    }
}

impl Padding {
    /// Checks per axis padding against the spatial ndim.
    pub fn validate(&self, spatial_ndim: usize) -> Result<()> {
        let len = match self {
            Self::PerAxis(padding) => padding.len(),
            Self::Explicit(padding) => padding.len(),
            _ => return Ok(()),
        };
        if len != spatial_ndim {
            return Err(Error::invalid(
                "padding",
                format!("{self:?} has {len} axes, expected {spatial_ndim}"),
            )
            .into());
        }
        Ok(())
    }
}

/// Padding along one axis so that the output has `ceil(in / stride)` elements.
pub fn same_padding_along_axis(in_size: usize, kernel: usize, stride: usize) -> (usize, usize) {
    let pad = if in_size % stride == 0 {
        kernel.saturating_sub(stride)
    } else {
        kernel.saturating_sub(in_size % stride)
    };
    (pad / 2, pad - pad / 2)
}

/// Resolves `padding` into `(before, after)` pairs for an input of `in_size`.
///
/// `same` depends on the input size, so it is resolved at call time.
pub fn resolve_padding(
    in_size: &[usize],
    padding: &Padding,
    kernel: &[usize],
    strides: &[usize],
) -> Result<Vec<(usize, usize)>> {
    padding.validate(kernel.len())?;
    let resolved = match padding {
        Padding::Same => in_size
            .iter()
            .zip(kernel.iter().zip(strides))
            .map(|(i, (k, s))| same_padding_along_axis(*i, *k, *s))
            .collect(),
        Padding::Valid => vec![(0, 0); kernel.len()],
        Padding::Full => kernel.iter().map(|k| (k - 1, k - 1)).collect(),
        Padding::Uniform(p) => vec![(*p, *p); kernel.len()],
        Padding::PerAxis(padding) => padding.iter().map(|p| (*p, *p)).collect(),
        Padding::Explicit(padding) => padding.clone(),
    };
    log::trace!("resolved {padding:?} for input {in_size:?} to {resolved:?}");
    Ok(resolved)
}

/// Output size of a convolution along every spatial axis.
pub fn conv_output_size(
    in_size: &[usize],
    kernel: &[usize],
    padding: &[(usize, usize)],
    strides: &[usize],
    dilation: &[usize],
) -> Vec<usize> {
    in_size
        .iter()
        .enumerate()
        .map(|(i, x)| {
            let padded = x + padding[i].0 + padding[i].1;
            let window = (kernel[i] - 1) * dilation[i] + 1;
            if padded < window {
                0
            } else {
                (padded - window) / strides[i] + 1
            }
        })
        .collect()
}

/// Padding of the dilated input that implements a transposed convolution.
///
/// Negative values crop the output.
pub fn transpose_padding(
    padding: &[(usize, usize)],
    kernel: &[usize],
    dilation: &[usize],
    out_padding: &[usize],
) -> Vec<(isize, isize)> {
    padding
        .iter()
        .zip(kernel)
        .zip(dilation.iter().zip(out_padding))
        .map(|((&(lo, hi), &k), (&d, &extra))| {
            let window = ((k - 1) * d) as isize;
            (window - lo as isize, window - hi as isize + extra as isize)
        })
        .collect()
}

/// Checks that `shape` is `(channels, *spatial)` with `spatial_ndim` spatial axes.
pub(crate) fn check_spatial_ndim(
    layer: &'static str,
    shape: &[usize],
    spatial_ndim: usize,
) -> Result<(), Error> {
    if shape.len() != spatial_ndim + 1 {
        return Err(Error::SpatialNdim {
            layer,
            expected: spatial_ndim,
            found: shape.len().saturating_sub(1),
        });
    }
    Ok(())
}

pub(crate) fn check_features(shape: &[usize], axis: usize, expected: usize) -> Result<(), Error> {
    let found = shape.get(axis).copied().unwrap_or(0);
    if found != expected {
        return Err(Error::FeatureMismatch {
            axis,
            expected,
            found,
        });
    }
    Ok(())
}

/// Normalizes a possibly negative axis.
pub(crate) fn normalize_axis(axis: isize, ndim: usize) -> Result<usize, Error> {
    let normalized = if axis < 0 {
        axis + ndim as isize
    } else {
        axis
    };
    if normalized < 0 || normalized >= ndim as isize {
        return Err(Error::invalid(
            "axis",
            format!("{axis} is out of range for ndim {ndim}"),
        ));
    }
    Ok(normalized as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_padding_matches_tensorflow() {
        assert_eq!(same_padding_along_axis(5, 3, 1), (1, 1));
        assert_eq!(same_padding_along_axis(5, 4, 1), (1, 2));
        assert_eq!(same_padding_along_axis(5, 3, 2), (1, 1));
        assert_eq!(same_padding_along_axis(6, 3, 2), (0, 1));
        assert_eq!(same_padding_along_axis(4, 1, 2), (0, 0));
    }

    #[test]
    fn resolve_padding_variants() {
        let kernel = [3, 5];
        let strides = [1, 1];
        let in_size = [8, 8];
        assert_eq!(
            resolve_padding(&in_size, &Padding::Same, &kernel, &strides).unwrap(),
            vec![(1, 1), (2, 2)]
        );
        assert_eq!(
            resolve_padding(&in_size, &Padding::Valid, &kernel, &strides).unwrap(),
            vec![(0, 0), (0, 0)]
        );
        assert_eq!(
            resolve_padding(&in_size, &Padding::Full, &kernel, &strides).unwrap(),
            vec![(2, 2), (4, 4)]
        );
        assert_eq!(
            resolve_padding(&in_size, &[(1, 0), (0, 2)].into(), &kernel, &strides).unwrap(),
            vec![(1, 0), (0, 2)]
        );
        assert!(resolve_padding(&in_size, &[1, 2, 3].into(), &kernel, &strides).is_err());
    }

    #[test]
    fn output_size_and_transpose_padding() {
        assert_eq!(
            conv_output_size(&[5], &[3], &[(1, 1)], &[2], &[1]),
            vec![3]
        );
        assert_eq!(conv_output_size(&[2], &[5], &[(0, 0)], &[1], &[1]), vec![0]);
        assert_eq!(
            transpose_padding(&[(1, 1)], &[3], &[1], &[0]),
            vec![(1, 1)]
        );
        assert_eq!(
            transpose_padding(&[(2, 2)], &[3], &[1], &[1]),
            vec![(0, 1)]
        );
        assert_eq!(
            transpose_padding(&[(3, 0)], &[2], &[1], &[0]),
            vec![(-2, 1)]
        );
    }

    #[test]
    fn canonicalize_rejects_zero() {
        let dims: Ix2 = canonicalize(3, "kernel_size").unwrap();
        assert_eq!(dims.slice(), &[3, 3]);
        assert!(canonicalize::<Ix2>([3, 0], "kernel_size").is_err());
    }

    #[test]
    fn padding_from_str() {
        assert_eq!("SAME".parse::<Padding>().unwrap(), Padding::Same);
        assert_eq!("valid".parse::<Padding>().unwrap(), Padding::Valid);
        assert!("reflect".parse::<Padding>().is_err());
    }
}
