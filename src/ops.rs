//! Kernels operate on unbatched arrays. Padding, dilation and window arguments
//! apply to the trailing axes, so a `(channels, *spatial)` array is padded
//! along its spatial axes by passing one entry per spatial axis.
use crate::Tensor;
use ndarray::{ArrayBase, Data, IxDyn, Slice};

mod conv;
mod pool;
mod spectral;

pub use conv::{
    conv_general, conv_local, conv_transpose, fft_conv_general, fft_conv_transpose, ConvOptions,
};
pub use pool::{adaptive_pool, avg_pool, lp_pool, max_pool, reduce_window, Reduction};
pub use spectral::spectral_conv;

/// Pads the trailing axes with `value`. Negative padding crops.
pub fn pad<S>(x: &ArrayBase<S, IxDyn>, padding: &[(isize, isize)], value: f32) -> Tensor
where
    S: Data<Elem = f32>,
{
    let offset = x.ndim() - padding.len();
    let pad_of = |axis: usize| {
        if axis < offset {
            (0, 0)
        } else {
            padding[axis - offset]
        }
    };
    // (src start, src end, dst start) per axis
    let ranges: Vec<(usize, usize, usize)> = x
        .shape()
        .iter()
        .enumerate()
        .map(|(axis, &n)| {
            let (lo, hi) = pad_of(axis);
            let n = n as isize;
            let start = (-lo).max(0).min(n);
            let end = (n - (-hi).max(0)).max(start);
            (start as usize, end as usize, lo.max(0) as usize)
        })
        .collect();
    let shape: Vec<usize> = x
        .shape()
        .iter()
        .enumerate()
        .map(|(axis, &n)| {
            let (lo, hi) = pad_of(axis);
            (n as isize + lo + hi).max(0) as usize
        })
        .collect();
    let mut out = Tensor::from_elem(shape, value);
    if ranges.iter().any(|(start, end, _)| start == end) {
        return out;
    }
    let src = x.slice_each_axis(|ax| {
        let (start, end, _) = ranges[ax.axis.index()];
        Slice::from(start..end)
    });
    out.slice_each_axis_mut(|ax| {
        let (start, end, dst) = ranges[ax.axis.index()];
        Slice::from(dst..dst + (end - start))
    })
    .assign(&src);
    out
}

/// Pads the trailing axes with `value`.
pub fn pad_constant<S>(x: &ArrayBase<S, IxDyn>, padding: &[(usize, usize)], value: f32) -> Tensor
where
    S: Data<Elem = f32>,
{
    pad(x, &signed(padding), value)
}

/// Inserts `dilation - 1` zeros between elements of the trailing axes.
pub fn dilate<S>(x: &ArrayBase<S, IxDyn>, dilation: &[usize]) -> Tensor
where
    S: Data<Elem = f32>,
{
    let offset = x.ndim() - dilation.len();
    let dilation_of = |axis: usize| {
        if axis < offset {
            1
        } else {
            dilation[axis - offset].max(1)
        }
    };
    let shape: Vec<usize> = x
        .shape()
        .iter()
        .enumerate()
        .map(|(axis, &n)| {
            if n == 0 {
                0
            } else {
                (n - 1) * dilation_of(axis) + 1
            }
        })
        .collect();
    let mut out = Tensor::zeros(shape);
    out.slice_each_axis_mut(|ax| Slice::new(0, None, dilation_of(ax.axis.index()) as isize))
        .assign(x);
    out
}

pub(crate) fn signed(padding: &[(usize, usize)]) -> Vec<(isize, isize)> {
    padding
        .iter()
        .map(|(lo, hi)| (*lo as isize, *hi as isize))
        .collect()
}

/// Strided window of `x` starting at `offset * dilation` with `out` elements per axis.
pub(crate) fn window<'a>(
    mut x: ndarray::ArrayViewD<'a, f32>,
    offset: &[usize],
    out: &[usize],
    strides: &[usize],
    dilation: &[usize],
) -> ndarray::ArrayViewD<'a, f32> {
    let lead = x.ndim() - offset.len();
    x.slice_each_axis_inplace(|ax| {
        let axis = ax.axis.index();
        if axis < lead {
            return Slice::from(..);
        }
        let i = axis - lead;
        let start = offset[i] * dilation[i];
        let end = start + (out[i] - 1) * strides[i] + 1;
        Slice::new(start as isize, Some(end as isize), strides[i] as isize)
    });
    x
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn pad_and_crop() {
        let x = array![[1f32, 2., 3.], [4., 5., 6.]].into_dyn();
        let y = pad(&x, &[(1, -1)], 0.);
        assert_eq!(y, array![[0f32, 1., 2.], [0., 4., 5.]].into_dyn());
        let y = pad_constant(&x, &[(0, 0), (0, 1)], -1.);
        assert_eq!(y, array![[1f32, 2., 3., -1.], [4., 5., 6., -1.]].into_dyn());
        let y = pad(&x, &[(-3, 0)], 0.);
        assert_eq!(y.shape(), &[2, 0]);
    }

    #[test]
    fn dilate_trailing_axis() {
        let x = array![[1f32, 2., 3.]].into_dyn();
        let y = dilate(&x, &[2]);
        assert_eq!(y, array![[1f32, 0., 2., 0., 3.]].into_dyn());
    }
}
