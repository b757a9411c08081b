use super::{pad_constant, window};
use crate::{dims::conv_output_size, Tensor};
use anyhow::{bail, Result};
use ndarray::{indices, Axis, Dimension, IxDyn, Slice, Zip};
use serde::{Deserialize, Serialize};

/// Folds every window of the trailing axes of `input` with `op`.
///
/// The input is padded with `init`, which also seeds every window.
pub fn reduce_window(
    input: &Tensor,
    kernel: &[usize],
    strides: &[usize],
    padding: &[(usize, usize)],
    init: f32,
    op: impl Fn(f32, f32) -> f32,
) -> Result<Tensor> {
    if kernel.len() > input.ndim() || strides.len() != kernel.len() || padding.len() != kernel.len() {
        bail!(
            "Kernel {kernel:?}, strides {strides:?} and padding {padding:?} do not match input {:?}!",
            input.shape()
        );
    }
    let x = pad_constant(input, padding, init);
    let lead = x.ndim() - kernel.len();
    let ones = vec![1; kernel.len()];
    let out_size = conv_output_size(
        &x.shape()[lead..],
        kernel,
        &vec![(0, 0); kernel.len()],
        strides,
        &ones,
    );
    let mut out_shape = x.shape()[..lead].to_vec();
    out_shape.extend_from_slice(&out_size);
    let mut out = Tensor::from_elem(out_shape, init);
    if out.is_empty() {
        return Ok(out);
    }
    for k in indices(IxDyn(kernel)) {
        let x = window(x.view(), k.slice(), &out_size, strides, &ones);
        Zip::from(&mut out)
            .and(&x)
            .for_each(|y, x| *y = op(*y, *x));
    }
    Ok(out)
}

/// Max over every window. Padding is `-inf`.
pub fn max_pool(
    input: &Tensor,
    kernel: &[usize],
    strides: &[usize],
    padding: &[(usize, usize)],
) -> Result<Tensor> {
    reduce_window(input, kernel, strides, padding, f32::NEG_INFINITY, f32::max)
}

/// Mean over every window, counting padded elements.
pub fn avg_pool(
    input: &Tensor,
    kernel: &[usize],
    strides: &[usize],
    padding: &[(usize, usize)],
) -> Result<Tensor> {
    let size = kernel.iter().product::<usize>() as f32;
    let sum = reduce_window(input, kernel, strides, padding, 0., |a, b| a + b)?;
    Ok(sum / size)
}

/// `(sum x^p)^(1/p)` over every window.
pub fn lp_pool(
    input: &Tensor,
    norm_type: f32,
    kernel: &[usize],
    strides: &[usize],
    padding: &[(usize, usize)],
) -> Result<Tensor> {
    let powered = input.mapv(|x| x.powf(norm_type));
    let sum = reduce_window(&powered, kernel, strides, padding, 0., |a, b| a + b)?;
    Ok(sum.mapv(|x| x.powf(norm_type.recip())))
}

/// Reduction applied by [`adaptive_pool`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reduction {
    Max,
    Avg,
}

/// Pools the trailing axes to `output_size`.
///
/// Output `i` of an axis of length `n` reduces `[floor(i * n / m), ceil((i + 1) * n / m))`.
pub fn adaptive_pool(input: &Tensor, output_size: &[usize], reduction: Reduction) -> Result<Tensor> {
    if output_size.len() > input.ndim() {
        bail!(
            "Output size {output_size:?} does not match input {:?}!",
            input.shape()
        );
    }
    let lead = input.ndim() - output_size.len();
    let mut x = input.clone();
    for (i, &m) in output_size.iter().enumerate() {
        let axis = Axis(lead + i);
        let n = x.len_of(axis);
        if n == 0 {
            bail!("Cannot pool empty axis {} of {:?}!", lead + i, input.shape());
        }
        let mut shape = x.shape().to_vec();
        shape[lead + i] = m;
        let mut out = Tensor::zeros(shape);
        for (j, mut y) in out.axis_iter_mut(axis).enumerate() {
            let start = j * n / m;
            let end = ((j + 1) * n + m - 1) / m;
            let window = x.slice_axis(axis, Slice::from(start..end));
            let reduced = match reduction {
                Reduction::Max => window.fold_axis(axis, f32::NEG_INFINITY, |a, b| a.max(*b)),
                Reduction::Avg => window.sum_axis(axis) / (end - start) as f32,
            };
            y.assign(&reduced);
        }
        x = out;
    }
    Ok(x)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn max_and_avg_pool() {
        let x = array![[1f32, 3., 2., 4.]].into_dyn();
        let y = max_pool(&x, &[2], &[2], &[(0, 0)]).unwrap();
        assert_eq!(y, array![[3f32, 4.]].into_dyn());
        let y = avg_pool(&x, &[2], &[1], &[(1, 0)]).unwrap();
        assert_eq!(y, array![[0.5f32, 2., 2.5, 3.]].into_dyn());
        let y = max_pool(&x, &[2], &[1], &[(1, 0)]).unwrap();
        assert_eq!(y, array![[1f32, 3., 3., 4.]].into_dyn());
    }

    #[test]
    fn lp_pool_is_norm() {
        let x = array![[3f32, 4.]].into_dyn();
        let y = lp_pool(&x, 2., &[2], &[1], &[(0, 0)]).unwrap();
        assert!((y[[0, 0]] - 5.).abs() < 1e-6);
    }

    #[test]
    fn adaptive_windows_overlap() {
        let x = array![[1f32, 2., 3., 4., 5.]].into_dyn();
        let y = adaptive_pool(&x, &[3], Reduction::Avg).unwrap();
        // windows [0, 2) [1, 4) [3, 5)
        assert_eq!(y, array![[1.5f32, 3., 4.5]].into_dyn());
        let y = adaptive_pool(&x, &[2], Reduction::Max).unwrap();
        assert_eq!(y, array![[3f32, 5.]].into_dyn());
    }
}
