use crate::{
    error::check_shape,
    fft::{irfftn, rfftn, Spectrum},
    Tensor,
};
use anyhow::{bail, Result};
use ndarray::{Axis, Slice, Zip};
use num_complex::Complex64;

/// Fourier neural operator convolution of `input` (I, *S).
///
/// `weight_r` and `weight_i` hold the real and imaginary parts of
/// `(2^(N-1), O, I, *modes)` spectral weights. Corner `k` covers the lowest
/// `modes` frequencies of the last axis, and on every other axis `j` the
/// positive frequencies when bit `j` of `k` is clear, the negative ones
/// otherwise. Every other frequency is discarded.
pub fn spectral_conv(
    input: &Tensor,
    weight_r: &Tensor,
    weight_i: &Tensor,
    modes: &[usize],
) -> Result<Tensor> {
    let spatial_ndim = modes.len();
    if input.ndim() != spatial_ndim + 1 {
        bail!(
            "Input {:?} does not match modes {modes:?}!",
            input.shape()
        );
    }
    check_shape(weight_r.shape(), weight_i.shape())?;
    let corners = 1 << (spatial_ndim - 1);
    let outputs = weight_r.shape().get(1).copied().unwrap_or(0);
    let mut expected = vec![corners, outputs, input.shape()[0]];
    expected.extend_from_slice(modes);
    check_shape(&expected, weight_r.shape())?;
    let in_size = input.shape()[1..].to_vec();
    let x = rfftn(input, spatial_ndim);
    for (axis, (&m, &n)) in modes.iter().zip(x.shape()[1..].iter()).enumerate() {
        if m > n {
            bail!(
                "Mode {m} exceeds {n} frequencies on spatial axis {axis} of input {:?}!",
                input.shape()
            );
        }
    }
    let mut out_shape = x.shape().to_vec();
    out_shape[0] = outputs;
    let mut y = Spectrum::zeros(out_shape);
    for corner in 0..corners {
        let region = |ax: ndarray::AxisDescription| {
            let axis = ax.axis.index();
            if axis == 0 {
                return Slice::from(..);
            }
            let m = modes[axis - 1] as isize;
            if axis < spatial_ndim && corner & (1 << (axis - 1)) != 0 {
                Slice::from(-m..)
            } else {
                Slice::from(..m)
            }
        };
        let x = x.slice_each_axis(region);
        let weight: Spectrum = Zip::from(&weight_r.index_axis(Axis(0), corner))
            .and(&weight_i.index_axis(Axis(0), corner))
            .map_collect(|r, i| Complex64::new(*r as f64, *i as f64));
        let mut y = y.slice_each_axis_mut(region);
        for (mut y, w) in y.axis_iter_mut(Axis(0)).zip(weight.axis_iter(Axis(0))) {
            y.fill(Complex64::default());
            for (x, w) in x.axis_iter(Axis(0)).zip(w.axis_iter(Axis(0))) {
                Zip::from(&mut y)
                    .and(&x)
                    .and(&w)
                    .for_each(|y, x, w| *y += x * w);
            }
        }
    }
    Ok(irfftn(&y, &in_size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, ArrayD, IxDyn};

    #[test]
    fn identity_weights_keep_low_frequencies() {
        // keeping every mode with unit weights is the identity
        let x = array![[1f32, 0., -1., 0.]].into_dyn();
        let weight_r = ArrayD::ones(IxDyn(&[1, 1, 1, 3]));
        let weight_i = ArrayD::zeros(IxDyn(&[1, 1, 1, 3]));
        let y = spectral_conv(&x, &weight_r, &weight_i, &[3]).unwrap();
        assert_abs_diff_eq!(y, x, epsilon = 1e-6);
        // only the mean survives a single mode
        let weight_r = ArrayD::from_elem(IxDyn(&[1, 1, 1, 1]), 2f32);
        let weight_i = ArrayD::zeros(IxDyn(&[1, 1, 1, 1]));
        let x = array![[1f32, 2., 3., 2.]].into_dyn();
        let y = spectral_conv(&x, &weight_r, &weight_i, &[1]).unwrap();
        assert_abs_diff_eq!(y, ArrayD::from_elem(IxDyn(&[1, 4]), 4f32), epsilon = 1e-6);
    }

    #[test]
    fn corner_weights_shape() {
        let x = ArrayD::<f32>::zeros(IxDyn(&[2, 6, 6]));
        let weight = ArrayD::<f32>::zeros(IxDyn(&[2, 3, 2, 2, 2]));
        let y = spectral_conv(&x, &weight, &weight, &[2, 2]).unwrap();
        assert_eq!(y.shape(), &[3, 6, 6]);
        let weight = ArrayD::<f32>::zeros(IxDyn(&[1, 3, 2, 2, 2]));
        assert!(spectral_conv(&x, &weight, &weight, &[2, 2]).is_err());
    }
}
