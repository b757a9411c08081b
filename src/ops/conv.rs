use super::{dilate, pad, signed, window};
use crate::{
    dims::{conv_output_size, transpose_padding},
    error::Error,
    fft::{irfftn, rfftn, Spectrum},
    Tensor,
};
use anyhow::{bail, Result};
use ndarray::{indices, parallel::prelude::*, Axis, Dimension, IxDyn, Slice, Zip};

/// Options for [`conv_general`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConvOptions {
    /// Window strides.
    pub strides: Vec<usize>,
    /// `(before, after)` padding of the dilated input, negative values crop.
    pub padding: Vec<(isize, isize)>,
    /// Input dilation.
    pub lhs_dilation: Vec<usize>,
    /// Kernel dilation.
    pub rhs_dilation: Vec<usize>,
    /// Feature groups.
    pub groups: usize,
}

impl ConvOptions {
    /// Unit strides and dilation, no padding, one group.
    pub fn new(spatial_ndim: usize) -> Self {
        Self {
            strides: vec![1; spatial_ndim],
            padding: vec![(0, 0); spatial_ndim],
            lhs_dilation: vec![1; spatial_ndim],
            rhs_dilation: vec![1; spatial_ndim],
            groups: 1,
        }
    }
    fn validate(&self, spatial_ndim: usize) -> Result<()> {
        let lens = [
            self.strides.len(),
            self.padding.len(),
            self.lhs_dilation.len(),
            self.rhs_dilation.len(),
        ];
        if lens.iter().any(|len| *len != spatial_ndim) {
            bail!("{self:?} does not match spatial ndim {spatial_ndim}!");
        }
        if self.strides.iter().chain(&self.lhs_dilation).chain(&self.rhs_dilation).any(|x| *x == 0) {
            bail!("{self:?} has zero strides or dilation!");
        }
        Ok(())
    }
}

/// Checks `input` (C, *S) against `weight` (O, C / groups, *K).
fn check_grouped(input: &[usize], weight: &[usize], groups: usize) -> Result<()> {
    if weight.len() != input.len() + 1 {
        bail!(
            "Weight {weight:?} does not match input {input:?}, expected {} weight axes!",
            input.len() + 1
        );
    }
    if groups == 0 || weight[0] % groups != 0 {
        bail!("Output features {} are not divisible by groups {groups}!", weight[0]);
    }
    let expected = weight[1] * groups;
    if input[0] != expected {
        return Err(Error::FeatureMismatch {
            axis: 0,
            expected,
            found: input[0],
        }
        .into());
    }
    Ok(())
}

/// N-d grouped cross-correlation of `input` (C, *S) with `weight` (O, C / groups, *K).
///
/// The input is dilated by `lhs_dilation` and then padded, so transposed
/// convolutions are expressed with `lhs_dilation = strides`.
pub fn conv_general(input: &Tensor, weight: &Tensor, options: &ConvOptions) -> Result<Tensor> {
    check_grouped(input.shape(), weight.shape(), options.groups)?;
    let spatial_ndim = input.ndim() - 1;
    options.validate(spatial_ndim)?;
    let x = dilate(input, &options.lhs_dilation);
    let x = pad(&x, &options.padding, 0.);
    let kernel = &weight.shape()[2..];
    let out_size = conv_output_size(
        &x.shape()[1..],
        kernel,
        &vec![(0, 0); spatial_ndim],
        &options.strides,
        &options.rhs_dilation,
    );
    let outputs = weight.shape()[0];
    let mut out_shape = vec![outputs];
    out_shape.extend_from_slice(&out_size);
    let mut out = Tensor::zeros(out_shape);
    if out.is_empty() {
        return Ok(out);
    }
    let group_outputs = outputs / options.groups;
    let group_inputs = weight.shape()[1];
    out.axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .for_each(|(o, mut y)| {
            let group = o / group_outputs;
            for (c, w) in weight.index_axis(Axis(0), o).axis_iter(Axis(0)).enumerate() {
                let x = x.index_axis(Axis(0), group * group_inputs + c);
                for (k, w) in w.indexed_iter() {
                    let x = window(
                        x.view(),
                        k.slice(),
                        &out_size,
                        &options.strides,
                        &options.rhs_dilation,
                    );
                    y.scaled_add(*w, &x);
                }
            }
        });
    Ok(out)
}

/// Transposed convolution of `input` (C, *S) with `weight` (O, C / groups, *K).
///
/// `padding` is the padding of the forward convolution. The kernel is not
/// flipped.
pub fn conv_transpose(
    input: &Tensor,
    weight: &Tensor,
    strides: &[usize],
    padding: &[(usize, usize)],
    dilation: &[usize],
    out_padding: &[usize],
    groups: usize,
) -> Result<Tensor> {
    let kernel = &weight.shape()[2..];
    if kernel.len() != padding.len() || kernel.len() != out_padding.len() {
        bail!(
            "Padding {padding:?} and out padding {out_padding:?} do not match kernel {kernel:?}!"
        );
    }
    let options = ConvOptions {
        strides: vec![1; kernel.len()],
        padding: transpose_padding(padding, kernel, dilation, out_padding),
        lhs_dilation: strides.to_vec(),
        rhs_dilation: dilation.to_vec(),
        groups,
    };
    conv_general(input, weight, &options)
}

/// [`conv_transpose`] computed in the frequency domain.
///
/// The input is dilated by `strides` before the correlation, so both agree.
pub fn fft_conv_transpose(
    input: &Tensor,
    weight: &Tensor,
    strides: &[usize],
    padding: &[(usize, usize)],
    dilation: &[usize],
    out_padding: &[usize],
    groups: usize,
) -> Result<Tensor> {
    let kernel = &weight.shape()[2..];
    if kernel.len() != padding.len() || kernel.len() != out_padding.len() {
        bail!(
            "Padding {padding:?} and out padding {out_padding:?} do not match kernel {kernel:?}!"
        );
    }
    let padding = transpose_padding(padding, kernel, dilation, out_padding);
    let x = dilate(input, strides);
    fft_conv_general(&x, weight, &vec![1; kernel.len()], &padding, dilation, groups)
}

/// Convolution with unshared weights.
///
/// `weight` is (O, C * prod(K), *out_size), with the patch axis ordered
/// channel first, then kernel position in row major order.
pub fn conv_local(
    input: &Tensor,
    weight: &Tensor,
    kernel: &[usize],
    strides: &[usize],
    padding: &[(usize, usize)],
    dilation: &[usize],
) -> Result<Tensor> {
    let x = pad(input, &signed(padding), 0.);
    let spatial_ndim = kernel.len();
    let out_size = conv_output_size(
        &x.shape()[1..],
        kernel,
        &vec![(0, 0); spatial_ndim],
        strides,
        dilation,
    );
    let kernel_len: usize = kernel.iter().product();
    let outputs = weight.shape().first().copied().unwrap_or(0);
    let mut expected = vec![outputs, input.shape()[0] * kernel_len];
    expected.extend_from_slice(&out_size);
    crate::error::check_shape(&expected, weight.shape())?;
    let mut out_shape = vec![outputs];
    out_shape.extend_from_slice(&out_size);
    let mut out = Tensor::zeros(out_shape);
    if out.is_empty() {
        return Ok(out);
    }
    out.axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .for_each(|(o, mut y)| {
            let w = weight.index_axis(Axis(0), o);
            for (c, x) in x.axis_iter(Axis(0)).enumerate() {
                for (i, k) in indices(IxDyn(kernel)).into_iter().enumerate() {
                    let x = window(x.view(), k.slice(), &out_size, strides, dilation);
                    let w = w.index_axis(Axis(0), c * kernel_len + i);
                    Zip::from(&mut y)
                        .and(&w)
                        .and(&x)
                        .for_each(|y, w, x| *y += w * x);
                }
            }
        });
    Ok(out)
}

/// [`conv_general`] computed in the frequency domain.
///
/// The dilated kernel is zero padded to the padded input, correlated as
/// `X * conj(W)` per group, and the first `in - k + 1` outputs per axis are kept
/// before applying `strides`.
pub fn fft_conv_general(
    input: &Tensor,
    weight: &Tensor,
    strides: &[usize],
    padding: &[(isize, isize)],
    dilation: &[usize],
    groups: usize,
) -> Result<Tensor> {
    check_grouped(input.shape(), weight.shape(), groups)?;
    let spatial_ndim = input.ndim() - 1;
    if strides.len() != spatial_ndim || dilation.len() != spatial_ndim {
        bail!("Strides {strides:?} and dilation {dilation:?} do not match spatial ndim {spatial_ndim}!");
    }
    let weight = dilate(weight, dilation);
    let x = pad(input, padding, 0.);
    let in_size = x.shape()[1..].to_vec();
    let kernel = weight.shape()[2..].to_vec();
    let outputs = weight.shape()[0];
    if in_size.iter().zip(&kernel).any(|(i, k)| i < k) || in_size.contains(&0) {
        let mut out_shape = vec![outputs];
        out_shape.extend(
            conv_output_size(&in_size, &kernel, &vec![(0, 0); spatial_ndim], strides, &vec![1; spatial_ndim]),
        );
        return Ok(Tensor::zeros(out_shape));
    }
    let kernel_padding: Vec<(isize, isize)> = in_size
        .iter()
        .zip(&kernel)
        .map(|(i, k)| (0, (i - k) as isize))
        .collect();
    let weight = pad(&weight, &kernel_padding, 0.);
    let x_spectrum = rfftn(&x, spatial_ndim);
    let w_spectrum = rfftn(&weight, spatial_ndim);
    let mut y_shape = x_spectrum.shape().to_vec();
    y_shape[0] = outputs;
    let mut y_spectrum = Spectrum::zeros(y_shape);
    let group_outputs = outputs / groups;
    let group_inputs = weight.shape()[1];
    y_spectrum
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .for_each(|(o, mut y)| {
            let group = o / group_outputs;
            for c in 0..group_inputs {
                let x = x_spectrum.index_axis(Axis(0), group * group_inputs + c);
                let w = w_spectrum.index_axis(Axis(0), o);
                Zip::from(&mut y)
                    .and(&x)
                    .and(&w.index_axis(Axis(0), c))
                    .for_each(|y, x, w| *y += x * w.conj());
            }
        });
    let y = irfftn(&y_spectrum, &in_size);
    let valid = y.slice_each_axis(|ax| {
        let axis = ax.axis.index();
        if axis == 0 {
            return Slice::from(..);
        }
        let len = in_size[axis - 1] - kernel[axis - 1] + 1;
        Slice::new(0, Some(len as isize), strides[axis - 1] as isize)
    });
    Ok(valid.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, ArrayD};

    fn ramp(shape: &[usize]) -> Tensor {
        let len: usize = shape.iter().product();
        ArrayD::from_shape_vec(
            IxDyn(shape),
            (0..len).map(|x| ((x * 7) % 11) as f32 / 11. - 0.5).collect(),
        )
        .unwrap()
    }

    #[test]
    fn conv1_valid() {
        let x = array![[1f32, 2., 3., 4.]].into_dyn();
        let w = array![[[1f32, 0., -1.]]].into_dyn();
        let y = conv_general(&x, &w, &ConvOptions::new(1)).unwrap();
        assert_eq!(y, array![[-2f32, -2.]].into_dyn());
    }

    #[test]
    fn conv_grouped_channels() {
        let x = array![[1f32, 1.], [2., 2.]].into_dyn();
        let w = array![[[1f32]], [[1.]]].into_dyn();
        let options = ConvOptions {
            groups: 2,
            ..ConvOptions::new(1)
        };
        let y = conv_general(&x, &w, &options).unwrap();
        assert_eq!(y, x);
        let w = array![[[1f32], [1.]]].into_dyn();
        assert!(conv_general(&x, &w, &options).is_err());
    }

    #[test]
    fn conv_transpose_upsamples() {
        let x = array![[1f32, 2.]].into_dyn();
        let w = array![[[1f32, 1.]]].into_dyn();
        let y = conv_transpose(&x, &w, &[2], &[(0, 0)], &[1], &[0], 1).unwrap();
        assert_eq!(y, array![[1f32, 1., 2., 2.]].into_dyn());
    }

    #[test]
    fn fft_conv_matches_direct() {
        let x = ramp(&[2, 7, 6]);
        let w = ramp(&[4, 1, 3, 2]);
        let padding = [(1isize, 1isize), (0, 1)];
        let options = ConvOptions {
            strides: vec![2, 1],
            padding: padding.to_vec(),
            rhs_dilation: vec![1, 2],
            groups: 2,
            ..ConvOptions::new(2)
        };
        let direct = conv_general(&x, &w, &options).unwrap();
        let fft = fft_conv_general(&x, &w, &[2, 1], &padding, &[1, 2], 2).unwrap();
        assert_eq!(direct.shape(), fft.shape());
        assert_abs_diff_eq!(direct, fft, epsilon = 1e-4);
    }

    #[test]
    fn fft_conv_transpose_matches_direct() {
        let x = ramp(&[2, 4, 3]);
        let w = ramp(&[3, 2, 3, 2]);
        let padding = [(1, 1), (0, 1)];
        let direct = conv_transpose(&x, &w, &[2, 1], &padding, &[1, 2], &[1, 0], 1).unwrap();
        let fft = fft_conv_transpose(&x, &w, &[2, 1], &padding, &[1, 2], &[1, 0], 1).unwrap();
        assert_eq!(direct.shape(), fft.shape());
        assert_abs_diff_eq!(direct, fft, epsilon = 1e-4);
    }

    #[test]
    fn local_conv_with_shared_weights_matches_conv() {
        let x = ramp(&[2, 5]);
        let w = ramp(&[3, 2, 3]);
        let direct = conv_general(&x, &w, &ConvOptions::new(1)).unwrap();
        // broadcast the shared kernel to every output position
        let mut local = Tensor::zeros(IxDyn(&[3, 6, 3]));
        for o in 0..3 {
            for c in 0..2 {
                for k in 0..3 {
                    local
                        .index_axis_mut(Axis(0), o)
                        .index_axis_move(Axis(0), c * 3 + k)
                        .fill(w[[o, c, k]]);
                }
            }
        }
        let y = conv_local(&x, &local, &[3], &[1], &[(0, 0)], &[1]).unwrap();
        assert_abs_diff_eq!(direct, y, epsilon = 1e-6);
    }
}
