use crate::Tensor;
use ndarray::{ArrayD, Axis, Slice};
use num_complex::Complex64;
use std::f64::consts::PI;

/// Complex spectrum.
pub type Spectrum = ArrayD<Complex64>;

fn radix2(buf: &mut [Complex64], inverse: bool) {
    let n = buf.len();
    let mut j = 0;
    for i in 1..n {
        let mut bit = n >> 1;
        while j & bit != 0 {
            j ^= bit;
            bit >>= 1;
        }
        j |= bit;
        if i < j {
            buf.swap(i, j);
        }
    }
    let sign = if inverse { 1. } else { -1. };
    let mut len = 2;
    while len <= n {
        let half = len / 2;
        let twiddles: Vec<Complex64> = (0..half)
            .map(|k| Complex64::from_polar(1., sign * 2. * PI * k as f64 / len as f64))
            .collect();
        for chunk in buf.chunks_mut(len) {
            for (k, w) in twiddles.iter().enumerate() {
                let u = chunk[k];
                let v = chunk[k + half] * w;
                chunk[k] = u + v;
                chunk[k + half] = u - v;
            }
        }
        len <<= 1;
    }
}

fn dft(buf: &mut [Complex64], inverse: bool) {
    let n = buf.len();
    let sign = if inverse { 1. } else { -1. };
    let out: Vec<Complex64> = (0..n)
        .map(|k| {
            buf.iter()
                .enumerate()
                .map(|(t, x)| {
                    // k * t wraps mod n to keep the angle small
                    let phase = ((k * t) % n) as f64 / n as f64;
                    x * Complex64::from_polar(1., sign * 2. * PI * phase)
                })
                .sum()
        })
        .collect();
    buf.copy_from_slice(&out);
}

/// Unnormalized transform of `buf` inplace.
///
/// The inverse transform is not scaled by `1 / n`.
pub fn fft_inplace(buf: &mut [Complex64], inverse: bool) {
    match buf.len() {
        0 | 1 => (),
        n if n.is_power_of_two() => radix2(buf, inverse),
        _ => dft(buf, inverse),
    }
}

/// Transforms every lane along `axis`. The inverse is normalized by `1 / n`.
pub fn fft_axis(x: &mut Spectrum, axis: usize, inverse: bool) {
    let n = x.len_of(Axis(axis));
    let mut buf = vec![Complex64::default(); n];
    for mut lane in x.lanes_mut(Axis(axis)) {
        buf.iter_mut().zip(lane.iter()).for_each(|(b, x)| *b = *x);
        fft_inplace(&mut buf, inverse);
        if inverse {
            let scale = 1. / n as f64;
            buf.iter_mut().for_each(|b| *b *= scale);
        }
        lane.iter_mut().zip(buf.iter()).for_each(|(x, b)| *x = *b);
    }
}

/// Zero pads or truncates `axis` to `len`.
fn resize_axis(x: Spectrum, axis: usize, len: usize) -> Spectrum {
    let n = x.len_of(Axis(axis));
    if n == len {
        return x;
    }
    let mut shape = x.shape().to_vec();
    shape[axis] = len;
    let mut out = Spectrum::zeros(shape);
    let keep = n.min(len);
    out.slice_axis_mut(Axis(axis), Slice::from(..keep))
        .assign(&x.slice_axis(Axis(axis), Slice::from(..keep)));
    out
}

/// Real FFT over the trailing `ndim` axes.
///
/// The last axis keeps `n / 2 + 1` frequencies.
pub fn rfftn(x: &Tensor, ndim: usize) -> Spectrum {
    let mut spectrum = x.mapv(|x| Complex64::new(x as f64, 0.));
    let rank = spectrum.ndim();
    for axis in rank - ndim..rank {
        fft_axis(&mut spectrum, axis, false);
    }
    let last = rank - 1;
    let half = x.len_of(Axis(last)) / 2 + 1;
    spectrum
        .slice_axis(Axis(last), Slice::from(..half))
        .to_owned()
}

/// Inverse of [`rfftn`] with explicit output sizes of the trailing axes.
///
/// Leading transformed axes are zero padded or truncated to `sizes`, like
/// `numpy.fft.irfftn(x, s=sizes)`.
pub fn irfftn(x: &Spectrum, sizes: &[usize]) -> Tensor {
    let rank = x.ndim();
    let first = rank - sizes.len();
    let mut spectrum = x.clone();
    for (axis, len) in (first..rank - 1).zip(sizes) {
        spectrum = resize_axis(spectrum, axis, *len);
        fft_axis(&mut spectrum, axis, true);
    }
    let last = rank - 1;
    let n = sizes[sizes.len() - 1];
    let half = spectrum.len_of(Axis(last));
    let mut shape = spectrum.shape().to_vec();
    shape[last] = n;
    let mut out = Tensor::zeros(shape);
    let mut buf = vec![Complex64::default(); n];
    for (lane, mut out_lane) in spectrum
        .lanes(Axis(last))
        .into_iter()
        .zip(out.lanes_mut(Axis(last)))
    {
        // rebuild the hermitian spectrum, dc and nyquist are real
        for k in 0..n {
            buf[k] = if k <= n / 2 {
                lane.get(k).copied().unwrap_or_default()
            } else {
                lane.get(n - k)
                    .map(|x| x.conj())
                    .unwrap_or_default()
            };
        }
        if n > 0 {
            buf[0].im = 0.;
        }
        if n % 2 == 0 && n > 0 && n / 2 < half {
            buf[n / 2].im = 0.;
        }
        fft_inplace(&mut buf, true);
        let scale = 1. / n as f64;
        out_lane
            .iter_mut()
            .zip(buf.iter())
            .for_each(|(y, b)| *y = (b.re * scale) as f32);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, ArrayD, IxDyn};

    #[test]
    fn radix2_matches_dft() {
        let x: Vec<Complex64> = (0..8)
            .map(|i| Complex64::new(i as f64, (i * i) as f64 * 0.1))
            .collect();
        let mut fast = x.clone();
        radix2(&mut fast, false);
        let mut slow = x.clone();
        dft(&mut slow, false);
        for (a, b) in fast.iter().zip(slow.iter()) {
            assert!((a - b).norm() < 1e-9);
        }
    }

    #[test]
    fn fft_of_impulse_is_flat() {
        let mut x = vec![Complex64::default(); 6];
        x[0] = Complex64::new(1., 0.);
        fft_inplace(&mut x, false);
        assert!(x.iter().all(|x| (x - Complex64::new(1., 0.)).norm() < 1e-12));
    }

    #[test]
    fn rfftn_irfftn_odd_and_even() {
        for shape in [[2, 5, 6], [1, 4, 7]] {
            let x = ArrayD::from_shape_fn(IxDyn(&shape), |i| {
                (i[0] * 31 + i[1] * 7 + i[2]) as f32 % 5. - 2.
            });
            let spectrum = rfftn(&x, 2);
            assert_eq!(spectrum.shape()[2], shape[2] / 2 + 1);
            let y = irfftn(&spectrum, &shape[1..]);
            assert_abs_diff_eq!(x, y, epsilon = 1e-5);
        }
    }

    #[test]
    fn rfft_of_constant() {
        let x = array![1f32, 1., 1., 1.].into_dyn();
        let spectrum = rfftn(&x, 1);
        assert!((spectrum[[0]].re - 4.).abs() < 1e-12);
        assert!(spectrum.iter().skip(1).all(|x| x.norm() < 1e-12));
    }
}
