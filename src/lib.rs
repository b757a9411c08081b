/*!
# tessera
Neural network layers over [ndarray](https://docs.rs/ndarray).

Layers are plain values. Parameters are owned by the layer that uses them and
are replaced by building a new layer, never mutated behind a shared reference.
Spatial layers take a single unbatched sample shaped `(channels, *spatial)`.
Use [`Layer::forward_batch()`](layer::Layer::forward_batch) to map a layer over
a batch.

```
# use tessera::{Result, layer::{Forward, conv::Conv2}};
# use ndarray::ArrayD;
# use rand::{SeedableRng, rngs::StdRng};
# fn main() -> Result<()> {
let mut rng = StdRng::seed_from_u64(0);
let conv = Conv2::builder()
    .inputs(1)
    .outputs(2)
    .kernel(3)
    .build(&mut rng)?;
let y = conv.forward(&ArrayD::ones(vec![1, 5, 5]))?;
assert_eq!(y.shape(), &[2, 5, 5]);
# Ok(())
# }
```
*/
#![cfg_attr(not(test), forbid(unsafe_code))]
// `deny` under test: ndarray 0.15's `s!` macro emits `#[allow(unsafe_code)]`, which `forbid` rejects.
#![cfg_attr(test, deny(unsafe_code))]

// Lets `tessera_derive` refer to `::tessera` from inside this crate.
extern crate self as tessera;

/// Errors
pub mod error;

/// Spatial dimensions and padding arithmetic
pub mod dims;

/// Parameter initializers
pub mod init;

/// Discrete Fourier transforms
pub mod fft;

/// Numeric kernels
pub mod ops;

/// Layers
pub mod layer;

pub use anyhow::Result;

/// Dynamic dimensional f32 array used for every input, output and parameter.
pub type Tensor = ndarray::ArrayD<f32>;

#[doc(hidden)]
pub mod __private {
    pub use anyhow;
    pub use rand;
}
