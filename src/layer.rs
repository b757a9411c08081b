use crate::{
    error::{check_rate, Error},
    Result, Tensor,
};
use anyhow::bail;
use ndarray::{parallel::prelude::*, Axis};
use rand::{rngs::StdRng, Rng, RngCore, SeedableRng};
use serde::{Deserialize, Serialize};
use std::{
    fmt::{self, Debug},
    ops::{Bound, RangeBounds},
    sync::Arc,
};

#[doc(hidden)]
pub use tessera_derive::*;

/// Activations.
pub mod activation;
/// Convolutions.
pub mod conv;
/// Dropout and cutout.
pub mod dropout;
/// Image transforms and filters.
pub mod image;
/// Linear layers.
pub mod linear;
/// Normalization.
pub mod norm;
/// Pooling.
pub mod pool;
/// Recurrent cells and scans.
pub mod recurrent;
/// Reshaping, padding and cropping.
pub mod reshape;


/// A trait for the forward pass.
///
/// [`Layer`]'s implement [`Forward`], which computes the output as a function of the input.
///
/// # Derive
/// [`Forward`] can be [derived](tessera_derive) for sequential layers.
pub trait Forward {
    /// Computes the forward pass.
    ///
    /// **Errors**
    ///
    /// Returns an error if the input does not match the layer, or if the layer
    /// needs an rng (see [`.forward_rng()`](Self::forward_rng())).
    fn forward(&self, input: &Tensor) -> Result<Tensor>;
    /// Computes the forward pass with a source of randomness.
    ///
    /// Deterministic layers ignore `rng`.
    fn forward_rng(&self, input: &Tensor, rng: &mut dyn RngCore) -> Result<Tensor> {
        let _ = rng;
        self.forward(input)
    }
}

/// Clones boxed layers.
pub trait LayerClone {
    /// Clones the layer into a box.
    fn boxed_clone(&self) -> Box<dyn Layer>;
}

impl<T: Layer + Clone> LayerClone for T {
    fn boxed_clone(&self) -> Box<dyn Layer> {
        Box::new(self.clone())
    }
}

impl Clone for Box<dyn Layer> {
    fn clone(&self) -> Self {
        (**self).boxed_clone()
    }
}

/// A trait for networks and layers.
///
/// [`Layer`] provides reflection and utility methods.
///
/// # Derive
/// [`Layer`] should be [derived](tessera_derive).
///
/// # Clone
/// Layers are [`Clone`], see [`LayerClone`].
///
/// # serde
/// Most layers implement [`Serialize`](serde::Serialize) and [`Deserialize`](serde::Deserialize) for saving and loading.
pub trait Layer: Forward + LayerClone + Debug + Send + Sync + 'static {
    /// The number of parameters.
    ///
    /// This is the length of [`.parameters()`](Self::parameters()).
    fn parameters_len(&self) -> usize {
        0
    }
    #[doc(hidden)]
    #[allow(unused)]
    fn collect_parameters<'a>(&'a self, parameters: &mut Vec<&'a Tensor>) {}
    /// Enumerates the parameters of the layer, including child layers.
    fn parameters(&self) -> Vec<&Tensor> {
        let mut parameters = Vec::with_capacity(self.parameters_len());
        self.collect_parameters(&mut parameters);
        parameters
    }
    #[doc(hidden)]
    #[allow(unused)]
    fn collect_parameters_mut<'a>(&'a mut self, parameters: &mut Vec<&'a mut Tensor>) {}
    /// Enumerates mutable references to the parameters of the layer, including child layers.
    fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        let mut parameters = Vec::with_capacity(self.parameters_len());
        self.collect_parameters_mut(&mut parameters);
        parameters
    }
    /// Enumerates the immediate child layers of the layer.
    fn layers(&self) -> Vec<&dyn Layer> {
        Vec::new()
    }
    /// Enumerates mutable references to the immediate child layers of the layer.
    fn layers_mut(&mut self) -> Vec<&mut dyn Layer> {
        Vec::new()
    }
    /// Switches between training and evaluation.
    ///
    /// Stochastic layers are the identity in evaluation mode, batch norm uses
    /// its running statistics.
    #[allow(unused)]
    fn set_training(&mut self, training: bool) {}
    /// Returns the layer in evaluation mode.
    fn eval(mut self) -> Self
    where
        Self: Sized,
    {
        self.set_training(false);
        self
    }
    /// Materializes lazy parameters from a sample `input`, returning the output.
    ///
    /// Layers with known shapes just call [`.forward()`](Forward::forward()).
    fn build(&mut self, input: &Tensor) -> Result<Tensor> {
        self.forward(input)
    }
    /// Whether [`.build()`](Self::build()) still has to be called.
    fn is_lazy(&self) -> bool {
        false
    }
    /// Applies the layer to every sample along axis 0 in parallel.
    ///
    /// **Errors**
    ///
    /// Fails on an empty batch or if any sample fails.
    fn forward_batch(&self, input: &Tensor) -> Result<Tensor> {
        if input.ndim() == 0 || input.is_empty() {
            bail!("Cannot map over empty batch {:?}!", input.shape());
        }
        let outputs = input
            .axis_iter(Axis(0))
            .into_par_iter()
            .map(|x| self.forward(&x.to_owned()))
            .collect::<Result<Vec<_>>>()?;
        stack(&outputs)
    }
    /// Like [`.forward_batch()`](Self::forward_batch()), every sample gets its own rng seeded from `rng`.
    fn forward_batch_rng(&self, input: &Tensor, rng: &mut dyn RngCore) -> Result<Tensor> {
        if input.ndim() == 0 || input.is_empty() {
            bail!("Cannot map over empty batch {:?}!", input.shape());
        }
        let seeds: Vec<u64> = (0..input.len_of(Axis(0))).map(|_| rng.next_u64()).collect();
        let outputs = input
            .axis_iter(Axis(0))
            .into_par_iter()
            .zip(seeds)
            .map(|(x, seed)| self.forward_rng(&x.to_owned(), &mut StdRng::seed_from_u64(seed)))
            .collect::<Result<Vec<_>>>()?;
        stack(&outputs)
    }
}

fn stack(outputs: &[Tensor]) -> Result<Tensor> {
    let views: Vec<_> = outputs.iter().map(Tensor::view).collect();
    Ok(ndarray::stack(Axis(0), &views)?)
}

impl Forward for Box<dyn Layer> {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        (**self).forward(input)
    }
    fn forward_rng(&self, input: &Tensor, rng: &mut dyn RngCore) -> Result<Tensor> {
        (**self).forward_rng(input, rng)
    }
}

impl Layer for Box<dyn Layer> {
    fn parameters_len(&self) -> usize {
        (**self).parameters_len()
    }
    fn collect_parameters<'a>(&'a self, parameters: &mut Vec<&'a Tensor>) {
        (**self).collect_parameters(parameters)
    }
    fn collect_parameters_mut<'a>(&'a mut self, parameters: &mut Vec<&'a mut Tensor>) {
        (**self).collect_parameters_mut(parameters)
    }
    fn layers(&self) -> Vec<&dyn Layer> {
        (**self).layers()
    }
    fn layers_mut(&mut self) -> Vec<&mut dyn Layer> {
        (**self).layers_mut()
    }
    fn set_training(&mut self, training: bool) {
        (**self).set_training(training)
    }
    fn build(&mut self, input: &Tensor) -> Result<Tensor> {
        (**self).build(input)
    }
    fn is_lazy(&self) -> bool {
        (**self).is_lazy()
    }
}

/// Returns the input.
#[derive(Default, Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Identity;

impl Forward for Identity {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        Ok(input.clone())
    }
}

impl Layer for Identity {}

type LambdaFn = dyn Fn(&Tensor) -> Result<Tensor> + Send + Sync;

/// Wraps a function.
#[derive(Clone)]
pub struct Lambda {
    name: String,
    func: Arc<LambdaFn>,
}

impl Lambda {
    /// Creates a new [`Lambda`] for `func`.
    pub fn new<F>(func: F) -> Self
    where
        F: Fn(&Tensor) -> Result<Tensor> + Send + Sync + 'static,
    {
        Self {
            name: "lambda".into(),
            func: Arc::new(func),
        }
    }
    /// Names the function, for [`Debug`].
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

impl Debug for Lambda {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("Lambda").field(&self.name).finish()
    }
}

impl Forward for Lambda {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        (self.func)(input)
    }
}

impl Layer for Lambda {}

/// Applies layers in order.
///
/// [`.forward_rng()`](Forward::forward_rng()) gives every layer its own rng,
/// seeded from the parent.
#[derive(Default, Clone, Debug)]
pub struct Sequential {
    layers: Vec<Box<dyn Layer>>,
}

impl Sequential {
    /// Creates an empty [`Sequential`].
    pub fn new() -> Self {
        Self::default()
    }
    /// Creates a new [`Sequential`] from `layers`.
    pub fn from_layers(layers: Vec<Box<dyn Layer>>) -> Self {
        Self { layers }
    }
    /// Appends `layer`.
    pub fn with(mut self, layer: impl Layer) -> Self {
        self.push(layer);
        self
    }
    /// Appends `layer` inplace.
    pub fn push(&mut self, layer: impl Layer) {
        self.layers.push(Box::new(layer));
    }
    /// The number of layers.
    pub fn len(&self) -> usize {
        self.layers.len()
    }
    /// Whether there are no layers.
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
    /// The layer at `index`.
    ///
    /// **Errors**
    ///
    /// [`Error::IndexOutOfBounds`] if `index >= len`.
    pub fn get(&self, index: usize) -> Result<&dyn Layer> {
        self.layers
            .get(index)
            .map(|layer| &**layer)
            .ok_or_else(|| {
                Error::IndexOutOfBounds {
                    index,
                    len: self.len(),
                }
                .into()
            })
    }
    /// A new [`Sequential`] with the layers in `range`.
    ///
    /// **Errors**
    ///
    /// [`Error::IndexOutOfBounds`] if the range extends past the end.
    pub fn slice(&self, range: impl RangeBounds<usize>) -> Result<Self> {
        let len = self.len();
        let start = match range.start_bound() {
            Bound::Included(x) => *x,
            Bound::Excluded(x) => x + 1,
            Bound::Unbounded => 0,
        };
        let end = match range.end_bound() {
            Bound::Included(x) => x + 1,
            Bound::Excluded(x) => *x,
            Bound::Unbounded => len,
        };
        if end > len {
            return Err(Error::IndexOutOfBounds { index: end, len }.into());
        }
        if start > end {
            return Err(Error::IndexOutOfBounds { index: start, len: end }.into());
        }
        Ok(Self::from_layers(self.layers[start..end].to_vec()))
    }
    /// Iterates over the layers, [`.rev()`](Iterator::rev()) iterates in reverse.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &dyn Layer> + ExactSizeIterator {
        self.layers.iter().map(|layer| &**layer)
    }
}

impl Forward for Sequential {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let mut x = input.clone();
        for layer in self.layers.iter() {
            x = layer.forward(&x)?;
        }
        Ok(x)
    }
    fn forward_rng(&self, input: &Tensor, rng: &mut dyn RngCore) -> Result<Tensor> {
        let mut x = input.clone();
        for layer in self.layers.iter() {
            let mut rng = StdRng::seed_from_u64(rng.next_u64());
            x = layer.forward_rng(&x, &mut rng)?;
        }
        Ok(x)
    }
}

impl Layer for Sequential {
    fn parameters_len(&self) -> usize {
        self.layers.iter().map(|x| x.parameters_len()).sum()
    }
    fn collect_parameters<'a>(&'a self, parameters: &mut Vec<&'a Tensor>) {
        for layer in self.layers.iter() {
            layer.collect_parameters(parameters);
        }
    }
    fn collect_parameters_mut<'a>(&'a mut self, parameters: &mut Vec<&'a mut Tensor>) {
        for layer in self.layers.iter_mut() {
            layer.collect_parameters_mut(parameters);
        }
    }
    fn layers(&self) -> Vec<&dyn Layer> {
        self.iter().collect()
    }
    fn layers_mut(&mut self) -> Vec<&mut dyn Layer> {
        self.layers
            .iter_mut()
            .map(|layer| layer.as_mut() as &mut dyn Layer)
            .collect()
    }
    fn set_training(&mut self, training: bool) {
        for layer in self.layers.iter_mut() {
            layer.set_training(training);
        }
    }
    fn build(&mut self, input: &Tensor) -> Result<Tensor> {
        let mut x = input.clone();
        for layer in self.layers.iter_mut() {
            x = layer.build(&x)?;
        }
        Ok(x)
    }
    fn is_lazy(&self) -> bool {
        self.layers.iter().any(|x| x.is_lazy())
    }
}

/// Applies a layer with probability `rate`.
///
/// Requires an rng in training mode, the identity in evaluation mode.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RandomApply<L> {
    layer: L,
    rate: f32,
    training: bool,
}

impl<L: Layer> RandomApply<L> {
    /// Creates a new [`RandomApply`].
    ///
    /// **Errors**
    ///
    /// The rate is not in [0, 1].
    pub fn new(layer: L, rate: f32) -> Result<Self> {
        Ok(Self {
            layer,
            rate: check_rate("rate", rate)?,
            training: true,
        })
    }
    /// The wrapped layer.
    pub fn layer(&self) -> &L {
        &self.layer
    }
}

impl<L: Layer> Forward for RandomApply<L> {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        if !self.training {
            return Ok(input.clone());
        }
        Err(Error::MissingRng("RandomApply").into())
    }
    fn forward_rng(&self, input: &Tensor, rng: &mut dyn RngCore) -> Result<Tensor> {
        if !self.training || !rng.gen_bool(self.rate as f64) {
            return Ok(input.clone());
        }
        self.layer.forward_rng(input, rng)
    }
}

impl<L: Layer + Clone> Layer for RandomApply<L> {
    fn parameters_len(&self) -> usize {
        self.layer.parameters_len()
    }
    fn collect_parameters<'a>(&'a self, parameters: &mut Vec<&'a Tensor>) {
        self.layer.collect_parameters(parameters);
    }
    fn collect_parameters_mut<'a>(&'a mut self, parameters: &mut Vec<&'a mut Tensor>) {
        self.layer.collect_parameters_mut(parameters);
    }
    fn layers(&self) -> Vec<&dyn Layer> {
        vec![&self.layer as &dyn Layer]
    }
    fn layers_mut(&mut self) -> Vec<&mut dyn Layer> {
        vec![&mut self.layer as &mut dyn Layer]
    }
    fn set_training(&mut self, training: bool) {
        self.training = training;
        self.layer.set_training(training);
    }
    fn build(&mut self, input: &Tensor) -> Result<Tensor> {
        self.layer.build(input)
    }
    fn is_lazy(&self) -> bool {
        self.layer.is_lazy()
    }
}

/// Applies one of its layers, chosen uniformly.
///
/// Requires an rng in training mode, the identity in evaluation mode.
#[derive(Clone, Debug)]
pub struct RandomChoice {
    layers: Vec<Box<dyn Layer>>,
    training: bool,
}

impl RandomChoice {
    /// Creates a new [`RandomChoice`] from `layers`.
    ///
    /// **Errors**
    ///
    /// `layers` is empty.
    pub fn new(layers: Vec<Box<dyn Layer>>) -> Result<Self> {
        if layers.is_empty() {
            return Err(Error::invalid("layers", "RandomChoice needs at least one layer").into());
        }
        Ok(Self {
            layers,
            training: true,
        })
    }
}

impl Forward for RandomChoice {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        if !self.training {
            return Ok(input.clone());
        }
        Err(Error::MissingRng("RandomChoice").into())
    }
    fn forward_rng(&self, input: &Tensor, rng: &mut dyn RngCore) -> Result<Tensor> {
        if !self.training {
            return Ok(input.clone());
        }
        let index = rng.gen_range(0..self.layers.len());
        self.layers[index].forward_rng(input, rng)
    }
}

impl Layer for RandomChoice {
    fn parameters_len(&self) -> usize {
        self.layers.iter().map(|x| x.parameters_len()).sum()
    }
    fn collect_parameters<'a>(&'a self, parameters: &mut Vec<&'a Tensor>) {
        for layer in self.layers.iter() {
            layer.collect_parameters(parameters);
        }
    }
    fn collect_parameters_mut<'a>(&'a mut self, parameters: &mut Vec<&'a mut Tensor>) {
        for layer in self.layers.iter_mut() {
            layer.collect_parameters_mut(parameters);
        }
    }
    fn layers(&self) -> Vec<&dyn Layer> {
        self.layers.iter().map(|layer| &**layer).collect()
    }
    fn layers_mut(&mut self) -> Vec<&mut dyn Layer> {
        self.layers
            .iter_mut()
            .map(|layer| layer.as_mut() as &mut dyn Layer)
            .collect()
    }
    fn set_training(&mut self, training: bool) {
        self.training = training;
        for layer in self.layers.iter_mut() {
            layer.set_training(training);
        }
    }
    /// Builds every layer on `input`, returning the output of the first.
    fn build(&mut self, input: &Tensor) -> Result<Tensor> {
        let mut outputs = self
            .layers
            .iter_mut()
            .map(|layer| layer.build(input))
            .collect::<Result<Vec<_>>>()?;
        Ok(outputs.swap_remove(0))
    }
    fn is_lazy(&self) -> bool {
        self.layers.iter().any(|x| x.is_lazy())
    }
}

/// Builds a stochastic layer with a fixed rng.
///
/// Output shapes of stochastic layers do not depend on the draw.
pub(crate) fn build_stochastic<L: Forward + ?Sized>(layer: &L, input: &Tensor) -> Result<Tensor> {
    layer.forward_rng(input, &mut StdRng::seed_from_u64(0))
}

/// Rng that materializes a lazy layer from the seed drawn at construction.
pub(crate) fn lazy_rng(layer: &'static str, seed: u64, input_shape: &[usize]) -> StdRng {
    log::debug!("materializing {layer} from input {input_shape:?}");
    StdRng::seed_from_u64(seed)
}
