use super::{
    activation::Activation,
    conv::{ConvBase, Direct},
    linear::Linear,
    stack, Forward, Layer,
};
use crate::{
    dims::{check_spatial_ndim, IntoDims, Spatial},
    error::{check_positive, check_shape, Error},
    init::Init,
    Result, Tensor,
};
use anyhow::bail;
use dry::macro_for;
use ndarray::{Axis, Ix1, Ix2, Ix3, Slice};
use paste::paste;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug};

/// State carried between the steps of a [`RecurrentCell`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RnnState {
    /// The hidden state, `(hidden_features, *spatial)`.
    pub hidden: Tensor,
    /// The cell state of lstm cells.
    pub cell: Option<Tensor>,
}

impl RnnState {
    fn zeros(shape: &[usize], with_cell: bool) -> Self {
        Self {
            hidden: Tensor::zeros(shape),
            cell: with_cell.then(|| Tensor::zeros(shape)),
        }
    }
    fn cell(&self, layer: &'static str) -> Result<&Tensor> {
        match self.cell.as_ref() {
            Some(cell) => Ok(cell),
            None => bail!("{layer} state has no cell state!"),
        }
    }
}

/// A single step of a recurrent network.
///
/// [`Forward`] applies one step from the initial state.
pub trait RecurrentCell: Layer {
    /// The state before the first step, for a step input of `input_shape`.
    ///
    /// **Errors**
    ///
    /// The input shape does not match the cell.
    fn init_state(&self, input_shape: &[usize]) -> Result<RnnState>;
    /// Advances `state` with one step of `input`.
    ///
    /// **Errors**
    ///
    /// The input or the state does not match the cell.
    fn step(&self, input: &Tensor, state: &RnnState) -> Result<RnnState>;
    /// The output of a step, the hidden state.
    fn output(&self, state: &RnnState) -> Tensor {
        state.hidden.clone()
    }
}

/// Splits axis 0 into `parts` equal chunks.
fn split(x: &Tensor, parts: usize) -> Vec<Tensor> {
    let len = x.len_of(Axis(0)) / parts;
    (0..parts)
        .map(|i| {
            x.slice_axis(Axis(0), Slice::from(i * len..(i + 1) * len))
                .to_owned()
        })
        .collect()
}

/// Layer impl for cells that are built complete, visiting `$field`s in order.
macro_rules! impl_cell_layer {
    ($cell:ident $(<$generic:ident: $bound:ident>)?, [$($field:ident),*]) => {
        impl $(<$generic: $bound>)? Forward for $cell $(<$generic>)? {
            fn forward(&self, input: &Tensor) -> Result<Tensor> {
                let state = self.init_state(input.shape())?;
                Ok(self.output(&self.step(input, &state)?))
            }
        }

        impl $(<$generic: $bound>)? Layer for $cell $(<$generic>)? {
            fn parameters_len(&self) -> usize {
                0 $(+ self.$field.parameters_len())*
            }
            fn collect_parameters<'a>(&'a self, parameters: &mut Vec<&'a Tensor>) {
                $(self.$field.collect_parameters(parameters);)*
            }
            fn collect_parameters_mut<'a>(&'a mut self, parameters: &mut Vec<&'a mut Tensor>) {
                $(self.$field.collect_parameters_mut(parameters);)*
            }
            fn layers(&self) -> Vec<&dyn Layer> {
                vec![$(&self.$field as &dyn Layer),*]
            }
            fn layers_mut(&mut self) -> Vec<&mut dyn Layer> {
                vec![$(&mut self.$field as &mut dyn Layer),*]
            }
        }
    };
}

fn in_to_hidden(
    inputs: usize,
    outputs: usize,
    weight_init: Init,
    rng: &mut dyn RngCore,
) -> Result<Linear> {
    Linear::builder()
        .inputs(inputs)
        .outputs(outputs)
        .weight_init(weight_init)
        .build(rng)
}

fn hidden_to_hidden(
    hidden: usize,
    outputs: usize,
    recurrent_weight_init: Init,
    rng: &mut dyn RngCore,
) -> Result<Linear> {
    Linear::builder()
        .inputs(hidden)
        .outputs(outputs)
        .weight_init(recurrent_weight_init)
        .bias_init(None)
        .build(rng)
}

/// Elman cell, `h = act(W_ih x + b + W_hh h)`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SimpleRnnCell {
    in_to_hidden: Linear,
    hidden_to_hidden: Linear,
    act: Activation,
    hidden_features: usize,
}

impl SimpleRnnCell {
    /// Creates a new [`SimpleRnnCell`] for `in_features` and `hidden_features`.
    ///
    /// Defaults:
    /// - act: tanh
    /// - weight_init: glorot_uniform
    /// - recurrent_weight_init: orthogonal
    /// - bias_init: zeros
    ///
    /// **Errors**
    ///
    /// Features are zero.
    pub fn new(in_features: usize, hidden_features: usize, rng: &mut dyn RngCore) -> Result<Self> {
        let hidden_features = check_positive("hidden_features", hidden_features)?;
        Ok(Self {
            in_to_hidden: in_to_hidden(in_features, hidden_features, Init::GlorotUniform, rng)?,
            hidden_to_hidden: hidden_to_hidden(hidden_features, hidden_features, Init::Orthogonal, rng)?,
            act: Activation::Tanh,
            hidden_features,
        })
    }
    /// Sets the activation.
    pub fn with_act(mut self, act: Activation) -> Self {
        self.act = act;
        self
    }
}

impl RecurrentCell for SimpleRnnCell {
    fn init_state(&self, _input_shape: &[usize]) -> Result<RnnState> {
        Ok(RnnState::zeros(&[self.hidden_features], false))
    }
    fn step(&self, input: &Tensor, state: &RnnState) -> Result<RnnState> {
        let h = self.in_to_hidden.forward(input)? + self.hidden_to_hidden.forward(&state.hidden)?;
        Ok(RnnState {
            hidden: self.act.forward(&h)?,
            cell: None,
        })
    }
}

impl_cell_layer!(SimpleRnnCell, [in_to_hidden, hidden_to_hidden]);

/// Cell without recurrence, `h = act(W x + b)`.
///
/// Lets a [`ScanRnn`] map a dense layer over time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DenseCell {
    in_to_hidden: Linear,
    act: Activation,
    hidden_features: usize,
}

impl DenseCell {
    /// Creates a new [`DenseCell`] for `in_features` and `hidden_features`.
    ///
    /// Defaults:
    /// - act: tanh
    /// - weight_init: glorot_uniform
    ///
    /// **Errors**
    ///
    /// Features are zero.
    pub fn new(in_features: usize, hidden_features: usize, rng: &mut dyn RngCore) -> Result<Self> {
        let hidden_features = check_positive("hidden_features", hidden_features)?;
        Ok(Self {
            in_to_hidden: in_to_hidden(in_features, hidden_features, Init::GlorotUniform, rng)?,
            act: Activation::Tanh,
            hidden_features,
        })
    }
    /// Sets the activation.
    pub fn with_act(mut self, act: Activation) -> Self {
        self.act = act;
        self
    }
}

impl RecurrentCell for DenseCell {
    fn init_state(&self, _input_shape: &[usize]) -> Result<RnnState> {
        Ok(RnnState::zeros(&[self.hidden_features], false))
    }
    fn step(&self, input: &Tensor, _state: &RnnState) -> Result<RnnState> {
        Ok(RnnState {
            hidden: self.act.forward(&self.in_to_hidden.forward(input)?)?,
            cell: None,
        })
    }
}

impl_cell_layer!(DenseCell, [in_to_hidden]);

/// `(h, c)` from the stacked input, forget, candidate and output gates.
fn lstm_update(
    gates: &Tensor,
    cell: &Tensor,
    act: Activation,
    recurrent_act: Activation,
) -> Result<RnnState> {
    let [i, f, g, o]: [Tensor; 4] = split(gates, 4)
        .try_into()
        .map_err(|_| Error::invalid("gates", "expected 4 gates"))?;
    let i = recurrent_act.forward(&i)?;
    let f = recurrent_act.forward(&f)?;
    let g = act.forward(&g)?;
    let o = recurrent_act.forward(&o)?;
    let c = f * cell + i * g;
    let h = o * act.forward(&c)?;
    Ok(RnnState {
        hidden: h,
        cell: Some(c),
    })
}

/// `h` from the stacked reset, update and candidate gates of the input and hidden state.
fn gru_update(
    x_gates: &Tensor,
    h_gates: &Tensor,
    hidden: &Tensor,
    act: Activation,
    recurrent_act: Activation,
) -> Result<Tensor> {
    let [xe, xu, xo]: [Tensor; 3] = split(x_gates, 3)
        .try_into()
        .map_err(|_| Error::invalid("gates", "expected 3 gates"))?;
    let [he, hu, ho]: [Tensor; 3] = split(h_gates, 3)
        .try_into()
        .map_err(|_| Error::invalid("gates", "expected 3 gates"))?;
    let e = recurrent_act.forward(&(xe + he))?;
    let u = recurrent_act.forward(&(xu + hu))?;
    let o = act.forward(&(xo + e * ho))?;
    Ok(u.mapv(|u| 1. - u) * o + u * hidden)
}

/// Long short term memory cell.
///
/// Gates are `[input, forget, candidate, output]`, each `hidden_features` wide:
/// `c = f * c + i * g` and `h = o * act(c)`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LstmCell {
    in_to_hidden: Linear,
    hidden_to_hidden: Linear,
    act: Activation,
    recurrent_act: Activation,
    hidden_features: usize,
}

impl LstmCell {
    /// Creates a new [`LstmCell`] for `in_features` and `hidden_features`.
    ///
    /// Defaults:
    /// - act: tanh
    /// - recurrent_act: sigmoid
    /// - weight_init: glorot_uniform
    /// - recurrent_weight_init: orthogonal
    /// - bias_init: zeros
    ///
    /// **Errors**
    ///
    /// Features are zero.
    pub fn new(in_features: usize, hidden_features: usize, rng: &mut dyn RngCore) -> Result<Self> {
        let hidden_features = check_positive("hidden_features", hidden_features)?;
        Ok(Self {
            in_to_hidden: in_to_hidden(in_features, 4 * hidden_features, Init::GlorotUniform, rng)?,
            hidden_to_hidden: hidden_to_hidden(
                hidden_features,
                4 * hidden_features,
                Init::Orthogonal,
                rng,
            )?,
            act: Activation::Tanh,
            recurrent_act: Activation::Sigmoid,
            hidden_features,
        })
    }
    /// Sets the activations of the candidate and of the gates.
    pub fn with_acts(mut self, act: Activation, recurrent_act: Activation) -> Self {
        self.act = act;
        self.recurrent_act = recurrent_act;
        self
    }
}

impl RecurrentCell for LstmCell {
    fn init_state(&self, _input_shape: &[usize]) -> Result<RnnState> {
        Ok(RnnState::zeros(&[self.hidden_features], true))
    }
    fn step(&self, input: &Tensor, state: &RnnState) -> Result<RnnState> {
        let cell = state.cell("LstmCell")?;
        check_shape(&[self.hidden_features], cell.shape())?;
        let gates =
            self.in_to_hidden.forward(input)? + self.hidden_to_hidden.forward(&state.hidden)?;
        lstm_update(&gates, cell, self.act, self.recurrent_act)
    }
}

impl_cell_layer!(LstmCell, [in_to_hidden, hidden_to_hidden]);

/// Gated recurrent unit.
///
/// Gates are `[reset, update, candidate]`, with the reset gate applied to the
/// hidden part of the candidate: `h = (1 - u) * o + u * h`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GruCell {
    in_to_hidden: Linear,
    hidden_to_hidden: Linear,
    act: Activation,
    recurrent_act: Activation,
    hidden_features: usize,
}

impl GruCell {
    /// Creates a new [`GruCell`] for `in_features` and `hidden_features`.
    ///
    /// Defaults match [`LstmCell::new()`].
    ///
    /// **Errors**
    ///
    /// Features are zero.
    pub fn new(in_features: usize, hidden_features: usize, rng: &mut dyn RngCore) -> Result<Self> {
        let hidden_features = check_positive("hidden_features", hidden_features)?;
        Ok(Self {
            in_to_hidden: in_to_hidden(in_features, 3 * hidden_features, Init::GlorotUniform, rng)?,
            hidden_to_hidden: hidden_to_hidden(
                hidden_features,
                3 * hidden_features,
                Init::Orthogonal,
                rng,
            )?,
            act: Activation::Tanh,
            recurrent_act: Activation::Sigmoid,
            hidden_features,
        })
    }
    /// Sets the activations of the candidate and of the gates.
    pub fn with_acts(mut self, act: Activation, recurrent_act: Activation) -> Self {
        self.act = act;
        self.recurrent_act = recurrent_act;
        self
    }
}

impl RecurrentCell for GruCell {
    fn init_state(&self, _input_shape: &[usize]) -> Result<RnnState> {
        Ok(RnnState::zeros(&[self.hidden_features], false))
    }
    fn step(&self, input: &Tensor, state: &RnnState) -> Result<RnnState> {
        let x_gates = self.in_to_hidden.forward(input)?;
        let h_gates = self.hidden_to_hidden.forward(&state.hidden)?;
        Ok(RnnState {
            hidden: gru_update(&x_gates, &h_gates, &state.hidden, self.act, self.recurrent_act)?,
            cell: None,
        })
    }
}

impl_cell_layer!(GruCell, [in_to_hidden, hidden_to_hidden]);

fn conv_pair<D: Spatial>(
    in_features: usize,
    hidden_features: usize,
    gates: usize,
    kernel: impl IntoDims<D> + Copy,
    rng: &mut dyn RngCore,
) -> Result<(ConvBase<D, Direct>, ConvBase<D, Direct>)> {
    let in_to_hidden = ConvBase::<D, Direct>::builder()
        .inputs(in_features)
        .outputs(gates * hidden_features)
        .kernel(kernel)
        .build(rng)?;
    let hidden_to_hidden = ConvBase::<D, Direct>::builder()
        .inputs(hidden_features)
        .outputs(gates * hidden_features)
        .kernel(kernel)
        .weight_init(Init::Orthogonal)
        .bias_init(None)
        .build(rng)?;
    Ok((in_to_hidden, hidden_to_hidden))
}

fn conv_state_shape<D: Spatial>(
    layer: &'static str,
    hidden_features: usize,
    input_shape: &[usize],
) -> Result<Vec<usize>> {
    check_spatial_ndim(layer, input_shape, D::SPATIAL_NDIM)?;
    let mut shape = input_shape.to_vec();
    shape[0] = hidden_features;
    Ok(shape)
}

/// Convolutional lstm cell.
///
/// Like [`LstmCell`], with `same` padded convolutions over `(channels, *spatial)`
/// steps in place of the linear maps.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct ConvLstmCell<D: Spatial> {
    in_to_hidden: ConvBase<D, Direct>,
    hidden_to_hidden: ConvBase<D, Direct>,
    act: Activation,
    recurrent_act: Activation,
    hidden_features: usize,
}

/// Convolutional gru cell.
///
/// Like [`GruCell`], with `same` padded convolutions over `(channels, *spatial)`
/// steps in place of the linear maps.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct ConvGruCell<D: Spatial> {
    in_to_hidden: ConvBase<D, Direct>,
    hidden_to_hidden: ConvBase<D, Direct>,
    act: Activation,
    recurrent_act: Activation,
    hidden_features: usize,
}

macro_for!($N in [1, 2, 3] {
    paste! {
        #[doc = "Convolutional lstm cell in " $N "d, see [`ConvLstmCell`]."]
        pub type [<ConvLstm $N Cell>] = ConvLstmCell<[<Ix $N>]>;
        #[doc = "Convolutional gru cell in " $N "d, see [`ConvGruCell`]."]
        pub type [<ConvGru $N Cell>] = ConvGruCell<[<Ix $N>]>;
    }
});

impl<D: Spatial> ConvLstmCell<D> {
    /// Creates a new [`ConvLstmCell`] for `in_features`, `hidden_features` and `kernel`.
    ///
    /// Defaults match [`LstmCell::new()`].
    ///
    /// **Errors**
    ///
    /// Features or kernel are zero.
    pub fn new(
        in_features: usize,
        hidden_features: usize,
        kernel: impl IntoDims<D> + Copy,
        rng: &mut dyn RngCore,
    ) -> Result<Self> {
        let hidden_features = check_positive("hidden_features", hidden_features)?;
        let (in_to_hidden, hidden_to_hidden) =
            conv_pair(in_features, hidden_features, 4, kernel, rng)?;
        Ok(Self {
            in_to_hidden,
            hidden_to_hidden,
            act: Activation::Tanh,
            recurrent_act: Activation::Sigmoid,
            hidden_features,
        })
    }
}

impl<D: Spatial> RecurrentCell for ConvLstmCell<D> {
    fn init_state(&self, input_shape: &[usize]) -> Result<RnnState> {
        let shape = conv_state_shape::<D>("ConvLstmCell", self.hidden_features, input_shape)?;
        Ok(RnnState::zeros(&shape, true))
    }
    fn step(&self, input: &Tensor, state: &RnnState) -> Result<RnnState> {
        let cell = state.cell("ConvLstmCell")?;
        check_shape(state.hidden.shape(), cell.shape())?;
        let gates =
            self.in_to_hidden.forward(input)? + self.hidden_to_hidden.forward(&state.hidden)?;
        lstm_update(&gates, cell, self.act, self.recurrent_act)
    }
}

impl_cell_layer!(ConvLstmCell<D: Spatial>, [in_to_hidden, hidden_to_hidden]);

impl<D: Spatial> ConvGruCell<D> {
    /// Creates a new [`ConvGruCell`] for `in_features`, `hidden_features` and `kernel`.
    ///
    /// Defaults match [`GruCell::new()`].
    ///
    /// **Errors**
    ///
    /// Features or kernel are zero.
    pub fn new(
        in_features: usize,
        hidden_features: usize,
        kernel: impl IntoDims<D> + Copy,
        rng: &mut dyn RngCore,
    ) -> Result<Self> {
        let hidden_features = check_positive("hidden_features", hidden_features)?;
        let (in_to_hidden, hidden_to_hidden) =
            conv_pair(in_features, hidden_features, 3, kernel, rng)?;
        Ok(Self {
            in_to_hidden,
            hidden_to_hidden,
            act: Activation::Tanh,
            recurrent_act: Activation::Sigmoid,
            hidden_features,
        })
    }
}

impl<D: Spatial> RecurrentCell for ConvGruCell<D> {
    fn init_state(&self, input_shape: &[usize]) -> Result<RnnState> {
        let shape = conv_state_shape::<D>("ConvGruCell", self.hidden_features, input_shape)?;
        Ok(RnnState::zeros(&shape, false))
    }
    fn step(&self, input: &Tensor, state: &RnnState) -> Result<RnnState> {
        let x_gates = self.in_to_hidden.forward(input)?;
        let h_gates = self.hidden_to_hidden.forward(&state.hidden)?;
        Ok(RnnState {
            hidden: gru_update(&x_gates, &h_gates, &state.hidden, self.act, self.recurrent_act)?,
            cell: None,
        })
    }
}

impl_cell_layer!(ConvGruCell<D: Spatial>, [in_to_hidden, hidden_to_hidden]);

/// Scans a cell over axis 0 (time) of the input.
///
/// Returns the output of every step when `return_sequences` is set, otherwise
/// the output of the last step. A backward cell scans the reversed sequence,
/// its outputs are realigned to the input order and concatenated to the
/// forward outputs on the feature axis.
#[derive(Clone, Serialize, Deserialize)]
pub struct ScanRnn<C> {
    cell: C,
    backward_cell: Option<C>,
    return_sequences: bool,
}

impl<C: RecurrentCell> ScanRnn<C> {
    /// Creates a new [`ScanRnn`] returning the last output.
    pub fn new(cell: C) -> Self {
        Self {
            cell,
            backward_cell: None,
            return_sequences: false,
        }
    }
    /// Adds a backward cell, making the scan bidirectional.
    pub fn with_backward_cell(mut self, backward_cell: C) -> Self {
        self.backward_cell.replace(backward_cell);
        self
    }
    /// Returns the output of every step.
    pub fn with_return_sequences(mut self, return_sequences: bool) -> Self {
        self.return_sequences = return_sequences;
        self
    }
    /// The forward cell.
    pub fn cell(&self) -> &C {
        &self.cell
    }
    /// Scans the sequence from `state`, returning the outputs of every step and the final state.
    ///
    /// **Errors**
    ///
    /// The sequence is empty, or a step fails.
    pub fn scan(&self, input: &Tensor, state: RnnState) -> Result<(Vec<Tensor>, RnnState)> {
        scan(&self.cell, input.outer_iter().map(|x| x.to_owned()), state)
    }
}

fn scan<C: RecurrentCell>(
    cell: &C,
    steps: impl Iterator<Item = Tensor>,
    mut state: RnnState,
) -> Result<(Vec<Tensor>, RnnState)> {
    let mut outputs = Vec::new();
    for x in steps {
        state = cell.step(&x, &state)?;
        outputs.push(cell.output(&state));
    }
    Ok((outputs, state))
}

impl<C: RecurrentCell> Debug for ScanRnn<C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut builder = f.debug_struct("ScanRnn");
        builder.field("cell", &self.cell);
        if let Some(backward_cell) = self.backward_cell.as_ref() {
            builder.field("backward_cell", backward_cell);
        }
        if self.return_sequences {
            builder.field("return_sequences", &true);
        }
        builder.finish()
    }
}

impl<C: RecurrentCell> Forward for ScanRnn<C> {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        if input.ndim() < 2 || input.is_empty() {
            return Err(Error::invalid(
                "input",
                format!("expected a non empty (time, *features) sequence, found {:?}", input.shape()),
            )
            .into());
        }
        let step_shape = &input.shape()[1..];
        let (mut outputs, _) = self.scan(input, self.cell.init_state(step_shape)?)?;
        if let Some(backward_cell) = self.backward_cell.as_ref() {
            let reversed = input.outer_iter().rev().map(|x| x.to_owned());
            let (mut backward, _) =
                scan(backward_cell, reversed, backward_cell.init_state(step_shape)?)?;
            let last = backward.last().cloned();
            backward.reverse();
            if !self.return_sequences {
                outputs = outputs.split_off(outputs.len() - 1);
                backward = last.into_iter().collect();
            }
            for (forward, backward) in outputs.iter_mut().zip(backward) {
                *forward = ndarray::concatenate(Axis(0), &[forward.view(), backward.view()])?;
            }
        }
        if self.return_sequences {
            stack(&outputs)
        } else {
            match outputs.pop() {
                Some(output) => Ok(output),
                None => bail!("ScanRnn produced no output!"),
            }
        }
    }
}

impl<C: RecurrentCell + Clone> Layer for ScanRnn<C> {
    fn parameters_len(&self) -> usize {
        self.cell.parameters_len() + self.backward_cell.as_ref().map_or(0, |x| x.parameters_len())
    }
    fn collect_parameters<'a>(&'a self, parameters: &mut Vec<&'a Tensor>) {
        self.cell.collect_parameters(parameters);
        if let Some(backward_cell) = self.backward_cell.as_ref() {
            backward_cell.collect_parameters(parameters);
        }
    }
    fn collect_parameters_mut<'a>(&'a mut self, parameters: &mut Vec<&'a mut Tensor>) {
        self.cell.collect_parameters_mut(parameters);
        if let Some(backward_cell) = self.backward_cell.as_mut() {
            backward_cell.collect_parameters_mut(parameters);
        }
    }
    fn layers(&self) -> Vec<&dyn Layer> {
        std::iter::once(&self.cell as &dyn Layer)
            .chain(self.backward_cell.as_ref().map(|x| x as &dyn Layer))
            .collect()
    }
    fn layers_mut(&mut self) -> Vec<&mut dyn Layer> {
        std::iter::once(&mut self.cell as &mut dyn Layer)
            .chain(self.backward_cell.as_mut().map(|x| x as &mut dyn Layer))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array, IxDyn};
    use rand::{rngs::StdRng, SeedableRng};

    fn rng() -> StdRng {
        StdRng::seed_from_u64(0)
    }

    fn sequence(shape: &[usize]) -> Tensor {
        let len = shape.iter().product::<usize>();
        Array::linspace(-1., 1., len).into_shape(IxDyn(shape)).unwrap()
    }

    #[test]
    fn simple_rnn_step_matches_formula() {
        let mut cell = SimpleRnnCell::new(2, 1, &mut rng()).unwrap();
        cell.in_to_hidden = cell
            .in_to_hidden
            .with_weight(array![[0.5f32, -1.]].into_dyn())
            .unwrap()
            .with_bias(Some(array![0.25f32].into_dyn()))
            .unwrap();
        cell.hidden_to_hidden = cell
            .hidden_to_hidden
            .with_weight(array![[2f32]].into_dyn())
            .unwrap();
        let state = RnnState {
            hidden: array![0.5f32].into_dyn(),
            cell: None,
        };
        let next = cell.step(&array![1f32, 1.].into_dyn(), &state).unwrap();
        assert_abs_diff_eq!(next.hidden, array![0.75f32.tanh()].into_dyn(), epsilon = 1e-6);
        assert_eq!(cell.parameters_len(), 3);
    }

    #[test]
    fn lstm_gates() {
        let gates = array![0f32, 0., 1., 0.].into_dyn();
        let cell = array![2f32].into_dyn();
        let state = lstm_update(&gates, &cell, Activation::Tanh, Activation::Sigmoid).unwrap();
        let c = 0.5 * 2. + 0.5 * 1f32.tanh();
        assert_abs_diff_eq!(state.cell.unwrap(), array![c].into_dyn(), epsilon = 1e-6);
        assert_abs_diff_eq!(state.hidden, array![0.5 * c.tanh()].into_dyn(), epsilon = 1e-6);
    }

    #[test]
    fn gru_update_interpolates() {
        let x_gates = array![0f32, 0., 1.].into_dyn();
        let h_gates = array![0f32, 0., 2.].into_dyn();
        let h = gru_update(&x_gates, &h_gates, &array![4f32].into_dyn(), Activation::Tanh, Activation::Sigmoid).unwrap();
        let o = (1f32 + 0.5 * 2.).tanh();
        assert_abs_diff_eq!(h, array![0.5 * o + 0.5 * 4.].into_dyn(), epsilon = 1e-6);
    }

    #[test]
    fn cells_validate_state() {
        let cell = LstmCell::new(3, 2, &mut rng()).unwrap();
        let state = RnnState {
            hidden: Tensor::zeros(vec![2]),
            cell: None,
        };
        assert!(cell.step(&Tensor::ones(vec![3]), &state).is_err());
        let state = cell.init_state(&[3]).unwrap();
        assert!(cell.step(&Tensor::ones(vec![4]), &state).is_err());
        let next = cell.step(&Tensor::ones(vec![3]), &state).unwrap();
        assert_eq!(next.hidden.shape(), &[2]);
        assert_eq!(cell.forward(&Tensor::ones(vec![3])).unwrap(), next.hidden);
    }

    #[test]
    fn scan_shapes() {
        let x = sequence(&[5, 3]);
        let rnn = ScanRnn::new(GruCell::new(3, 4, &mut rng()).unwrap());
        assert_eq!(rnn.forward(&x).unwrap().shape(), &[4]);
        let rnn = rnn.with_return_sequences(true);
        let y = rnn.forward(&x).unwrap();
        assert_eq!(y.shape(), &[5, 4]);
        let last = ScanRnn::new(rnn.cell().clone()).forward(&x).unwrap();
        assert_eq!(y.index_axis(Axis(0), 4), last);
        assert!(rnn.forward(&Tensor::zeros(vec![0, 3])).is_err());
    }

    #[test]
    fn bidirectional_scan() {
        let mut rng = rng();
        let x = sequence(&[4, 2]);
        let forward = SimpleRnnCell::new(2, 3, &mut rng).unwrap();
        let backward = SimpleRnnCell::new(2, 3, &mut rng).unwrap();
        let rnn = ScanRnn::new(forward.clone())
            .with_backward_cell(backward.clone())
            .with_return_sequences(true);
        assert_eq!(rnn.parameters_len(), 6);
        let y = rnn.forward(&x).unwrap();
        assert_eq!(y.shape(), &[4, 6]);
        // the backward half of the first step has seen the whole sequence
        let mut reversed = x.clone();
        reversed.invert_axis(Axis(0));
        let backward_last = ScanRnn::new(backward).forward(&reversed).unwrap();
        assert_abs_diff_eq!(
            y.slice(ndarray::s![0, 3..]).to_owned().into_dyn(),
            backward_last,
            epsilon = 1e-6
        );
        let rnn = ScanRnn::new(forward).with_backward_cell(rnn.backward_cell.unwrap());
        assert_eq!(rnn.forward(&x).unwrap().shape(), &[6]);
    }

    #[test]
    fn conv_cells() {
        let cell = ConvLstm2Cell::new(2, 3, 3, &mut rng()).unwrap();
        let rnn = ScanRnn::new(cell).with_return_sequences(true);
        let y = rnn.forward(&sequence(&[4, 2, 5, 6])).unwrap();
        assert_eq!(y.shape(), &[4, 3, 5, 6]);
        let cell = ConvGru1Cell::new(2, 3, 3, &mut rng()).unwrap();
        assert_eq!(cell.parameters_len(), 3);
        let y = ScanRnn::new(cell.clone()).forward(&sequence(&[4, 2, 7])).unwrap();
        assert_eq!(y.shape(), &[3, 7]);
        assert!(cell.init_state(&[2, 7, 7]).is_err());
    }

    #[test]
    fn dense_cell_has_no_memory() {
        let cell = DenseCell::new(2, 2, &mut rng()).unwrap().with_act(Activation::Relu);
        let x = sequence(&[3, 2]);
        let y = ScanRnn::new(cell.clone())
            .with_return_sequences(true)
            .forward(&x)
            .unwrap();
        for (x, y) in x.outer_iter().zip(y.outer_iter()) {
            assert_eq!(cell.forward(&x.to_owned()).unwrap(), y);
        }
    }
}
