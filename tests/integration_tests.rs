use anyhow::{Context, Result};
use approx::{assert_abs_diff_eq, assert_relative_eq};
use libtest_mimic::{Arguments, Trial};
use ndarray::{array, Axis};
use rand::{rngs::StdRng, SeedableRng};
use serde_json::Value;
use tessera::{
    error::Error,
    init::Init,
    layer::{
        conv::{Conv2, ConvTranspose1, SeparableFftConv2},
        image::{HistogramEqualization2, PixelShuffle2},
        linear::{weight_norm, Bilinear, Linear},
        norm::{BatchNorm, GroupNorm, LayerNorm},
        pool::AvgPool2,
        Forward, Lambda, Layer, RandomApply, RandomChoice, Sequential,
    },
    Tensor,
};

fn main() {
    let args = Arguments::from_args();
    let tests = vec![
        trial("layer_norm", layer_norm),
        trial("instance_norm", instance_norm),
        trial("group_norm", group_norm),
        trial("batch_norm", batch_norm),
        trial("weight_norm", weight_norm_linear),
        trial("bilinear", bilinear),
        trial("linear_with_weight", linear_with_weight),
        trial("pixel_shuffle", pixel_shuffle),
        trial("histogram_equalization", histogram_equalization),
        trial("sequential_lambdas", sequential_lambdas),
        trial("random_containers", random_containers),
        trial("conv_serde", conv_serde),
        trial("batched_pipeline", batched_pipeline),
    ];
    libtest_mimic::run(&args, tests).exit()
}

fn trial(name: &str, f: fn() -> Result<()>) -> Trial {
    Trial::test(name, move || f().map_err(|e| format!("{e:?}").into()))
}

/// Expected arrays recorded in `tests/data/reference.json`.
fn reference(test: &str, name: &str) -> Result<Tensor> {
    let json: Value = serde_json::from_str(include_str!("data/reference.json"))?;
    let value = json
        .get(test)
        .and_then(|x| x.get(name))
        .with_context(|| format!("missing reference {test}.{name}"))?;
    Ok(serde_json::from_value(value.clone())?)
}

fn rng() -> StdRng {
    StdRng::seed_from_u64(0)
}

fn layer_norm() -> Result<()> {
    let x = reference("layer_norm", "x")?;
    let layer = LayerNorm::new(&[5, 2])?.with_weight(None)?.with_bias(None)?;
    assert_eq!(layer.parameters_len(), 0);
    assert_abs_diff_eq!(
        layer.forward(&x)?,
        reference("layer_norm", "y")?,
        epsilon = 1e-5
    );
    Ok(())
}

fn instance_norm() -> Result<()> {
    let x = reference("instance_norm", "x")?;
    let y = reference("instance_norm", "y")?;
    let layer = GroupNorm::instance(3)?;
    assert_eq!(layer.parameters_len(), 2);
    assert_abs_diff_eq!(layer.forward(&x)?, y, epsilon = 1e-5);
    let layer = layer.with_weight(None)?.with_bias(None)?;
    assert_abs_diff_eq!(layer.forward(&x)?, y, epsilon = 1e-5);
    Ok(())
}

fn group_norm() -> Result<()> {
    let layer = GroupNorm::new(6, 2)?;
    assert_abs_diff_eq!(
        layer.forward(&reference("group_norm", "x")?)?,
        reference("group_norm", "y")?,
        epsilon = 1e-5
    );
    for (in_features, groups) in [(6, 4), (0, 1), (1, 0)] {
        let err = GroupNorm::new(in_features, groups).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::InvalidArgument { .. })
        ));
    }
    Ok(())
}

fn batch_norm() -> Result<()> {
    let shape = [5, 10, 7, 8];
    let x0 = Tensor::from_shape_fn(shape.to_vec(), |ix| {
        (((ix[0] * 10 + ix[1]) * 7 + ix[2]) * 8 + ix[3] + 1) as f32
    });
    for (axis, features) in shape.into_iter().enumerate() {
        let mut bn = BatchNorm::new(features)?
            .with_momentum(0.5)?
            .with_eps(1e-7)?
            .with_axis(axis as isize)
            .with_weight(None)?
            .with_bias(None)?;
        let mut state = bn.init_state();
        let mut x = x0.clone();
        for _ in 0..5 {
            (x, state) = bn.forward_state(&x, &state)?;
        }
        assert_abs_diff_eq!(x, reference("batch_norm", &format!("y{axis}"))?, epsilon = 1e-4);
        assert_relative_eq!(
            state.running_mean,
            reference("batch_norm", &format!("mean{axis}"))?,
            max_relative = 1e-4
        );
        assert_relative_eq!(
            state.running_var,
            reference("batch_norm", &format!("var{axis}"))?,
            max_relative = 1e-4
        );
        if axis == 1 {
            bn.set_training(false);
            let (y, next) = bn.forward_state(&x, &state)?;
            assert_eq!(next, state);
            assert_abs_diff_eq!(y, reference("batch_norm", "y_eval1")?, epsilon = 1e-4);
        }
    }
    Ok(())
}

fn weight_norm_linear() -> Result<()> {
    let weight = weight_norm(&reference("weight_norm", "weight")?, -1, 1e-12)?;
    let linear = Linear::new(2, 4, &mut rng())?.with_weight(weight.t().to_owned())?;
    let y = linear.forward(&Tensor::ones(vec![1, 2]))?;
    assert_abs_diff_eq!(y, reference("weight_norm", "true")?, epsilon = 1e-5);
    Ok(())
}

fn bilinear() -> Result<()> {
    let weight = reference("bilinear", "W")?;
    let x1 = reference("bilinear", "x1")?;
    let x2 = reference("bilinear", "x2")?;
    let y = reference("bilinear", "y")?;
    for bias_init in [None, Some(Init::Zeros)] {
        let layer = Bilinear::new(&[3, 4], 2, Init::GlorotUniform, bias_init, &mut rng())?
            .with_weight(weight.clone())?;
        assert_abs_diff_eq!(layer.forward_many(&[&x1, &x2])?, y, epsilon = 1e-4);
    }
    assert!(Bilinear::new(&[], 2, Init::GlorotUniform, None, &mut rng()).is_err());
    Ok(())
}

fn linear_with_weight() -> Result<()> {
    let linear = Linear::builder()
        .inputs(1)
        .outputs(1)
        .bias_init(None)
        .build(&mut rng())?
        .with_weight(array![[-0.31568417f32]].into_dyn())?;
    let y = linear.forward(&array![[1f32]].into_dyn())?;
    assert_eq!(y, array![[-0.31568417f32]].into_dyn());
    Ok(())
}

fn pixel_shuffle() -> Result<()> {
    let y = PixelShuffle2::new(2)?.forward(&reference("pixel_shuffle", "x")?)?;
    let row = y.index_axis(Axis(0), 0).index_axis(Axis(0), 0).to_owned();
    assert_abs_diff_eq!(row, reference("pixel_shuffle", "y")?, epsilon = 1e-5);
    Ok(())
}

fn histogram_equalization() -> Result<()> {
    let x = reference("histogram_equalization", "x")?.insert_axis(Axis(0));
    let y = HistogramEqualization2::default().forward(&x)?;
    assert_abs_diff_eq!(
        y.index_axis(Axis(0), 0).to_owned(),
        reference("histogram_equalization", "y")?,
        epsilon = 1e-3
    );
    Ok(())
}

fn sequential_lambdas() -> Result<()> {
    let model = Sequential::new()
        .with(Lambda::new(|x| Ok(x + 1.)))
        .with(Lambda::new(|x| Ok(x * 2.)));
    let x = array![1f32].into_dyn();
    assert_eq!(model.forward(&x)?, array![4f32].into_dyn());
    assert_eq!(model.forward_rng(&x, &mut rng())?, array![4f32].into_dyn());
    assert_eq!(model.get(0)?.forward(&x)?, array![2f32].into_dyn());
    assert_eq!(model.slice(1..2)?.forward(&x)?, array![2f32].into_dyn());
    assert_eq!(model.iter().rev().count(), 2);
    Ok(())
}

fn random_containers() -> Result<()> {
    let x = array![1f32].into_dyn();
    let inc = Lambda::new(|x| Ok(x + 1.));
    let y = RandomApply::new(inc.clone(), 1.)?.forward_rng(&x, &mut rng())?;
    assert_eq!(y, array![2f32].into_dyn());
    let y = RandomApply::new(inc, 0.)?.forward_rng(&x, &mut rng())?;
    assert_eq!(y, x);
    let choice = RandomChoice::new(vec![
        Box::new(Lambda::new(|x| Ok(x + 2.))),
        Box::new(Lambda::new(|x| Ok(x * 2.))),
    ])?;
    let y = choice.forward_rng(&x, &mut rng())?;
    assert!(y == array![3f32].into_dyn() || y == array![2f32].into_dyn());
    Ok(())
}

fn conv_serde() -> Result<()> {
    let mut rng = rng();
    let conv = Conv2::builder()
        .inputs(3)
        .outputs(4)
        .kernel([3, 1])
        .strides(2)
        .build(&mut rng)?;
    let transpose = ConvTranspose1::builder()
        .inputs(2)
        .outputs(3)
        .kernel(3)
        .strides(2)
        .build(&mut rng)?;
    let separable = SeparableFftConv2::builder()
        .inputs(3)
        .outputs(2)
        .kernel(3)
        .build(&mut rng)?;
    let x = Tensor::ones(vec![3, 6, 5]);
    let y = conv.forward(&x)?;
    let conv: Conv2 = serde_json::from_str(&serde_json::to_string(&conv)?)?;
    assert_eq!(conv.forward(&x)?, y);
    let x1 = Tensor::ones(vec![2, 4]);
    let y1 = transpose.forward(&x1)?;
    let transpose: ConvTranspose1 = serde_json::from_str(&serde_json::to_string(&transpose)?)?;
    assert_eq!(transpose.forward(&x1)?, y1);
    let y = separable.forward(&x)?;
    assert_eq!(y.shape(), &[2, 6, 5]);
    let separable: SeparableFftConv2 =
        serde_json::from_str(&serde_json::to_string(&separable)?)?;
    assert_eq!(separable.forward(&x)?, y);
    Ok(())
}

fn batched_pipeline() -> Result<()> {
    let mut model = Sequential::new()
        .with(
            Conv2::builder()
                .outputs(4)
                .kernel(3)
                .build(&mut rng())?,
        )
        .with(AvgPool2::from_kernel(2)?.with_strides(2)?)
        .with(GroupNorm::new(4, 2)?);
    assert!(model.is_lazy());
    let x = Tensor::from_shape_fn(vec![5, 2, 8, 8], |ix| {
        ((ix[0] * 7 + ix[1] * 5 + ix[2] * 3 + ix[3]) % 11) as f32
    });
    model.build(&x.index_axis(Axis(0), 0).to_owned())?;
    let y = model.forward_batch(&x)?;
    assert_eq!(y.shape(), &[5, 4, 4, 4]);
    for (x, y) in x.outer_iter().zip(y.outer_iter()) {
        assert_abs_diff_eq!(model.forward(&x.to_owned())?, y, epsilon = 1e-6);
    }
    Ok(())
}
