use anyhow::Result;
use ndarray::ArrayD;
use rand::{rngs::StdRng, SeedableRng};
use tessera::{
    layer::{activation::Activation, linear::Linear, Forward, Layer},
    Tensor,
};

#[derive(Layer, Forward, Clone, Debug)]
struct DenseNet(Linear, Activation, Linear);

#[derive(Layer, Forward, Clone, Debug)]
struct TestSkip {
    dense1: Linear,
    #[layer(skip)]
    meta: String,
    dense2: Linear,
}

#[derive(Layer, Clone, Debug)]
struct Scale {
    #[layer(parameter)]
    weight: Tensor,
    #[layer(optional_parameter)]
    bias: Option<Tensor>,
}

impl Forward for Scale {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let y = input * &self.weight;
        Ok(match self.bias.as_ref() {
            Some(bias) => y + bias,
            None => y,
        })
    }
}

fn rng() -> StdRng {
    StdRng::seed_from_u64(0)
}

#[test]
fn tuple_struct() -> Result<()> {
    let mut rng = rng();
    let net = DenseNet(
        Linear::new(3, 4, &mut rng)?,
        Activation::Relu,
        Linear::new(4, 2, &mut rng)?,
    );
    assert_eq!(net.parameters_len(), 4);
    assert_eq!(net.layers().len(), 3);
    let x = ArrayD::ones(vec![5, 3]);
    let y = net.2.forward(&net.1.forward(&net.0.forward(&x)?)?)?;
    assert_eq!(net.forward(&x)?, y);
    Ok(())
}

#[test]
fn skip_field() -> Result<()> {
    let mut rng = rng();
    let mut net = TestSkip {
        dense1: Linear::new(2, 2, &mut rng)?,
        meta: "meta".to_string(),
        dense2: Linear::new(2, 1, &mut rng)?,
    };
    assert_eq!(net.layers().len(), 2);
    assert_eq!(net.parameters_len(), 4);
    let x = ArrayD::ones(vec![2]);
    assert_eq!(net.build(&x)?, net.forward(&x)?);
    assert_eq!(net.meta, "meta");
    Ok(())
}

#[test]
fn parameters() -> Result<()> {
    let mut scale = Scale {
        weight: ArrayD::from_elem(vec![2], 2.),
        bias: None,
    };
    assert_eq!(scale.parameters_len(), 1);
    scale.bias = Some(ArrayD::ones(vec![2]));
    assert_eq!(scale.parameters_len(), 2);
    for parameter in scale.parameters_mut() {
        parameter.fill(3.);
    }
    let x = ArrayD::ones(vec![2]);
    let y = scale.build(&x)?;
    assert_eq!(y, ArrayD::from_elem(vec![2], 6.));
    assert!(!scale.is_lazy());
    assert!(scale.layers().is_empty());
    Ok(())
}
