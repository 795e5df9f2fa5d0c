use candle::{D, Module, Result, Tensor};
use candle_nn::{Init, VarBuilder};

const LAYER_NORM_EPS: f64 = 1e-5;

/// Layer normalization over the last axis, written with plain tensor ops so
/// that the input, weight and bias all receive gradients.
#[derive(Clone, Debug)]
pub struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl LayerNorm {
    pub fn new(size: usize, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(size, "weight", Init::Const(1.0))?;
        let bias = vb.get_with_hints(size, "bias", Init::Const(0.0))?;
        Ok(Self {
            weight,
            bias,
            eps: LAYER_NORM_EPS,
        })
    }
}

impl Module for LayerNorm {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = x.broadcast_sub(&x.mean_keepdim(D::Minus1)?)?;
        let std = (x.sqr()?.mean_keepdim(D::Minus1)? + self.eps)?.sqrt()?;
        x.broadcast_div(&std)?
            .broadcast_mul(&self.weight)?
            .broadcast_add(&self.bias)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use candle::{DType, Device, Var, test_utils};
    use candle_nn::{LayerNormConfig, VarMap};

    #[test]
    fn matches_candle_layer_norm() -> Result<()> {
        let dev = &Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, dev);
        let norm = LayerNorm::new(5, vb.clone())?;
        let reference = candle_nn::layer_norm(5, LayerNormConfig::default(), vb)?;

        let xs = Tensor::randn(0f32, 2., (2, 3, 5), dev)?;
        assert_eq!(
            test_utils::to_vec3_round(&norm.forward(&xs)?, 4)?,
            test_utils::to_vec3_round(&reference.forward(&xs)?, 4)?
        );
        Ok(())
    }

    #[test]
    fn input_and_parameters_receive_gradients() -> Result<()> {
        let dev = &Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, dev);
        let norm = LayerNorm::new(4, vb)?;

        let xs = Var::new(&[[1f32, 2., 3., 4.], [0., 0., 0., 0.]], dev)?;
        let loss = norm.forward(&xs)?.sqr()?.sum_all()?;
        let grads = loss.backward()?;

        let data = varmap.data().lock().unwrap();
        for name in ["weight", "bias"] {
            let grad = grads.get(&data[name]).expect("missing parameter gradient");
            let grad = grad.to_vec1::<f32>()?;
            assert!(grad.iter().all(|g| g.is_finite()));
            assert!(grad.iter().any(|g| *g != 0.0), "{name}: {grad:?}");
        }
        let grad = grads.get(&xs).expect("missing input gradient");
        assert!(grad.flatten_all()?.to_vec1::<f32>()?.iter().all(|g| g.is_finite()));
        Ok(())
    }
}
